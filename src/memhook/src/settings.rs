//! Engine settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::script::ScriptLimits;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log how long each read cycle takes
    pub show_read_loop_statistics: bool,
    /// Official mapper folder. Front ends pick a platform default when unset.
    pub mapper_folder: Option<PathBuf>,
    pub custom_mapper_folder: Option<PathBuf>,
    /// Operation cap per script call
    pub script_max_operations: u64,
    pub delay_between_reads_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            show_read_loop_statistics: false,
            mapper_folder: None,
            custom_mapper_folder: None,
            script_max_operations: ScriptLimits::default().max_operations,
            delay_between_reads_ms: 5,
        }
    }
}

impl Settings {
    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            max_operations: self.script_max_operations,
            ..ScriptLimits::default()
        }
    }

    pub fn delay_between_reads(&self) -> Duration {
        Duration::from_millis(self.delay_between_reads_ms)
    }
}
