//! Configuration command handlers
//!
//! Handles the `configure` subcommand for setting engine defaults.

use std::path::PathBuf;

use anyhow::Result;

use crate::config::Config;

/// Requested configuration changes
#[derive(Debug, Default)]
pub struct Changes {
    pub mapper_folder: Option<PathBuf>,
    pub custom_mapper_folder: Option<PathBuf>,
    pub delay_ms: Option<u64>,
    pub statistics: Option<bool>,
    pub max_operations: Option<u64>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.mapper_folder.is_none()
            && self.custom_mapper_folder.is_none()
            && self.delay_ms.is_none()
            && self.statistics.is_none()
            && self.max_operations.is_none()
    }

    fn apply(self, config: &mut Config) {
        let engine = &mut config.engine;
        if let Some(folder) = self.mapper_folder {
            engine.mapper_folder = Some(folder);
        }
        if let Some(folder) = self.custom_mapper_folder {
            engine.custom_mapper_folder = Some(folder);
        }
        if let Some(delay) = self.delay_ms {
            engine.delay_between_reads_ms = delay;
        }
        if let Some(statistics) = self.statistics {
            engine.show_read_loop_statistics = statistics;
        }
        if let Some(max) = self.max_operations {
            engine.script_max_operations = max;
        }
    }
}

/// Handle the configure command
pub fn handle(changes: Changes, show: bool) -> Result<()> {
    let mut config = Config::load()?;

    if show {
        show_config(&config)?;
        return Ok(());
    }

    if changes.is_empty() {
        show_usage();
        return Ok(());
    }

    changes.apply(&mut config);
    config.save()?;

    println!("Configuration updated");
    if let Ok(path) = Config::config_path() {
        println!("Config saved to: {}", path.display());
    }

    Ok(())
}

/// Display current configuration
fn show_config(config: &Config) -> Result<()> {
    let engine = &config.engine;

    println!("Mapper folder:        {}", config.mapper_folder()?.display());
    match &engine.custom_mapper_folder {
        Some(folder) => println!("Custom mapper folder: {}", folder.display()),
        None => println!("Custom mapper folder: (none)"),
    }
    println!("Delay between reads:  {} ms", engine.delay_between_reads_ms);
    println!("Read loop statistics: {}", engine.show_read_loop_statistics);
    println!("Script max ops:       {}", engine.script_max_operations);

    if let Ok(path) = Config::config_path() {
        println!("Config file: {}", path.display());
    }

    Ok(())
}

/// Show usage help for the configure command
fn show_usage() {
    println!("Usage: memhook configure --mapper-folder PATH");
    println!("   or: memhook configure --delay-ms 5 --statistics true");
    println!("   or: memhook configure --show");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_apply_only_given_fields() {
        let mut config = Config::default();
        let before = config.engine.script_max_operations;

        Changes {
            delay_ms: Some(16),
            statistics: Some(true),
            ..Changes::default()
        }
        .apply(&mut config);

        assert_eq!(config.engine.delay_between_reads_ms, 16);
        assert!(config.engine.show_read_loop_statistics);
        assert_eq!(config.engine.script_max_operations, before);
        assert!(config.engine.mapper_folder.is_none());
    }

    #[test]
    fn test_empty_changes() {
        assert!(Changes::default().is_empty());
        assert!(!Changes {
            max_operations: Some(1),
            ..Changes::default()
        }
        .is_empty());
    }
}
