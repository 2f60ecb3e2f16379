//! Core CLI definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::driver::DriverArgs;

#[derive(Parser)]
#[command(name = "memhook")]
#[command(about = "Emulator memory sync engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the mapper catalogue
    #[command(visible_alias = "m")]
    Mappers {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a mapper and stream property changes until interrupted
    #[command(visible_alias = "w")]
    Watch {
        /// Mapper ID, display name, or file name without extension
        mapper: String,

        #[command(flatten)]
        driver: DriverArgs,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,

        /// Print the properties after loading and exit
        #[arg(long)]
        once: bool,
    },

    /// Capture a mapper's memory blocks from a process into a snapshot file
    Capture {
        /// Mapper ID, display name, or file name without extension
        mapper: String,

        /// Snapshot file to write
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        driver: DriverArgs,
    },

    /// Configure default settings
    #[command(visible_alias = "c")]
    Configure {
        /// Official mapper folder
        #[arg(long)]
        mapper_folder: Option<PathBuf>,

        /// Custom mapper folder
        #[arg(long)]
        custom_mapper_folder: Option<PathBuf>,

        /// Delay between read cycles in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Log the duration of every read cycle
        #[arg(long)]
        statistics: Option<bool>,

        /// Operation cap for each script call
        #[arg(long)]
        max_operations: Option<u64>,

        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}
