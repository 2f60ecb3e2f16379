//! CLI argument definitions for memhook
//!
//! This module contains all clap-derived structs and enums for CLI parsing.

mod core;
mod driver;

pub use core::{Cli, Commands};
pub use driver::DriverArgs;
