//! Driver selection arguments shared by commands that talk to an emulator

use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct DriverArgs {
    /// Replay memory from a snapshot file instead of a live process
    #[arg(long, conflicts_with_all = ["pid", "process_name"])]
    pub snapshot: Option<PathBuf>,

    /// Attach to the emulator process with this PID
    #[arg(long, conflicts_with = "process_name")]
    pub pid: Option<u32>,

    /// Attach to the emulator process with this name
    #[arg(long, short = 'p')]
    pub process_name: Option<String>,

    /// Host address of emulated memory (hex), e.g. 0x7ff6a0000000
    #[arg(long, value_parser = parse_hex)]
    pub base: Option<u64>,

    /// Emulated address that `--base` corresponds to (hex)
    #[arg(long, value_parser = parse_hex)]
    pub origin: Option<u64>,

    /// Delay between read cycles in milliseconds (overrides config)
    #[arg(long)]
    pub delay_ms: Option<u64>,
}

/// Parse a hexadecimal number with or without a `0x` prefix
pub fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex '{}': {}", s, e))
}
