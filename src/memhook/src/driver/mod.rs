//! Driver abstraction
//!
//! A driver moves raw bytes between the emulator and the engine:
//! - Live process attachment via `ProcessDriver`
//! - In-memory images and JSON snapshots via `StaticDriver`
//!
//! Drivers must not log above `debug`, and every failure is returned as an
//! error rather than swallowed.

mod process;
mod static_driver;

pub use process::{find_process_by_name, ProcessDriver, ProcessTarget};
pub use static_driver::StaticDriver;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::memory::{MemoryAddress, MemoryAddressBlock, MemoryAddressBlockResult};

/// Transport to an emulator's memory.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Human readable driver name
    fn proper_name(&self) -> &str;

    /// How long the poll loop waits between read cycles
    fn delay_between_reads(&self) -> Duration;

    /// Open the channel to the emulator. Called once per load.
    async fn establish_connection(&self) -> Result<()>;

    /// Fetch every block. Results may come back in any order but must cover
    /// exactly the requested ranges.
    async fn read_bytes(&self, blocks: &[MemoryAddressBlock]) -> Result<Vec<MemoryAddressBlockResult>>;

    /// Best-effort write into emulator memory.
    async fn write_bytes(&self, address: MemoryAddress, bytes: &[u8]) -> Result<()>;
}
