//! Live Process Driver
//!
//! Reads emulator memory straight out of the emulator process. Emulated
//! addresses are translated to host addresses with a fixed offset:
//! `host = base + (address - origin)`.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use process_memory::{CopyAddress, ProcessHandle, PutAddress, TryIntoProcessHandle};
use sysinfo::System;
use tracing::debug;

use super::Driver;
use crate::error::{Error, Result};
use crate::memory::{MemoryAddress, MemoryAddressBlock, MemoryAddressBlockResult};

/// How to find the emulator process
#[derive(Debug, Clone)]
pub enum ProcessTarget {
    Pid(u32),
    Name(String),
}

pub struct ProcessDriver {
    target: ProcessTarget,
    base: usize,
    origin: MemoryAddress,
    delay: Duration,
    name: String,
    attached: OnceLock<(u32, ProcessHandle)>,
}

// SAFETY: Windows HANDLEs are process-wide and can be safely used from any thread.
unsafe impl Send for ProcessDriver {}
unsafe impl Sync for ProcessDriver {}

impl ProcessDriver {
    pub fn new(target: ProcessTarget, base: usize, delay: Duration) -> Self {
        let name = match &target {
            ProcessTarget::Pid(pid) => format!("Process {}", pid),
            ProcessTarget::Name(name) => format!("Process '{}'", name),
        };

        Self {
            target,
            base,
            origin: 0,
            delay,
            name,
            attached: OnceLock::new(),
        }
    }

    /// Emulated address that `base` corresponds to.
    pub fn with_origin(mut self, origin: MemoryAddress) -> Self {
        self.origin = origin;
        self
    }

    fn handle(&self) -> Result<&ProcessHandle> {
        self.attached
            .get()
            .map(|(_, handle)| handle)
            .ok_or_else(|| Error::Connection(format!("{} is not attached", self.name)))
    }

    fn host_address(&self, address: MemoryAddress) -> Result<usize> {
        address
            .checked_sub(self.origin)
            .map(|offset| self.base + offset as usize)
            .ok_or_else(|| {
                Error::DriverRead(format!(
                    "address {:#x} is below the mapped origin {:#x}",
                    address, self.origin
                ))
            })
    }
}

#[async_trait]
impl Driver for ProcessDriver {
    fn proper_name(&self) -> &str {
        &self.name
    }

    fn delay_between_reads(&self) -> Duration {
        self.delay
    }

    async fn establish_connection(&self) -> Result<()> {
        if self.attached.get().is_some() {
            return Ok(());
        }

        let pid = match &self.target {
            ProcessTarget::Pid(pid) => *pid,
            ProcessTarget::Name(name) => find_process_by_name(name)?,
        };

        let handle = (pid as process_memory::Pid)
            .try_into_process_handle()
            .map_err(|e| Error::Connection(format!("failed to attach to process {}: {}", pid, e)))?;

        debug!("Attached to process {}", pid);
        let _ = self.attached.set((pid, handle));
        Ok(())
    }

    async fn read_bytes(&self, blocks: &[MemoryAddressBlock]) -> Result<Vec<MemoryAddressBlockResult>> {
        let handle = self.handle()?;

        blocks
            .iter()
            .map(|block| {
                let host = self.host_address(block.start)?;
                let mut buffer = vec![0u8; block.len()];
                handle.copy_address(host, &mut buffer).map_err(|e| {
                    Error::DriverRead(format!("failed to read {} at {:#x}: {}", block, host, e))
                })?;
                Ok(MemoryAddressBlockResult::new(block.clone(), buffer))
            })
            .collect()
    }

    async fn write_bytes(&self, address: MemoryAddress, bytes: &[u8]) -> Result<()> {
        let handle = self.handle().map_err(|e| Error::DriverWrite(e.to_string()))?;
        let host = self
            .host_address(address)
            .map_err(|e| Error::DriverWrite(e.to_string()))?;

        handle.put_address(host, bytes).map_err(|e| {
            Error::DriverWrite(format!(
                "failed to write {} bytes at {:#x}: {}",
                bytes.len(),
                host,
                e
            ))
        })
    }
}

/// Find a running process whose name contains `name` (case insensitive).
/// When several match, the one using the most memory wins.
pub fn find_process_by_name(name: &str) -> Result<u32> {
    let mut system = System::new_all();
    system.refresh_all();

    let needle = name.to_lowercase();
    let mut candidates: Vec<(u32, u64)> = system
        .processes()
        .values()
        .filter(|p| p.name().to_string_lossy().to_lowercase().contains(&needle))
        .map(|p| (p.pid().as_u32(), p.memory()))
        .collect();

    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    candidates
        .first()
        .map(|(pid, _)| *pid)
        .ok_or_else(|| Error::Connection(format!("no running process matches '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_address_translation() {
        let driver = ProcessDriver::new(ProcessTarget::Pid(1), 0x7f00_0000, Duration::ZERO)
            .with_origin(0x0200_0000);

        assert_eq!(driver.host_address(0x0200_0010).unwrap(), 0x7f00_0010);
        assert!(driver.host_address(0x0100_0000).is_err());
    }

    #[tokio::test]
    async fn test_read_before_connect_fails() {
        let driver = ProcessDriver::new(ProcessTarget::Pid(1), 0, Duration::ZERO);
        let blocks = vec![MemoryAddressBlock::new("r", 0, 0)];
        assert!(matches!(
            driver.read_bytes(&blocks).await,
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn test_unknown_process_name() {
        let err = find_process_by_name("memhook-no-such-emulator-process").unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
