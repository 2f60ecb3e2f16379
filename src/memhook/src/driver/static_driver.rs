//! In-memory driver
//!
//! Serves reads from a memory image held in the driver itself. The image can
//! be poked between cycles, loaded from a JSON snapshot of block results, or
//! told to fail, which makes it the driver of choice for tests and for
//! replaying captured memory.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::Driver;
use crate::error::{Error, Result};
use crate::memory::{MemoryAddress, MemoryAddressBlock, MemoryAddressBlockResult, MemoryNamespace};

pub struct StaticDriver {
    name: String,
    delay: Duration,
    image: Mutex<MemoryNamespace>,
    fail_reads: AtomicBool,
    fail_connect: AtomicBool,
    reads: AtomicUsize,
}

impl StaticDriver {
    /// Create an empty image polled every `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            name: "Static Memory".to_string(),
            delay,
            image: Mutex::new(MemoryNamespace::new()),
            fail_reads: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        }
    }

    /// Create an image pre-filled with snapshot results.
    pub fn from_results(results: &[MemoryAddressBlockResult], delay: Duration) -> Self {
        let driver = Self::new(delay);
        for result in results {
            driver.poke(result.block.start, &result.data);
        }
        driver
    }

    /// Load a JSON snapshot written by [`StaticDriver::save_snapshot`].
    pub fn load_snapshot(path: &Path, delay: Duration) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let results: Vec<MemoryAddressBlockResult> =
            serde_json::from_str(&contents).map_err(std::io::Error::from)?;

        let mut driver = Self::from_results(&results, delay);
        driver.name = format!("Snapshot ({})", path.display());
        Ok(driver)
    }

    /// Write every fragment of the image to `path` as JSON.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let results: Vec<MemoryAddressBlockResult> = {
            let image = self.image.lock().unwrap_or_else(|e| e.into_inner());
            image
                .fragments()
                .map(|(start, bytes)| {
                    let end = start + bytes.len() as MemoryAddress - 1;
                    MemoryAddressBlockResult::new(
                        MemoryAddressBlock::new(format!("Range {:#x}", start), start, end),
                        bytes.to_vec(),
                    )
                })
                .collect()
        };

        let json = serde_json::to_string_pretty(&results).map_err(std::io::Error::from)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Overwrite bytes in the image.
    pub fn poke(&self, address: MemoryAddress, bytes: &[u8]) {
        self.image
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fill(address, bytes);
    }

    /// Read bytes back out of the image.
    pub fn peek(&self, address: MemoryAddress, length: usize) -> Option<Vec<u8>> {
        self.image
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address, length)
            .map(<[u8]>::to_vec)
    }

    /// Make every subsequent read fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `establish_connection` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Number of `read_bytes` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for StaticDriver {
    fn proper_name(&self) -> &str {
        &self.name
    }

    fn delay_between_reads(&self) -> Duration {
        self.delay
    }

    async fn establish_connection(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("{} refused the connection", self.name)));
        }
        debug!("{} connected", self.name);
        Ok(())
    }

    async fn read_bytes(&self, blocks: &[MemoryAddressBlock]) -> Result<Vec<MemoryAddressBlockResult>> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::DriverRead(format!("{} is unreachable", self.name)));
        }

        let image = self.image.lock().unwrap_or_else(|e| e.into_inner());
        blocks
            .iter()
            .map(|block| {
                image
                    .get(block.start, block.len())
                    .map(|bytes| MemoryAddressBlockResult::new(block.clone(), bytes.to_vec()))
                    .ok_or_else(|| Error::DriverRead(format!("block {} is not in the image", block)))
            })
            .collect()
    }

    async fn write_bytes(&self, address: MemoryAddress, bytes: &[u8]) -> Result<()> {
        debug!("Writing {} bytes at {:#x}", bytes.len(), address);
        self.poke(address, bytes);
        Ok(())
    }
}
