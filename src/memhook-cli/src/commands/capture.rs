//! Memory snapshot capture
//!
//! Reads a mapper's block plan once and writes it as a snapshot that
//! `watch --snapshot` can replay.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use memhook::mapper::load_mapper_file;
use memhook::{Platform, StaticDriver};

use crate::cli::DriverArgs;
use crate::config::Config;

/// Handle the capture command
pub async fn handle(mapper: &str, output: &Path, driver_args: &DriverArgs) -> Result<()> {
    let config = Config::load()?;
    let catalog = super::catalog(&config)?;
    let file = super::find_mapper(catalog.as_ref(), mapper)?;

    let parsed = load_mapper_file(&file)
        .with_context(|| format!("Failed to parse mapper {}", file.display_name))?;
    let platform: Platform = parsed.metadata.platform.parse()?;
    let blocks = parsed.block_plan(platform);

    let driver = super::driver(driver_args, &config)?;
    driver.establish_connection().await?;
    let results = driver.read_bytes(&blocks).await?;

    StaticDriver::from_results(&results, Duration::ZERO).save_snapshot(output)?;

    let total: usize = results.iter().map(|r| r.data.len()).sum();
    println!(
        "Captured {} blocks ({} bytes) from {} to {}",
        results.len(),
        total,
        driver.proper_name(),
        output.display()
    );

    Ok(())
}
