//! Command handlers for the memhook CLI
//!
//! Each subcommand has its own module with handler functions. Helpers shared
//! between them live here.

pub mod capture;
pub mod configure;
pub mod mappers;
pub mod watch;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use memhook::{
    Driver, MapperCatalog, MapperFile, MapperFilesystemProvider, MemoryAddress, ProcessDriver,
    ProcessTarget, StaticDriver,
};

use crate::cli::DriverArgs;
use crate::config::Config;

/// Build the mapper catalogue from configured folders
pub fn catalog(config: &Config) -> Result<Arc<MapperFilesystemProvider>> {
    let official = config.mapper_folder()?;
    Ok(Arc::new(MapperFilesystemProvider::new(
        official,
        config.engine.custom_mapper_folder.clone(),
    )))
}

/// Find a mapper by ID, display name, or file stem
pub fn find_mapper(catalog: &dyn MapperCatalog, query: &str) -> Result<MapperFile> {
    if let Some(file) = catalog.resolve(query) {
        return Ok(file);
    }

    let mut matches: Vec<MapperFile> = catalog
        .mapper_files()
        .into_iter()
        .filter(|f| {
            f.display_name == query
                || f.absolute_path.file_stem().and_then(|s| s.to_str()) == Some(query)
        })
        .collect();

    match matches.len() {
        0 => bail!("No mapper matches '{}'. Run `memhook mappers` to list them.", query),
        1 => Ok(matches.remove(0)),
        n => bail!("'{}' matches {} mappers; use the mapper ID instead", query, n),
    }
}

/// Build the driver described by the command-line arguments
pub fn driver(args: &DriverArgs, config: &Config) -> Result<Arc<dyn Driver>> {
    let delay = args
        .delay_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.engine.delay_between_reads());

    if let Some(path) = &args.snapshot {
        return Ok(Arc::new(load_snapshot(path, delay)?));
    }

    let target = match (&args.pid, &args.process_name) {
        (Some(pid), _) => ProcessTarget::Pid(*pid),
        (None, Some(name)) => ProcessTarget::Name(name.clone()),
        (None, None) => bail!("Specify --snapshot, --pid, or --process-name"),
    };

    let base = args
        .base
        .context("--base is required when attaching to a process")?;
    let base = usize::try_from(base).context("--base does not fit in a host pointer")?;
    let origin = MemoryAddress::try_from(args.origin.unwrap_or(0))
        .context("--origin does not fit in an emulated address")?;

    Ok(Arc::new(
        ProcessDriver::new(target, base, delay).with_origin(origin),
    ))
}

fn load_snapshot(path: &Path, delay: Duration) -> Result<StaticDriver> {
    StaticDriver::load_snapshot(path, delay)
        .with_context(|| format!("Failed to load snapshot {}", path.display()))
}
