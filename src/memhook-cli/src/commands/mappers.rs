//! Mapper catalogue listing

use anyhow::Result;
use memhook::{MapperCatalog, MapperKind};

use crate::config::Config;

/// Handle the mappers command
pub fn handle(json: bool) -> Result<()> {
    let config = Config::load()?;
    let catalog = super::catalog(&config)?;
    let files = catalog.mapper_files();

    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    if files.is_empty() {
        println!("No mappers found in {}", catalog.official_folder().display());
        if let Some(custom) = catalog.custom_folder() {
            println!("              or {}", custom.display());
        }
        return Ok(());
    }

    for file in &files {
        let kind = match file.kind {
            MapperKind::Official => "official",
            MapperKind::Custom => "custom",
        };
        println!("{}  {:<8}  {}", file.id, kind, file.display_name);
    }
    println!();
    println!("{} mappers", files.len());

    Ok(())
}
