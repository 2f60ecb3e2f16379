//! Mappers: a game's memory layout expressed as named properties, plus an
//! optional global script.
//!
//! ## Module Structure
//!
//! - `property` - properties, change tracking, and the property graph
//! - `xml` - the XML mapper format
//! - `catalog` - on-disk mapper discovery and ID resolution

pub mod catalog;
pub mod property;
pub mod xml;

pub use catalog::{MapperCatalog, MapperFile, MapperFilesystemProvider, MapperKind};
pub use property::{
    Endian, Property, PropertyField, PropertyGraph, PropertyScripts, PropertySnapshot,
    PropertySpec, PropertyType,
};

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::{MemoryAddress, MemoryAddressBlock};
use crate::platform::Platform;

/// Extension of the companion script that sits next to an XML mapper.
pub const SCRIPT_EXTENSION: &str = "rhai";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperMetadata {
    pub id: String,
    pub game_name: String,
    /// Platform identifier as written in the mapper; resolved at load time.
    pub platform: String,
}

/// An explicit read range declared by the mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRange {
    pub start: MemoryAddress,
    pub end: MemoryAddress,
    pub namespace: Option<String>,
}

impl ReadRange {
    pub fn to_block(&self) -> MemoryAddressBlock {
        let block = MemoryAddressBlock::new(format!("Range {:#x}", self.start), self.start, self.end);
        match &self.namespace {
            Some(ns) => block.with_namespace(ns.clone()),
            None => block,
        }
    }
}

#[derive(Debug)]
pub struct Mapper {
    pub metadata: MapperMetadata,
    pub properties: PropertyGraph,
    pub read_ranges: Vec<ReadRange>,
    pub global_script: Option<String>,
    pub has_global_preprocessor: bool,
    pub has_global_postprocessor: bool,
}

impl Mapper {
    /// One block per declared read range, in declaration order.
    pub fn read_blocks(&self) -> Vec<MemoryAddressBlock> {
        self.read_ranges.iter().map(ReadRange::to_block).collect()
    }

    /// Blocks to fetch each cycle: the declared ranges, or the platform's
    /// defaults when none are declared.
    pub fn block_plan(&self, platform: Platform) -> Vec<MemoryAddressBlock> {
        if self.read_ranges.is_empty() {
            platform.default_blocks()
        } else {
            self.read_blocks()
        }
    }
}

static MODULE_EXPORTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"export\s*\{[^}]*\};").expect("export pattern is valid"));

/// Remove `export { ... };` statements so a companion script written as a
/// module can run as plain top-level code.
pub fn strip_module_exports(script: &str) -> String {
    MODULE_EXPORTS.replace_all(script, "").into_owned()
}

/// Load and parse the mapper a catalogue entry points at.
pub fn load_mapper_file(file: &MapperFile) -> Result<Mapper> {
    let path = file.absolute_path.as_path();
    if !path.exists() {
        return Err(Error::MapperFileMissing(file.display_name.clone()));
    }

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    if extension != "xml" {
        return Err(Error::UnsupportedMapperFormat(format!(
            "{} (.{} mappers cannot be loaded)",
            file.display_name, extension
        )));
    }

    let contents = std::fs::read_to_string(path)?;
    let script = read_companion_script(path)?;

    xml::parse_mapper(&contents, script)
}

fn read_companion_script(mapper_path: &Path) -> Result<Option<String>> {
    let script_path = mapper_path.with_extension(SCRIPT_EXTENSION);
    if !script_path.exists() {
        return Ok(None);
    }

    let script = std::fs::read_to_string(&script_path)?;
    Ok(Some(strip_module_exports(&script)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_at(path: PathBuf) -> MapperFile {
        MapperFile {
            id: "test".into(),
            kind: MapperKind::Official,
            display_name: format!("official:\\{}", path.display()),
            absolute_path: path,
        }
    }

    #[test]
    fn test_strip_module_exports() {
        let script = "fn preprocessor() { true }\nexport { preprocessor, postprocessor };\nlet a = 1;";
        let stripped = strip_module_exports(script);
        assert!(!stripped.contains("export"));
        assert!(stripped.contains("fn preprocessor()"));
        assert!(stripped.contains("let a = 1;"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_mapper_file(&file_at(dir.path().join("gone.xml"))).unwrap_err();
        assert!(matches!(err, Error::MapperFileMissing(_)));
    }

    #[test]
    fn test_yaml_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.yml");
        std::fs::write(&path, "properties: []").unwrap();

        let err = load_mapper_file(&file_at(path)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMapperFormat(_)));
    }

    #[test]
    fn test_loads_companion_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.xml");
        std::fs::write(
            &path,
            r#"<mapper id="g" name="Game" platform="GB"><properties /></mapper>"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("game.rhai"),
            "fn postprocessor() { }\nexport { postprocessor };",
        )
        .unwrap();

        let mapper = load_mapper_file(&file_at(path)).unwrap();
        assert!(mapper.has_global_postprocessor);
        assert!(!mapper.has_global_preprocessor);
        assert!(!mapper.global_script.unwrap().contains("export"));
    }

    #[test]
    fn test_block_plan_falls_back_to_platform() {
        let mapper = xml::parse_mapper(
            r#"<mapper id="g" name="Game" platform="NES"><properties /></mapper>"#,
            None,
        )
        .unwrap();
        assert_eq!(mapper.block_plan(Platform::Nes), Platform::Nes.default_blocks());
    }

    #[test]
    fn test_read_range_blocks_keep_namespace() {
        let range = ReadRange {
            start: 0x10,
            end: 0x1F,
            namespace: Some("sram".into()),
        };
        let block = range.to_block();
        assert_eq!(block.len(), 16);
        assert_eq!(block.namespace(), "sram");
    }
}
