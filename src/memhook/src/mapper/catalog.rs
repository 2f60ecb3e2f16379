//! On-disk mapper discovery.
//!
//! Mapper IDs are derived from the file's absolute path, so the same file
//! keeps its ID across restarts while the path itself is never exposed to
//! clients.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

const ID_SALT: &str = "a1b3d4e8-81cc-4771-a564-f90c669d952e";

/// File extensions the catalogue lists. Only XML is loadable.
pub const MAPPER_EXTENSIONS: &[&str] = &["xml", "yml"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapperKind {
    Official,
    Custom,
}

impl MapperKind {
    fn prefix(&self) -> &'static str {
        match self {
            MapperKind::Official => "official",
            MapperKind::Custom => "custom",
        }
    }
}

/// A mapper file known to the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperFile {
    pub id: String,
    pub kind: MapperKind,
    #[serde(skip)]
    pub absolute_path: PathBuf,
    pub display_name: String,
}

/// Resolves mapper IDs to files.
pub trait MapperCatalog: Send + Sync {
    fn resolve(&self, id: &str) -> Option<MapperFile>;

    fn mapper_files(&self) -> Vec<MapperFile>;
}

/// Catalogue backed by an official folder and an optional custom folder.
#[derive(Debug)]
pub struct MapperFilesystemProvider {
    official_folder: PathBuf,
    custom_folder: Option<PathBuf>,
    files: RwLock<Vec<MapperFile>>,
}

impl MapperFilesystemProvider {
    /// Create a provider and scan both folders.
    pub fn new(official_folder: impl Into<PathBuf>, custom_folder: Option<PathBuf>) -> Self {
        let provider = Self {
            official_folder: official_folder.into(),
            custom_folder,
            files: RwLock::new(Vec::new()),
        };
        provider.refresh();
        provider
    }

    pub fn official_folder(&self) -> &Path {
        &self.official_folder
    }

    pub fn custom_folder(&self) -> Option<&Path> {
        self.custom_folder.as_deref()
    }

    /// Re-scan both folders, replacing the current listing.
    pub fn refresh(&self) {
        let mut files = scan(&self.official_folder, MapperKind::Official);
        if let Some(custom) = self.custom_folder.as_deref().filter(|p| p.is_dir()) {
            files.extend(scan(custom, MapperKind::Custom));
        }

        debug!("Found {} mapper files", files.len());
        *self.files.write().unwrap_or_else(|e| e.into_inner()) = files;
    }
}

impl MapperCatalog for MapperFilesystemProvider {
    fn resolve(&self, id: &str) -> Option<MapperFile> {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|f| f.id == id)
            .cloned()
    }

    fn mapper_files(&self) -> Vec<MapperFile> {
        self.files.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn scan(root: &Path, kind: MapperKind) -> Vec<MapperFile> {
    if !root.is_dir() {
        warn!("Mapper folder {} does not exist", root.display());
        return Vec::new();
    }

    let mut files: Vec<MapperFile> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| MAPPER_EXTENSIONS.contains(&ext))
                .unwrap_or(false)
        })
        .map(|e| {
            let absolute_path = std::fs::canonicalize(e.path()).unwrap_or_else(|_| e.path().to_path_buf());
            let relative = e.path().strip_prefix(root).unwrap_or(e.path());
            MapperFile {
                id: mapper_id(&absolute_path),
                kind,
                display_name: format!("{}:\\{}", kind.prefix(), relative.display()),
                absolute_path,
            }
        })
        .collect();

    files.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    files
}

/// Lowercase hex MD5 of the path followed by the salt.
pub fn mapper_id(absolute_path: &Path) -> String {
    let mut hasher = Md5::new();
    hasher.update(absolute_path.to_string_lossy().as_bytes());
    hasher.update(ID_SALT.as_bytes());
    hex::encode(hasher.finalize())
}
