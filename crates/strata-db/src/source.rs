use std::collections::BTreeMap;
use std::path::PathBuf;

use include_dir::Dir;
use strata_common::{Error, Result};

/// Read-only storage of named migration assets, grouped in directories
/// (one per database driver).
pub trait AssetSource {
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    fn read(&self, dir: &str, name: &str) -> Result<Vec<u8>>;
}

/// Assets on the local filesystem under `root`.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetSource for DirectorySource {
    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.root.join(dir);
        let entries = std::fs::read_dir(&path).map_err(|e| {
            Error::Catalog(format!("failed to list {}: {e}", path.display()))
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, dir: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.root.join(dir).join(name);
        std::fs::read(&path)
            .map_err(|e| Error::Catalog(format!("failed to read {}: {e}", path.display())))
    }
}

/// Assets compiled into the binary with `include_dir!`.
pub struct EmbeddedSource {
    root: &'static Dir<'static>,
}

impl EmbeddedSource {
    pub fn new(root: &'static Dir<'static>) -> Self {
        Self { root }
    }
}

impl AssetSource for EmbeddedSource {
    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let sub = self
            .root
            .get_dir(dir)
            .ok_or_else(|| Error::Catalog(format!("embedded directory '{dir}' not found")))?;

        let mut names: Vec<String> = sub
            .files()
            .filter_map(|f| f.path().file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn read(&self, dir: &str, name: &str) -> Result<Vec<u8>> {
        let path = format!("{dir}/{name}");
        self.root
            .get_file(&path)
            .map(|f| f.contents().to_vec())
            .ok_or_else(|| Error::Catalog(format!("embedded asset '{path}' not found")))
    }
}

/// Owned in-memory assets, for tests and programmatic catalogs.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    dirs: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, dir: &str, name: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(dir, name, contents);
        self
    }

    pub fn insert(&mut self, dir: &str, name: &str, contents: impl Into<Vec<u8>>) {
        self.dirs
            .entry(dir.to_string())
            .or_default()
            .insert(name.to_string(), contents.into());
    }
}

impl AssetSource for MemorySource {
    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let files = self
            .dirs
            .get(dir)
            .ok_or_else(|| Error::Catalog(format!("directory '{dir}' not found")))?;
        Ok(files.keys().cloned().collect())
    }

    fn read(&self, dir: &str, name: &str) -> Result<Vec<u8>> {
        self.dirs
            .get(dir)
            .and_then(|files| files.get(name))
            .cloned()
            .ok_or_else(|| Error::Catalog(format!("asset '{dir}/{name}' not found")))
    }
}
