//! Content manifest: name + sorted file list, content-addressed by SHA-256.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hashable description of a content item. The file list is always kept sorted by path,
/// so two manifests with the same logical content hash identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    name: String,
    filelist: Vec<(String, u64)>,
}

/// On-disk form. `hash` is written for integrity checking, never trusted on load.
#[derive(Serialize, Deserialize)]
struct ManifestFile {
    name: String,
    filelist: Vec<(String, u64)>,
    hash: String,
}

impl Manifest {
    pub fn new(name: impl Into<String>, mut filelist: Vec<(String, u64)>) -> Self {
        filelist.sort();
        Self {
            name: name.into(),
            filelist,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filelist(&self) -> &[(String, u64)] {
        &self.filelist
    }

    /// Total size in bytes of all files.
    pub fn size(&self) -> u64 {
        self.filelist.iter().map(|(_, size)| size).sum()
    }

    /// Lowercase hex SHA-256 over `name:` followed by `path:size` for every entry.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b":");
        for (path, size) in &self.filelist {
            hasher.update(path.as_bytes());
            hasher.update(b":");
            hasher.update(size.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Check a hash that travelled alongside this manifest (file or wire).
    pub fn verify_hash(&self, stored: &str) -> Result<(), ManifestError> {
        let computed = self.hash();
        if computed != stored {
            return Err(ManifestError::HashMismatch {
                stored: stored.to_string(),
                computed,
            });
        }
        Ok(())
    }

    /// Write the manifest as JSON (`name`, `filelist`, `hash`).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ManifestError> {
        let file = ManifestFile {
            name: self.name.clone(),
            filelist: self.filelist.clone(),
            hash: self.hash(),
        };
        let json = serde_json::to_string(&file)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load a manifest written by [`Manifest::save`]. Fails with
    /// [`ManifestError::HashMismatch`] if the stored hash does not match the content.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let s = fs::read_to_string(path)?;
        let file: ManifestFile = serde_json::from_str(&s)?;
        let manifest = Manifest::new(file.name, file.filelist);
        manifest.verify_hash(&file.hash)?;
        Ok(manifest)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid manifest json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hash mismatch (stored {stored}, computed {computed}): manifest may be corrupted")]
    HashMismatch { stored: String, computed: String },
}
