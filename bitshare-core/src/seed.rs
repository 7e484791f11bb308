//! Seed: "this local path holds the content described by this manifest".

use std::path::{Path, PathBuf};

use crate::manifest::Manifest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed {
    manifest: Manifest,
    path: PathBuf,
}

impl Seed {
    pub fn new(manifest: Manifest, path: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            path: path.into(),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content hash of the seeded manifest.
    pub fn hash(&self) -> String {
        self.manifest.hash()
    }
}
