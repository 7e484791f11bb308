//! Packager: enumerate a source file or directory into a manifest.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::manifest::Manifest;

/// Piece size in bytes used for piece-count arithmetic.
pub const PIECE_SIZE: u64 = 256 * 1024; // 256 KiB

/// Source file or directory to be described by a [`Manifest`].
pub struct Packager {
    source: PathBuf,
    name: String,
}

impl Packager {
    /// `name` defaults to the source's file stem.
    pub fn new(source: impl Into<PathBuf>, name: Option<String>) -> Result<Self, PackagerError> {
        let source = source.into();
        if !source.exists() {
            return Err(PackagerError::NotFound(source));
        }
        let name = match name {
            Some(n) => n,
            None => source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| PackagerError::NoName(source.clone()))?,
        };
        Ok(Self { source, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_file(&self) -> bool {
        self.source.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.source.is_dir()
    }

    /// Every regular file under the source with its size. Paths are relative to the
    /// source's parent directory and `/`-separated.
    pub fn filelist(&self) -> Result<Vec<(String, u64)>, PackagerError> {
        let base = self.source.parent().unwrap_or_else(|| Path::new(""));
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.source) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let size = entry.metadata()?.len();
            let rel = entry.path().strip_prefix(base).unwrap_or(entry.path());
            out.push((to_posix(rel), size));
        }
        out.sort();
        Ok(out)
    }

    pub fn size(&self) -> Result<u64, PackagerError> {
        Ok(self.filelist()?.iter().map(|(_, size)| size).sum())
    }

    /// Number of [`PIECE_SIZE`] pieces needed to cover the content.
    pub fn piece_count(&self) -> Result<u64, PackagerError> {
        Ok(piece_count(self.size()?, PIECE_SIZE))
    }

    pub fn package(&self) -> Result<Manifest, PackagerError> {
        Ok(Manifest::new(self.name.clone(), self.filelist()?))
    }
}

/// `ceil(total / piece_size)`; a zero piece size falls back to [`PIECE_SIZE`].
pub fn piece_count(total: u64, piece_size: u64) -> u64 {
    let size = if piece_size == 0 { PIECE_SIZE } else { piece_size };
    total.div_ceil(size)
}

fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, thiserror::Error)]
pub enum PackagerError {
    #[error("source path '{0}' does not exist")]
    NotFound(PathBuf),
    #[error("cannot derive a package name from '{0}'")]
    NoName(PathBuf),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}
