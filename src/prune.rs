//! Prune Housekeeping
//!
//! Removes the byproducts of interrupted downloads from a layout:
//! `blobs/sha256/*.partial` files and `.fray/` chunk-state entries.
//! Finalized blobs are never touched.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PruneError {
    #[error("directory not found: {0}")]
    DirNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a prune operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneResult {
    pub files: usize,
    pub bytes: u64,
}

/// A file or directory slated for removal.
#[derive(Debug, Clone)]
pub struct Item {
    pub path: PathBuf,
    pub bytes: u64,
    /// File count inside a directory item.
    pub files: usize,
    pub is_dir: bool,
}

/// Configures the prune operation.
#[derive(Default)]
pub struct Options {
    pub dry_run: bool,
    /// Called for each item found.
    pub on_item: Option<Box<dyn Fn(&Item)>>,
    /// Called after each delete attempt.
    pub on_delete: Option<Box<dyn Fn(&Item, Option<&std::io::Error>)>>,
}

/// Prune incomplete downloads and state from an OCI layout directory.
pub fn run(dir: &Path, opts: &Options) -> Result<PruneResult, PruneError> {
    if !dir.exists() {
        return Err(PruneError::DirNotFound(dir.to_path_buf()));
    }

    let mut result = PruneResult::default();

    // Partial blob downloads.
    let blob_dir = dir.join("blobs").join("sha256");
    if let Ok(entries) = fs::read_dir(&blob_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() || path.extension().and_then(|e| e.to_str()) != Some("partial") {
                continue;
            }

            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let item = Item {
                path: path.clone(),
                bytes,
                files: 1,
                is_dir: false,
            };

            result.files += 1;
            result.bytes += bytes;

            if let Some(cb) = &opts.on_item {
                cb(&item);
            }

            if !opts.dry_run {
                let err = fs::remove_file(&path).err();
                if let Some(cb) = &opts.on_delete {
                    cb(&item, err.as_ref());
                }
            }
        }
    }

    // Chunk-state entries.
    let state_dir = dir.join(".fray");
    if let Ok(entries) = fs::read_dir(&state_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_dir = path.is_dir();

            let (bytes, files) = if is_dir {
                dir_size(&path)
            } else {
                (entry.metadata().map(|m| m.len()).unwrap_or(0), 1)
            };

            let item = Item {
                path: path.clone(),
                bytes,
                files,
                is_dir,
            };

            result.files += files;
            result.bytes += bytes;

            if let Some(cb) = &opts.on_item {
                cb(&item);
            }

            if !opts.dry_run {
                let err = if is_dir {
                    fs::remove_dir_all(&path).err()
                } else {
                    fs::remove_file(&path).err()
                };
                if let Some(cb) = &opts.on_delete {
                    cb(&item, err.as_ref());
                }
            }
        }
    }

    Ok(result)
}

fn dir_size(path: &Path) -> (u64, usize) {
    let mut size = 0;
    let mut count = 0;

    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                let (s, c) = dir_size(&entry_path);
                size += s;
                count += c;
            } else if let Ok(meta) = entry.metadata() {
                size += meta.len();
                count += 1;
            }
        }
    }

    (size, count)
}

/// Format a byte count as a human-readable string.
pub fn human_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;

    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    format!(
        "{:.1} {}B",
        bytes as f64 / div as f64,
        ['K', 'M', 'G', 'T', 'P', 'E'][exp]
    )
}
