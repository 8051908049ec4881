//! Content-Addressed Layered Store
//!
//! The on-disk OCI Image Layout plus the resumable puller that fills it:
//! - Atomic, deduplicating blob ingestion
//! - Sparse partial-blob writes for chunked downloads
//! - index.json manipulation and storage statistics
//! - Resumable, parallel, digest-verified layer pulls

mod layout;
mod puller;

pub use layout::{Index, Layout, Stats, LAYOUT_VERSION};
pub use puller::{
    ProgressFn, PullOptions, PullResult, Puller, DEFAULT_CHUNK_SIZE, DEFAULT_PARALLEL,
};

use thiserror::Error;

use crate::chunk::ChunkError;
use crate::image::ImageError;
use crate::registry::RegistryError;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unsupported image layout version: {0}")]
    UnsupportedLayout(String),

    #[error("partial blob not found: {0}")]
    PartialNotFound(String),

    #[error("layer incomplete: {present}/{total} chunks")]
    Incomplete { present: usize, total: usize },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("store corruption: {0}")]
    Corruption(String),

    #[error("chunk state error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
