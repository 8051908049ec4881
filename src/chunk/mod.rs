//! Chunk-State Tracking for Resumable Blob Downloads
//!
//! Every in-flight layer download is backed by a [`ChunkTree`]: a record
//! of which fixed-size chunks of the blob are already on disk. The tree
//! survives process crashes through a JSON state file, so an interrupted
//! pull resumes by fetching only the chunks that are still missing.
//!
//! Chunk hashes are xxHash64 — fast enough for edge devices. Final blob
//! verification uses SHA-256 (OCI requirement) at a layer above.

mod state;
mod tree;

pub use state::{State, STATE_VERSION};
pub use tree::{ChunkHash, ChunkTree};

use thiserror::Error;

/// Errors that can occur during chunk-state operations
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("chunk index {index} out of range [0, {num_chunks})")]
    OutOfRange { index: usize, num_chunks: usize },

    #[error("unsupported state version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid leaf hash: {0}")]
    InvalidLeaf(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChunkError>;
