//! OCI Distribution (Registry) Client
//!
//! Implements the read side of the OCI Distribution Specification for
//! pulling images from Docker Hub, GHCR, and other OCI-compliant
//! registries.
//!
//! Features:
//! - Token-based authentication with container auth.json credentials
//! - Manifest resolution with multi-arch platform selection
//! - Ranged blob fetches for chunked, resumable downloads
//! - Bounded retries with exponential backoff on range fetches

mod auth;
mod client;

pub use auth::AuthStore;
pub use client::{FetchedManifest, RegistryClient};

use thiserror::Error;

/// Errors that can occur during registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no matching manifest for {target}, available: {available:?}")]
    NoMatchingManifest {
        target: String,
        available: Vec<String>,
    },

    #[error("registry returned status {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
