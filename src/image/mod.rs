//! OCI Image Data Model
//!
//! Provides the shared image vocabulary used across the store, registry
//! client, and proxy:
//! - Image reference parsing (Docker-style strings)
//! - Manifest parsing (OCI and Docker v2 formats, manifest lists)
//! - Platform selection for multi-arch images

mod manifest;
mod reference;

pub use manifest::{
    detect_media_type, parse_manifest, Descriptor, Manifest, ManifestKind, ManifestList,
    MediaType, Platform, REF_NAME_ANNOTATION,
};
pub use reference::{ImageReference, DOCKER_HUB_ALIAS, DOCKER_HUB_REGISTRY};

pub(crate) use manifest::host_arch;

use thiserror::Error;

/// Errors that can occur while working with image data
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;
