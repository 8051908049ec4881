//! OCI Image Manifest Parsing
//!
//! Supports both OCI Image Manifest and Docker Image Manifest v2 formats,
//! plus manifest lists / image indexes for multi-arch images.
//! See: https://github.com/opencontainers/image-spec/blob/main/manifest.md

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::image::Result;

/// Annotation key carrying the user-visible image reference in index.json.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// OCI Media Types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    /// OCI Image Index
    OciIndex,
    /// OCI Image Manifest
    OciManifest,
    /// Docker Manifest List (fat manifest)
    DockerManifestList,
    /// Docker Manifest v2
    DockerManifestV2,
    /// Unknown/other media type
    Other(String),
}

impl MediaType {
    pub fn from_str(s: &str) -> Self {
        match s {
            "application/vnd.oci.image.index.v1+json" => MediaType::OciIndex,
            "application/vnd.oci.image.manifest.v1+json" => MediaType::OciManifest,
            "application/vnd.docker.distribution.manifest.list.v2+json" => {
                MediaType::DockerManifestList
            }
            "application/vnd.docker.distribution.manifest.v2+json" => MediaType::DockerManifestV2,
            other => MediaType::Other(other.to_string()),
        }
    }

    /// True for manifest-of-manifests media types.
    pub fn is_index(&self) -> bool {
        match self {
            MediaType::OciIndex | MediaType::DockerManifestList => true,
            MediaType::Other(s) => s.contains("manifest.list") || s.contains("image.index"),
            _ => false,
        }
    }

    /// The Accept header value for manifest requests.
    pub fn accept_header() -> String {
        [
            "application/vnd.oci.image.manifest.v1+json",
            "application/vnd.oci.image.index.v1+json",
            "application/vnd.docker.distribution.manifest.v2+json",
            "application/vnd.docker.distribution.manifest.list.v2+json",
        ]
        .join(", ")
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::OciIndex => write!(f, "application/vnd.oci.image.index.v1+json"),
            MediaType::OciManifest => write!(f, "application/vnd.oci.image.manifest.v1+json"),
            MediaType::DockerManifestList => {
                write!(
                    f,
                    "application/vnd.docker.distribution.manifest.list.v2+json"
                )
            }
            MediaType::DockerManifestV2 => {
                write!(f, "application/vnd.docker.distribution.manifest.v2+json")
            }
            MediaType::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Content descriptor - refers to a blob by digest
///
/// Also used for entries in the layout's index.json, where `annotations`
/// carries the image reference and `platform` may carry arch hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    /// MIME type of the referenced content
    #[serde(rename = "mediaType")]
    pub media_type: String,

    /// Content hash (e.g., "sha256:abc123...")
    pub digest: String,

    /// Size in bytes
    pub size: u64,

    /// Optional annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,

    /// Platform this content is for (manifest lists)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// The `ref.name` annotation, if present.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(REF_NAME_ANNOTATION))
            .map(String::as_str)
    }
}

/// Platform specification for multi-arch images
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture (e.g., "amd64", "arm64")
    pub architecture: String,

    /// Operating system (e.g., "linux", "windows")
    pub os: String,

    /// CPU variant (e.g., "v8" for arm64)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Check if this platform matches the given os/arch pair.
    fn matches(&self, os: &str, arch: &str) -> bool {
        self.os == os && self.architecture == arch
    }
}

/// CPU architecture of the running host, in OCI naming.
pub(crate) fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Image manifest (OCI or Docker v2 — structurally compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version (2 for all supported formats)
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    /// Media type of the manifest
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Reference to image configuration
    pub config: Descriptor,

    /// List of layer descriptors
    pub layers: Vec<Descriptor>,

    /// Optional annotations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Manifest {
    /// The declared media type, defaulting to Docker manifest v2.
    pub fn media_type(&self) -> String {
        self.media_type
            .clone()
            .unwrap_or_else(|| MediaType::DockerManifestV2.to_string())
    }
}

/// OCI Image Index / Docker Manifest List
///
/// Used for multi-architecture images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    /// Select the sub-manifest for the running host.
    ///
    /// Falls back to linux/amd64 when the host platform is absent.
    /// Returns `None` when neither matches.
    pub fn select_platform(&self) -> Option<&Descriptor> {
        self.find_platform(std::env::consts::OS, host_arch())
            .or_else(|| self.find_platform("linux", "amd64"))
    }

    /// Find a manifest for a specific os/arch pair.
    pub fn find_platform(&self, os: &str, arch: &str) -> Option<&Descriptor> {
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .map(|p| p.matches(os, arch))
                .unwrap_or(false)
        })
    }

    /// The os/arch pairs this index offers, for error reporting.
    pub fn offered_platforms(&self) -> Vec<String> {
        self.manifests
            .iter()
            .filter_map(|m| m.platform.as_ref())
            .map(|p| format!("{}/{}", p.os, p.architecture))
            .collect()
    }
}

/// Enum representing the two manifest shapes a registry can return
#[derive(Debug, Clone)]
pub enum ManifestKind {
    /// Concrete image manifest (OCI or Docker v2)
    Image(Manifest),
    /// Manifest list / image index (multi-arch)
    Index(ManifestList),
}

/// Parse any manifest type from JSON.
///
/// The type is detected from the `mediaType` field when present, or from
/// the presence of a `manifests` array.
pub fn parse_manifest(data: &[u8]) -> Result<ManifestKind> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
        manifests: Option<Vec<serde_json::Value>>,
    }

    let probe: Probe = serde_json::from_slice(data)?;

    if probe.manifests.is_some()
        || probe
            .media_type
            .as_deref()
            .map(|mt| MediaType::from_str(mt).is_index())
            .unwrap_or(false)
    {
        let list: ManifestList = serde_json::from_slice(data)?;
        return Ok(ManifestKind::Index(list));
    }

    let manifest: Manifest = serde_json::from_slice(data)?;
    Ok(ManifestKind::Image(manifest))
}

/// Sniff the media type of stored manifest bytes.
///
/// Falls back to Docker manifest v2 when the field is absent or the
/// bytes fail to parse.
pub fn detect_media_type(data: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
    }

    serde_json::from_slice::<Probe>(data)
        .ok()
        .and_then(|p| p.media_type)
        .unwrap_or_else(|| MediaType::DockerManifestV2.to_string())
}
