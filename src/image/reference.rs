//! Image Reference Parsing
//!
//! Parses Docker-style image references like:
//! - alpine
//! - alpine:3.19
//! - myuser/myapp:v1.0
//! - ghcr.io/owner/repo:tag
//! - registry.example.com:5000/app@sha256:abc...

use crate::image::{ImageError, Result};

/// Canonical Docker Hub registry host.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// User-facing Docker Hub alias, folded to the canonical host on parse.
pub const DOCKER_HUB_ALIAS: &str = "docker.io";

/// Parsed image reference
///
/// The `reference` field is either a tag or a full `alg:hex` digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host (e.g., "registry-1.docker.io", "ghcr.io")
    pub registry: String,

    /// Repository path (e.g., "library/alpine", "myuser/myapp")
    pub repository: String,

    /// Tag or digest (e.g., "latest", "sha256:abc...")
    pub reference: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Defaults:
    /// - `alpine` -> registry-1.docker.io/library/alpine:latest
    /// - `myuser/myapp` -> registry-1.docker.io/myuser/myapp:latest
    /// - `docker.io/...` folds to registry-1.docker.io
    ///
    /// A leading segment is treated as a registry host iff it contains
    /// a `.` or a `:`. The last `@` separates a digest and wins over a
    /// trailing `:tag`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ImageError::InvalidReference("empty image reference".to_string()));
        }

        let mut rest = s;
        let mut reference = "latest".to_string();

        if let Some(idx) = rest.rfind('@') {
            reference = rest[idx + 1..].to_string();
            rest = &rest[..idx];
        } else if let Some(idx) = rest.rfind(':') {
            // A colon inside a host segment (port) is followed by a slash.
            if !rest[idx..].contains('/') {
                reference = rest[idx + 1..].to_string();
                rest = &rest[..idx];
            }
        }

        let (registry, repository) = match rest.split_once('/') {
            None => (DOCKER_HUB_REGISTRY.to_string(), format!("library/{}", rest)),
            Some((first, remainder)) => {
                if first.contains('.') || first.contains(':') {
                    let registry = if first == DOCKER_HUB_ALIAS {
                        DOCKER_HUB_REGISTRY.to_string()
                    } else {
                        first.to_string()
                    };
                    (registry, remainder.to_string())
                } else {
                    (DOCKER_HUB_REGISTRY.to_string(), rest.to_string())
                }
            }
        };

        if repository.is_empty() || reference.is_empty() {
            return Err(ImageError::InvalidReference(s.to_string()));
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// True when the reference part is a digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }

    /// The canonical reference string, the left inverse of [`parse`].
    ///
    /// [`parse`]: ImageReference::parse
    pub fn full_name(&self) -> String {
        if self.is_digest() {
            format!("{}/{}@{}", self.registry, self.repository, self.reference)
        } else {
            format!("{}/{}:{}", self.registry, self.repository, self.reference)
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_image() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference, "latest");
        assert!(!r.is_digest());
    }

    #[test]
    fn test_image_with_tag() {
        let r = ImageReference::parse("alpine:3.19").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference, "3.19");
    }

    #[test]
    fn test_user_image() {
        let r = ImageReference::parse("myuser/myapp").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "myuser/myapp");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn test_docker_io_alias() {
        let r = ImageReference::parse("docker.io/library/alpine:latest").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/alpine");
    }

    #[test]
    fn test_ghcr_image() {
        let r = ImageReference::parse("ghcr.io/owner/repo:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "owner/repo");
        assert_eq!(r.reference, "v1");
    }

    #[test]
    fn test_local_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/myapp:v1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myapp");
        assert_eq!(r.reference, "v1");
    }

    #[test]
    fn test_digest_reference() {
        let r = ImageReference::parse("alpine@sha256:abc123").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference, "sha256:abc123");
        assert!(r.is_digest());
    }

    #[test]
    fn test_digest_wins_over_tag() {
        let r = ImageReference::parse("ghcr.io/owner/repo:v1@sha256:def456").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "owner/repo");
        assert_eq!(r.reference, "sha256:def456");
    }

    #[test]
    fn test_empty_rejected() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
    }

    #[test]
    fn test_format_parse_round_trip() {
        let inputs = [
            "alpine",
            "alpine:3.19",
            "myuser/myapp:v1.0",
            "ghcr.io/owner/repo:tag",
            "localhost:5000/app:v1",
            "registry.example.com/deep/nested/repo@sha256:abc",
        ];

        for input in inputs {
            let parsed = ImageReference::parse(input).unwrap();
            let reparsed = ImageReference::parse(&parsed.full_name()).unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {}", input);
        }
    }
}
