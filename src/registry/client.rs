//! Registry Client Implementation
//!
//! Implements the OCI Distribution Spec API consumed by the puller:
//! - GET /v2/<name>/manifests/<reference> - manifest with platform resolution
//! - GET /v2/<name>/blobs/<digest> - full blob download
//! - GET /v2/<name>/blobs/<digest> with Range - chunked blob download
//!
//! Every request starts anonymous; a 401 triggers exactly one retry with
//! an Authorization header obtained from the [`AuthStore`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RANGE};
use reqwest::StatusCode;

use crate::image::{parse_manifest, ImageReference, Manifest, ManifestKind, MediaType};
use crate::registry::{AuthStore, RegistryError, Result};

/// Per-request timeout for range fetches.
const RANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry budget for range fetches, on top of the first attempt.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between retries.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A manifest as fetched from a registry.
///
/// `raw` holds the canonical bytes actually received for the resolved
/// (platform-specific) manifest; digests are computed over these bytes,
/// never over a re-serialization.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub manifest: Manifest,
    pub raw: Vec<u8>,
    pub media_type: String,
}

/// OCI Distribution registry client
pub struct RegistryClient {
    http: reqwest::Client,
    auth: Arc<AuthStore>,
    insecure: HashSet<String>,
}

impl RegistryClient {
    /// Create a client with the default auth store.
    pub fn new() -> Result<Self> {
        Self::with_auth(AuthStore::new())
    }

    /// Create a client with a preconfigured auth store.
    pub fn with_auth(auth: AuthStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("fray/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            http,
            auth: Arc::new(auth),
            insecure: HashSet::new(),
        })
    }

    /// Mark a registry as insecure (HTTP instead of HTTPS), for local
    /// and testing registries.
    pub fn set_insecure(&mut self, registry: &str) {
        self.insecure.insert(registry.to_string());
    }

    fn registry_url(&self, registry: &str) -> String {
        let scheme = if self.insecure.contains(registry) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, registry)
    }

    fn manifest_url(&self, registry: &str, repo: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url(registry),
            repo,
            reference
        )
    }

    fn blob_url(&self, registry: &str, repo: &str, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.registry_url(registry),
            repo,
            digest
        )
    }

    /// Fetch the manifest for an image, resolving manifest lists to the
    /// platform-specific sub-manifest.
    pub async fn get_manifest(&self, image: &ImageReference) -> Result<FetchedManifest> {
        let (raw, media_type) = self
            .fetch_manifest_raw(&image.registry, &image.repository, &image.reference)
            .await?;

        let kind = parse_manifest(&raw).map_err(|e| RegistryError::Protocol {
            status: 200,
            body: format!("unparseable manifest: {}", e),
        })?;

        match kind {
            ManifestKind::Image(manifest) => Ok(FetchedManifest {
                manifest,
                raw,
                media_type,
            }),
            ManifestKind::Index(list) => {
                let selected = list.select_platform().ok_or_else(|| {
                    RegistryError::NoMatchingManifest {
                        target: format!(
                            "{}/{}",
                            std::env::consts::OS,
                            crate::image::host_arch()
                        ),
                        available: list.offered_platforms(),
                    }
                })?;

                tracing::debug!(
                    image = %image,
                    digest = %selected.digest,
                    "resolved manifest list to platform manifest"
                );

                let (raw, media_type) = self
                    .fetch_manifest_raw(&image.registry, &image.repository, &selected.digest)
                    .await?;

                match parse_manifest(&raw).map_err(|e| RegistryError::Protocol {
                    status: 200,
                    body: format!("unparseable platform manifest: {}", e),
                })? {
                    ManifestKind::Image(manifest) => Ok(FetchedManifest {
                        manifest,
                        raw,
                        media_type,
                    }),
                    ManifestKind::Index(_) => Err(RegistryError::Protocol {
                        status: 200,
                        body: "nested manifest list".to_string(),
                    }),
                }
            }
        }
    }

    async fn fetch_manifest_raw(
        &self,
        registry: &str,
        repo: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, String)> {
        let url = self.manifest_url(registry, repo, reference);

        let response = self
            .send_with_auth(registry, repo, |auth_header| {
                let mut request = self.http.get(&url).header(ACCEPT, MediaType::accept_header());
                if let Some(value) = auth_header {
                    request = request.header(AUTHORIZATION, value);
                }
                request
            })
            .await?;

        let status = response.status();
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await?;

        match status {
            StatusCode::OK => Ok((body.to_vec(), media_type)),
            StatusCode::UNAUTHORIZED => Err(RegistryError::Unauthorized(registry.to_string())),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(url)),
            s => Err(RegistryError::Protocol {
                status: s.as_u16(),
                body: body_head(&body),
            }),
        }
    }

    /// Download a complete blob. The returned response streams the body.
    pub async fn get_blob(
        &self,
        registry: &str,
        repo: &str,
        digest: &str,
    ) -> Result<reqwest::Response> {
        let url = self.blob_url(registry, repo, digest);

        let response = self
            .send_with_auth(registry, repo, |auth_header| {
                let mut request = self.http.get(&url);
                if let Some(value) = auth_header {
                    request = request.header(AUTHORIZATION, value);
                }
                request
            })
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(response),
            StatusCode::UNAUTHORIZED => Err(RegistryError::Unauthorized(registry.to_string())),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(url)),
            s => {
                let body = response.bytes().await.unwrap_or_default();
                Err(RegistryError::Protocol {
                    status: s.as_u16(),
                    body: body_head(&body),
                })
            }
        }
    }

    /// Download bytes `[start, end]` (inclusive) of a blob.
    ///
    /// Retries transient failures up to three times with exponential
    /// backoff. A `206` response whose length differs from the requested
    /// window fails with `ShortRead`; a `200` full-body response is
    /// returned as-is (the caller decides whether it is usable).
    pub async fn get_blob_range(
        &self,
        registry: &str,
        repo: &str,
        digest: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_DELAY * 2u32.pow(attempt - 1);
                tracing::debug!(
                    digest,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying range fetch"
                );
                tokio::time::sleep(delay).await;
            }

            match self
                .fetch_range_once(registry, repo, digest, start, end)
                .await
            {
                Ok(data) => return Ok(data),
                // Only transport-level failures are worth retrying.
                Err(err @ (RegistryError::Transport(_) | RegistryError::ShortRead { .. })) => {
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.expect("retry loop exhausted without error"))
    }

    async fn fetch_range_once(
        &self,
        registry: &str,
        repo: &str,
        digest: &str,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>> {
        let url = self.blob_url(registry, repo, digest);
        let range = format!("bytes={}-{}", start, end);

        let response = self
            .send_with_auth(registry, repo, |auth_header| {
                let mut request = self
                    .http
                    .get(&url)
                    .header(RANGE, &range)
                    .timeout(RANGE_TIMEOUT);
                if let Some(value) = auth_header {
                    request = request.header(AUTHORIZATION, value);
                }
                request
            })
            .await?;

        let status = response.status();
        match status {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
                let body = response.bytes().await?;

                if status == StatusCode::PARTIAL_CONTENT {
                    let expected = (end - start + 1) as usize;
                    if body.len() != expected {
                        return Err(RegistryError::ShortRead {
                            expected,
                            actual: body.len(),
                        });
                    }
                }

                Ok(body.to_vec())
            }
            StatusCode::UNAUTHORIZED => Err(RegistryError::Unauthorized(registry.to_string())),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(url)),
            s => {
                let body = response.bytes().await.unwrap_or_default();
                Err(RegistryError::Protocol {
                    status: s.as_u16(),
                    body: body_head(&body),
                })
            }
        }
    }

    /// Check whether the registry honors Range requests for a blob.
    ///
    /// Issues a one-byte ranged GET; only a `206` counts as support.
    pub async fn supports_range(&self, registry: &str, repo: &str, digest: &str) -> Result<bool> {
        let url = self.blob_url(registry, repo, digest);

        let response = self
            .send_with_auth(registry, repo, |auth_header| {
                let mut request = self
                    .http
                    .get(&url)
                    .header(RANGE, "bytes=0-0")
                    .timeout(RANGE_TIMEOUT);
                if let Some(value) = auth_header {
                    request = request.header(AUTHORIZATION, value);
                }
                request
            })
            .await?;

        let supported = response.status() == StatusCode::PARTIAL_CONTENT;
        // Drain so the connection returns to the pool.
        let _ = response.bytes().await;

        Ok(supported)
    }

    /// Send a request anonymously; on 401, obtain auth and retry once.
    async fn send_with_auth<F>(
        &self,
        registry: &str,
        repo: &str,
        build: F,
    ) -> Result<reqwest::Response>
    where
        F: Fn(Option<&str>) -> reqwest::RequestBuilder,
    {
        let response = build(None).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let auth_header = match self.auth.get_auth(registry, repo).await {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(response),
            Err(e) => {
                tracing::debug!(registry, error = %e, "auth lookup failed");
                return Ok(response);
            }
        };

        Ok(build(Some(&auth_header)).send().await?)
    }
}

fn body_head(body: &[u8]) -> String {
    const HEAD: usize = 512;
    String::from_utf8_lossy(&body[..body.len().min(HEAD)]).into_owned()
}
