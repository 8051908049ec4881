//! Proxy HTTP Server
//!
//! Route table (read-only OCI Distribution v2):
//! - GET  /v2/                                   API version check
//! - GET/HEAD /v2/<registry>/<repo…>/manifests/<ref>  cache-or-fetch manifest
//! - GET/HEAD /v2/<registry>/<repo…>/blobs/<digest>   cached blob, 404 if absent
//!
//! `<repo…>` spans one or more path segments; the split is on the first
//! `manifests` or `blobs` segment. Blob requests never reach upstream —
//! blobs are populated as a side effect of manifest-driven pulls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;

use crate::image::detect_media_type;
use crate::registry::{RegistryClient, RegistryError};
use crate::store::{Layout, PullOptions, Puller, StoreError};

pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Configures the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub chunk_size: usize,
    pub parallel: usize,
    pub pull_timeout: Duration,
    pub verify_digests: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::store::DEFAULT_CHUNK_SIZE,
            parallel: crate::store::DEFAULT_PARALLEL,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            verify_digests: true,
        }
    }
}

/// How a pull attempt failed, for HTTP status mapping.
#[derive(Debug, Clone)]
enum PullFailure {
    /// Image unknown upstream: 404.
    NotFound(String),
    /// Upstream registry problem: 502.
    Upstream(String),
    /// Local store problem: 500.
    Local(String),
}

impl PullFailure {
    fn from_store_error(err: &StoreError) -> Self {
        match err {
            StoreError::Registry(RegistryError::NotFound(url)) => Self::NotFound(url.clone()),
            StoreError::Registry(e) => Self::Upstream(e.to_string()),
            StoreError::Image(e) => Self::Upstream(e.to_string()),
            e => Self::Local(e.to_string()),
        }
    }

    fn into_response(self) -> Response {
        match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            Self::Upstream(msg) => (
                StatusCode::BAD_GATEWAY,
                format!("upstream pull failed: {}", msg),
            )
                .into_response(),
            Self::Local(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

/// A single-flight entry: one pull in progress, any number of waiters.
#[derive(Clone)]
struct Flight {
    done: watch::Receiver<bool>,
    outcome: Arc<OnceLock<Option<PullFailure>>>,
}

/// Shared state behind the proxy router.
pub struct ProxyState {
    layout: Arc<Layout>,
    client: Arc<RegistryClient>,
    opts: ProxyOptions,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl ProxyState {
    pub fn new(layout: Arc<Layout>, client: Arc<RegistryClient>, opts: ProxyOptions) -> Self {
        Self {
            layout,
            client,
            opts,
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

/// Build the proxy router.
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/v2", get(handle_version))
        .route("/v2/", get(handle_version))
        .route("/v2/*rest", get(handle_v2))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request"
    );

    response
}

async fn handle_version() -> Response {
    (
        [
            (API_VERSION_HEADER, "registry/2.0"),
            (header::CONTENT_TYPE.as_str(), "application/json"),
        ],
        "{}",
    )
        .into_response()
}

/// Dispatch `/v2/<registry>/<repo…>/{manifests|blobs}/<ref>` paths.
async fn handle_v2(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    Path(rest): Path<String>,
) -> Response {
    let parts: Vec<&str> = rest.split('/').collect();

    if parts.len() >= 4 {
        for i in 1..parts.len() - 1 {
            let registry = parts[0];
            let repo = parts[1..i].join("/");
            let reference = parts[i + 1..].join("/");

            match parts[i] {
                "manifests" => {
                    return handle_manifest(&state, &method, registry, &repo, &reference).await
                }
                "blobs" => return handle_blob(&state, &method, &reference).await,
                _ => {}
            }
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

async fn handle_manifest(
    state: &Arc<ProxyState>,
    method: &Method,
    registry: &str,
    repo: &str,
    reference: &str,
) -> Response {
    let image = if reference.starts_with("sha256:") {
        format!("{}/{}@{}", registry, repo, reference)
    } else {
        format!("{}/{}:{}", registry, repo, reference)
    };

    let digest = match find_manifest_digest(state, &image) {
        Some(digest) => digest,
        None => {
            tracing::info!(image = %image, "cache miss, pulling from upstream");
            if let Err(failure) = pull_image(state, &image).await {
                tracing::warn!(image = %image, error = ?failure, "upstream pull failed");
                return failure.into_response();
            }

            match find_manifest_digest(state, &image) {
                Some(digest) => digest,
                None => {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "manifest not found after pull",
                    )
                        .into_response()
                }
            }
        }
    };

    let data = match state.layout.read_blob(&digest) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(digest = %digest, error = %e, "read manifest blob failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read manifest").into_response();
        }
    };

    let media_type = detect_media_type(&data);

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, media_type)
        .header(CONTENT_DIGEST_HEADER, digest.as_str())
        .header(header::CONTENT_LENGTH, data.len());

    if method == Method::HEAD {
        return response
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    response = response.status(StatusCode::OK);
    response
        .body(Body::from(data))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_blob(state: &Arc<ProxyState>, method: &Method, digest: &str) -> Response {
    if !state.layout.has_blob(digest) {
        return (StatusCode::NOT_FOUND, "blob not found").into_response();
    }

    let Some(size) = state.layout.blob_size(digest) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "blob stat failed").into_response();
    };

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_DIGEST_HEADER, digest)
        .header(header::CONTENT_LENGTH, size);

    if method == Method::HEAD {
        return response
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let file = match tokio::fs::File::open(state.layout.blob_path(digest)).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(digest = %digest, error = %e, "blob open failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "blob open failed").into_response();
        }
    };

    response
        .body(Body::from_stream(ReaderStream::new(file)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn find_manifest_digest(state: &ProxyState, image: &str) -> Option<String> {
    let index = state.layout.get_index().ok()?;

    index
        .manifests
        .iter()
        .find(|m| m.ref_name() == Some(image))
        .map(|m| m.digest.clone())
}

/// Run (or join) the deduplicated pull for an image.
///
/// The first caller creates the flight and runs the puller; concurrent
/// callers for the same image await its completion signal and observe
/// the same outcome.
async fn pull_image(state: &Arc<ProxyState>, image: &str) -> Result<(), PullFailure> {
    enum Role {
        Leader(watch::Sender<bool>, Arc<OnceLock<Option<PullFailure>>>),
        Waiter(Flight),
    }

    let role = {
        let mut in_flight = state.in_flight.lock().unwrap_or_else(|e| e.into_inner());

        match in_flight.get(image) {
            Some(flight) => Role::Waiter(flight.clone()),
            None => {
                let (tx, rx) = watch::channel(false);
                let outcome = Arc::new(OnceLock::new());
                in_flight.insert(
                    image.to_string(),
                    Flight {
                        done: rx,
                        outcome: Arc::clone(&outcome),
                    },
                );
                Role::Leader(tx, outcome)
            }
        }
    };

    match role {
        Role::Waiter(mut flight) => {
            let _ = flight.done.wait_for(|done| *done).await;

            match flight.outcome.get() {
                Some(None) => Ok(()),
                Some(Some(failure)) => Err(failure.clone()),
                None => Err(PullFailure::Local("pull aborted".to_string())),
            }
        }
        Role::Leader(tx, outcome) => {
            let puller = Puller::new(
                Arc::clone(&state.layout),
                Arc::clone(&state.client),
                PullOptions {
                    chunk_size: state.opts.chunk_size,
                    parallel: state.opts.parallel,
                    verify_digests: state.opts.verify_digests,
                    ..Default::default()
                },
            );

            let failure = match tokio::time::timeout(state.opts.pull_timeout, puller.pull(image))
                .await
            {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(PullFailure::from_store_error(&e)),
                Err(_) => Some(PullFailure::Upstream("pull deadline exceeded".to_string())),
            };

            let _ = outcome.set(failure.clone());
            {
                let mut in_flight = state.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.remove(image);
            }
            let _ = tx.send(true);

            match failure {
                None => Ok(()),
                Some(failure) => Err(failure),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::image::{Descriptor, MediaType, REF_NAME_ANNOTATION};

    fn test_state(dir: &std::path::Path) -> Arc<ProxyState> {
        let layout = Arc::new(Layout::open(dir).unwrap());
        let client = Arc::new(RegistryClient::new().unwrap());
        Arc::new(ProxyState::new(layout, client, ProxyOptions::default()))
    }

    /// Seed a manifest blob plus its index entry.
    fn seed_manifest(state: &ProxyState, image: &str, body: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let digest = format!("sha256:{:x}", Sha256::digest(body));

        state
            .layout
            .write_blob(&digest, &mut &body[..])
            .unwrap();

        let mut annotations = StdHashMap::new();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), image.to_string());
        state
            .layout
            .add_manifest(Descriptor {
                media_type: MediaType::DockerManifestV2.to_string(),
                digest: digest.clone(),
                size: body.len() as u64,
                annotations: Some(annotations),
                platform: None,
            })
            .unwrap();

        digest
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let dir = tempdir().unwrap();
        let app = router(test_state(dir.path()));

        for uri in ["/v2", "/v2/"] {
            let response = app
                .clone()
                .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get(API_VERSION_HEADER).unwrap(),
                "registry/2.0"
            );
            assert_eq!(body_bytes(response).await, b"{}");
        }
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let dir = tempdir().unwrap();
        let app = router(test_state(dir.path()));

        for uri in ["/", "/v1/whatever", "/v2/short", "/v2/a/b/c"] {
            let response = app
                .clone()
                .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_manifest_cache_hit() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        let manifest = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json"}"#;
        let digest = seed_manifest(&state, "example.com/myrepo:v1", manifest);

        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v2/example.com/myrepo/manifests/v1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_DIGEST_HEADER).unwrap(),
            digest.as_str()
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/vnd.oci.image.manifest.v1+json"
        );
        assert_eq!(body_bytes(response).await, manifest);
    }

    #[tokio::test]
    async fn test_manifest_head_has_length_and_no_body() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        let manifest = br#"{"schemaVersion":2}"#;
        seed_manifest(&state, "example.com/myrepo:v1", manifest);

        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(Method::HEAD)
                    .uri("/v2/example.com/myrepo/manifests/v1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            manifest.len().to_string().as_str()
        );
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_lookup_by_digest_path() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        use sha2::{Digest, Sha256};
        let manifest = br#"{"schemaVersion":2}"#;
        let digest = format!("sha256:{:x}", Sha256::digest(manifest));

        // The handler builds an @digest image string for sha256: refs.
        let image = format!("example.com/myrepo@{}", digest);
        seed_manifest(&state, &image, manifest);

        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/v2/example.com/myrepo/manifests/{}", digest))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_nested_repo_path() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        let manifest = br#"{"schemaVersion":2}"#;
        seed_manifest(&state, "ghcr.io/org/team/app:v2", manifest);

        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v2/ghcr.io/org/team/app/manifests/v2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_blob_hit_and_miss() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        state
            .layout
            .write_blob("sha256:cafe", &mut &b"blob body"[..])
            .unwrap();

        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/v2/example.com/myrepo/blobs/sha256:cafe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        assert_eq!(
            response.headers().get(CONTENT_DIGEST_HEADER).unwrap(),
            "sha256:cafe"
        );
        assert_eq!(body_bytes(response).await, b"blob body");

        // Missing blobs are 404 and never trigger upstream fetches.
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v2/example.com/myrepo/blobs/sha256:absent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_blob_head() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        state
            .layout
            .write_blob("sha256:cafe", &mut &b"0123456789"[..])
            .unwrap();

        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(Method::HEAD)
                    .uri("/v2/example.com/myrepo/blobs/sha256:cafe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "10");
        assert!(body_bytes(response).await.is_empty());
    }
}
