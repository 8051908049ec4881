//! Resumable Image Puller
//!
//! Downloads an image into the layout: manifest, config, then each layer
//! as a chunked, resumable transfer. Per-layer chunk state persists under
//! `<root>/.fray/`, so a crash or network partition costs at most the
//! chunks completed since the last state flush.
//!
//! With `parallel > 1`, chunk fetches fan out to a bounded set of worker
//! tasks; all writes to the partial blob and all chunk-state mutation
//! stay on the coordinator so state-file ordering is preserved.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};

use crate::chunk::{ChunkHash, ChunkTree};
use crate::image::{Descriptor, ImageReference, REF_NAME_ANNOTATION};
use crate::registry::{RegistryClient, RegistryError};
use crate::store::{Layout, Result, StoreError};

pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_PARALLEL: usize = 4;

const STATE_DIR: &str = ".fray";
const STATE_SUFFIX: &str = ".state";
const STATE_KEY_LEN: usize = 12;

/// Chunks completed between state flushes.
const FLUSH_INTERVAL: usize = 10;

/// Progress callback: `(layer_index, fraction)`.
pub type ProgressFn = Box<dyn Fn(usize, f64) + Send + Sync>;

/// Configures a pull operation.
pub struct PullOptions {
    /// Chunk size in bytes for resumable layer downloads.
    pub chunk_size: usize,

    /// Number of concurrent chunk fetches per layer.
    pub parallel: usize,

    /// Re-hash assembled layers before finalizing them.
    pub verify_digests: bool,

    /// Chunk-state directory; defaults to `<root>/.fray`.
    pub state_dir: Option<PathBuf>,

    /// Invoked after each completed chunk.
    pub on_progress: Option<ProgressFn>,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallel: DEFAULT_PARALLEL,
            verify_digests: true,
            state_dir: None,
            on_progress: None,
        }
    }
}

/// Results of a pull operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    /// Digest of the image manifest, computed over the received bytes.
    pub digest: String,
    /// Number of layers in the manifest.
    pub layers: usize,
    /// Total declared size of all layers.
    pub total_size: u64,
    /// Bytes fetched from the network during this invocation.
    pub downloaded: u64,
    /// Bytes satisfied from the local store.
    pub cached: u64,
}

/// Downloads images to an OCI layout with resumable chunked transfers.
pub struct Puller {
    layout: Arc<Layout>,
    client: Arc<RegistryClient>,
    opts: PullOptions,
}

enum ChunkResult {
    Data(Vec<u8>),
    Failed(RegistryError),
}

impl Puller {
    pub fn new(layout: Arc<Layout>, client: Arc<RegistryClient>, opts: PullOptions) -> Self {
        let mut opts = opts;
        if opts.chunk_size == 0 {
            opts.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if opts.parallel == 0 {
            opts.parallel = DEFAULT_PARALLEL;
        }

        Self {
            layout,
            client,
            opts,
        }
    }

    fn state_dir(&self) -> PathBuf {
        self.opts
            .state_dir
            .clone()
            .unwrap_or_else(|| self.layout.root().join(STATE_DIR))
    }

    fn state_path(&self, digest: &str) -> PathBuf {
        let hex = digest.split_once(':').map(|(_, h)| h).unwrap_or(digest);
        let key = &hex[..hex.len().min(STATE_KEY_LEN)];
        self.state_dir().join(format!("{}{}", key, STATE_SUFFIX))
    }

    fn report_progress(&self, layer: usize, fraction: f64) {
        if let Some(cb) = &self.opts.on_progress {
            cb(layer, fraction);
        }
    }

    /// Pull an image into the layout.
    ///
    /// The index.json descriptor is annotated with the image string
    /// exactly as given, so proxy lookups match byte-for-byte.
    pub async fn pull(&self, image: &str) -> Result<PullResult> {
        let reference = ImageReference::parse(image)?;

        let fetched = self.client.get_manifest(&reference).await?;
        let manifest = &fetched.manifest;

        let manifest_digest = sha256_digest(&fetched.raw);

        self.layout
            .write_blob(&manifest_digest, &mut fetched.raw.as_slice())?;

        let mut result = PullResult {
            digest: manifest_digest.clone(),
            layers: manifest.layers.len(),
            total_size: 0,
            downloaded: 0,
            cached: 0,
        };

        // Config blob is small; a single unchunked fetch.
        if self.layout.has_blob(&manifest.config.digest) {
            result.cached += manifest.config.size;
        } else {
            self.download_blob(&reference, &manifest.config.digest)
                .await?;
            result.downloaded += manifest.config.size;
        }

        for (i, layer) in manifest.layers.iter().enumerate() {
            result.total_size += layer.size;

            if self.layout.has_blob(&layer.digest) {
                result.cached += layer.size;
                self.report_progress(i, 1.0);
                continue;
            }

            let (downloaded, cached) = self.download_layer(&reference, layer, i).await?;
            result.downloaded += downloaded;
            result.cached += cached;
        }

        let mut annotations = std::collections::HashMap::new();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), image.to_string());

        self.layout.add_manifest(Descriptor {
            media_type: manifest.media_type(),
            digest: manifest_digest,
            size: fetched.raw.len() as u64,
            annotations: Some(annotations),
            platform: None,
        })?;

        Ok(result)
    }

    /// Stream a whole blob into the layout.
    async fn download_blob(&self, reference: &ImageReference, digest: &str) -> Result<u64> {
        let response = self
            .client
            .get_blob(&reference.registry, &reference.repository, digest)
            .await?;

        let body = response.bytes().await.map_err(RegistryError::from)?;
        Ok(self.layout.write_blob(digest, &mut body.as_ref())?)
    }

    /// Resumable chunked download of one layer.
    ///
    /// Returns `(downloaded, cached)` byte counts for this invocation.
    async fn download_layer(
        &self,
        reference: &ImageReference,
        layer: &Descriptor,
        layer_idx: usize,
    ) -> Result<(u64, u64)> {
        if layer.size == 0 {
            self.layout.write_blob(&layer.digest, &mut std::io::empty())?;
            self.report_progress(layer_idx, 1.0);
            return Ok((0, 0));
        }

        std::fs::create_dir_all(self.state_dir())?;
        let state_path = self.state_path(&layer.digest);

        let mut tree = match self.load_state(layer, &state_path) {
            Some(mut tree) => {
                self.clear_corrupt_chunks(&mut tree, &layer.digest);
                tree
            }
            None => {
                // A partial with no usable state is unaccounted-for; its
                // contents cannot be trusted.
                if self.layout.has_partial(&layer.digest) {
                    tracing::warn!(digest = %layer.digest, "removing orphan partial blob");
                    self.layout.remove_partial(&layer.digest)?;
                }
                ChunkTree::new(layer.size, self.opts.chunk_size)
            }
        };

        if tree.complete() {
            match self.finalize_layer(&layer.digest, &state_path) {
                Ok(()) => {
                    self.report_progress(layer_idx, 1.0);
                    return Ok((0, layer.size));
                }
                Err(StoreError::PartialNotFound(_)) => {
                    // State claims completion but the bytes are gone.
                    tracing::warn!(digest = %layer.digest, "stale complete state, restarting layer");
                    tree = ChunkTree::new(layer.size, self.opts.chunk_size);
                }
                Err(e) => return Err(e),
            }
        }

        if !self
            .client
            .supports_range(&reference.registry, &reference.repository, &layer.digest)
            .await?
        {
            tracing::debug!(digest = %layer.digest, "registry ignores Range, fetching layer whole");
            return self
                .download_layer_whole(reference, layer, layer_idx, &state_path)
                .await
                .map(|n| (n, 0));
        }

        let fetch = self
            .fetch_missing(reference, layer, layer_idx, &mut tree, &state_path)
            .await;

        // Flush before surfacing any error so the next run resumes.
        if let Err(save_err) = tree.save_to_file(&state_path) {
            tracing::warn!(path = %state_path.display(), error = %save_err, "chunk state flush failed");
        }
        let downloaded = fetch?;

        if !tree.complete() {
            return Err(StoreError::Incomplete {
                present: tree.present_count(),
                total: tree.num_chunks(),
            });
        }

        self.finalize_layer(&layer.digest, &state_path)?;

        Ok((downloaded, 0))
    }

    /// Cross-check resumed chunks against the partial file, clearing any
    /// whose bytes no longer match the recorded hash.
    fn clear_corrupt_chunks(&self, tree: &mut ChunkTree, digest: &str) {
        if tree.present_count() == 0 {
            return;
        }

        if !self.layout.has_partial(digest) {
            tracing::warn!(digest, "partial blob missing, re-fetching recorded chunks");
            for chunk in 0..tree.num_chunks() {
                tree.clear_chunk(chunk);
            }
            return;
        }

        for chunk in 0..tree.num_chunks() {
            if !tree.has_chunk(chunk) {
                continue;
            }

            let length = tree.chunk_length(chunk);
            let intact = self
                .layout
                .read_blob_at(digest, tree.chunk_offset(chunk), length)
                .map(|data| data.len() == length && ChunkHash::of(&data) == tree.chunk_hash(chunk))
                .unwrap_or(false);

            if !intact {
                tracing::warn!(digest, chunk, "chunk failed local verification, re-fetching");
                tree.clear_chunk(chunk);
            }
        }
    }

    fn load_state(&self, layer: &Descriptor, state_path: &Path) -> Option<ChunkTree> {
        if !state_path.exists() {
            return None;
        }

        match ChunkTree::load_from_file(state_path) {
            Ok(tree)
                if tree.total_size() == layer.size
                    && tree.chunk_size() == self.opts.chunk_size =>
            {
                tracing::debug!(
                    digest = %layer.digest,
                    present = tree.present_count(),
                    total = tree.num_chunks(),
                    "resuming layer from saved state"
                );
                Some(tree)
            }
            Ok(_) => {
                tracing::warn!(digest = %layer.digest, "chunk state geometry changed, discarding");
                let _ = std::fs::remove_file(state_path);
                None
            }
            Err(e) => {
                tracing::warn!(digest = %layer.digest, error = %e, "unreadable chunk state, discarding");
                let _ = std::fs::remove_file(state_path);
                None
            }
        }
    }

    /// Single-fetch path for registries that ignore Range requests.
    async fn download_layer_whole(
        &self,
        reference: &ImageReference,
        layer: &Descriptor,
        layer_idx: usize,
        state_path: &Path,
    ) -> Result<u64> {
        let response = self
            .client
            .get_blob(&reference.registry, &reference.repository, &layer.digest)
            .await?;

        let mut stream = response.bytes_stream();
        let mut offset = 0u64;

        while let Some(piece) = stream.next().await {
            let piece = piece.map_err(RegistryError::from)?;
            self.layout.write_blob_at(&layer.digest, offset, &piece)?;
            offset += piece.len() as u64;
        }

        if offset != layer.size {
            self.layout.remove_partial(&layer.digest)?;
            return Err(StoreError::Registry(RegistryError::ShortRead {
                expected: layer.size as usize,
                actual: offset as usize,
            }));
        }

        self.finalize_layer(&layer.digest, state_path)?;
        self.report_progress(layer_idx, 1.0);

        Ok(offset)
    }

    /// Fetch every missing chunk, sequentially or via the worker pool.
    async fn fetch_missing(
        &self,
        reference: &ImageReference,
        layer: &Descriptor,
        layer_idx: usize,
        tree: &mut ChunkTree,
        state_path: &Path,
    ) -> Result<u64> {
        if self.opts.parallel <= 1 {
            self.fetch_missing_seq(reference, layer, layer_idx, tree, state_path)
                .await
        } else {
            self.fetch_missing_parallel(reference, layer, layer_idx, tree, state_path)
                .await
        }
    }

    async fn fetch_missing_seq(
        &self,
        reference: &ImageReference,
        layer: &Descriptor,
        layer_idx: usize,
        tree: &mut ChunkTree,
        state_path: &Path,
    ) -> Result<u64> {
        let mut downloaded = 0u64;
        let mut completed = 0usize;

        for (start, end) in tree.missing_ranges() {
            for chunk in start..end {
                let offset = tree.chunk_offset(chunk);
                let length = tree.chunk_length(chunk);

                let data = self
                    .client
                    .get_blob_range(
                        &reference.registry,
                        &reference.repository,
                        &layer.digest,
                        offset,
                        offset + length as u64 - 1,
                    )
                    .await?;

                if data.len() != length {
                    return Err(StoreError::Registry(RegistryError::ShortRead {
                        expected: length,
                        actual: data.len(),
                    }));
                }

                self.layout.write_blob_at(&layer.digest, offset, &data)?;
                tree.set_chunk(chunk, &data)?;
                downloaded += data.len() as u64;
                completed += 1;

                self.report_progress(layer_idx, tree.progress());

                if completed % FLUSH_INTERVAL == 0 {
                    tree.save_to_file(state_path)?;
                }
            }
        }

        Ok(downloaded)
    }

    /// Worker-pool fetch: bounded concurrent range requests, with all
    /// writes and tree mutation on this (coordinator) task.
    ///
    /// The first error is kept; chunks already in flight are still
    /// written when they arrive intact, maximizing resumable progress.
    async fn fetch_missing_parallel(
        &self,
        reference: &ImageReference,
        layer: &Descriptor,
        layer_idx: usize,
        tree: &mut ChunkTree,
        state_path: &Path,
    ) -> Result<u64> {
        let missing = tree.missing_chunks();

        let (tx, mut rx) = mpsc::channel::<(usize, ChunkResult)>(self.opts.parallel);
        let semaphore = Arc::new(Semaphore::new(self.opts.parallel));

        for chunk in missing {
            let offset = tree.chunk_offset(chunk);
            let length = tree.chunk_length(chunk);

            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let registry = reference.registry.clone();
            let repository = reference.repository.clone();
            let digest = layer.digest.clone();

            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();

                let result = client
                    .get_blob_range(&registry, &repository, &digest, offset, offset + length as u64 - 1)
                    .await;

                let outcome = match result {
                    Ok(data) => ChunkResult::Data(data),
                    Err(e) => ChunkResult::Failed(e),
                };

                let _ = tx.send((chunk, outcome)).await;
            });
        }
        drop(tx);

        let mut downloaded = 0u64;
        let mut completed = 0usize;
        let mut first_err: Option<StoreError> = None;

        while let Some((chunk, outcome)) = rx.recv().await {
            let data = match outcome {
                ChunkResult::Data(data) => data,
                ChunkResult::Failed(e) => {
                    first_err.get_or_insert(e.into());
                    continue;
                }
            };

            let length = tree.chunk_length(chunk);
            if data.len() != length {
                first_err.get_or_insert(StoreError::Registry(RegistryError::ShortRead {
                    expected: length,
                    actual: data.len(),
                }));
                continue;
            }

            let write = self
                .layout
                .write_blob_at(&layer.digest, tree.chunk_offset(chunk), &data)
                .and_then(|_| Ok(tree.set_chunk(chunk, &data)?));
            if let Err(e) = write {
                first_err.get_or_insert(e);
                continue;
            }

            downloaded += data.len() as u64;
            completed += 1;

            self.report_progress(layer_idx, tree.progress());

            if completed % FLUSH_INTERVAL == 0 {
                if let Err(e) = tree.save_to_file(state_path) {
                    first_err.get_or_insert(e.into());
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(downloaded),
        }
    }

    /// Verify (when enabled) and atomically finalize an assembled layer,
    /// then drop its state file.
    fn finalize_layer(&self, digest: &str, state_path: &Path) -> Result<()> {
        if !self.layout.has_partial(digest) {
            return Err(StoreError::PartialNotFound(digest.to_string()));
        }

        if self.opts.verify_digests && digest.starts_with("sha256:") {
            let actual = self.layout.partial_digest(digest)?;
            if actual != digest {
                // Partial and state are kept; the next run re-checks
                // chunk hashes and refetches what is corrupt.
                return Err(StoreError::DigestMismatch {
                    expected: digest.to_string(),
                    actual,
                });
            }
        }

        self.layout.finalize_blob(digest)?;

        if let Err(e) = std::fs::remove_file(state_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %state_path.display(), error = %e, "state cleanup failed");
            }
        }

        Ok(())
    }
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path as AxumPath, State};
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use tempfile::tempdir;

    use crate::image::{Manifest, MediaType};

    /// In-memory upstream registry for puller tests.
    #[derive(Clone)]
    struct MockRegistry {
        manifests: Arc<HashMap<String, (Vec<u8>, String)>>,
        blobs: Arc<HashMap<String, Vec<u8>>>,
        manifest_requests: Arc<AtomicUsize>,
        range_requests: Arc<AtomicUsize>,
        honor_range: bool,
    }

    async fn mock_manifest(
        State(state): State<MockRegistry>,
        AxumPath((_repo, reference)): AxumPath<(String, String)>,
    ) -> Response {
        state.manifest_requests.fetch_add(1, Ordering::SeqCst);
        match state.manifests.get(&reference) {
            Some((body, media_type)) => (
                [(header::CONTENT_TYPE, media_type.clone())],
                body.clone(),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn mock_blob(
        State(state): State<MockRegistry>,
        AxumPath((_repo, digest)): AxumPath<(String, String)>,
        headers: HeaderMap,
    ) -> Response {
        let Some(blob) = state.blobs.get(&digest) else {
            return StatusCode::NOT_FOUND.into_response();
        };

        let range = headers
            .get(header::RANGE)
            .and_then(|h| h.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) if state.honor_range => {
                state.range_requests.fetch_add(1, Ordering::SeqCst);
                let end = end.min(blob.len() as u64 - 1);
                let body = blob[start as usize..=end as usize].to_vec();
                (StatusCode::PARTIAL_CONTENT, body).into_response()
            }
            _ => blob.clone().into_response(),
        }
    }

    fn parse_range(value: &str) -> Option<(u64, u64)> {
        let spec = value.strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }

    async fn serve_mock(state: MockRegistry) -> String {
        let app = Router::new()
            .route("/v2/", get(|| async { "{}" }))
            .route("/v2/:repo/manifests/:reference", get(mock_manifest))
            .route("/v2/:repo/blobs/:digest", get(mock_blob))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("127.0.0.1:{}", addr.port())
    }

    struct Fixture {
        registry: MockRegistry,
        image_suffix: String,
        layer_digest: String,
        layer_data: Vec<u8>,
        total_size: u64,
    }

    /// Build a single-layer image with deterministic contents.
    fn make_fixture(layer_len: usize) -> Fixture {
        let layer_data: Vec<u8> = (0..layer_len).map(|i| (i % 251) as u8).collect();
        let layer_digest = sha256_digest(&layer_data);

        let config_data = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let config_digest = sha256_digest(&config_data);

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MediaType::OciManifest.to_string()),
            config: Descriptor {
                media_type: "application/vnd.oci.image.config.v1+json".to_string(),
                digest: config_digest.clone(),
                size: config_data.len() as u64,
                annotations: None,
                platform: None,
            },
            layers: vec![Descriptor {
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                digest: layer_digest.clone(),
                size: layer_data.len() as u64,
                annotations: None,
                platform: None,
            }],
            annotations: None,
        };
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();

        let mut manifests = HashMap::new();
        manifests.insert(
            "latest".to_string(),
            (manifest_bytes, MediaType::OciManifest.to_string()),
        );

        let mut blobs = HashMap::new();
        blobs.insert(config_digest, config_data.clone());
        blobs.insert(layer_digest.clone(), layer_data.clone());

        let total_size = layer_data.len() as u64;

        Fixture {
            registry: MockRegistry {
                manifests: Arc::new(manifests),
                blobs: Arc::new(blobs),
                manifest_requests: Arc::new(AtomicUsize::new(0)),
                range_requests: Arc::new(AtomicUsize::new(0)),
                honor_range: true,
            },
            image_suffix: "/testrepo:latest".to_string(),
            layer_digest,
            layer_data,
            total_size,
        }
    }

    fn make_puller(root: &std::path::Path, host: &str, opts: PullOptions) -> Puller {
        let layout = Arc::new(Layout::open(root).unwrap());
        let mut client = RegistryClient::new().unwrap();
        client.set_insecure(host);
        Puller::new(layout, Arc::new(client), opts)
    }

    #[tokio::test]
    async fn test_fresh_pull_then_cached_pull() {
        let fixture = make_fixture(100 * 1024);
        let host = serve_mock(fixture.registry.clone()).await;
        let dir = tempdir().unwrap();

        let opts = PullOptions {
            chunk_size: 16 * 1024,
            parallel: 1,
            ..Default::default()
        };
        let puller = make_puller(dir.path(), &host, opts);
        let image = format!("{}{}", host, fixture.image_suffix);

        let result = puller.pull(&image).await.unwrap();
        assert_eq!(result.layers, 1);
        assert_eq!(result.total_size, fixture.total_size);
        assert_eq!(result.downloaded, fixture.total_size + 37); // layer + config
        assert_eq!(result.cached, 0);

        // Layer, config, and manifest are all in the store.
        assert!(puller.layout.has_blob(&fixture.layer_digest));
        assert!(puller.layout.has_blob(&result.digest));
        assert_eq!(
            puller.layout.read_blob(&fixture.layer_digest).unwrap(),
            fixture.layer_data
        );

        // index.json carries the image string.
        let index = puller.layout.get_index().unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.manifests[0].ref_name(), Some(image.as_str()));

        // Second pull touches nothing on the network for blobs.
        let second = puller.pull(&image).await.unwrap();
        assert_eq!(second.downloaded, 0);
        assert_eq!(second.cached, fixture.total_size + 37);
    }

    #[tokio::test]
    async fn test_parallel_pull_assembles_correctly() {
        let fixture = make_fixture(100 * 1024);
        let host = serve_mock(fixture.registry.clone()).await;
        let dir = tempdir().unwrap();

        let opts = PullOptions {
            chunk_size: 8 * 1024,
            parallel: 4,
            ..Default::default()
        };
        let puller = make_puller(dir.path(), &host, opts);
        let image = format!("{}{}", host, fixture.image_suffix);

        let result = puller.pull(&image).await.unwrap();
        assert_eq!(result.downloaded, fixture.total_size + 37);
        assert_eq!(
            puller.layout.read_blob(&fixture.layer_digest).unwrap(),
            fixture.layer_data
        );
    }

    #[tokio::test]
    async fn test_resume_fetches_only_missing_chunks() {
        let chunk_size = 10 * 1024;
        let fixture = make_fixture(10 * chunk_size);
        let host = serve_mock(fixture.registry.clone()).await;
        let dir = tempdir().unwrap();

        let opts = PullOptions {
            chunk_size,
            parallel: 1,
            ..Default::default()
        };
        let puller = make_puller(dir.path(), &host, opts);
        let image = format!("{}{}", host, fixture.image_suffix);

        // Simulate a crash after chunks 0..=3 completed and flushed.
        let mut tree = ChunkTree::new(fixture.total_size, chunk_size);
        for chunk in 0..4 {
            let start = chunk * chunk_size;
            let data = &fixture.layer_data[start..start + chunk_size];
            puller
                .layout
                .write_blob_at(&fixture.layer_digest, start as u64, data)
                .unwrap();
            tree.set_chunk(chunk, data).unwrap();
        }
        std::fs::create_dir_all(puller.state_dir()).unwrap();
        tree.save_to_file(&puller.state_path(&fixture.layer_digest))
            .unwrap();

        let result = puller.pull(&image).await.unwrap();

        // Only chunks 4..10 were fetched (plus the range probe).
        assert_eq!(
            fixture.registry.range_requests.load(Ordering::SeqCst),
            6 + 1
        );
        assert_eq!(result.downloaded as usize, 6 * chunk_size + 37);
        assert_eq!(
            puller.layout.read_blob(&fixture.layer_digest).unwrap(),
            fixture.layer_data
        );
        // The state file is gone after finalization.
        assert!(!puller.state_path(&fixture.layer_digest).exists());
    }

    #[tokio::test]
    async fn test_resume_refetches_locally_corrupt_chunk() {
        let chunk_size = 10 * 1024;
        let fixture = make_fixture(10 * chunk_size);
        let host = serve_mock(fixture.registry.clone()).await;
        let dir = tempdir().unwrap();

        let opts = PullOptions {
            chunk_size,
            parallel: 1,
            ..Default::default()
        };
        let puller = make_puller(dir.path(), &host, opts);
        let image = format!("{}{}", host, fixture.image_suffix);

        // Four chunks recorded, but chunk 2's bytes rot on disk afterwards.
        let mut tree = ChunkTree::new(fixture.total_size, chunk_size);
        for chunk in 0..4 {
            let start = chunk * chunk_size;
            let data = &fixture.layer_data[start..start + chunk_size];
            puller
                .layout
                .write_blob_at(&fixture.layer_digest, start as u64, data)
                .unwrap();
            tree.set_chunk(chunk, data).unwrap();
        }
        puller
            .layout
            .write_blob_at(&fixture.layer_digest, (2 * chunk_size) as u64, &[0u8; 64])
            .unwrap();
        std::fs::create_dir_all(puller.state_dir()).unwrap();
        tree.save_to_file(&puller.state_path(&fixture.layer_digest))
            .unwrap();

        let result = puller.pull(&image).await.unwrap();

        // Chunks 4..10 plus the corrupt chunk 2, plus the range probe.
        assert_eq!(
            fixture.registry.range_requests.load(Ordering::SeqCst),
            7 + 1
        );
        assert_eq!(result.downloaded as usize, 7 * chunk_size + 37);
        assert_eq!(
            puller.layout.read_blob(&fixture.layer_digest).unwrap(),
            fixture.layer_data
        );
    }

    #[tokio::test]
    async fn test_chunk_size_change_discards_state() {
        let fixture = make_fixture(64 * 1024);
        let host = serve_mock(fixture.registry.clone()).await;
        let dir = tempdir().unwrap();

        // State recorded with a 1 MiB chunk size.
        let stale_puller = make_puller(
            dir.path(),
            &host,
            PullOptions {
                chunk_size: 1024 * 1024,
                parallel: 1,
                ..Default::default()
            },
        );
        let mut stale = ChunkTree::new(fixture.total_size, 1024 * 1024);
        stale.set_chunk(0, b"not the real bytes").unwrap();
        std::fs::create_dir_all(stale_puller.state_dir()).unwrap();
        stale
            .save_to_file(&stale_puller.state_path(&fixture.layer_digest))
            .unwrap();
        stale_puller
            .layout
            .write_blob_at(&fixture.layer_digest, 0, b"not the real bytes")
            .unwrap();

        // Resume with a 2x smaller chunk size: state is discarded and the
        // layer re-downloads from zero, uncorrupted.
        let puller = make_puller(
            dir.path(),
            &host,
            PullOptions {
                chunk_size: 32 * 1024,
                parallel: 1,
                ..Default::default()
            },
        );
        let image = format!("{}{}", host, fixture.image_suffix);
        let result = puller.pull(&image).await.unwrap();

        assert_eq!(result.downloaded as usize, 64 * 1024 + 37);
        assert_eq!(
            puller.layout.read_blob(&fixture.layer_digest).unwrap(),
            fixture.layer_data
        );
    }

    #[tokio::test]
    async fn test_range_unsupported_falls_back_to_whole_fetch() {
        let mut fixture = make_fixture(48 * 1024);
        fixture.registry.honor_range = false;
        let host = serve_mock(fixture.registry.clone()).await;
        let dir = tempdir().unwrap();

        let opts = PullOptions {
            chunk_size: 16 * 1024,
            parallel: 4,
            ..Default::default()
        };
        let puller = make_puller(dir.path(), &host, opts);
        let image = format!("{}{}", host, fixture.image_suffix);

        let result = puller.pull(&image).await.unwrap();
        assert_eq!(result.downloaded as usize, 48 * 1024 + 37);
        assert_eq!(fixture.registry.range_requests.load(Ordering::SeqCst), 0);
        assert_eq!(
            puller.layout.read_blob(&fixture.layer_digest).unwrap(),
            fixture.layer_data
        );
    }

    #[tokio::test]
    async fn test_verification_rejects_corrupt_server_bytes() {
        let mut fixture = make_fixture(32 * 1024);
        // Serve bytes that do not match the declared layer digest.
        let mut blobs: HashMap<String, Vec<u8>> = (*fixture.registry.blobs).clone();
        blobs.insert(fixture.layer_digest.clone(), vec![0xFF; 32 * 1024]);
        fixture.registry.blobs = Arc::new(blobs);

        let host = serve_mock(fixture.registry.clone()).await;
        let dir = tempdir().unwrap();

        let opts = PullOptions {
            chunk_size: 16 * 1024,
            parallel: 1,
            ..Default::default()
        };
        let puller = make_puller(dir.path(), &host, opts);
        let image = format!("{}{}", host, fixture.image_suffix);

        let err = puller.pull(&image).await.unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
        assert!(!puller.layout.has_blob(&fixture.layer_digest));
    }

    #[tokio::test]
    async fn test_progress_callback_reaches_one() {
        let fixture = make_fixture(40 * 1024);
        let host = serve_mock(fixture.registry.clone()).await;
        let dir = tempdir().unwrap();

        let last = Arc::new(std::sync::Mutex::new(0.0f64));
        let last_clone = Arc::clone(&last);

        let opts = PullOptions {
            chunk_size: 8 * 1024,
            parallel: 1,
            on_progress: Some(Box::new(move |_, fraction| {
                *last_clone.lock().unwrap() = fraction;
            })),
            ..Default::default()
        };
        let puller = make_puller(dir.path(), &host, opts);
        let image = format!("{}{}", host, fixture.image_suffix);

        puller.pull(&image).await.unwrap();
        assert_eq!(*last.lock().unwrap(), 1.0);
    }

    #[test]
    fn test_state_path_uses_digest_prefix() {
        let dir = tempdir().unwrap();
        let layout = Arc::new(Layout::open(dir.path()).unwrap());
        let client = Arc::new(RegistryClient::new().unwrap());
        let puller = Puller::new(layout, client, PullOptions::default());

        let path = puller.state_path("sha256:0123456789abcdef0123456789abcdef");
        assert!(path.ends_with(".fray/0123456789ab.state"));
    }
}
