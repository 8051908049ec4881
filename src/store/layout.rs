//! OCI Image Layout
//!
//! An on-disk directory in the standard OCI layout format:
//! - `oci-layout` version marker
//! - `index.json` of manifest descriptors
//! - `blobs/<alg>/<hex>` content-addressed blobs
//!
//! Blobs land via a temp file and an atomic rename, so readers never see
//! a half-written blob. In-progress downloads live in sibling `.partial`
//! files that support sparse writes at arbitrary offsets.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::image::{Descriptor, MediaType};
use crate::store::{Result, StoreError};

/// The image layout version this store reads and writes.
pub const LAYOUT_VERSION: &str = "1.0.0";

const BLOBS_DIR: &str = "blobs";
const INDEX_FILE: &str = "index.json";
const LAYOUT_FILE: &str = "oci-layout";
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Serialize, Deserialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// The index.json content: descriptors keyed by digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub manifests: Vec<Descriptor>,
}

/// Storage statistics over finalized blobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub blob_count: usize,
    pub total_size: u64,
    pub unique_digests: usize,
}

/// An OCI Image Layout directory.
///
/// Mutations to index.json and partial blobs take the write lock;
/// readers of finalized blobs rely on atomic renames and skip locking.
pub struct Layout {
    root: PathBuf,
    lock: RwLock<()>,
}

impl Layout {
    /// Open an existing layout or create a fresh one. Idempotent.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let layout = Self {
            root: root.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        };

        let marker = layout.root.join(LAYOUT_FILE);
        if marker.exists() {
            let data = fs::read(&marker)?;
            let parsed: OciLayout = serde_json::from_slice(&data)?;
            if parsed.image_layout_version != LAYOUT_VERSION {
                return Err(StoreError::UnsupportedLayout(parsed.image_layout_version));
            }
            return Ok(layout);
        }

        layout.init()?;
        Ok(layout)
    }

    fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join(BLOBS_DIR).join("sha256"))?;

        let marker = OciLayout {
            image_layout_version: LAYOUT_VERSION.to_string(),
        };
        fs::write(self.root.join(LAYOUT_FILE), serde_json::to_vec(&marker)?)?;

        let index = Index {
            schema_version: 2,
            media_type: Some(MediaType::OciIndex.to_string()),
            manifests: Vec::new(),
        };
        self.write_index(&index)?;

        Ok(())
    }

    /// The layout root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The filesystem path for a blob digest.
    ///
    /// `root/blobs/<alg>/<hex>`; an unparseable digest falls back to the
    /// sha256 directory.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let blobs = self.root.join(BLOBS_DIR);
        match digest.split_once(':') {
            Some((alg, hex)) => blobs.join(alg).join(hex),
            None => blobs.join("sha256").join(digest),
        }
    }

    fn partial_path(&self, digest: &str) -> PathBuf {
        let mut path = self.blob_path(digest).into_os_string();
        path.push(PARTIAL_SUFFIX);
        PathBuf::from(path)
    }

    /// Whether a finalized blob exists.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// The size of a finalized blob, or `None` if absent.
    pub fn blob_size(&self, digest: &str) -> Option<u64> {
        fs::metadata(self.blob_path(digest)).ok().map(|m| m.len())
    }

    /// Open a finalized blob for streaming reads.
    pub fn open_blob(&self, digest: &str) -> Result<File> {
        Ok(File::open(self.blob_path(digest))?)
    }

    /// Read an entire finalized blob into memory.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.blob_path(digest))?)
    }

    /// Write a blob from a reader, atomically.
    ///
    /// Returns the number of bytes written, or 0 when the blob already
    /// exists (deduplication) — an existing blob is never touched.
    pub fn write_blob(&self, digest: &str, reader: &mut impl Read) -> Result<u64> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(0);
        }

        let dir = path
            .parent()
            .ok_or_else(|| StoreError::Corruption(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let written = std::io::copy(reader, tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;

        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;

        Ok(written)
    }

    /// Write data at an offset into the partial blob for `digest`.
    ///
    /// Creates the partial file on first call; gaps between writes stay
    /// sparse until filled.
    pub fn write_blob_at(&self, digest: &str, offset: u64, data: &[u8]) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let path = self.partial_path(digest);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.write_all_at(data, offset)?;

        Ok(())
    }

    /// Read from the partial blob at an offset, tolerating EOF.
    ///
    /// Returns fewer than `length` bytes when the file ends early.
    pub fn read_blob_at(&self, digest: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());

        let file = File::open(self.partial_path(digest))?;

        let mut data = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let n = file.read_at(&mut data[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        data.truncate(filled);
        Ok(data)
    }

    /// Atomically move a partial blob to its canonical location.
    ///
    /// If the final blob already exists the partial is discarded and the
    /// call succeeds.
    pub fn finalize_blob(&self, digest: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let partial = self.partial_path(digest);
        let path = self.blob_path(digest);

        if !partial.exists() {
            return Err(StoreError::PartialNotFound(digest.to_string()));
        }

        if path.exists() {
            fs::remove_file(&partial)?;
            return Ok(());
        }

        fs::rename(&partial, &path)?;
        Ok(())
    }

    /// Whether a partial blob exists for `digest`.
    pub fn has_partial(&self, digest: &str) -> bool {
        self.partial_path(digest).exists()
    }

    /// Remove the partial blob for `digest`, if any.
    pub fn remove_partial(&self, digest: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let partial = self.partial_path(digest);
        if partial.exists() {
            fs::remove_file(&partial)?;
        }
        Ok(())
    }

    /// Compute the sha256 digest of the partial blob for `digest`.
    pub fn partial_digest(&self, digest: &str) -> Result<String> {
        use sha2::{Digest, Sha256};

        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());

        let mut file = File::open(self.partial_path(digest))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Add or replace a manifest descriptor in index.json, keyed by digest.
    pub fn add_manifest(&self, desc: Descriptor) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());

        let mut index = self.read_index()?;

        match index.manifests.iter_mut().find(|m| m.digest == desc.digest) {
            Some(existing) => *existing = desc,
            None => index.manifests.push(desc),
        }

        self.write_index(&index)
    }

    /// The current index.json.
    pub fn get_index(&self) -> Result<Index> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.read_index()
    }

    fn read_index(&self) -> Result<Index> {
        let data = fs::read(self.root.join(INDEX_FILE))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_index(&self, index: &Index) -> Result<()> {
        let path = self.root.join(INDEX_FILE);
        let data = serde_json::to_vec_pretty(index)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    /// Storage statistics over finalized blobs; partials are skipped.
    pub fn get_stats(&self) -> Result<Stats> {
        let mut stats = Stats::default();

        let blob_dir = self.root.join(BLOBS_DIR).join("sha256");
        let entries = match fs::read_dir(&blob_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        let mut seen = std::collections::HashSet::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };

            stats.blob_count += 1;
            stats.total_size += meta.len();
            if seen.insert(name.into_owned()) {
                stats.unique_digests += 1;
            }
        }

        Ok(stats)
    }
}
