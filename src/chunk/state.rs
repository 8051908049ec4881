//! Chunk-tree persistence
//!
//! The state file is plain JSON so it stays inspectable on edge devices.
//! Absent leaves are encoded as an empty string, which keeps them
//! distinct from a chunk whose hash is literally zero when formatted
//! (`"0000000000000000"`). Writes go through a sibling temp file and an
//! atomic rename so a crash mid-write never replaces good state.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{ChunkError, ChunkHash, ChunkTree, Result};

/// State file schema version. Bumped on incompatible changes; older
/// files are discarded with a warning and the download restarts.
pub const STATE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATE_VERSION
}

/// Serializable form of a [`ChunkTree`].
#[derive(Debug, Serialize, Deserialize)]
pub struct State {
    #[serde(default = "default_version")]
    pub version: u32,
    pub total_size: u64,
    pub chunk_size: usize,
    pub num_chunks: usize,
    pub present_count: usize,
    pub root: String,
    /// Hex-encoded leaf hashes, empty string for missing chunks.
    pub leaves: Vec<String>,
}

impl ChunkTree {
    /// Convert to a serializable state record.
    pub fn serialize(&self) -> State {
        let leaves = (0..self.num_chunks())
            .map(|i| {
                let h = self.chunk_hash(i);
                if h.is_empty() {
                    String::new()
                } else {
                    h.to_string()
                }
            })
            .collect();

        State {
            version: STATE_VERSION,
            total_size: self.total_size(),
            chunk_size: self.chunk_size(),
            num_chunks: self.num_chunks(),
            present_count: self.present_count(),
            root: self.root().to_string(),
            leaves,
        }
    }

    /// Reconstruct a tree from persisted state.
    ///
    /// `present_count` is rebuilt from the leaves; the persisted count
    /// is never trusted.
    pub fn deserialize(state: &State) -> Result<Self> {
        if state.version != STATE_VERSION {
            return Err(ChunkError::UnsupportedVersion(state.version));
        }

        let mut tree = ChunkTree::new(state.total_size, state.chunk_size);

        for (i, leaf) in state.leaves.iter().enumerate().take(tree.num_chunks()) {
            if leaf.is_empty() {
                continue;
            }
            tree.set_chunk_hash(i, ChunkHash::from_hex(leaf)?)?;
        }

        Ok(tree)
    }

    /// Save the tree state, atomically replacing any previous file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.serialize())?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;

        Ok(())
    }

    /// Load a tree from a state file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let state: State = serde_json::from_slice(&data)?;
        Self::deserialize(&state)
    }
}
