//! Per-blob chunk presence tracking
//!
//! A tree of xxHash64 leaves, one per chunk, with a rollup root. A leaf
//! of zero means the chunk is absent; present chunks whose data happens
//! to hash to zero are indistinguishable from absent ones, which is
//! acceptable because the blob digest is verified before finalization.

use std::fmt;

use xxhash_rust::xxh64::xxh64;

use super::{ChunkError, Result};

/// A 64-bit chunk hash. Zero is the "missing chunk" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHash(pub u64);

impl ChunkHash {
    /// The sentinel for a missing/empty chunk.
    pub const EMPTY: ChunkHash = ChunkHash(0);

    /// Compute the hash of chunk data.
    pub fn of(data: &[u8]) -> Self {
        ChunkHash(xxh64(data, 0))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse a 16-digit hex string into a hash.
    pub fn from_hex(s: &str) -> Result<Self> {
        u64::from_str_radix(s, 16)
            .map(ChunkHash)
            .map_err(|_| ChunkError::InvalidLeaf(s.to_string()))
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Download-state record for a single blob.
///
/// Tracks which chunks of a `total_size`-byte blob are present. The leaf
/// vector is padded to a power of two so the root rollup is a complete
/// binary reduction; only the first `num_chunks` leaves are meaningful.
#[derive(Debug, Clone)]
pub struct ChunkTree {
    total_size: u64,
    chunk_size: usize,
    num_chunks: usize,
    present_count: usize,
    leaves: Vec<ChunkHash>,
}

impl ChunkTree {
    /// Create a tree for a blob of `total_size` bytes split into
    /// `chunk_size`-byte chunks, with all chunks marked absent.
    pub fn new(total_size: u64, chunk_size: usize) -> Self {
        let num_chunks = if chunk_size == 0 {
            0
        } else {
            (total_size as usize).div_ceil(chunk_size)
        };
        let leaf_count = num_chunks.next_power_of_two().max(1);

        Self {
            total_size,
            chunk_size,
            num_chunks,
            present_count: 0,
            leaves: vec![ChunkHash::EMPTY; leaf_count],
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn present_count(&self) -> usize {
        self.present_count
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.num_chunks {
            return Err(ChunkError::OutOfRange {
                index,
                num_chunks: self.num_chunks,
            });
        }
        Ok(())
    }

    /// Mark a chunk present, hashing its data.
    ///
    /// Re-setting an already-present chunk overwrites the hash without
    /// changing `present_count`.
    pub fn set_chunk(&mut self, index: usize, data: &[u8]) -> Result<()> {
        self.set_chunk_hash(index, ChunkHash::of(data))
    }

    /// Mark a chunk present with a precomputed hash.
    pub fn set_chunk_hash(&mut self, index: usize, hash: ChunkHash) -> Result<()> {
        self.check_index(index)?;

        let was_empty = self.leaves[index].is_empty();
        self.leaves[index] = hash;
        if was_empty && !hash.is_empty() {
            self.present_count += 1;
        }

        Ok(())
    }

    /// Mark a chunk absent (for re-download after local corruption).
    pub fn clear_chunk(&mut self, index: usize) {
        if index >= self.num_chunks {
            return;
        }

        if !self.leaves[index].is_empty() {
            self.leaves[index] = ChunkHash::EMPTY;
            self.present_count -= 1;
        }
    }

    pub fn has_chunk(&self, index: usize) -> bool {
        index < self.num_chunks && !self.leaves[index].is_empty()
    }

    /// The hash of a chunk, or the empty sentinel if missing.
    pub fn chunk_hash(&self, index: usize) -> ChunkHash {
        if index >= self.num_chunks {
            return ChunkHash::EMPTY;
        }
        self.leaves[index]
    }

    /// True when every chunk is present. A zero-size blob is complete.
    pub fn complete(&self) -> bool {
        self.present_count >= self.num_chunks
    }

    /// Fraction of chunks present, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.num_chunks == 0 {
            return 1.0;
        }
        self.present_count as f64 / self.num_chunks as f64
    }

    /// Indices of all missing chunks, ascending.
    pub fn missing_chunks(&self) -> Vec<usize> {
        (0..self.num_chunks)
            .filter(|&i| self.leaves[i].is_empty())
            .collect()
    }

    /// Contiguous runs of missing chunks as `[start, end)` pairs.
    pub fn missing_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let mut start = None;

        for i in 0..self.num_chunks {
            match (self.leaves[i].is_empty(), start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    ranges.push((s, i));
                    start = None;
                }
                _ => {}
            }
        }

        if let Some(s) = start {
            ranges.push((s, self.num_chunks));
        }

        ranges
    }

    /// Byte offset of a chunk within the blob.
    pub fn chunk_offset(&self, index: usize) -> u64 {
        index as u64 * self.chunk_size as u64
    }

    /// Byte length of a chunk. The last chunk may be short.
    pub fn chunk_length(&self, index: usize) -> usize {
        if index >= self.num_chunks {
            return 0;
        }

        let remaining = self.total_size - self.chunk_offset(index);
        remaining.min(self.chunk_size as u64) as usize
    }

    /// Rollup hash over all leaves.
    ///
    /// Absent leaves participate as the fixed sentinel, so trees of
    /// equal geometry and equal leaf contents produce equal roots, and
    /// any single-chunk change changes the root.
    pub fn root(&self) -> ChunkHash {
        if self.leaves.is_empty() {
            return ChunkHash::EMPTY;
        }

        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = level
                .chunks_exact(2)
                .map(|pair| hash_pair(pair[0], pair[1]))
                .collect();
        }

        level[0]
    }

    pub(super) fn leaves(&self) -> &[ChunkHash] {
        &self.leaves
    }
}

fn hash_pair(left: ChunkHash, right: ChunkHash) -> ChunkHash {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&left.0.to_le_bytes());
    buf[8..].copy_from_slice(&right.0.to_le_bytes());
    ChunkHash(xxh64(&buf, 0))
}
