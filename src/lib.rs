//! Fray — edge-native OCI image puller and pull-through cache
//!
//! A caching client for OCI image registries built around resumable
//! chunked blob transfer: large layers are split into fixed-size chunks,
//! chunk completion is tracked in a persistent state tree, and an
//! interrupted pull resumes by downloading only the absent chunks.
//!
//! Modules, leaves first:
//! - [`chunk`] — per-blob chunk-state trees and their persistence
//! - [`image`] — references, manifests, platform selection
//! - [`registry`] — OCI Distribution client and auth
//! - [`store`] — the on-disk OCI layout and the resumable puller
//! - [`proxy`] — read-only Distribution API in front of the store
//! - [`prune`] — housekeeping for interrupted downloads
//! - [`version`] — build metadata

pub mod chunk;
pub mod image;
pub mod prune;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod version;
