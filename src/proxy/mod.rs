//! Pull-Through Caching Proxy
//!
//! Serves the read subset of the OCI Distribution API in front of the
//! layout. Cache misses trigger an upstream pull; concurrent requests
//! for the same image coalesce into a single puller (single-flight).

mod server;

pub use server::{router, ProxyOptions, ProxyState, DEFAULT_PULL_TIMEOUT};
