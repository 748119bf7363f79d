//! Offline-capable HTTP caching.
//!
//! This module provides the intercepting side of the offline layer:
//! - Versioned cache partitions (static assets, API responses, images)
//! - Install/activate lifecycle that primes and evicts partitions per version
//! - Network-first routing for API calls, cache-first with background
//!   revalidation for everything else
//! - Offline fallbacks (cached copy, offline page, 503 JSON, placeholder image)

mod classify;
mod layer;
mod lifecycle;
mod storage;
mod traits;

pub use classify::{classify, Route};
pub use layer::CacheLayer;
pub use lifecycle::{ActivationReport, AssetManifest, CacheLifecycle, InstallReport};
pub use storage::{CacheStorage, CachedResponse, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CacheVersion, PartitionKind};
