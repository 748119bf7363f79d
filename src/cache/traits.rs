//! Core types for the caching system.

use chrono::{DateTime, Utc};

/// Logical purpose of a cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  /// Application shell and other static assets
  Static,
  /// Responses from the REST namespace
  Api,
  /// Images, by destination or file extension
  Image,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 3] = [Self::Static, Self::Api, Self::Image];
}

/// Version tag shared by every partition of one deployment.
///
/// Partition names follow `{name}-{version}`, `{name}-{version}-api` and
/// `{name}-{version}-images`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion {
  name: String,
  version: String,
}

impl CacheVersion {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
    }
  }

  pub fn tag(&self) -> String {
    format!("{}-{}", self.name, self.version)
  }

  pub fn partition_name(&self, kind: PartitionKind) -> String {
    match kind {
      PartitionKind::Static => self.tag(),
      PartitionKind::Api => format!("{}-api", self.tag()),
      PartitionKind::Image => format!("{}-images", self.tag()),
    }
  }

  /// The three partition names this version is allowed to keep.
  pub fn reserved_names(&self) -> [String; 3] {
    PartitionKind::ALL.map(|kind| self.partition_name(kind))
  }

  pub fn is_reserved(&self, partition: &str) -> bool {
    self.reserved_names().iter().any(|name| name == partition)
  }
}

/// A response together with metadata about where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached data served without consulting the network first.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Cached data served because the network failed.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Synthesized stand-in served when neither network nor cache could answer.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cache hit, a background revalidation may be in flight
  Cache,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline page, error payload or placeholder image
  Fallback,
}
