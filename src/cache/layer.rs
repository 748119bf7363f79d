//! Cache layer that routes intercepted requests through a caching strategy.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::classify::{classify, Route};
use super::storage::{CacheStorage, CachedResponse};
use super::traits::{CacheResult, CacheVersion, PartitionKind};
use crate::http::{FetchMode, Fetcher, Request, Response};

const OFFLINE_PAGE: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>Reconnect to continue. Cached pages are still available.</p></body></html>";

const OFFLINE_IMAGE: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"200\" height=\"200\">\
<rect fill=\"#f1f5f9\" width=\"200\" height=\"200\"/>\
<text x=\"50%\" y=\"50%\" text-anchor=\"middle\" fill=\"#64748b\" font-family=\"sans-serif\" font-size=\"14\">Offline</text></svg>";

/// Intercepting cache layer.
///
/// API requests go network-first so data stays fresh; static assets and
/// images go cache-first and are refreshed in the background.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  fetcher: Arc<dyn Fetcher>,
  version: CacheVersion,
  api_prefix: String,
  offline_page: String,
  /// Upper bound on a network-first attempt before falling back
  network_timeout: Duration,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(storage: Arc<S>, fetcher: Arc<dyn Fetcher>, version: CacheVersion) -> Self {
    Self {
      storage,
      fetcher,
      version,
      api_prefix: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      network_timeout: Duration::from_secs(10),
    }
  }

  pub fn with_api_prefix(mut self, api_prefix: impl Into<String>) -> Self {
    self.api_prefix = api_prefix.into();
    self
  }

  pub fn with_offline_page(mut self, offline_page: impl Into<String>) -> Self {
    self.offline_page = offline_page.into();
    self
  }

  pub fn with_network_timeout(mut self, network_timeout: Duration) -> Self {
    self.network_timeout = network_timeout;
    self
  }

  /// Answer an intercepted request.
  pub async fn handle(&self, request: &Request) -> Result<CacheResult<Response>> {
    match classify(request, &self.api_prefix) {
      Route::PassThrough => {
        let response = self.fetcher.fetch(request, FetchMode::Default).await?;
        Ok(CacheResult::from_network(response))
      }
      Route::NetworkFirst(kind) => self.network_first(request, kind).await,
      Route::CacheFirst(kind) => self.cache_first(request, kind).await,
    }
  }

  /// Network-first strategy.
  ///
  /// 1. Try the network (bounded by the network timeout)
  /// 2. On success, store a copy in the partition and return it
  /// 3. On failure, return any cached copy of the exact request
  /// 4. Otherwise the offline page for navigations, or a 503 JSON error
  pub async fn network_first(
    &self,
    request: &Request,
    kind: PartitionKind,
  ) -> Result<CacheResult<Response>> {
    let attempt = tokio::time::timeout(
      self.network_timeout,
      self.fetcher.fetch(request, FetchMode::Default),
    )
    .await
    .unwrap_or_else(|_| {
      Err(eyre!(
        "{} timed out after {:?}",
        request.describe(),
        self.network_timeout
      ))
    });

    match attempt {
      Ok(response) => {
        if response.is_success() {
          self.store_quietly(&self.version.partition_name(kind), request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        debug!("Network request failed, trying cache: {:#}", err);

        if let Some(cached) = self.lookup(request) {
          return Ok(CacheResult::offline(cached.response, cached.stored_at));
        }

        if request.is_navigation() {
          return Ok(CacheResult::fallback(self.offline_document(request)));
        }

        Ok(CacheResult::fallback(offline_error()))
      }
    }
  }

  /// Cache-first strategy with stale-while-revalidate.
  ///
  /// A cache hit is returned immediately while a detached task refetches the
  /// request and overwrites the stored copy. A miss goes to the network;
  /// image misses that fail get a placeholder, anything else propagates.
  pub async fn cache_first(
    &self,
    request: &Request,
    kind: PartitionKind,
  ) -> Result<CacheResult<Response>> {
    let partition = self.version.partition_name(kind);

    if let Some(cached) = self.lookup(request) {
      self.revalidate(request.clone(), partition);
      return Ok(CacheResult::from_cache(cached.response, cached.stored_at));
    }

    match self.fetcher.fetch(request, FetchMode::Default).await {
      Ok(response) => {
        if response.is_success() {
          self.store_quietly(&partition, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        if kind == PartitionKind::Image {
          debug!("Image fetch failed, serving placeholder: {:#}", err);
          return Ok(CacheResult::fallback(Response::new(
            200,
            "image/svg+xml",
            OFFLINE_IMAGE,
          )));
        }
        Err(err)
      }
    }
  }

  /// Refetch in a detached task and overwrite the cached copy on success.
  ///
  /// Nothing awaits the task; its only observable effect is the cache write.
  fn revalidate(&self, request: Request, partition: String) {
    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);

    tokio::spawn(async move {
      match fetcher.fetch(&request, FetchMode::Default).await {
        Ok(response) if response.is_success() => {
          match storage.put(&partition, &request, &response) {
            Ok(()) => debug!("Revalidated {}", request.describe()),
            Err(e) => warn!("Failed to store revalidated {}: {:#}", request.describe(), e),
          }
        }
        Ok(response) => debug!(
          "Revalidation of {} returned status {}",
          request.describe(),
          response.status
        ),
        // Silent for background updates
        Err(_) => {}
      }
    });
  }

  /// Cache lookup, current version's partitions first. A storage failure
  /// counts as a miss.
  fn lookup(&self, request: &Request) -> Option<CachedResponse> {
    self
      .version
      .reserved_names()
      .iter()
      .find_map(|name| self.storage.match_in(name, request).transpose())
      .or_else(|| self.storage.match_any(request).transpose())
      .transpose()
      .unwrap_or_else(|e| {
        warn!("Cache lookup for {} failed: {:#}", request.describe(), e);
        None
      })
  }

  /// Opportunistic write; the response is already on its way to the caller.
  fn store_quietly(&self, partition: &str, request: &Request, response: &Response) {
    if let Err(e) = self.storage.put(partition, request, response) {
      warn!("Failed to cache {}: {:#}", request.describe(), e);
    }
  }

  fn offline_document(&self, request: &Request) -> Response {
    let cached = request
      .url
      .join(&self.offline_page)
      .ok()
      .and_then(|url| self.lookup(&Request::get(url)));

    match cached {
      Some(cached) => cached.response,
      None => Response::new(503, "text/html; charset=utf-8", OFFLINE_PAGE),
    }
  }
}

fn offline_error() -> Response {
  let body = serde_json::json!({
    "error": "Offline",
    "message": "You are currently offline",
  });
  Response::new(503, "application/json", body.to_string())
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      version: self.version.clone(),
      api_prefix: self.api_prefix.clone(),
      offline_page: self.offline_page.clone(),
      network_timeout: self.network_timeout,
    }
  }
}
