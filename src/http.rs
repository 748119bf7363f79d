//! Request descriptors, response snapshots and the network seam.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  Image,
  Document,
  #[default]
  Other,
}

/// Whether the request is a top-level page navigation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  Navigate,
  #[default]
  Other,
}

/// How the network should treat intermediate HTTP caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
  #[default]
  Default,
  /// Force-reload: bypass every cache between us and the origin.
  Reload,
}

/// An outgoing request as seen by the intercepting layer.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      destination: Destination::Other,
      mode: RequestMode::Other,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation (document destination, navigate mode).
  pub fn navigate(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json(mut self, body: &serde_json::Value) -> Result<Self> {
    let bytes =
      serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
    self.body = Some(bytes);
    Ok(self.with_header("Content-Type", "application/json"))
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Human-readable identity of the request: method plus URL.
  pub fn describe(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  /// Stable, fixed-length key identifying this request in a cache partition.
  /// The fragment never reaches the server, so it is not part of the key.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    let mut hasher = Sha256::new();
    hasher.update(format!("{} {}", self.method, url).as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// An immutable snapshot of a network response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: vec![("Content-Type".to_string(), content_type.to_string())],
      body: body.into(),
    }
  }

  /// True for 2xx statuses.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("Content-Type")
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// The network as seen by the caching core.
///
/// Returned futures are `'static` so a fetch can be moved into a detached
/// background task.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request, mode: FetchMode) -> BoxFuture<'static, Result<Response>>;
}

/// Fetcher backed by a real HTTP client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: &Request, mode: FetchMode) -> BoxFuture<'static, Result<Response>> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if mode == FetchMode::Reload {
      builder = builder
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache");
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let description = request.describe();
    Box::pin(async move {
      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Network request {} failed: {}", description, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response body for {}: {}", description, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}
