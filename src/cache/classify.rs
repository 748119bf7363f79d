//! Routing of intercepted requests to a caching strategy.

use reqwest::Method;

use super::traits::PartitionKind;
use crate::http::{Destination, Request};

const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "svg"];

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted; goes to the network untouched
  PassThrough,
  NetworkFirst(PartitionKind),
  CacheFirst(PartitionKind),
}

/// Classify a request. Rules are evaluated in order; the first match wins.
pub fn classify(request: &Request, api_prefix: &str) -> Route {
  if request.method != Method::GET {
    return Route::PassThrough;
  }

  let path = request.url.path();
  if path.starts_with(api_prefix) {
    return Route::NetworkFirst(PartitionKind::Api);
  }

  if request.destination == Destination::Image || has_image_extension(path) {
    return Route::CacheFirst(PartitionKind::Image);
  }

  Route::CacheFirst(PartitionKind::Static)
}

fn has_image_extension(path: &str) -> bool {
  path
    .rsplit_once('.')
    .map(|(_, ext)| {
      IMAGE_EXTENSIONS
        .iter()
        .any(|known| ext.eq_ignore_ascii_case(known))
    })
    .unwrap_or(false)
}
