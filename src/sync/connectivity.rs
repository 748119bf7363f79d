//! Connectivity state shared between the host and the synchronizer.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::http::{FetchMode, Fetcher, Request};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Offline,
  Online,
}

impl From<bool> for Connectivity {
  fn from(online: bool) -> Self {
    if online {
      Self::Online
    } else {
      Self::Offline
    }
  }
}

/// Current connectivity, observable through a watch channel.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
  pub fn new(initial: Connectivity) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx: Arc::new(tx) }
  }

  pub fn current(&self) -> Connectivity {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.current() == Connectivity::Online
  }

  /// Report a platform connectivity event. Returns true if the state changed.
  pub fn set_online(&self, online: bool) -> bool {
    let next = Connectivity::from(online);
    let changed = self.tx.send_if_modified(|state| {
      if *state == next {
        false
      } else {
        *state = next;
        true
      }
    });
    if changed {
      info!("Connectivity changed to {:?}", next);
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.tx.subscribe()
  }

  /// Check reachability of `url` once and record it. Any HTTP answer
  /// counts as online; only transport failures and timeouts count as offline.
  pub async fn probe(&self, fetcher: &dyn Fetcher, url: &Url, timeout: Duration) -> Connectivity {
    let request = Request::get(url.clone());
    let attempt = tokio::time::timeout(timeout, fetcher.fetch(&request, FetchMode::Reload)).await;
    let online = matches!(attempt, Ok(Ok(_)));
    debug!("Connectivity probe: online={}", online);
    self.set_online(online);
    Connectivity::from(online)
  }

  /// Probe `url` every `interval`.
  pub fn spawn_probe(
    &self,
    fetcher: Arc<dyn Fetcher>,
    url: Url,
    interval: Duration,
  ) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        monitor.probe(fetcher.as_ref(), &url, interval).await;
      }
    })
  }
}
