use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

use crate::sync::Connectivity;

/// Events from the outbox synchronizer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// Connectivity flipped
  ConnectivityChanged(Connectivity),
  /// A mutation was deferred to the outbox
  Queued { action_id: i64 },
  /// The outbox drained completely
  DrainCompleted { replayed: usize },
  /// Draining stopped at the first failed replay
  DrainFailed {
    action_id: i64,
    replayed: usize,
    remaining: usize,
    error: String,
  },
}

/// Events from the worker lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
  Installed { cached: usize, failed: usize },
  Activated { deleted: usize },
  /// Open clients are now served by this version
  Claimed,
  InstallFailed { error: String },
  /// Old partitions could not be listed; the worker stays out of the way
  ActivationFailed { error: String },
  /// The configured cache version moved on; a restart installs it
  UpdateAvailable { version: String },
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
  next_id: u64,
  handlers: BTreeMap<u64, Handler<E>>,
}

/// Subscription registry. Handlers run in subscription order.
pub struct EventBus<E> {
  registry: Arc<Mutex<Registry<E>>>,
}

impl<E> EventBus<E> {
  pub fn new() -> Self {
    Self {
      registry: Arc::new(Mutex::new(Registry {
        next_id: 0,
        handlers: BTreeMap::new(),
      })),
    }
  }

  /// Register a handler. It stays registered until the returned
  /// subscription is dropped or unsubscribed.
  pub fn subscribe<F>(&self, handler: F) -> Subscription<E>
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    let mut registry = self
      .registry
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let id = registry.next_id;
    registry.next_id += 1;
    registry.handlers.insert(id, Arc::new(handler));

    Subscription {
      id,
      registry: Arc::downgrade(&self.registry),
    }
  }

  pub fn emit(&self, event: E) {
    // Snapshot so handlers may subscribe or unsubscribe while running
    let handlers: Vec<Handler<E>> = self
      .registry
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .handlers
      .values()
      .cloned()
      .collect();

    for handler in handlers {
      handler(&event);
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self
      .registry
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .handlers
      .len()
  }

  /// Remove every handler.
  pub fn clear(&self) {
    self
      .registry
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .handlers
      .clear();
  }
}

impl<E: Clone + Send + 'static> EventBus<E> {
  /// Forward events into a channel for async consumers.
  pub fn channel(&self) -> (Subscription<E>, mpsc::UnboundedReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = self.subscribe(move |event: &E| {
      let _ = tx.send(event.clone());
    });
    (subscription, rx)
  }
}

impl<E> Default for EventBus<E> {
  fn default() -> Self {
    Self::new()
  }
}

impl<E> Clone for EventBus<E> {
  fn clone(&self) -> Self {
    Self {
      registry: Arc::clone(&self.registry),
    }
  }
}

/// Handle to a registered handler. Dropping it unsubscribes.
pub struct Subscription<E> {
  id: u64,
  registry: Weak<Mutex<Registry<E>>>,
}

impl<E> Subscription<E> {
  pub fn unsubscribe(self) {
    // Drop does the work
  }
}

impl<E> Drop for Subscription<E> {
  fn drop(&mut self) {
    if let Some(registry) = self.registry.upgrade() {
      registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .handlers
        .remove(&self.id);
    }
  }
}
