//! Replays the outbox against the origin when connectivity returns.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::connectivity::{Connectivity, ConnectivityMonitor};
use super::replay::Replayer;
use crate::event::{EventBus, SyncEvent};
use crate::http::{FetchMode, Fetcher, Response};
use crate::store::{ActionKind, LocalStore, PendingAction};

/// Outcome of one drain pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
  pub replayed: usize,
  pub remaining: usize,
  pub failure: Option<DrainFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainFailure {
  pub action_id: i64,
  pub error: String,
}

/// Outcome of submitting a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
  /// Reached the server
  Sent(Response),
  /// Deferred to the outbox
  Queued(i64),
}

pub struct Synchronizer {
  store: LocalStore,
  fetcher: Arc<dyn Fetcher>,
  replayer: Replayer,
  connectivity: ConnectivityMonitor,
  events: EventBus<SyncEvent>,
  /// Held for the duration of a drain so drains never overlap
  draining: Mutex<()>,
}

impl Synchronizer {
  pub fn new(
    store: LocalStore,
    fetcher: Arc<dyn Fetcher>,
    replayer: Replayer,
    connectivity: ConnectivityMonitor,
  ) -> Self {
    Self {
      store,
      fetcher,
      replayer,
      connectivity,
      events: EventBus::new(),
      draining: Mutex::new(()),
    }
  }

  pub fn events(&self) -> &EventBus<SyncEvent> {
    &self.events
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }

  /// Perform a mutation now, or defer it to the outbox.
  ///
  /// While offline, or while older actions are still queued, the action is
  /// queued so replay order matches authoring order. A transport failure
  /// also queues; a server rejection is returned to the caller.
  pub async fn submit(&self, kind: ActionKind, payload: Value) -> Result<SubmitOutcome> {
    if !self.connectivity.is_online() {
      return self.queue(kind, payload).await;
    }

    if self.store.pending_action_count().await? > 0 {
      // Already durable; a failed drain must not invite a duplicate resubmit
      let outcome = self.queue(kind, payload).await?;
      self.drain_logged().await;
      return Ok(outcome);
    }

    let request = self.replayer.request_for(kind, &payload)?;
    match self.fetcher.fetch(&request, FetchMode::Default).await {
      Ok(response) if response.is_success() => Ok(SubmitOutcome::Sent(response)),
      Ok(response) => Err(eyre!(
        "Server rejected {} with status {}: {}",
        kind,
        response.status,
        response.text()
      )),
      Err(err) => {
        warn!("Could not reach server for {}, queueing: {:#}", kind, err);
        self.queue(kind, payload).await
      }
    }
  }

  async fn queue(&self, kind: ActionKind, payload: Value) -> Result<SubmitOutcome> {
    let action_id = self.store.enqueue_pending_action(kind, payload).await?;
    info!("Queued {} as pending action {}", kind, action_id);
    self.events.emit(SyncEvent::Queued { action_id });
    Ok(SubmitOutcome::Queued(action_id))
  }

  /// Replay the outbox oldest-first, one action at a time.
  ///
  /// Each acknowledged action is removed before the next is attempted. The
  /// first failure stops the pass and leaves it and everything after it
  /// queued for the next drain.
  pub async fn drain(&self) -> Result<DrainReport> {
    let _guard = self.draining.lock().await;

    let actions = self.store.list_pending_actions().await?;
    let total = actions.len();
    let mut replayed = 0;

    for action in actions {
      if let Err(err) = self.replay(&action).await {
        let error = format!("{:#}", err);
        warn!("Replay of pending action {} ({}) failed: {}", action.id, action.action, error);

        let remaining = total - replayed;
        self.events.emit(SyncEvent::DrainFailed {
          action_id: action.id,
          replayed,
          remaining,
          error: error.clone(),
        });
        return Ok(DrainReport {
          replayed,
          remaining,
          failure: Some(DrainFailure {
            action_id: action.id,
            error,
          }),
        });
      }

      self.store.remove_pending_action(action.id).await?;
      replayed += 1;
    }

    if total > 0 {
      info!("Outbox drained: {} actions replayed", replayed);
    }
    self.events.emit(SyncEvent::DrainCompleted { replayed });
    Ok(DrainReport {
      replayed,
      remaining: 0,
      failure: None,
    })
  }

  async fn replay(&self, action: &PendingAction) -> Result<()> {
    let request = self.replayer.request_for_action(action)?;
    let response = self.fetcher.fetch(&request, FetchMode::Default).await?;
    if !response.is_success() {
      return Err(eyre!(
        "{} returned status {}",
        request.describe(),
        response.status
      ));
    }
    Ok(())
  }

  async fn drain_logged(&self) {
    if let Err(e) = self.drain().await {
      error!("Outbox drain failed: {:#}", e);
    }
  }

  /// Watch connectivity and drain on every Offline to Online transition,
  /// plus a periodic backstop while online with a non-empty outbox.
  ///
  /// The synchronizer keeps its own monitor alive, so this never returns on
  /// its own; the host stops it by aborting the task.
  pub async fn run(self: Arc<Self>, backstop: Duration) {
    let mut rx = self.connectivity.subscribe();
    let mut last = *rx.borrow_and_update();

    if last == Connectivity::Online {
      self.drain_logged().await;
    }

    let mut ticker = tokio::time::interval(backstop);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
      tokio::select! {
        changed = rx.changed() => {
          if changed.is_err() {
            break;
          }
          let state = *rx.borrow_and_update();
          if state == last {
            continue;
          }
          last = state;
          self.events.emit(SyncEvent::ConnectivityChanged(state));
          if state == Connectivity::Online {
            self.drain_logged().await;
          }
        }
        _ = ticker.tick() => {
          if last != Connectivity::Online {
            continue;
          }
          match self.store.pending_action_count().await {
            Ok(0) => {}
            Ok(_) => self.drain_logged().await,
            Err(e) => error!("Failed to inspect outbox: {:#}", e),
          }
        }
      }
    }
  }
}
