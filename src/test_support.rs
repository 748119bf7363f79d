//! Scripted network used by unit tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::http::{FetchMode, Fetcher, Request, Response};

#[derive(Clone)]
enum Step {
  Respond(Response),
  Fail,
  Stall,
}

/// Fetcher answering from per-URL scripts.
///
/// Each URL has a queue of steps; the last step repeats forever. Unscripted
/// URLs fail like an unreachable host.
#[derive(Default)]
pub struct ScriptedFetcher {
  scripts: Mutex<HashMap<String, VecDeque<Step>>>,
  calls: Mutex<Vec<(String, FetchMode)>>,
  offline: AtomicBool,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  fn push(&self, url: &str, step: Step) {
    self
      .scripts
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(step);
  }

  pub fn respond(&self, url: &str, status: u16, content_type: &str, body: &str) {
    self.push(url, Step::Respond(Response::new(status, content_type, body)));
  }

  pub fn fail(&self, url: &str) {
    self.push(url, Step::Fail);
  }

  /// Never answer.
  pub fn stall(&self, url: &str) {
    self.push(url, Step::Stall);
  }

  /// Fail every request regardless of scripts.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Requests seen so far, as `METHOD URL`.
  pub fn calls(&self) -> Vec<String> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .map(|(call, _)| call.clone())
      .collect()
  }

  pub fn modes(&self) -> Vec<FetchMode> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .map(|(_, mode)| *mode)
      .collect()
  }

  fn next_step(&self, url: &str) -> Option<Step> {
    let mut scripts = self.scripts.lock().unwrap();
    let queue = scripts.get_mut(url)?;
    if queue.len() > 1 {
      queue.pop_front()
    } else {
      queue.front().cloned()
    }
  }
}

impl Fetcher for ScriptedFetcher {
  fn fetch(&self, request: &Request, mode: FetchMode) -> BoxFuture<'static, Result<Response>> {
    let description = request.describe();
    self.calls.lock().unwrap().push((description.clone(), mode));

    let step = if self.offline.load(Ordering::SeqCst) {
      Some(Step::Fail)
    } else {
      self.next_step(request.url.as_str())
    };

    Box::pin(async move {
      match step {
        Some(Step::Respond(response)) => Ok(response),
        Some(Step::Stall) => {
          tokio::time::sleep(Duration::from_secs(3600)).await;
          Err(eyre!("stalled request {} gave up", description))
        }
        Some(Step::Fail) | None => Err(eyre!("connection refused: {}", description)),
      }
    })
  }
}
