//! Reconnection synchronizer: connectivity tracking and outbox replay.

mod connectivity;
mod replay;
mod synchronizer;

pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use replay::Replayer;
pub use synchronizer::{DrainFailure, DrainReport, SubmitOutcome, Synchronizer};
