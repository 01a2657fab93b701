//! Workloads submitted to the worker pool and their firing schedules.

use std::time::{Duration, Instant};

use crate::error::Status;
use crate::server::ServerConfig;

/// Host function run by a [`WorkloadKind::Function`] workload.
pub type WorkFn = Box<dyn FnOnce() + Send + 'static>;

/// Completion callback attached to a workload. Receives the scheduling
/// outcome: [`Status::Cancelled`] if the item was cancelled before firing,
/// [`Status::Success`] otherwise.
pub type CompletionFn = Box<dyn FnOnce(Status) + Send + 'static>;

/// The three shapes of work a pool submission can carry.
pub enum WorkloadKind {
    /// Invoke an opaque host function once.
    Function(WorkFn),
    /// Start a server from the given configuration, unless one is already
    /// bound to the configured port.
    StartServer(ServerConfig),
    /// Stop the first running server bound to this port; a no-op if none
    /// matches.
    StopServer(u16),
}

/// One unit of work plus an optional completion callback.
pub struct Workload {
    pub(crate) kind: WorkloadKind,
    pub(crate) callback: Option<CompletionFn>,
}

impl Workload {
    /// A workload that invokes `f` once when it fires.
    pub fn function(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            kind: WorkloadKind::Function(Box::new(f)),
            callback: None,
        }
    }

    /// A workload that starts a server when it fires.
    pub fn start_server(config: ServerConfig) -> Self {
        Self {
            kind: WorkloadKind::StartServer(config),
            callback: None,
        }
    }

    /// A workload that stops the server bound to `port` when it fires.
    pub fn stop_server(port: u16) -> Self {
        Self {
            kind: WorkloadKind::StopServer(port),
            callback: None,
        }
    }

    /// Attach a completion callback, replacing any previous one.
    pub fn with_callback(mut self, callback: impl FnOnce(Status) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

/// When a submitted workload fires.
#[derive(Debug, Clone, Copy)]
pub enum Schedule {
    /// As soon as the item's lane picks it up.
    Now,
    /// At a specific monotonic instant.
    At(Instant),
    /// After a delay from submission.
    After(Duration),
}
