//! Scheduled work items: one workload, one firing schedule, one lane.
//!
//! An item arms its schedule at submission. When the schedule fires, the
//! workload runs on the item's lane; a cancelled timer runs the same path
//! with a cancellation status instead and skips the workload. Items expose
//! `started`/`finished` flags whose observers are serialised through the
//! lane, so a caller sees them consistently with concurrent mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::error::Status;
use crate::lane::Lane;
use crate::server::Server;
use crate::slot_table::SlotTable;
use crate::workload::{Schedule, Workload, WorkloadKind};

type CleanupFn = Box<dyn FnOnce() + Send + 'static>;
pub(crate) type ServerTable = Arc<Mutex<SlotTable<Arc<Server>>>>;

struct TaskCore {
    lane: Lane,
    started: AtomicBool,
    finished: AtomicBool,
    cancel: Notify,
    submitted_at: Instant,
}

/// Handle to one submitted work item.
///
/// Handles are cheap clones over shared state; the worker pool keeps one in
/// its items table until the item finishes and is swept.
#[derive(Clone)]
pub struct ScheduledTask {
    core: Arc<TaskCore>,
}

impl ScheduledTask {
    /// Create an unarmed item. The pool registers the item in its table
    /// before calling [`arm`](Self::arm), so the item's cleanup sweep always
    /// finds it there.
    pub(crate) fn new(runtime: &Handle) -> ScheduledTask {
        ScheduledTask {
            core: Arc::new(TaskCore {
                lane: Lane::new(runtime),
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                cancel: Notify::new(),
                submitted_at: Instant::now(),
            }),
        }
    }

    /// Arm the firing schedule.
    pub(crate) fn arm(
        &self,
        runtime: &Handle,
        workload: Workload,
        schedule: Schedule,
        servers: ServerTable,
        cleanup: CleanupFn,
    ) {
        let core = self.core.clone();
        let runner = {
            let core = core.clone();
            let runtime = runtime.clone();
            move |status: Status| run_workload(&runtime, &core, &servers, workload, cleanup, status)
        };

        match schedule {
            Schedule::Now => {
                core.lane.post(move || runner(Status::Success));
            }
            Schedule::At(when) => arm_timer(runtime, &core, when, runner),
            Schedule::After(delay) => arm_timer(runtime, &core, Instant::now() + delay, runner),
        }
    }

    /// Request cancellation. Best-effort: once the schedule has fired and
    /// the workload begun, it is not rolled back. A cancelled item's
    /// completion callback receives [`Status::Cancelled`].
    pub fn cancel(&self) {
        let core = self.core.clone();
        self.core.lane.post(move || core.cancel.notify_one());
    }

    /// Whether the workload has begun executing. Blocks briefly: the read is
    /// posted onto the item's lane for a consistent view. Must not be called
    /// from engine lanes.
    pub fn started(&self) -> bool {
        let core = self.core.clone();
        self.core
            .lane
            .post_and_wait(move || core.started.load(Ordering::Acquire))
            .unwrap_or_else(|| self.core.started.load(Ordering::Acquire))
    }

    /// Whether the item has finished (workload complete, or the server it
    /// started has stopped). Blocks briefly, like [`started`](Self::started).
    pub fn finished(&self) -> bool {
        let core = self.core.clone();
        self.core
            .lane
            .post_and_wait(move || core.finished.load(Ordering::Acquire))
            .unwrap_or_else(|| self.core.finished.load(Ordering::Acquire))
    }

    /// When the item was submitted.
    pub fn submitted_at(&self) -> Instant {
        self.core.submitted_at
    }

    /// Non-blocking flag read for the pool's cleanup sweep, which already
    /// runs on the cleanup lane and must not wait on another lane.
    pub(crate) fn is_finished_now(&self) -> bool {
        self.core.finished.load(Ordering::Acquire)
    }
}

fn arm_timer(
    runtime: &Handle,
    core: &Arc<TaskCore>,
    when: Instant,
    runner: impl FnOnce(Status) + Send + 'static,
) {
    let core = core.clone();
    let deadline = tokio::time::Instant::from_std(when);
    runtime.spawn(async move {
        let status = tokio::select! {
            biased;
            _ = core.cancel.notified() => Status::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Status::Success,
        };
        core.lane.post(move || runner(status));
    });
}

/// Execute the fired (or cancelled) item on its lane.
///
/// Every shape except a successfully registered StartServer completes
/// within this call and finishes immediately; a registered server takes
/// over the item's finished transition through its cleanup closure.
fn run_workload(
    runtime: &Handle,
    core: &Arc<TaskCore>,
    servers: &ServerTable,
    workload: Workload,
    cleanup: CleanupFn,
    status: Status,
) {
    let Workload { kind, callback } = workload;
    let cancelled = status.is_error();
    let mut cleanup = Some(cleanup);
    let mut immediate_cleanup = true;

    if !cancelled {
        core.started.store(true, Ordering::Release);
        match kind {
            WorkloadKind::Function(f) => f(),
            WorkloadKind::StartServer(config) => {
                let port = config.port;
                let mut table = servers.lock();
                if !table.contains(|server| server.port() == port) {
                    match Server::start(runtime, config) {
                        Ok(server) => {
                            if let Some(item_cleanup) = cleanup.take() {
                                let core = core.clone();
                                let servers = servers.clone();
                                server.set_cleanup(Box::new(move || {
                                    servers.lock().remove_if(|server| server.port() == port);
                                    core.finished.store(true, Ordering::Release);
                                    item_cleanup();
                                }));
                            }
                            table.add(Arc::new(server));
                            immediate_cleanup = false;
                        }
                        Err(e) => {
                            tracing::error!(port, error = %e, "failed to start server");
                        }
                    }
                }
            }
            WorkloadKind::StopServer(port) => {
                let server = servers
                    .lock()
                    .first_where(|server| server.port() == port)
                    .cloned();
                if let Some(server) = server {
                    server.stop();
                }
            }
        }
    }

    if let Some(callback) = callback {
        callback(if cancelled { status } else { Status::Success });
    }

    if immediate_cleanup {
        core.finished.store(true, Ordering::Release);
        if let Some(cleanup) = cleanup.take() {
            cleanup();
        }
    }
}
