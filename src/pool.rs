//! Worker pool: the executor core plus the scheduling surface.
//!
//! The pool owns a multi-thread runtime and two slot tables: in-flight
//! scheduled items and running servers. Submissions add an item; each item's
//! cleanup posts a sweep onto the pool's cleanup lane that removes every
//! finished item. Dropping the pool stops all running servers, shuts the
//! runtime down and joins the workers; no further submissions are possible
//! after that by construction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::config::EngineConfig;
use crate::error::Error;
use crate::lane::Lane;
use crate::metrics::WORKLOADS_SUBMITTED;
use crate::scheduled::{ScheduledTask, ServerTable};
use crate::server::Server;
use crate::slot_table::SlotTable;
use crate::workload::{Schedule, Workload};

/// Scheduled items pre-allocated per worker thread.
const ITEMS_PER_WORKER: usize = 32;

/// A pool of worker threads sharing one executor, accepting scheduled
/// workloads and hosting the servers they start.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    threads: usize,
    items: Arc<Mutex<SlotTable<ScheduledTask>>>,
    servers: ServerTable,
    cleanup: Lane,
}

impl WorkerPool {
    /// Create a pool with `threads` workers (clamped to at least one).
    pub fn new(threads: usize) -> Result<Self, Error> {
        let threads = threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("spindle-worker")
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        let cleanup = Lane::new(runtime.handle());
        Ok(Self {
            runtime: Some(runtime),
            threads,
            items: Arc::new(Mutex::new(SlotTable::with_capacity(
                threads * ITEMS_PER_WORKER,
            ))),
            servers: Arc::new(Mutex::new(SlotTable::with_capacity(threads))),
            cleanup,
        })
    }

    /// Create a pool with one worker per available CPU.
    pub fn with_default_threads() -> Result<Self, Error> {
        Self::new(num_cpus::get())
    }

    /// Create a pool from a loaded configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self, Error> {
        Self::new(config.threads())
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Submit a workload to run as soon as its lane picks it up.
    pub fn run_immediately(&self, workload: Workload) -> ScheduledTask {
        self.submit(workload, Schedule::Now)
    }

    /// Submit a workload to run at a monotonic instant.
    pub fn run_at(&self, workload: Workload, when: Instant) -> ScheduledTask {
        self.submit(workload, Schedule::At(when))
    }

    /// Submit a workload to run after a delay.
    pub fn run_after(&self, workload: Workload, delay: Duration) -> ScheduledTask {
        self.submit(workload, Schedule::After(delay))
    }

    /// Returns true if any item is in flight or any server is running.
    pub fn has_active_tasks(&self) -> bool {
        !self.items.lock().is_empty() || !self.servers.lock().is_empty()
    }

    /// Returns true if a server is registered on `port`.
    pub fn has_server(&self, port: u16) -> bool {
        self.servers.lock().contains(|server| server.port() == port)
    }

    /// Number of running servers.
    pub fn server_count(&self) -> usize {
        self.servers.lock().len()
    }

    fn submit(&self, workload: Workload, schedule: Schedule) -> ScheduledTask {
        WORKLOADS_SUBMITTED.increment();
        let runtime = self
            .runtime
            .as_ref()
            .expect("pool is running until dropped")
            .handle();

        let items = self.items.clone();
        let cleanup_lane = self.cleanup.clone();
        let cleanup = Box::new(move || {
            cleanup_lane.post(move || {
                items.lock().remove_if(|item| item.is_finished_now());
            });
        });

        // Register the item before arming it: a Now schedule can fire (and
        // post its cleanup sweep) before submit returns.
        let task = ScheduledTask::new(runtime);
        self.items.lock().add(task.clone());
        task.arm(runtime, workload, schedule, self.servers.clone(), cleanup);
        task
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Stop servers before the executor goes away; each stop returns
        // only once its handler has fully wound down and fired on_stop.
        let running: Vec<Arc<Server>> = self
            .servers
            .lock()
            .iter()
            .map(|(_, server)| server.clone())
            .collect();
        for server in running {
            server.stop();
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}
