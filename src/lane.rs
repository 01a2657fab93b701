//! Serial execution lanes.
//!
//! A lane runs posted closures one at a time in submission order, on
//! whichever worker thread the runtime picks. It is the engine's ordering
//! device: callers that must observe a consistent sequence of effects post
//! everything touching that sequence onto one lane. A lane does not pin a
//! thread; it only forbids two of its jobs from overlapping.

use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO lane of closures drained by a single runtime task.
///
/// Cloning a `Lane` yields another submitter for the same queue. The drain
/// task exits when every clone has been dropped.
#[derive(Clone)]
pub struct Lane {
    tx: mpsc::UnboundedSender<Job>,
}

impl Lane {
    /// Create a lane on the given runtime.
    pub fn new(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { tx }
    }

    /// Queue `job` behind everything already posted. Returns false if the
    /// lane has shut down (runtime gone), in which case the job is dropped.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(job)).is_ok()
    }

    /// Post `read` and block the calling thread until it has run, returning
    /// its value. `None` means the lane is gone.
    ///
    /// This is the linearisable-observation primitive: the read is ordered
    /// against every mutation posted to the same lane. It must never be
    /// called from the lane itself, which would deadlock.
    pub fn post_and_wait<T, F>(&self, read: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        if !self.post(move || {
            let _ = tx.send(read());
        }) {
            return None;
        }
        rx.recv().ok()
    }
}

/// Block the calling thread until `rx` resolves (acknowledgement sent, or
/// the engine side dropped its sender).
///
/// Callable from runtime workers: blocking one outright would starve the
/// very tasks being waited on, so a worker hands its core off first and
/// engine tasks keep making progress even on a single-worker pool. Threads
/// outside the runtime just block.
pub(crate) fn wait_for_ack(rx: std::sync::mpsc::Receiver<()>) {
    if tokio::runtime::Handle::try_current().is_ok() {
        tokio::task::block_in_place(|| {
            let _ = rx.recv();
        });
    } else {
        let _ = rx.recv();
    }
}
