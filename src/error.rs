//! Error surface: engine faults and callback completion status.

use std::fmt;
use std::io;

/// Completion status delivered to host callbacks.
///
/// The engine mints exactly one status of its own, [`Disconnected`], for
/// operations requested on an already-closed session. [`Cancelled`] reports
/// an operation torn down by a stop or an explicit cancellation. Everything
/// else passes through from the I/O layer as [`Io`].
///
/// [`Disconnected`]: Status::Disconnected
/// [`Cancelled`]: Status::Cancelled
/// [`Io`]: Status::Io
#[derive(Debug)]
pub enum Status {
    /// The operation completed normally.
    Success,
    /// The operation was cancelled before completion (timer cancel,
    /// handler stop, session teardown).
    Cancelled,
    /// The operation was requested on an already-closed session.
    Disconnected,
    /// The operation failed in the I/O layer.
    Io(io::Error),
}

impl Status {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Status::Cancelled)
    }

    #[inline]
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Status::Disconnected)
    }

    /// Returns true for any non-success status.
    #[inline]
    pub fn is_error(&self) -> bool {
        !self.is_success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Cancelled => write!(f, "cancelled"),
            Status::Disconnected => write!(f, "disconnected"),
            Status::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl From<io::Error> for Status {
    fn from(e: io::Error) -> Self {
        Status::Io(e)
    }
}

/// Errors returned by engine setup paths.
#[derive(Debug)]
pub enum Error {
    /// Building the worker runtime failed.
    Runtime(io::Error),
    /// Binding a listening or datagram socket failed.
    Bind { port: u16, source: io::Error },
    /// Socket configuration failed after bind.
    Socket(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Runtime(e) => write!(f, "runtime setup: {e}"),
            Error::Bind { port, source } => write!(f, "bind port {port}: {source}"),
            Error::Socket(e) => write!(f, "socket setup: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Runtime(e) => Some(e),
            Error::Bind { source, .. } => Some(source),
            Error::Socket(e) => Some(e),
        }
    }
}

/// Install a process-wide panic hook that logs a diagnostic and aborts.
///
/// Host callbacks must not panic: the engine invokes them from its worker
/// lanes, where an unwinding panic would silently kill the affected task and
/// strand its connections. With this hook installed, any panic in a callback
/// (or inside the engine itself) prints the payload and terminates the
/// process.
pub fn install_panic_abort() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        tracing::error!("fatal: {info}");
        std::process::abort();
    }));
}
