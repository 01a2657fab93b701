//! Server: one running handler plus its registration cleanup.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::error::Error;
use crate::metrics::{SERVERS_STARTED, SERVERS_STOPPED};
use crate::tcp::{TcpConfig, TcpHandler};
use crate::udp::{UdpConfig, UdpHandler};

/// Configuration for one server: a port, an address family and the
/// protocol-specific handler configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Bind the IPv6 wildcard instead of the IPv4 one.
    pub v6: bool,
    pub handler: HandlerConfig,
}

impl ServerConfig {
    /// A TCP server on the IPv4 wildcard.
    pub fn tcp(port: u16, config: TcpConfig) -> Self {
        Self {
            port,
            v6: false,
            handler: HandlerConfig::Tcp(config),
        }
    }

    /// A UDP server on the IPv4 wildcard.
    pub fn udp(port: u16, config: UdpConfig) -> Self {
        Self {
            port,
            v6: false,
            handler: HandlerConfig::Udp(config),
        }
    }

    /// Select the IPv6 wildcard endpoint.
    pub fn with_v6(mut self, v6: bool) -> Self {
        self.v6 = v6;
        self
    }
}

/// Protocol-specific handler configuration.
#[derive(Clone)]
pub enum HandlerConfig {
    Tcp(TcpConfig),
    Udp(UdpConfig),
}

enum HandlerKind {
    Tcp(Arc<TcpHandler>),
    Udp(Arc<UdpHandler>),
}

type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// A running server: the handler for its protocol plus the cleanup hook
/// that unregisters it from the worker pool.
///
/// Construction binds the socket and starts the handler eagerly, so a bind
/// failure surfaces to the submitting workload. `stop` (and drop) stops the
/// handler and runs the cleanup exactly once.
pub struct Server {
    port: u16,
    handler: HandlerKind,
    cleanup: Mutex<Option<CleanupFn>>,
    stopped: AtomicBool,
}

impl Server {
    pub(crate) fn start(runtime: &Handle, config: ServerConfig) -> Result<Server, Error> {
        let handler = match config.handler {
            HandlerConfig::Tcp(tcp) => {
                HandlerKind::Tcp(TcpHandler::start(runtime, tcp, config.port, config.v6)?)
            }
            HandlerConfig::Udp(udp) => {
                HandlerKind::Udp(UdpHandler::start(runtime, udp, config.port, config.v6)?)
            }
        };
        SERVERS_STARTED.increment();
        tracing::info!(port = config.port, v6 = config.v6, "server started");
        Ok(Server {
            port: config.port,
            handler,
            cleanup: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_cleanup(&self, cleanup: CleanupFn) {
        *self.cleanup.lock() = Some(cleanup);
    }

    /// The port this server is bound to; the worker pool's lookup key.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the handler and then run the cleanup. The handler's `stop`
    /// returns only once its `on_stop` has run, so by the time this returns
    /// the server is fully wound down and unregistered. Only the first call
    /// has any effect; drop calls this too.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.handler {
            HandlerKind::Tcp(handler) => handler.stop(),
            HandlerKind::Udp(handler) => handler.stop(),
        }
        if let Some(cleanup) = self.cleanup.lock().take() {
            cleanup();
        }
        SERVERS_STOPPED.increment();
        tracing::info!(port = self.port, "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The wildcard endpoint for the configured family and port.
pub(crate) fn wildcard_addr(port: u16, v6: bool) -> SocketAddr {
    if v6 {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
    }
}
