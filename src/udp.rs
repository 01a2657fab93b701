//! UDP handler: a single-socket datagram loop driven by host commands.
//!
//! Unlike TCP there are no per-peer sessions; one handler owns one
//! unconnected socket and alternates receives and sends as the host's
//! [`UdpCommand`]s dictate, with exactly one operation outstanding at a
//! time. All callbacks run on the handler's lane (its task).

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::buffer::Buffer;
use crate::error::{Error, Status};
use crate::lane::wait_for_ack;
use crate::metrics::{DATAGRAMS_RECEIVED, DATAGRAMS_SENT};
use crate::server::wildcard_addr;

/// Default read buffer size for a UDP handler.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Host-implemented event callbacks for a UDP server.
pub trait UdpEvents: Send + Sync + 'static {
    /// A datagram arrived (or the receive failed). On success, the first
    /// `bytes` bytes of [`UdpHandler::read_buffer`] hold the payload and
    /// `sender` is the datagram's source.
    fn on_receive(
        &self,
        handler: &Arc<UdpHandler>,
        status: Status,
        bytes: usize,
        sender: SocketAddr,
    ) -> UdpCommand;

    /// A send completed.
    fn on_write(&self, handler: &Arc<UdpHandler>, status: Status, bytes: usize) -> UdpCommand;

    /// The handler is about to issue its first receive.
    fn on_start(&self, handler: &Arc<UdpHandler>);

    /// The handler stopped and its socket is closed.
    fn on_stop(&self, handler: &Arc<UdpHandler>);
}

/// The next I/O step for a UDP handler, returned by host callbacks.
/// Consumed exactly once.
pub enum UdpCommand {
    /// Receive the next datagram into the read buffer.
    Read,
    /// Send the whole buffer to the given endpoint.
    Write(Buffer, SocketAddr),
}

/// Configuration for a UDP server.
#[derive(Clone)]
pub struct UdpConfig {
    /// Capacity of the handler's read buffer. Must be non-zero; datagrams
    /// longer than this are truncated by the socket layer.
    pub read_buffer_size: usize,
    /// Host callbacks.
    pub events: Arc<dyn UdpEvents>,
}

impl UdpConfig {
    pub fn new(events: Arc<dyn UdpEvents>) -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            events,
        }
    }
}

enum UdpCtrl {
    Stop(std::sync::mpsc::Sender<()>),
}

/// One bound datagram socket and its command loop.
pub struct UdpHandler {
    ctrl: mpsc::UnboundedSender<UdpCtrl>,
    port: u16,
    read_buf: Mutex<Buffer>,
    stopped: AtomicBool,
}

impl UdpHandler {
    pub(crate) fn start(
        runtime: &Handle,
        config: UdpConfig,
        port: u16,
        v6: bool,
    ) -> Result<Arc<UdpHandler>, Error> {
        let socket = bind_socket(runtime, port, v6)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(UdpHandler {
            ctrl: tx,
            port,
            read_buf: Mutex::new(Buffer::with_capacity(config.read_buffer_size)),
            stopped: AtomicBool::new(false),
        });
        runtime.spawn(udp_task(handler.clone(), config, socket, rx));
        Ok(handler)
    }

    /// The port this handler is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Locked view of the handler's read buffer. After an `on_receive`
    /// completion with `bytes = n`, the first `n` bytes are the payload.
    pub fn read_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.read_buf.lock()
    }

    /// Cancel the outstanding operation, close the socket and fire
    /// `on_stop`, returning only once all of that has run. Only the first
    /// call has any effect; later calls return immediately. Must not be
    /// called from this handler's own callbacks, which would wait on
    /// themselves.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        if self.ctrl.send(UdpCtrl::Stop(ack_tx)).is_ok() {
            wait_for_ack(ack_rx);
        }
    }
}

fn bind_socket(runtime: &Handle, port: u16, v6: bool) -> Result<UdpSocket, Error> {
    let socket = std::net::UdpSocket::bind(wildcard_addr(port, v6))
        .map_err(|source| Error::Bind { port, source })?;
    socket.set_nonblocking(true).map_err(Error::Socket)?;
    let _guard = runtime.enter();
    UdpSocket::from_std(socket).map_err(Error::Socket)
}

async fn udp_task(
    handler: Arc<UdpHandler>,
    config: UdpConfig,
    socket: UdpSocket,
    mut ctrl: mpsc::UnboundedReceiver<UdpCtrl>,
) {
    let events = config.events;
    // Placeholder handed to on_receive until the first datagram arrives.
    let mut last_sender = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));

    events.on_start(&handler);

    let mut command = UdpCommand::Read;
    let stop_request = loop {
        match command {
            UdpCommand::Read => {
                tokio::select! {
                    biased;
                    msg = ctrl.recv() => {
                        // The pending receive is cancelled by the stop; its
                        // completion is still delivered, but the returned
                        // command is not followed.
                        let _ = events.on_receive(&handler, Status::Cancelled, 0, last_sender);
                        break msg;
                    }
                    result = recv_from(&socket, &handler) => {
                        command = match result {
                            Ok((n, sender)) => {
                                DATAGRAMS_RECEIVED.increment();
                                last_sender = sender;
                                events.on_receive(&handler, Status::Success, n, sender)
                            }
                            Err(e) => {
                                events.on_receive(&handler, Status::Io(e), 0, last_sender)
                            }
                        };
                    }
                }
            }
            UdpCommand::Write(data, to) => {
                tokio::select! {
                    biased;
                    msg = ctrl.recv() => {
                        let _ = events.on_write(&handler, Status::Cancelled, 0);
                        break msg;
                    }
                    result = send_to(&socket, &data, to) => {
                        command = match result {
                            Ok(n) => {
                                DATAGRAMS_SENT.increment();
                                events.on_write(&handler, Status::Success, n)
                            }
                            Err(e) => events.on_write(&handler, Status::Io(e), 0),
                        };
                    }
                }
            }
        }
    };

    drop(socket);
    if let Some(UdpCtrl::Stop(ack)) = stop_request {
        events.on_stop(&handler);
        let _ = ack.send(());
    }
}

/// Receive one datagram into the handler's read buffer. The buffer lock is
/// held only across the non-blocking receive, never across an await.
async fn recv_from(socket: &UdpSocket, handler: &UdpHandler) -> io::Result<(usize, SocketAddr)> {
    loop {
        socket.readable().await?;
        let mut buf = handler.read_buf.lock();
        match socket.try_recv_from(buf.as_mut_slice()) {
            Ok((n, sender)) => return Ok((n, sender)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Send the whole buffer to `to`.
async fn send_to(socket: &UdpSocket, data: &Buffer, to: SocketAddr) -> io::Result<usize> {
    loop {
        socket.writable().await?;
        match socket.try_send_to(data.as_slice(), to) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}
