//! TCP handler and per-connection sessions.
//!
//! The handler owns the listening socket and the table of live sessions;
//! each session owns one accepted connection and drives it through the
//! command protocol: every completion is reported to the host through
//! [`TcpEvents`], and the returned [`TcpCommand`] decides the next I/O step.
//! All callbacks for one session run on that session's lane (its task), so
//! the host observes per-connection events in the order they occurred.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::buffer::Buffer;
use crate::error::{Error, Status};
use crate::lane::wait_for_ack;
use crate::metrics::{CONNECTIONS_ACCEPTED, SESSIONS_ACTIVE};
use crate::server::wildcard_addr;
use crate::slot_table::SlotTable;

/// Default read buffer size for new sessions.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;
/// Default number of pre-allocated session slots per handler.
pub const DEFAULT_PREALLOCATED_SESSIONS: usize = 128;

/// Host-implemented event callbacks for a TCP server.
///
/// `on_connect`, `on_receive` and `on_write` return the session's next
/// command; `on_disconnect` and the handler lifecycle callbacks return
/// nothing. Callbacks are invoked synchronously from engine lanes: they must
/// not block for long and must not panic (a panic is fatal, see
/// [`crate::error::install_panic_abort`]).
pub trait TcpEvents: Send + Sync + 'static {
    /// A connection was accepted (or failed to establish).
    fn on_connect(&self, session: &Arc<TcpSession>, status: Status) -> TcpCommand;

    /// A read completed. On success, the first `bytes` bytes of
    /// [`TcpSession::read_buffer`] hold the payload.
    fn on_receive(&self, session: &Arc<TcpSession>, status: Status, bytes: usize) -> TcpCommand;

    /// A write completed.
    fn on_write(&self, session: &Arc<TcpSession>, status: Status, bytes: usize) -> TcpCommand;

    /// The session closed. `status` is `Success` for an orderly local close,
    /// `Disconnected` when the session was already closed, or the error that
    /// made the close unclean.
    fn on_disconnect(&self, session: &Arc<TcpSession>, status: Status);

    /// The handler is about to start accepting.
    fn on_start(&self, handler: &Arc<TcpHandler>);

    /// The handler stopped: the acceptor is closed and every session has
    /// been told to disconnect.
    fn on_stop(&self, handler: &Arc<TcpHandler>);
}

/// The next I/O step for a session, returned by host callbacks.
/// Consumed exactly once.
pub enum TcpCommand {
    /// Read at least one byte into the session's read buffer.
    Read,
    /// Write the whole buffer to the peer.
    Write(Buffer),
    /// Disconnect the session.
    Close,
}

/// Configuration for a TCP server.
#[derive(Clone)]
pub struct TcpConfig {
    /// Capacity of each session's read buffer. Must be non-zero.
    pub read_buffer_size: usize,
    /// Session slots pre-allocated in the handler's table; the table grows
    /// past this only when more sessions are live at once.
    pub preallocated_sessions: usize,
    /// Host callbacks.
    pub events: Arc<dyn TcpEvents>,
}

impl TcpConfig {
    pub fn new(events: Arc<dyn TcpEvents>) -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            preallocated_sessions: DEFAULT_PREALLOCATED_SESSIONS,
            events,
        }
    }
}

type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// Token released (by drop) once a session's disconnect has fully run;
/// the handler's stop path waits for every live session's token.
type DisconnectAck = mpsc::UnboundedSender<()>;

enum SessionCtrl {
    Start {
        session: Arc<TcpSession>,
        status: Status,
        cleanup: CleanupFn,
    },
    Disconnect {
        session: Arc<TcpSession>,
        ack: Option<DisconnectAck>,
    },
}

/// One accepted connection.
///
/// Host callbacks receive sessions as shared handles and may retain them
/// beyond the callback; the connection state lives on the session's task and
/// outlives any individual handle until the last one is dropped.
pub struct TcpSession {
    ctrl: mpsc::UnboundedSender<SessionCtrl>,
    self_ref: Weak<TcpSession>,
    peer: SocketAddr,
    read_buf: Mutex<Buffer>,
}

impl TcpSession {
    fn spawn(
        runtime: &Handle,
        config: TcpConfig,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Arc<TcpSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        let read_buffer_size = config.read_buffer_size;
        let session = Arc::new_cyclic(|weak| TcpSession {
            ctrl: tx,
            self_ref: weak.clone(),
            peer,
            read_buf: Mutex::new(Buffer::with_capacity(read_buffer_size)),
        });
        runtime.spawn(session_task(config, stream, rx));
        session
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Locked view of the session's read buffer. After an `on_receive`
    /// completion with `bytes = n`, the first `n` bytes are the payload.
    pub fn read_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.read_buf.lock()
    }

    /// Request a disconnect. Delivered on the session's lane; idempotent. A
    /// disconnect of an already-closed session observes
    /// [`Status::Disconnected`] in `on_disconnect` and triggers no cleanup.
    pub fn disconnect(&self) {
        if let Some(session) = self.self_ref.upgrade() {
            let _ = self.ctrl.send(SessionCtrl::Disconnect { session, ack: None });
        }
    }

    /// Handler-stop disconnect: the token is released once the disconnect
    /// (including its `on_disconnect`) has run.
    fn disconnect_for_stop(&self, ack: DisconnectAck) {
        if let Some(session) = self.self_ref.upgrade() {
            let _ = self.ctrl.send(SessionCtrl::Disconnect {
                session,
                ack: Some(ack),
            });
        }
    }

    /// Deliver the accept outcome and the cleanup hook that removes this
    /// session from its handler's table.
    fn begin(&self, status: Status, cleanup: CleanupFn) {
        if let Some(session) = self.self_ref.upgrade() {
            let _ = self.ctrl.send(SessionCtrl::Start {
                session,
                status,
                cleanup,
            });
        }
    }
}

enum IoOp {
    Read,
    Write(Buffer),
}

enum Step {
    Next(TcpCommand),
    Teardown(Option<DisconnectAck>),
    Gone,
}

async fn session_task(
    config: TcpConfig,
    stream: TcpStream,
    mut ctrl: mpsc::UnboundedReceiver<SessionCtrl>,
) {
    let events = config.events;
    let mut stream = Some(stream);

    let (session, status, mut cleanup) = match ctrl.recv().await {
        Some(SessionCtrl::Start {
            session,
            status,
            cleanup,
        }) => (session, status, Some(cleanup)),
        Some(SessionCtrl::Disconnect { .. }) | None => {
            shutdown_stream(stream.take());
            return;
        }
    };

    let mut command = events.on_connect(&session, status);

    let pending_ack = loop {
        let op = match command {
            TcpCommand::Close => break None,
            TcpCommand::Read => IoOp::Read,
            TcpCommand::Write(data) => IoOp::Write(data),
        };
        match io_step(&mut ctrl, &stream, &session, events.as_ref(), op).await {
            Step::Next(next) => command = next,
            Step::Teardown(ack) => break ack,
            Step::Gone => {
                shutdown_stream(stream.take());
                return;
            }
        }
    };

    disconnect_now(&session, events.as_ref(), &mut stream, &mut cleanup);
    drop(pending_ack);
    drop(session);

    // Late disconnect requests observe Disconnected without a cleanup; the
    // loop ends once the last handle is dropped.
    while let Some(msg) = ctrl.recv().await {
        if let SessionCtrl::Disconnect {
            session: handle,
            ack,
        } = msg
        {
            events.on_disconnect(&handle, Status::Disconnected);
            drop(ack);
        }
    }
}

/// Run one commanded I/O operation, racing it against control messages.
async fn io_step(
    ctrl: &mut mpsc::UnboundedReceiver<SessionCtrl>,
    stream: &Option<TcpStream>,
    session: &Arc<TcpSession>,
    events: &dyn TcpEvents,
    op: IoOp,
) -> Step {
    let completed = tokio::select! {
        biased;
        msg = ctrl.recv() => {
            return match msg {
                Some(SessionCtrl::Disconnect { ack, .. }) => {
                    // Teardown cancels the outstanding operation. Its
                    // completion is still delivered, but the returned
                    // command is not followed: the session is closing.
                    match &op {
                        IoOp::Read => {
                            let _ = events.on_receive(session, Status::Cancelled, 0);
                        }
                        IoOp::Write(_) => {
                            let _ = events.on_write(session, Status::Cancelled, 0);
                        }
                    }
                    Step::Teardown(ack)
                }
                Some(SessionCtrl::Start { .. }) => Step::Teardown(None),
                None => Step::Gone,
            };
        }
        result = perform(stream, session, &op) => result,
    };

    let next = match (op, completed) {
        (IoOp::Read, Ok(n)) => events.on_receive(session, Status::Success, n),
        (IoOp::Read, Err(e)) => events.on_receive(session, Status::Io(e), 0),
        (IoOp::Write(_), Ok(n)) => events.on_write(session, Status::Success, n),
        (IoOp::Write(_), Err(e)) => events.on_write(session, Status::Io(e), 0),
    };
    Step::Next(next)
}

async fn perform(
    stream: &Option<TcpStream>,
    session: &Arc<TcpSession>,
    op: &IoOp,
) -> io::Result<usize> {
    let Some(stream) = stream.as_ref() else {
        return Err(io::ErrorKind::NotConnected.into());
    };
    match op {
        IoOp::Read => read_at_least_one(stream, session).await,
        IoOp::Write(data) => write_all(stream, data).await,
    }
}

/// Read at least one byte into the session's read buffer. EOF surfaces as
/// `UnexpectedEof`. The buffer lock is held only across the non-blocking
/// read, never across an await.
async fn read_at_least_one(stream: &TcpStream, session: &TcpSession) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        let mut buf = session.read_buf.lock();
        match stream.try_read(buf.as_mut_slice()) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write the whole buffer to the peer.
async fn write_all(stream: &TcpStream, data: &Buffer) -> io::Result<usize> {
    let bytes = data.as_slice();
    let mut written = 0;
    while written < bytes.len() {
        stream.writable().await?;
        match stream.try_write(&bytes[written..]) {
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Close the session exactly once: shut the socket down, report the outcome
/// to `on_disconnect`, and run the cleanup only on a clean close. Called
/// with the socket already gone, it reports `Disconnected` and keeps the
/// cleanup unfired.
fn disconnect_now(
    session: &Arc<TcpSession>,
    events: &dyn TcpEvents,
    stream: &mut Option<TcpStream>,
    cleanup: &mut Option<CleanupFn>,
) {
    match stream.take() {
        Some(open) => {
            let status = shutdown_stream(Some(open));
            let clean = status.is_success();
            events.on_disconnect(session, status);
            if clean {
                if let Some(cleanup) = cleanup.take() {
                    cleanup();
                }
            }
        }
        None => events.on_disconnect(session, Status::Disconnected),
    }
}

/// Shut the socket down in both directions, then close it. Returns the
/// first failing step's error, else `Success`.
fn shutdown_stream(stream: Option<TcpStream>) -> Status {
    let Some(stream) = stream else {
        return Status::Disconnected;
    };
    match stream.into_std() {
        Ok(std_stream) => match std_stream.shutdown(Shutdown::Both) {
            Ok(()) => Status::Success,
            Err(e) => Status::Io(e),
        },
        Err(e) => Status::Io(e),
    }
}

enum HandlerCtrl {
    Stop(std::sync::mpsc::Sender<()>),
    RemoveSession(usize),
}

/// Accepts inbound connections on one port and owns the session table.
///
/// Exactly one accept is outstanding while the acceptor is open. The session
/// table is touched only from the handler's own task: sessions are added on
/// accept, and removals arrive as control messages posted by each session's
/// cleanup hook.
pub struct TcpHandler {
    ctrl: mpsc::UnboundedSender<HandlerCtrl>,
    port: u16,
    stopped: AtomicBool,
}

impl TcpHandler {
    pub(crate) fn start(
        runtime: &Handle,
        config: TcpConfig,
        port: u16,
        v6: bool,
    ) -> Result<Arc<TcpHandler>, Error> {
        let listener = bind_listener(runtime, port, v6)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(TcpHandler {
            ctrl: tx,
            port,
            stopped: AtomicBool::new(false),
        });
        runtime.spawn(handler_task(handler.clone(), config, listener, rx));
        Ok(handler)
    }

    /// The port this handler is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the acceptor, disconnect every session and fire `on_stop`,
    /// returning only once all of that has run. Only the first call has any
    /// effect; later calls return immediately. Must not be called from this
    /// handler's own callbacks, which would wait on themselves.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let (ack_tx, ack_rx) = std::sync::mpsc::channel();
        if self.ctrl.send(HandlerCtrl::Stop(ack_tx)).is_ok() {
            wait_for_ack(ack_rx);
        }
    }
}

fn bind_listener(runtime: &Handle, port: u16, v6: bool) -> Result<TcpListener, Error> {
    let listener = std::net::TcpListener::bind(wildcard_addr(port, v6))
        .map_err(|source| Error::Bind { port, source })?;
    listener.set_nonblocking(true).map_err(Error::Socket)?;
    let _guard = runtime.enter();
    TcpListener::from_std(listener).map_err(Error::Socket)
}

async fn handler_task(
    handler: Arc<TcpHandler>,
    config: TcpConfig,
    listener: TcpListener,
    mut ctrl: mpsc::UnboundedReceiver<HandlerCtrl>,
) {
    let events = config.events.clone();
    let mut sessions: SlotTable<Arc<TcpSession>> =
        SlotTable::with_capacity(config.preallocated_sessions);
    let runtime = Handle::current();

    events.on_start(&handler);

    let stop_ack = loop {
        tokio::select! {
            biased;
            msg = ctrl.recv() => match msg {
                Some(HandlerCtrl::Stop(ack)) => break Some(ack),
                Some(HandlerCtrl::RemoveSession(index)) => {
                    if sessions.remove(index) {
                        SESSIONS_ACTIVE.decrement();
                    }
                }
                None => break None,
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    CONNECTIONS_ACCEPTED.increment();
                    SESSIONS_ACTIVE.increment();
                    tracing::debug!(port = handler.port, peer = %peer, "accepted connection");
                    let session = TcpSession::spawn(&runtime, config.clone(), stream, peer);
                    let index = sessions.add(session.clone());
                    let remove = handler.ctrl.clone();
                    session.begin(
                        Status::Success,
                        Box::new(move || {
                            let _ = remove.send(HandlerCtrl::RemoveSession(index));
                        }),
                    );
                }
                Err(e) => {
                    tracing::error!(port = handler.port, error = %e, "accept failed");
                }
            },
        }
    };

    drop(listener);
    SESSIONS_ACTIVE.sub(sessions.len() as i64);

    // Disconnect every session and wait until each has delivered its
    // on_disconnect: the channel closes when the last token is released.
    let (token, mut all_done) = mpsc::unbounded_channel::<()>();
    for (_, session) in sessions.iter() {
        session.disconnect_for_stop(token.clone());
    }
    drop(token);
    let _ = all_done.recv().await;

    if let Some(ack) = stop_ack {
        events.on_stop(&handler);
        let _ = ack.send(());
    }
}
