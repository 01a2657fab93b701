//! Server lifecycle tests: scheduled stop, duplicate starts, unbound stop
//! and pool teardown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use spindle::{
    ServerConfig, Status, TcpCommand, TcpConfig, TcpEvents, TcpHandler, TcpSession, WorkerPool,
    Workload,
};

fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Minimal host: closes on first receive, counts callbacks and records
/// handler lifecycle. `disconnects_at_stop` captures how many disconnects
/// had run by the time `on_stop` fired.
#[derive(Default)]
struct Quiet {
    started: AtomicBool,
    stopped: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    disconnects_at_stop: AtomicUsize,
}

impl TcpEvents for Quiet {
    fn on_connect(&self, _session: &Arc<TcpSession>, _status: Status) -> TcpCommand {
        self.connects.fetch_add(1, Ordering::SeqCst);
        TcpCommand::Read
    }

    fn on_receive(&self, _session: &Arc<TcpSession>, _status: Status, _bytes: usize) -> TcpCommand {
        TcpCommand::Close
    }

    fn on_write(&self, _session: &Arc<TcpSession>, _status: Status, _bytes: usize) -> TcpCommand {
        TcpCommand::Read
    }

    fn on_disconnect(&self, _session: &Arc<TcpSession>, _status: Status) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_start(&self, _handler: &Arc<TcpHandler>) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn on_stop(&self, _handler: &Arc<TcpHandler>) {
        self.disconnects_at_stop
            .store(self.disconnects.load(Ordering::SeqCst), Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn start_server(pool: &WorkerPool, config: ServerConfig) -> Status {
    let (tx, rx) = mpsc::channel();
    pool.run_immediately(Workload::start_server(config).with_callback(move |status| {
        let _ = tx.send(status);
    }));
    rx.recv_timeout(Duration::from_secs(5))
        .expect("start-server workload did not complete")
}

#[test]
fn test_scheduled_stop_removes_server() {
    let pool = WorkerPool::new(2).unwrap();
    let port = get_available_port();
    let events = Arc::new(Quiet::default());

    assert!(start_server(&pool, ServerConfig::tcp(port, TcpConfig::new(events.clone()))).is_success());
    assert!(pool.has_server(port));

    let (tx, rx) = mpsc::channel();
    pool.run_after(
        Workload::stop_server(port).with_callback(move |status| {
            let _ = tx.send(status);
        }),
        Duration::from_millis(50),
    );

    // The stop workload reports completion only after the handler has
    // fully stopped: on_stop has fired and the registration is gone.
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_success());
    assert!(events.stopped.load(Ordering::SeqCst));
    assert!(!pool.has_server(port));
}

#[test]
fn test_stop_completes_sessions_before_on_stop() {
    use std::net::TcpStream;

    // A single worker exercises the stop path's core handoff as well.
    let pool = WorkerPool::new(1).unwrap();
    let port = get_available_port();
    let events = Arc::new(Quiet::default());

    assert!(start_server(&pool, ServerConfig::tcp(port, TcpConfig::new(events.clone()))).is_success());

    // One idle session sitting in a read.
    let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        events.connects.load(Ordering::SeqCst) == 1
    }));

    let (tx, rx) = mpsc::channel();
    pool.run_immediately(Workload::stop_server(port).with_callback(move |status| {
        let _ = tx.send(status);
    }));
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_success());

    // By completion time the session's disconnect has run, and it ran
    // before on_stop.
    assert!(events.stopped.load(Ordering::SeqCst));
    assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(events.disconnects_at_stop.load(Ordering::SeqCst), 1);
    assert!(!pool.has_server(port));
    drop(client);
}

#[test]
fn test_duplicate_start_server_keeps_first() {
    let pool = WorkerPool::new(2).unwrap();
    let port = get_available_port();
    let first = Arc::new(Quiet::default());
    let second = Arc::new(Quiet::default());

    assert!(start_server(&pool, ServerConfig::tcp(port, TcpConfig::new(first.clone()))).is_success());
    assert!(wait_until(Duration::from_secs(5), || {
        first.started.load(Ordering::SeqCst)
    }));

    // A second StartServer for the same port constructs nothing, still
    // finishes and still reports success.
    let (tx, rx) = mpsc::channel();
    let task = pool.run_immediately(
        Workload::start_server(ServerConfig::tcp(port, TcpConfig::new(second.clone())))
            .with_callback(move |status| {
                let _ = tx.send(status);
            }),
    );
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_success());
    assert!(wait_until(Duration::from_secs(5), || task.finished()));

    assert_eq!(pool.server_count(), 1);
    assert!(!second.started.load(Ordering::SeqCst));
}

#[test]
fn test_stop_unbound_port_is_noop() {
    let pool = WorkerPool::new(1).unwrap();
    let (tx, rx) = mpsc::channel();

    let task = pool.run_immediately(Workload::stop_server(get_available_port()).with_callback(
        move |status| {
            let _ = tx.send(status);
        },
    ));

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_success());
    assert!(wait_until(Duration::from_secs(5), || task.finished()));
    assert_eq!(pool.server_count(), 0);
}

#[test]
fn test_pool_drop_stops_running_servers() {
    let port = get_available_port();
    let events = Arc::new(Quiet::default());

    let pool = WorkerPool::new(2).unwrap();
    assert!(start_server(&pool, ServerConfig::tcp(port, TcpConfig::new(events.clone()))).is_success());
    assert!(pool.has_server(port));

    drop(pool);

    // Teardown stopped the handler and joined the workers; the port is
    // free to bind again.
    assert!(events.stopped.load(Ordering::SeqCst));
    assert!(std::net::TcpListener::bind(("0.0.0.0", port)).is_ok());
}

#[test]
fn test_tcp_and_udp_servers_coexist() {
    use spindle::{UdpCommand, UdpConfig, UdpEvents, UdpHandler};

    #[derive(Default)]
    struct Sink;

    impl UdpEvents for Sink {
        fn on_receive(
            &self,
            _handler: &Arc<UdpHandler>,
            _status: Status,
            _bytes: usize,
            _sender: std::net::SocketAddr,
        ) -> UdpCommand {
            UdpCommand::Read
        }

        fn on_write(&self, _handler: &Arc<UdpHandler>, _status: Status, _bytes: usize) -> UdpCommand {
            UdpCommand::Read
        }

        fn on_start(&self, _handler: &Arc<UdpHandler>) {}

        fn on_stop(&self, _handler: &Arc<UdpHandler>) {}
    }

    let pool = WorkerPool::new(2).unwrap();
    let tcp_port = get_available_port();
    let udp_port = get_available_port();

    assert!(start_server(
        &pool,
        ServerConfig::tcp(tcp_port, TcpConfig::new(Arc::new(Quiet::default())))
    )
    .is_success());

    let (tx, rx) = mpsc::channel();
    pool.run_immediately(
        Workload::start_server(ServerConfig::udp(udp_port, UdpConfig::new(Arc::new(Sink))))
            .with_callback(move |status| {
                let _ = tx.send(status);
            }),
    );
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_success());

    assert_eq!(pool.server_count(), 2);
    assert!(pool.has_server(tcp_port));
    assert!(pool.has_server(udp_port));
}
