//! spindle - an embeddable network service engine.
//!
//! A host program supplies event callbacks ([`TcpEvents`], [`UdpEvents`])
//! and the engine drives TCP and UDP servers on top of a shared worker
//! pool. Each network completion is reported to the host, which answers
//! with a declarative command (read again, write a buffer, close) that the
//! engine enforces on the socket. The pool also accepts scheduled
//! workloads: run now, at an instant, or after a delay, including the
//! server start/stop operations themselves.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use spindle::{Buffer, ServerConfig, Status, TcpCommand, TcpConfig, WorkerPool, Workload};
//!
//! struct Echo;
//!
//! impl spindle::TcpEvents for Echo {
//!     fn on_connect(&self, _s: &Arc<spindle::TcpSession>, _st: Status) -> TcpCommand {
//!         TcpCommand::Read
//!     }
//!     fn on_receive(&self, s: &Arc<spindle::TcpSession>, st: Status, n: usize) -> TcpCommand {
//!         if st.is_success() {
//!             let payload = s.read_buffer().as_slice()[..n].to_vec();
//!             TcpCommand::Write(Buffer::from_vec(payload))
//!         } else {
//!             TcpCommand::Close
//!         }
//!     }
//!     fn on_write(&self, _s: &Arc<spindle::TcpSession>, _st: Status, _n: usize) -> TcpCommand {
//!         TcpCommand::Read
//!     }
//!     fn on_disconnect(&self, _s: &Arc<spindle::TcpSession>, _st: Status) {}
//!     fn on_start(&self, _h: &Arc<spindle::TcpHandler>) {}
//!     fn on_stop(&self, _h: &Arc<spindle::TcpHandler>) {}
//! }
//!
//! let pool = WorkerPool::with_default_threads()?;
//! let config = ServerConfig::tcp(8080, TcpConfig::new(Arc::new(Echo)));
//! pool.run_immediately(Workload::start_server(config));
//! # Ok::<(), spindle::Error>(())
//! ```
//!
//! # Ordering model
//!
//! Serial ordering is per lane: all callbacks of one session run in order,
//! all callbacks of one handler run in order, each scheduled item's
//! workload and completion callback run in order. Nothing is specified
//! across lanes. See the [`lane`] module.

pub mod buffer;
pub mod config;
pub mod error;
pub mod lane;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod scheduled;
pub mod server;
pub mod slot_table;
pub mod tcp;
pub mod udp;
pub mod workload;

pub use buffer::Buffer;
pub use config::EngineConfig;
pub use error::{install_panic_abort, Error, Status};
pub use lane::Lane;
pub use pool::WorkerPool;
pub use scheduled::ScheduledTask;
pub use server::{HandlerConfig, Server, ServerConfig};
pub use slot_table::SlotTable;
pub use tcp::{TcpCommand, TcpConfig, TcpEvents, TcpHandler, TcpSession};
pub use udp::{UdpCommand, UdpConfig, UdpEvents, UdpHandler};
pub use workload::{Schedule, Workload};
