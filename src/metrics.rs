//! Engine metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of TCP connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "sessions_active",
    description = "Number of currently active TCP sessions"
)]
pub static SESSIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "workloads_submitted",
    description = "Total workloads submitted to the pool"
)]
pub static WORKLOADS_SUBMITTED: Counter = Counter::new();

#[metric(name = "servers_started", description = "Total servers started")]
pub static SERVERS_STARTED: Counter = Counter::new();

#[metric(name = "servers_stopped", description = "Total servers stopped")]
pub static SERVERS_STOPPED: Counter = Counter::new();

#[metric(
    name = "datagrams_received",
    description = "Total UDP datagrams received"
)]
pub static DATAGRAMS_RECEIVED: Counter = Counter::new();

#[metric(name = "datagrams_sent", description = "Total UDP datagrams sent")]
pub static DATAGRAMS_SENT: Counter = Counter::new();
