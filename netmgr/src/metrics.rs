//! Socket statistics.

use metriken::{metric, Counter, Gauge};

// TCP-family counters (shared by the TCP-DNS and TLS-DNS variants).

#[metric(name = "tcp_open", description = "TCP sockets opened")]
pub static TCP_OPEN: Counter = Counter::new();

#[metric(name = "tcp_open_fail", description = "TCP socket open failures")]
pub static TCP_OPEN_FAIL: Counter = Counter::new();

#[metric(name = "tcp_close", description = "TCP sockets closed")]
pub static TCP_CLOSE: Counter = Counter::new();

#[metric(name = "tcp_bind_fail", description = "TCP bind failures")]
pub static TCP_BIND_FAIL: Counter = Counter::new();

#[metric(name = "tcp_connect", description = "TCP connections initiated")]
pub static TCP_CONNECT: Counter = Counter::new();

#[metric(name = "tcp_connect_fail", description = "TCP connect failures")]
pub static TCP_CONNECT_FAIL: Counter = Counter::new();

#[metric(name = "tcp_accept", description = "TCP connections accepted")]
pub static TCP_ACCEPT: Counter = Counter::new();

#[metric(name = "tcp_accept_fail", description = "TCP accept failures")]
pub static TCP_ACCEPT_FAIL: Counter = Counter::new();

#[metric(name = "tcp_send_fail", description = "TCP send failures")]
pub static TCP_SEND_FAIL: Counter = Counter::new();

#[metric(name = "tcp_recv_fail", description = "TCP receive failures")]
pub static TCP_RECV_FAIL: Counter = Counter::new();

#[metric(name = "tcp_active", description = "Active TCP sockets")]
pub static TCP_ACTIVE: Gauge = Gauge::new();

// UDP-family counters.

#[metric(name = "udp_open", description = "UDP sockets opened")]
pub static UDP_OPEN: Counter = Counter::new();

#[metric(name = "udp_open_fail", description = "UDP socket open failures")]
pub static UDP_OPEN_FAIL: Counter = Counter::new();

#[metric(name = "udp_close", description = "UDP sockets closed")]
pub static UDP_CLOSE: Counter = Counter::new();

#[metric(name = "udp_bind_fail", description = "UDP bind failures")]
pub static UDP_BIND_FAIL: Counter = Counter::new();

#[metric(name = "udp_connect", description = "UDP sockets connected")]
pub static UDP_CONNECT: Counter = Counter::new();

#[metric(name = "udp_connect_fail", description = "UDP connect failures")]
pub static UDP_CONNECT_FAIL: Counter = Counter::new();

#[metric(name = "udp_send_fail", description = "UDP send failures")]
pub static UDP_SEND_FAIL: Counter = Counter::new();

#[metric(name = "udp_recv_fail", description = "UDP receive failures")]
pub static UDP_RECV_FAIL: Counter = Counter::new();

#[metric(name = "udp_active", description = "Active UDP sockets")]
pub static UDP_ACTIVE: Gauge = Gauge::new();

/// Statistics family a socket variant maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatsFamily {
    Tcp,
    Udp,
}

impl StatsFamily {
    pub(crate) fn open(self) {
        match self {
            StatsFamily::Tcp => TCP_OPEN.increment(),
            StatsFamily::Udp => UDP_OPEN.increment(),
        };
    }

    pub(crate) fn open_fail(self) {
        match self {
            StatsFamily::Tcp => TCP_OPEN_FAIL.increment(),
            StatsFamily::Udp => UDP_OPEN_FAIL.increment(),
        };
    }

    pub(crate) fn close(self) {
        match self {
            StatsFamily::Tcp => TCP_CLOSE.increment(),
            StatsFamily::Udp => UDP_CLOSE.increment(),
        };
    }

    pub(crate) fn bind_fail(self) {
        match self {
            StatsFamily::Tcp => TCP_BIND_FAIL.increment(),
            StatsFamily::Udp => UDP_BIND_FAIL.increment(),
        };
    }

    pub(crate) fn connect(self) {
        match self {
            StatsFamily::Tcp => TCP_CONNECT.increment(),
            StatsFamily::Udp => UDP_CONNECT.increment(),
        };
    }

    pub(crate) fn connect_fail(self) {
        match self {
            StatsFamily::Tcp => TCP_CONNECT_FAIL.increment(),
            StatsFamily::Udp => UDP_CONNECT_FAIL.increment(),
        };
    }

    pub(crate) fn accept(self) {
        if self == StatsFamily::Tcp {
            TCP_ACCEPT.increment();
        }
    }

    pub(crate) fn accept_fail(self) {
        if self == StatsFamily::Tcp {
            TCP_ACCEPT_FAIL.increment();
        }
    }

    pub(crate) fn send_fail(self) {
        match self {
            StatsFamily::Tcp => TCP_SEND_FAIL.increment(),
            StatsFamily::Udp => UDP_SEND_FAIL.increment(),
        };
    }

    pub(crate) fn recv_fail(self) {
        match self {
            StatsFamily::Tcp => TCP_RECV_FAIL.increment(),
            StatsFamily::Udp => UDP_RECV_FAIL.increment(),
        };
    }

    pub(crate) fn active_up(self) {
        match self {
            StatsFamily::Tcp => TCP_ACTIVE.increment(),
            StatsFamily::Udp => UDP_ACTIVE.increment(),
        };
    }

    pub(crate) fn active_down(self) {
        match self {
            StatsFamily::Tcp => TCP_ACTIVE.decrement(),
            StatsFamily::Udp => UDP_ACTIVE.decrement(),
        };
    }
}
