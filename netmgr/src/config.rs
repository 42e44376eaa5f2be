//! Network manager configuration.

use serde::Deserialize;

/// Default TCP timeout values, in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_backlog() -> u32 {
    128
}

/// Configuration for a [`Manager`](crate::Manager).
///
/// All timeouts are in milliseconds; zero disables the corresponding timer.
/// Buffer sizes of zero leave the operating-system defaults in place.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of event-loop workers. Must be at least one.
    #[serde(rename = "threads")]
    pub workers: usize,

    /// Timeout for the first read on an accepted connection.
    pub init_timeout_ms: u64,
    /// Idle timeout between reads on an established connection.
    pub idle_timeout_ms: u64,
    /// Idle timeout used instead of `idle_timeout_ms` when the connection
    /// has been marked keepalive.
    pub keepalive_timeout_ms: u64,
    /// Timeout advertised to clients (EDNS TCP keepalive and similar).
    pub advertised_timeout_ms: u64,

    /// SO_RCVBUF / SO_SNDBUF for TCP sockets; zero keeps the OS default.
    pub tcp_recv_buffer_size: usize,
    pub tcp_send_buffer_size: usize,
    /// SO_RCVBUF / SO_SNDBUF for UDP sockets; zero keeps the OS default.
    pub udp_recv_buffer_size: usize,
    pub udp_send_buffer_size: usize,

    /// Maximum outbound UDP payload; zero means unlimited.
    pub max_udp_size: usize,

    /// Listen backlog applied when a listener does not specify one.
    pub backlog: u32,

    /// Explicit CPU list for worker pinning. Workers are assigned
    /// round-robin; empty disables pinning.
    pub cpu_affinity: Vec<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            init_timeout_ms: default_timeout(),
            idle_timeout_ms: default_timeout(),
            keepalive_timeout_ms: default_timeout(),
            advertised_timeout_ms: default_timeout(),
            tcp_recv_buffer_size: 0,
            tcp_send_buffer_size: 0,
            udp_recv_buffer_size: 0,
            udp_send_buffer_size: 0,
            max_udp_size: 0,
            backlog: default_backlog(),
            cpu_affinity: Vec::new(),
        }
    }
}

impl Config {
    /// A configuration with an explicit worker count and defaults for
    /// everything else.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.workers >= 1);
        assert_eq!(config.init_timeout_ms, 30_000);
        assert_eq!(config.idle_timeout_ms, 30_000);
        assert_eq!(config.backlog, 128);
        assert!(config.cpu_affinity.is_empty());
    }

    #[test]
    fn test_with_workers() {
        let config = Config::with_workers(4);
        assert_eq!(config.workers, 4);
        assert_eq!(config.keepalive_timeout_ms, 30_000);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config =
            serde_json::from_str(r#"{"threads": 2, "idle_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.idle_timeout_ms, 500);
        assert_eq!(config.init_timeout_ms, 30_000);
    }
}
