//! netmgr - multithreaded network manager for a DNS server/resolver.
//!
//! The manager owns a pool of single-threaded event-loop workers (mio) and
//! provides the I/O substrate a DNS server runs on: UDP, DNS-over-TCP and
//! DNS-over-TLS listeners and clients, per-conversation handles with
//! reference-counted lifetimes, connect/read timeouts, connection quotas,
//! and manager-wide pause/resume fencing.
//!
//! # Threading model
//!
//! Every socket is owned by exactly one worker; all mutation of its I/O
//! state happens on that worker's thread. Callers interact through
//! [`Handle`]s: operations either run inline (when the caller already is
//! the owning worker) or are posted to the worker's lock-free event
//! queues and picked up on its next loop iteration. Parallelism comes
//! from running multiple workers, never from within one socket.
//!
//! # Quick start
//!
//! ```ignore
//! use netmgr::{Config, Manager};
//!
//! let mgr = Manager::new(Config::with_workers(4))?;
//! let listener = mgr.listen_tcpdns(
//!     "127.0.0.1:53".parse()?,
//!     |handle, msg| {
//!         // Each complete DNS message arrives framed; echo it back.
//!         if let Ok(region) = msg {
//!             handle.send(bytes::Bytes::copy_from_slice(region), |_, _| {});
//!         }
//!     },
//!     |_handle, _result| Ok(()),
//!     0,
//!     128,
//!     None,
//! )?;
//! // ...
//! listener.stop_listening();
//! mgr.destroy();
//! ```

mod config;
mod event;
mod handle;
mod manager;
pub mod metrics;
mod queue;
mod quota;
mod request;
mod result;
mod socket;
mod sockopt;
mod tcpdns;
mod tls;
mod tlsdns;
mod udp;
mod worker;

pub use config::Config;
pub use handle::Handle;
pub use manager::Manager;
pub use quota::{Quota, QuotaGuard};
pub use result::{NetError, NetResult};
pub use socket::{Listener, SocketVariant};
pub use tls::TlsContext;

// Re-exported so callers hand regions to `Handle::send` without naming
// the crate separately.
pub use bytes::Bytes;
