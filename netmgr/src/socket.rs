//! Socket model.
//!
//! Each socket is owned by exactly one worker and all mutation of its I/O
//! state happens on that worker's thread. The state is split accordingly:
//!
//! - [`SockShared`] is the cross-thread part: reference counts, atomic
//!   flags, the active-handle table, and the rendezvous used by blocking
//!   `listen`/`connect` calls. Any thread may touch it.
//! - [`OwnedSocket`] is the worker-owned part: the mio handle, the stream
//!   reassembly buffer, user callbacks, the TLS engine state. It lives in
//!   the owning worker's socket table and is only ever mutated there.
//!
//! Cross-thread operations are expressed as [`Event`](crate::event::Event)
//! values posted to the owning worker's queues.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};

use crate::event::Event;
use crate::handle::HandleCore;
use crate::manager::Manager;
use crate::metrics::StatsFamily;
use crate::quota::{Quota, QuotaGuard};
use crate::request::Request;
use crate::result::{NetError, NetResult};
use crate::tlsdns::TlsState;
use crate::Handle;

/// Maximum number of in-flight handles on a single connected stream socket
/// before reading is suspended until one is released.
pub(crate) const STREAM_CLIENTS_PER_CONN: usize = 23;

/// Cap on the per-socket request free list.
const REQS_FREE_MAX: usize = 64;

/// Sentinel for "not registered with a worker yet".
pub(crate) const INVALID_TOKEN: usize = usize::MAX;

/// Initial size of the active-handle table.
const AH_INITIAL_SIZE: usize = 32;

/// Socket variants implemented by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketVariant {
    UdpListener,
    UdpSocket,
    TcpDnsListener,
    TcpDnsSocket,
    TlsDnsListener,
    TlsDnsSocket,
}

impl SocketVariant {
    pub(crate) fn is_listener(self) -> bool {
        matches!(
            self,
            SocketVariant::UdpListener
                | SocketVariant::TcpDnsListener
                | SocketVariant::TlsDnsListener
        )
    }

    pub(crate) fn is_stream(self) -> bool {
        matches!(
            self,
            SocketVariant::TcpDnsSocket | SocketVariant::TlsDnsSocket
        )
    }

    pub(crate) fn stats(self) -> StatsFamily {
        match self {
            SocketVariant::UdpListener | SocketVariant::UdpSocket => StatsFamily::Udp,
            _ => StatsFamily::Tcp,
        }
    }
}

/// Callback invoked for every received message or read failure.
pub type RecvFn = Arc<dyn Fn(&Handle, Result<&[u8], NetError>) + Send + Sync>;

/// Callback invoked when a listener accepts a connection. Returning an
/// error rejects the connection.
pub type AcceptFn = Arc<dyn Fn(&Handle, NetResult<()>) -> NetResult<()> + Send + Sync>;

/// One-shot send completion callback.
pub type SendOnce = Box<dyn FnOnce(&Handle, NetResult<()>) + Send>;

/// One-shot connect completion callback.
pub type ConnectOnce = Box<dyn FnOnce(&Handle, NetResult<()>) + Send>;

/// Shared reference to a socket.
pub(crate) type SockRef = Arc<SockShared>;

/// Blocking-call rendezvous and address slots, guarded by `SockShared::ctl`.
#[derive(Default)]
pub(crate) struct SockCtl {
    /// Result reported by the owning worker for a blocking listen/connect.
    pub result: Option<NetResult<()>>,
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
}

/// The active-handle table: a dense array backed by a LIFO free-slot stack.
///
/// `frees[ah..len)` always holds the free slot indices; claiming a slot
/// reads `frees[ah]` and increments `ah`, releasing writes the slot index
/// back at the new top.
pub(crate) struct HandleTable {
    pub handles: Vec<Option<Arc<HandleCore>>>,
    pub frees: Vec<usize>,
    /// Non-owning link to the single-conversation handle; never counted,
    /// cleared when that handle is detached.
    pub statichandle: Option<Weak<HandleCore>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            handles: vec![None; AH_INITIAL_SIZE],
            frees: (0..AH_INITIAL_SIZE).collect(),
            statichandle: None,
        }
    }
}

/// Cross-thread socket state.
pub(crate) struct SockShared {
    pub variant: SocketVariant,
    /// Owning worker; never changes after the socket enters its loop.
    pub tid: usize,
    pub mgr: Manager,

    /// Logical reference count: external attach/detach plus one per
    /// outstanding request or handle.
    pub refs: AtomicUsize,

    pub active: AtomicBool,
    pub closing: AtomicBool,
    pub closed: AtomicBool,
    pub destroying: AtomicBool,
    pub connecting: AtomicBool,
    pub connected: AtomicBool,
    pub listening: AtomicBool,
    pub accepting: AtomicBool,
    pub sequential: AtomicBool,
    pub read_paused: AtomicBool,
    pub client: AtomicBool,
    pub keepalive: AtomicBool,

    /// Number of claimed slots in the active-handle table.
    pub ah: AtomicUsize,

    /// Milliseconds; zero disables the corresponding timer.
    pub read_timeout: AtomicU64,
    pub connect_timeout: AtomicU64,

    /// Token in the owning worker's socket table.
    pub token: AtomicUsize,

    /// Interface this socket is bound to, when it is.
    pub iface: Option<SocketAddr>,
    pub extrahandlesize: usize,

    pub ctl: Mutex<SockCtl>,
    pub cond: Condvar,

    pub table: Mutex<HandleTable>,
    pub inactive_reqs: Mutex<Vec<Box<Request>>>,

    /// Listener parent for a per-worker child.
    pub parent: Option<SockRef>,
    /// Per-worker children of a listener.
    pub children: Mutex<Vec<SockRef>>,
    pub rchildren: AtomicUsize,
    pub start_barrier: Mutex<Option<Arc<Barrier>>>,
    pub stop_barrier: Mutex<Option<Arc<Barrier>>>,

    /// The listener child an accepted socket was accepted on.
    pub server: Mutex<Option<SockRef>>,

    /// Listener-wide admission control; children and accepted sockets
    /// share the parent's quota.
    pub quota: Option<Arc<Quota>>,

    /// Resume stream processing when an in-flight handle is released.
    pub resume_on_release: AtomicBool,
}

impl SockShared {
    pub(crate) fn new(
        mgr: Manager,
        variant: SocketVariant,
        tid: usize,
        iface: Option<SocketAddr>,
        extrahandlesize: usize,
    ) -> SockRef {
        variant.stats().active_up();
        Arc::new(SockShared {
            variant,
            tid,
            mgr,
            refs: AtomicUsize::new(1),
            active: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            sequential: AtomicBool::new(false),
            read_paused: AtomicBool::new(false),
            client: AtomicBool::new(false),
            keepalive: AtomicBool::new(false),
            ah: AtomicUsize::new(0),
            read_timeout: AtomicU64::new(0),
            connect_timeout: AtomicU64::new(0),
            token: AtomicUsize::new(INVALID_TOKEN),
            iface,
            extrahandlesize,
            ctl: Mutex::new(SockCtl::default()),
            cond: Condvar::new(),
            table: Mutex::new(HandleTable::new()),
            inactive_reqs: Mutex::new(Vec::new()),
            parent: None,
            children: Mutex::new(Vec::new()),
            rchildren: AtomicUsize::new(0),
            start_barrier: Mutex::new(None),
            stop_barrier: Mutex::new(None),
            server: Mutex::new(None),
            quota: None,
            resume_on_release: AtomicBool::new(false),
        })
    }

    /// Like [`SockShared::new`] for a listener child: shares the parent's
    /// callbacks-by-construction and counts references against the parent.
    pub(crate) fn new_child(
        parent: &SockRef,
        variant: SocketVariant,
        tid: usize,
        quota: Option<Arc<Quota>>,
    ) -> SockRef {
        variant.stats().active_up();
        Arc::new(SockShared {
            variant,
            tid,
            mgr: parent.mgr.clone(),
            refs: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            sequential: AtomicBool::new(false),
            read_paused: AtomicBool::new(false),
            client: AtomicBool::new(false),
            keepalive: AtomicBool::new(false),
            ah: AtomicUsize::new(0),
            read_timeout: AtomicU64::new(0),
            connect_timeout: AtomicU64::new(0),
            token: AtomicUsize::new(INVALID_TOKEN),
            iface: parent.iface,
            extrahandlesize: parent.extrahandlesize,
            ctl: Mutex::new(SockCtl::default()),
            cond: Condvar::new(),
            table: Mutex::new(HandleTable::new()),
            inactive_reqs: Mutex::new(Vec::new()),
            parent: Some(parent.clone()),
            children: Mutex::new(Vec::new()),
            rchildren: AtomicUsize::new(0),
            start_barrier: Mutex::new(None),
            stop_barrier: Mutex::new(None),
            server: Mutex::new(None),
            quota,
            resume_on_release: AtomicBool::new(false),
        })
    }

}

/// Operations on shared socket references. (An extension trait because
/// `Arc<SockShared>` is the unit these act on: reference counting and
/// lifecycle always follow the `Arc`, not a borrowed `SockShared`.)
pub(crate) trait SockRefExt {
    fn root(&self) -> &SockRef;
    fn is_active(&self) -> bool;
    fn deactivate(&self) -> bool;
    fn is_closing(&self) -> bool;
    fn attach(&self) -> SockRef;
    fn detach(&self);
    fn prep_destroy_root(&self);
    fn prep_destroy(&self);
    fn maybe_destroy(&self);
    fn cleanup(&self);
    fn table_claim(&self, handle: &Arc<HandleCore>) -> usize;
    fn table_release(&self, pos: usize, handle: &Arc<HandleCore>);
    fn statichandle(&self) -> Option<Handle>;
    fn set_statichandle(&self, handle: &Arc<HandleCore>);
    fn req_cache_pop(&self) -> Option<Box<Request>>;
    fn req_cache_push(&self, req: Box<Request>);
    fn report_result(&self, result: NetResult<()>);
    fn wait_result(&self) -> NetResult<()>;
    fn peer(&self) -> Option<SocketAddr>;
    fn local(&self) -> Option<SocketAddr>;
    fn set_addrs(&self, peer: Option<SocketAddr>, local: Option<SocketAddr>);
}

impl SockRefExt for SockRef {
    /// The reference-counting authority: the parent for a child, the
    /// socket itself otherwise.
    fn root(&self) -> &SockRef {
        match &self.parent {
            Some(parent) => {
                debug_assert!(parent.parent.is_none());
                parent
            }
            None => self,
        }
    }

    /// Whether the socket (or, for a child, its parent) is still active.
    fn is_active(&self) -> bool {
        self.root().active.load(Ordering::Acquire)
    }

    /// Mark the socket (or its parent) inactive; returns false if it
    /// already was.
    fn deactivate(&self) -> bool {
        self.root()
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True when no further I/O should be started on this socket.
    fn is_closing(&self) -> bool {
        if !self.is_active() || self.closing.load(Ordering::Acquire) {
            return true;
        }
        if self.mgr.is_closing() {
            return true;
        }
        if let Some(server) = self.server.lock().as_ref() {
            if !server.is_active() {
                return true;
            }
        }
        false
    }

    fn attach(&self) -> SockRef {
        self.root().refs.fetch_add(1, Ordering::AcqRel);
        self.clone()
    }

    fn detach(&self) {
        let root = self.root().clone();
        if root.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            root.prep_destroy();
        }
    }

    /// Begin teardown from a child or standalone socket: teardown always
    /// targets the accounting root.
    fn prep_destroy_root(&self) {
        self.root().prep_destroy();
    }

    /// Stop external activity and begin variant-specific teardown. Close
    /// happens asynchronously on the owning worker; destruction completes
    /// once the close callback has run and every active handle is gone.
    fn prep_destroy(&self) {
        debug_assert!(self.parent.is_none());

        self.active.store(false, Ordering::Release);
        for child in self.children.lock().iter() {
            child.active.store(false, Ordering::Release);
        }

        if !self.closed.load(Ordering::Acquire) && !self.variant.is_listener() {
            self.mgr
                .enqueue(self.tid, Event::Close(self.clone()));
            return;
        }

        self.maybe_destroy();
    }

    /// Destroy the socket if nothing keeps it alive: no references, the
    /// close callback has run, and no active handles remain (a lone static
    /// handle does not block destruction; it is weak).
    fn maybe_destroy(&self) {
        if let Some(parent) = &self.parent {
            parent.maybe_destroy();
            return;
        }

        {
            let table = self.table.lock();
            if self.active.load(Ordering::Acquire)
                || self.destroying.load(Ordering::Acquire)
                || !self.closed.load(Ordering::Acquire)
                || self.refs.load(Ordering::Acquire) != 0
            {
                return;
            }

            let mut active_handles = self.ah.load(Ordering::Acquire);
            for child in self.children.lock().iter() {
                active_handles += child.ah.load(Ordering::Acquire);
            }

            // A lone static handle does not keep the socket alive: the
            // link is unowned, so destruction may proceed.
            if active_handles != 0 && table.statichandle.is_none() {
                return;
            }

            self.destroying.store(true, Ordering::Release);
        }

        self.cleanup();
    }

    /// Release everything the shared side still holds.
    fn cleanup(&self) {
        self.children.lock().clear();
        *self.start_barrier.lock() = None;
        *self.stop_barrier.lock() = None;
        self.table.lock().statichandle = None;
        self.inactive_reqs.lock().clear();
        *self.server.lock() = None;
        self.variant.stats().active_down();
    }

    /// Claim a slot in the active-handle table for `handle`.
    fn table_claim(&self, handle: &Arc<HandleCore>) -> usize {
        let mut table = self.table.lock();

        let size = table.handles.len();
        if self.ah.load(Ordering::Acquire) == size {
            table.handles.resize(size * 2, None);
            table.frees.resize(size * 2, 0);
            for (i, slot) in table.frees[size..].iter_mut().enumerate() {
                *slot = size + i;
            }
        }

        let claimed = self.ah.fetch_add(1, Ordering::AcqRel);
        let pos = table.frees[claimed];
        debug_assert!(table.handles[pos].is_none());
        table.handles[pos] = Some(handle.clone());
        pos
    }

    /// Release the table slot `pos`, returning it to the top of the free
    /// stack.
    fn table_release(&self, pos: usize, handle: &Arc<HandleCore>) {
        let mut table = self.table.lock();

        debug_assert!(table.handles[pos]
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(h, handle)));
        table.handles[pos] = None;

        let claimed = self.ah.fetch_sub(1, Ordering::AcqRel) - 1;
        table.frees[claimed] = pos;

        if let Some(stat) = &table.statichandle {
            if stat.as_ptr() == Arc::as_ptr(handle) {
                table.statichandle = None;
            }
        }
    }

    /// The single-conversation handle, if one is set and still alive.
    fn statichandle(&self) -> Option<Handle> {
        let table = self.table.lock();
        let weak = table.statichandle.as_ref()?;
        let core = weak.upgrade()?;
        drop(table);
        Some(Handle::from_core_attach(core))
    }

    /// Assign (not attach) the static handle slot.
    fn set_statichandle(&self, handle: &Arc<HandleCore>) {
        let mut table = self.table.lock();
        debug_assert!(table.statichandle.is_none());
        table.statichandle = Some(Arc::downgrade(handle));
    }

    /// Pop a request shell from the inactive cache, if any.
    fn req_cache_pop(&self) -> Option<Box<Request>> {
        if !self.is_active() {
            return None;
        }
        self.inactive_reqs.lock().pop()
    }

    /// Return a request shell to the inactive cache if there is room and
    /// the socket is still active.
    fn req_cache_push(&self, req: Box<Request>) {
        if !self.is_active() {
            return;
        }
        let mut cache = self.inactive_reqs.lock();
        if cache.len() < REQS_FREE_MAX {
            cache.push(req);
        }
    }

    /// Report the result of a blocking listen/connect initiation and wake
    /// the caller.
    fn report_result(&self, result: NetResult<()>) {
        let mut ctl = self.ctl.lock();
        ctl.result = Some(result);
        self.cond.notify_all();
    }

    /// Block until the owning worker reports an initiation result.
    fn wait_result(&self) -> NetResult<()> {
        let mut ctl = self.ctl.lock();
        loop {
            if let Some(result) = ctl.result.take() {
                return result;
            }
            self.cond.wait(&mut ctl);
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.ctl.lock().peer
    }

    fn local(&self) -> Option<SocketAddr> {
        self.ctl.lock().local
    }

    fn set_addrs(&self, peer: Option<SocketAddr>, local: Option<SocketAddr>) {
        let mut ctl = self.ctl.lock();
        if peer.is_some() {
            ctl.peer = peer;
        }
        if local.is_some() {
            ctl.local = local;
        }
    }
}

/// A running listener. Stopping (or dropping) it quiesces every
/// per-worker child socket and closes the listener once outstanding
/// references drain.
pub struct Listener {
    pub(crate) sock: SockRef,
}

impl Listener {
    /// The address the listener is bound to, with the concrete port when
    /// the caller bound port zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local()
    }

    /// Quiesce the listener: every worker closes its child socket. The
    /// request is asynchronous; the listener is fully closed once the
    /// workers have drained it.
    pub fn stop_listening(&self) {
        if self
            .sock
            .closing
            .compare_exchange(false, true, std::sync::atomic::Ordering::AcqRel, std::sync::atomic::Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.sock
            .mgr
            .enqueue(self.sock.tid, Event::StopListening(self.sock.clone()));
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop_listening();
        self.sock.detach();
    }
}

/// Which timer the socket's single logical timer is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Connect,
    Read,
}

/// I/O resource held by the worker-owned half of a socket.
pub(crate) enum SockIo {
    TcpListener(mio::net::TcpListener),
    Tcp(mio::net::TcpStream),
    Udp(mio::net::UdpSocket),
    /// Client socket configured but not yet connected.
    Pending(socket2::Socket),
    None,
}

/// An outbound buffer in flight on a stream socket. At most one may exist
/// per socket; further output is absorbed by the next cycle.
pub(crate) struct SendData {
    pub data: Vec<u8>,
    pub pos: usize,
    /// Completion to deliver once this buffer is fully written (TCP-DNS
    /// only; the TLS path completes sends at the engine boundary).
    pub req: Option<Box<Request>>,
}

/// Worker-owned socket state.
pub(crate) struct OwnedSocket {
    pub shared: SockRef,
    pub io: SockIo,

    /// Stream reassembly buffer: framed DNS messages are carved out of
    /// this in place.
    pub buf: BytesMut,

    pub recv_cb: Option<RecvFn>,
    pub accept_cb: Option<AcceptFn>,

    /// Edge-triggered readiness tracking.
    pub readable: bool,
    pub writable: bool,

    /// Whether the event loop is currently delivering reads to us.
    pub reading: bool,
    /// A user-requested read is outstanding (client sockets).
    pub recv_read: bool,
    /// Re-entrancy guard for `process_buffer`.
    pub processing: bool,

    /// Connect request awaiting TCP connection establishment.
    pub connect_req: Option<Box<Request>>,

    /// Internal handle that keeps an accepted connection alive between
    /// messages.
    pub recv_handle: Option<Handle>,

    /// Outbound data mid-flight (one at most).
    pub pending_send: Option<SendData>,
    /// Sends queued behind `pending_send` (TCP-DNS) or behind the
    /// handshake (TLS-DNS).
    pub send_queue: Vec<Box<Request>>,

    pub quota_guard: Option<QuotaGuard>,

    /// TLS engine state; present on TLS-DNS sockets only.
    pub tls: Option<TlsState>,

    /// Armed deadline of the socket's logical timer.
    pub timer: Option<(Instant, TimerKind)>,
}

impl OwnedSocket {
    pub(crate) fn new(shared: SockRef, io: SockIo) -> Box<OwnedSocket> {
        Box::new(OwnedSocket {
            shared,
            io,
            buf: BytesMut::new(),
            recv_cb: None,
            accept_cb: None,
            readable: false,
            writable: false,
            reading: false,
            recv_read: false,
            processing: false,
            connect_req: None,
            recv_handle: None,
            pending_send: None,
            send_queue: Vec::new(),
            quota_guard: None,
            tls: None,
            timer: None,
        })
    }

    pub(crate) fn variant(&self) -> SocketVariant {
        self.shared.variant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_sock() -> SockRef {
        let mgr = Manager::new(Config::with_workers(1)).unwrap();
        let sock = SockShared::new(
            mgr.clone(),
            SocketVariant::TcpDnsSocket,
            0,
            None,
            0,
        );
        sock
    }

    #[test]
    fn test_table_claim_release_lifo() {
        let sock = test_sock();
        let h1 = HandleCore::alloc_for_test(&sock);
        let h2 = HandleCore::alloc_for_test(&sock);

        let p1 = sock.table_claim(&h1);
        let p2 = sock.table_claim(&h2);
        assert_ne!(p1, p2);
        assert_eq!(sock.ah.load(Ordering::Acquire), 2);

        sock.table_release(p2, &h2);
        assert_eq!(sock.ah.load(Ordering::Acquire), 1);

        // The just-freed slot is at the logical top of the free stack.
        let h3 = HandleCore::alloc_for_test(&sock);
        let p3 = sock.table_claim(&h3);
        assert_eq!(p3, p2);

        sock.table_release(p3, &h3);
        sock.table_release(p1, &h1);
        assert_eq!(sock.ah.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_table_grows_by_doubling() {
        let sock = test_sock();
        let mut handles = Vec::new();
        let mut slots = Vec::new();
        for _ in 0..100 {
            let h = HandleCore::alloc_for_test(&sock);
            slots.push(sock.table_claim(&h));
            handles.push(h);
        }
        assert_eq!(sock.ah.load(Ordering::Acquire), 100);
        assert!(sock.table.lock().handles.len() >= 100);

        // Every claimed slot is distinct.
        let mut sorted = slots.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), slots.len());

        for (h, pos) in handles.iter().zip(slots) {
            sock.table_release(pos, h);
        }
        assert_eq!(sock.ah.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_attach_detach_counts_against_root() {
        let sock = test_sock();
        assert_eq!(sock.refs.load(Ordering::Acquire), 1);
        let other = sock.attach();
        assert_eq!(sock.refs.load(Ordering::Acquire), 2);
        other.detach();
        assert_eq!(sock.refs.load(Ordering::Acquire), 1);
    }
}
