//! Caller-visible per-conversation handles.
//!
//! A [`Handle`] is what higher layers hold while they process one message
//! (server side) or one connection (client side). Cloning a handle takes a
//! logical reference; dropping releases one. When the last reference is
//! released on the owning worker's thread, teardown runs inline; from any
//! other thread it is posted to the owning worker as an event, carrying the
//! allocation itself as the implicit reference.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::event::Event;
use crate::request::{CompletionCb, Request};
use crate::result::{NetError, NetResult};
use crate::socket::{RecvFn, SendOnce, SockRef, SockRefExt};
use crate::worker::nm_tid;

/// Hook invoked on the opaque payload when a handle is recycled or freed.
pub type PayloadHook = Box<dyn Fn(&mut (dyn Any + Send)) + Send>;

pub(crate) struct HandleData {
    pub payload: Option<Box<dyn Any + Send>>,
    pub on_reset: Option<PayloadHook>,
    pub on_free: Option<PayloadHook>,
}

pub(crate) struct HandleCore {
    /// Logical reference count; the `Arc` only keeps the allocation alive.
    pub refs: AtomicUsize,
    /// Teardown ran; a stale cross-thread detach must not run it again.
    pub detached: AtomicBool,
    pub sock: SockRef,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Claimed slot in the socket's active-handle table.
    pub ah_pos: AtomicUsize,
    pub data: Mutex<HandleData>,
    /// Bytes co-allocated for the caller, sized by the listen/connect
    /// `extrahandlesize` argument.
    pub extra: Mutex<Box<[u8]>>,
}

impl HandleCore {
    #[cfg(test)]
    pub(crate) fn alloc_for_test(sock: &SockRef) -> Arc<HandleCore> {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        Arc::new(HandleCore {
            refs: AtomicUsize::new(1),
            detached: AtomicBool::new(false),
            sock: sock.attach(),
            peer: addr,
            local: addr,
            ah_pos: AtomicUsize::new(0),
            data: Mutex::new(HandleData {
                payload: None,
                on_reset: None,
                on_free: None,
            }),
            extra: Mutex::new(Box::new([])),
        })
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        let mut data = self.data.lock();
        if let (Some(free), Some(payload)) = (data.on_free.take(), data.payload.as_mut()) {
            free(payload.as_mut());
        }
    }
}

/// A reference to one conversation on a socket.
pub struct Handle {
    core: Arc<HandleCore>,
}

/// Create a handle on `sock`, reusing the socket's bound addresses when
/// `peer`/`local` are not provided. The handle is added to the socket's
/// active-handle table, and becomes the socket's static handle for
/// client-style sockets whose identity is a single conversation.
pub(crate) fn handle_get(
    sock: &SockRef,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
) -> Handle {
    let peer = peer
        .or_else(|| sock.peer())
        .or(sock.iface)
        .expect("socket has no peer address");
    let local = local
        .or_else(|| sock.local())
        .or(sock.iface)
        .expect("socket has no local address");

    let core = Arc::new(HandleCore {
        refs: AtomicUsize::new(1),
        detached: AtomicBool::new(false),
        sock: sock.attach(),
        peer,
        local,
        ah_pos: AtomicUsize::new(0),
        data: Mutex::new(HandleData {
            payload: None,
            on_reset: None,
            on_free: None,
        }),
        extra: Mutex::new(vec![0u8; sock.extrahandlesize].into_boxed_slice()),
    });

    let pos = sock.table_claim(&core);
    core.ah_pos.store(pos, Ordering::Release);

    // The static handle is assigned, not attached: a counted link here
    // would form a handle->socket->handle cycle that never reaches zero.
    let client = sock.client.load(Ordering::Acquire);
    if client && !sock.variant.is_listener() {
        sock.set_statichandle(&core);
    }

    Handle { core }
}

/// Teardown for the last reference; must run on the owning worker.
pub(crate) fn handle_detach_cb(core: &Arc<HandleCore>) {
    // A static-handle upgrade may have revived the handle between the
    // cross-thread post and now.
    if core.refs.load(Ordering::Acquire) != 0 {
        return;
    }
    if core.detached.swap(true, Ordering::AcqRel) {
        return;
    }

    {
        let mut data = core.data.lock();
        let data = &mut *data;
        if let (Some(reset), Some(payload)) = (data.on_reset.as_ref(), data.payload.as_mut()) {
            reset(payload.as_mut());
        }
    }

    let sock = core.sock.clone();
    sock.table_release(core.ah_pos.load(Ordering::Acquire), core);

    if sock.resume_on_release.load(Ordering::Acquire) {
        sock.mgr
            .enqueue(sock.tid, Event::ResumeProcessing(sock.clone()));
    }

    sock.detach();
}

impl Handle {
    pub(crate) fn sock(&self) -> &SockRef {
        &self.core.sock
    }

    /// Wrap an existing core, taking a logical reference.
    pub(crate) fn from_core_attach(core: Arc<HandleCore>) -> Handle {
        core.refs.fetch_add(1, Ordering::AcqRel);
        Handle { core }
    }

    /// The peer this conversation is with.
    pub fn peer_addr(&self) -> SocketAddr {
        self.core.peer
    }

    /// The local address of this conversation.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local
    }

    /// Attach an opaque payload with optional recycle/free hooks.
    pub fn set_data(
        &self,
        payload: Box<dyn Any + Send>,
        on_reset: Option<PayloadHook>,
        on_free: Option<PayloadHook>,
    ) {
        let mut data = self.core.data.lock();
        data.payload = Some(payload);
        data.on_reset = on_reset;
        data.on_free = on_free;
    }

    /// Borrow the opaque payload.
    pub fn with_data<R>(&self, f: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
        let mut data = self.core.data.lock();
        f(data.payload.as_mut().map(|p| p.as_mut()))
    }

    /// Borrow the extra bytes co-allocated with the handle.
    pub fn with_extra<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut extra = self.core.extra.lock();
        f(&mut extra)
    }

    /// Send one message on this conversation. For the DNS stream variants
    /// the two-byte length prefix is added by the transport; `body` is the
    /// bare message.
    pub fn send(&self, body: Bytes, cb: impl FnOnce(&Handle, NetResult<()>) + Send + 'static) {
        let sock = self.sock();
        if body.len() > u16::MAX as usize && sock.variant.is_stream() {
            cb(self, Err(NetError::Unexpected));
            return;
        }

        let mut req = Request::get(sock);
        req.tcplen = (body.len() as u16).to_be_bytes();
        req.buf = body;
        req.handle = Some(self.clone());
        req.cb = CompletionCb::Send(Box::new(cb) as SendOnce);

        sock.mgr.enqueue(sock.tid, Event::Send(sock.clone(), req));
    }

    /// Start (or continue) reading on this conversation. Each complete
    /// message is delivered to `cb`; failures are delivered exactly once
    /// with the error.
    pub fn read(&self, cb: impl Fn(&Handle, Result<&[u8], NetError>) + Send + Sync + 'static) {
        let sock = self.sock();
        let recv: RecvFn = Arc::new(cb);
        sock.mgr
            .enqueue(sock.tid, Event::Read(sock.clone(), Some(recv)));
    }

    /// Cancel an outstanding read: the read callback fires with
    /// [`NetError::Canceled`] and the socket is shut down.
    pub fn cancel_read(&self) {
        let sock = self.sock();
        sock.mgr.enqueue(sock.tid, Event::Cancel(sock.clone()));
    }

    /// Stop delivering reads until [`Handle::resume_read`].
    pub fn pause_read(&self) {
        let sock = self.sock();
        assert!(sock.variant.is_stream(), "pause_read on a non-stream socket");
        sock.read_paused.store(true, Ordering::Release);
        sock.mgr.enqueue(sock.tid, Event::PauseRead(sock.clone()));
    }

    /// Resume reads paused by [`Handle::pause_read`].
    pub fn resume_read(&self) {
        let sock = self.sock();
        assert!(sock.variant.is_stream(), "resume_read on a non-stream socket");
        sock.read_paused.store(false, Ordering::Release);
        sock.mgr.enqueue(sock.tid, Event::ResumeRead(sock.clone()));
    }

    /// Override the read timeout for this conversation, in milliseconds,
    /// restarting the timer if it is armed.
    pub fn set_timeout(&self, timeout_ms: u64) {
        let sock = self.sock();
        sock.read_timeout.store(timeout_ms, Ordering::Release);
        sock.mgr
            .enqueue(sock.tid, Event::TimerRestart(sock.clone()));
    }

    /// Disable the read timeout for this conversation.
    pub fn clear_timeout(&self) {
        let sock = self.sock();
        sock.read_timeout.store(0, Ordering::Release);
        sock.mgr
            .enqueue(sock.tid, Event::TimerRestart(sock.clone()));
    }

    /// Mark the connection keepalive: the keepalive timeout is used for
    /// reads instead of the idle timeout.
    pub fn set_keepalive(&self, value: bool) {
        self.sock().keepalive.store(value, Ordering::Release);
    }

    /// Disable pipelining on this connection: after each message, reading
    /// stops until the message's handle is released.
    pub fn set_sequential(&self) {
        let sock = self.sock();
        assert!(sock.variant.is_stream(), "set_sequential on a non-stream socket");
        sock.sequential.store(true, Ordering::Release);
        sock.mgr.enqueue(sock.tid, Event::PauseRead(sock.clone()));
    }

    /// Logical reference count, for diagnostics and tests.
    pub fn references(&self) -> usize {
        self.core.refs.load(Ordering::Acquire)
    }
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        self.core.refs.fetch_add(1, Ordering::AcqRel);
        Handle {
            core: self.core.clone(),
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.core.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let sock = &self.core.sock;
        if nm_tid() == sock.tid as isize {
            handle_detach_cb(&self.core);
        } else {
            // The Arc inside the event is the implicit reference; the
            // owning worker performs the actual teardown.
            sock.mgr
                .enqueue(sock.tid, Event::Detach(self.core.clone()));
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("peer", &self.core.peer)
            .field("local", &self.core.local)
            .field("refs", &self.references())
            .finish()
    }
}

/// Rate limiter for accept-side quota log lines: at most one per second.
pub(crate) struct LogRateLimit {
    last: AtomicU64,
}

impl LogRateLimit {
    pub(crate) const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub(crate) fn permit(&self, now_secs: u64) -> bool {
        self.last.swap(now_secs, Ordering::Relaxed) != now_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::manager::Manager;
    use crate::socket::{SockShared, SocketVariant};

    fn test_sock() -> SockRef {
        let mgr = Manager::new(Config::with_workers(1)).unwrap();
        SockShared::new(mgr, SocketVariant::TcpDnsSocket, 0, None, 8)
    }

    #[test]
    fn test_handle_addresses_and_extra() {
        let sock = test_sock();
        let peer: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:1053".parse().unwrap();
        let handle = handle_get(&sock, Some(peer), Some(local));

        assert_eq!(handle.peer_addr(), peer);
        assert_eq!(handle.local_addr(), local);
        handle.with_extra(|extra| {
            assert_eq!(extra.len(), 8);
            extra[0] = 0xAB;
        });
        handle.with_extra(|extra| assert_eq!(extra[0], 0xAB));
    }

    #[test]
    fn test_clone_and_drop_reference_counts() {
        let sock = test_sock();
        let peer: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let handle = handle_get(&sock, Some(peer), Some(peer));
        assert_eq!(handle.references(), 1);

        let clone = handle.clone();
        assert_eq!(handle.references(), 2);
        drop(clone);
        assert_eq!(handle.references(), 1);
        assert_eq!(sock.ah.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_payload_hooks() {
        let sock = test_sock();
        let peer: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let handle = handle_get(&sock, Some(peer), Some(peer));

        handle.set_data(Box::new(41u32), None, None);
        handle.with_data(|data| {
            let value = data.unwrap().downcast_mut::<u32>().unwrap();
            *value += 1;
        });
        handle.with_data(|data| {
            assert_eq!(*data.unwrap().downcast_ref::<u32>().unwrap(), 42);
        });
    }

    #[test]
    fn test_log_rate_limit() {
        let limiter = LogRateLimit::new();
        assert!(limiter.permit(100));
        assert!(!limiter.permit(100));
        assert!(limiter.permit(101));
    }
}
