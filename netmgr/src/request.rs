//! Per-operation request descriptors.
//!
//! A [`Request`] is the control block for one in-flight connect, send, or
//! read completion. It holds a logical reference on its socket (and on its
//! handle when one is attached) for as long as it is live, and its shell is
//! recycled through the socket's bounded inactive-request cache.

use std::net::SocketAddr;

use bytes::Bytes;

use crate::socket::{ConnectOnce, SendOnce, SockRef, SockRefExt};

/// Completion callback attached to a request.
pub(crate) enum CompletionCb {
    None,
    Send(SendOnce),
    Connect(ConnectOnce),
}

pub(crate) struct Request {
    pub sock: SockRef,
    pub handle: Option<crate::Handle>,
    pub cb: CompletionCb,
    /// Outbound payload (sends) or connect scratch.
    pub buf: Bytes,
    /// Network-order DNS length prefix for the stream variants.
    pub tcplen: [u8; 2],
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
}

impl Request {
    /// Get a fresh request bound to `sock`, reusing a cached shell when
    /// one is available.
    pub(crate) fn get(sock: &SockRef) -> Box<Request> {
        match sock.req_cache_pop() {
            Some(mut req) => {
                debug_assert!(req.handle.is_none());
                req.sock = sock.attach();
                req.cb = CompletionCb::None;
                req.buf = Bytes::new();
                req.tcplen = [0; 2];
                req.peer = None;
                req.local = None;
                req
            }
            None => Box::new(Request {
                sock: sock.attach(),
                handle: None,
                cb: CompletionCb::None,
                buf: Bytes::new(),
                tcplen: [0; 2],
                peer: None,
                local: None,
            }),
        }
    }

    /// Release the request: drop its handle and socket references and
    /// return the shell to the socket's cache.
    pub(crate) fn put(mut req: Box<Request>) {
        let sock = req.sock.clone();

        req.handle = None;
        req.cb = CompletionCb::None;
        req.buf = Bytes::new();

        sock.req_cache_push(req);
        sock.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::manager::Manager;
    use crate::socket::{SockShared, SocketVariant};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_request_reuse_and_refcounts() {
        let mgr = Manager::new(Config::with_workers(1)).unwrap();
        let sock = SockShared::new(mgr, SocketVariant::TcpDnsSocket, 0, None, 0);
        let base = sock.refs.load(Ordering::Acquire);

        let req = Request::get(&sock);
        assert_eq!(sock.refs.load(Ordering::Acquire), base + 1);

        Request::put(req);
        assert_eq!(sock.refs.load(Ordering::Acquire), base);
        assert_eq!(sock.inactive_reqs.lock().len(), 1);

        // The cached shell is reused.
        let req = Request::get(&sock);
        assert!(sock.inactive_reqs.lock().is_empty());
        Request::put(req);
    }
}
