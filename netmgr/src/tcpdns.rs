//! DNS over TCP: listener fan-out, the accept path, and the framed
//! stream send/receive plumbing shared with the TLS-DNS variant.
//!
//! Every message on the wire carries a 16-bit network-order length prefix.
//! Inbound framing lives in the worker's `process_sock_buffer`; this module
//! provides the transport underneath it.

use std::io::{IoSlice, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use socket2::{Domain, Protocol, Socket, Type};

use crate::event::Event;
use crate::handle::{handle_get, LogRateLimit};
use crate::manager::{Manager, ManagerInner};
use crate::quota::{Quota, QuotaGuard};
use crate::request::{CompletionCb, Request};
use crate::result::{NetError, NetResult};
use crate::socket::{
    AcceptFn, Listener, OwnedSocket, RecvFn, SendData, SockIo, SockRefExt, SockShared, SocketVariant,
};
use crate::sockopt;
use crate::tls::TlsContext;
use crate::tlsdns::TlsState;
use crate::worker::{nm_tid, Worker, WorkerShared};
use crate::Handle;

static ACCEPT_LOG_LIMIT: LogRateLimit = LogRateLimit::new();

/// Log accept-path failures at most once per second (quota rejections can
/// arrive at line rate).
pub(crate) fn log_accept_failure(error: &NetError) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if ACCEPT_LOG_LIMIT.permit(now) {
        tracing::warn!(error = %error, "accepting TCP connection failed");
    }
}

fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
    }
}

impl Manager {
    /// Listen for DNS-over-TCP connections on `iface`. `recv` is invoked
    /// for every framed message with a fresh per-message handle; `accept`
    /// is invoked once per accepted connection and may reject it.
    ///
    /// Returns once every worker's child socket is accepting.
    pub fn listen_tcpdns(
        &self,
        iface: SocketAddr,
        recv: impl Fn(&Handle, Result<&[u8], NetError>) + Send + Sync + 'static,
        accept: impl Fn(&Handle, NetResult<()>) -> NetResult<()> + Send + Sync + 'static,
        extrahandlesize: usize,
        backlog: u32,
        quota: Option<Arc<Quota>>,
    ) -> NetResult<Listener> {
        self.listen_stream(
            SocketVariant::TcpDnsListener,
            iface,
            Arc::new(recv),
            Arc::new(accept),
            extrahandlesize,
            backlog,
            quota,
            None,
        )
    }

    /// Connect to a DNS-over-TCP server. `cb` fires with the connection
    /// handle once the TCP connection is established (or with the error).
    /// Returns once the connection attempt has been initiated.
    pub fn connect_tcpdns(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: impl FnOnce(&Handle, NetResult<()>) + Send + 'static,
        timeout_ms: u64,
        extrahandlesize: usize,
    ) -> NetResult<()> {
        self.connect_stream(
            SocketVariant::TcpDnsSocket,
            local,
            peer,
            Box::new(cb),
            timeout_ms,
            extrahandlesize,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn listen_stream(
        &self,
        variant: SocketVariant,
        iface: SocketAddr,
        recv: RecvFn,
        accept: AcceptFn,
        extrahandlesize: usize,
        backlog: u32,
        quota: Option<Arc<Quota>>,
        tls: Option<Arc<TlsContext>>,
    ) -> NetResult<Listener> {
        let nworkers = self.workers();
        let backlog = if backlog == 0 {
            self.inner().backlog
        } else {
            backlog
        };
        let parent = SockShared::new(self.clone(), variant, 0, Some(iface), extrahandlesize);

        // Open the per-worker listening sockets up front. With kernel
        // load balancing each worker gets its own socket bound to the
        // same address; otherwise the first socket is shared.
        let mut listeners: Vec<std::net::TcpListener> = Vec::with_capacity(nworkers);
        let first = listener_socket(self.inner(), iface, backlog)?;
        let bound = first
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .ok_or(NetError::Unexpected)?;
        listeners.push(first.into());
        for _ in 1..nworkers {
            let listener = if sockopt::have_reuseport_lb() {
                listener_socket(self.inner(), bound, backlog)?.into()
            } else {
                listeners[0].try_clone()?
            };
            listeners.push(listener);
        }

        parent.set_addrs(None, Some(bound));
        *parent.start_barrier.lock() = Some(Arc::new(std::sync::Barrier::new(nworkers)));

        for (tid, listener) in listeners.into_iter().enumerate() {
            let child = SockShared::new_child(&parent, variant, tid, quota.clone());
            // Each child holds one reference on the listener.
            let child = child.attach();
            child.set_addrs(None, Some(bound));
            parent.children.lock().push(child.clone());

            let mut owned = OwnedSocket::new(
                child,
                SockIo::TcpListener(mio::net::TcpListener::from_std(listener)),
            );
            owned.recv_cb = Some(recv.clone());
            owned.accept_cb = Some(accept.clone());
            owned.tls = tls.clone().map(TlsState::for_listener);

            if tid as isize == nm_tid() {
                listen_child(self.inner(), &self.inner().workers[tid], owned);
            } else {
                self.enqueue(tid, Event::Listen(owned));
            }
        }

        // Wait until every worker reports its child ready.
        let result = {
            let mut ctl = parent.ctl.lock();
            while parent.rchildren.load(Ordering::Acquire) != nworkers {
                parent.cond.wait(&mut ctl);
            }
            ctl.result.take().unwrap_or(Ok(()))
        };

        let listener = Listener {
            sock: parent.clone(),
        };
        match result {
            Ok(()) => {
                parent.listening.store(true, Ordering::Release);
                tracing::info!(address = %bound, variant = ?variant, "listening");
                Ok(listener)
            }
            Err(e) => {
                listener.stop_listening();
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn connect_stream(
        &self,
        variant: SocketVariant,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: crate::socket::ConnectOnce,
        timeout_ms: u64,
        extrahandlesize: usize,
        tls: Option<Arc<TlsContext>>,
    ) -> NetResult<()> {
        let tid = self.choose_tid();
        let sock = SockShared::new(self.clone(), variant, tid, local, extrahandlesize);
        sock.client.store(true, Ordering::Release);
        sock.connecting.store(true, Ordering::Release);
        sock.connect_timeout.store(timeout_ms, Ordering::Release);
        let handle_local = local.unwrap_or_else(|| unspecified_for(peer));
        sock.set_addrs(Some(peer), Some(handle_local));

        let socket = Socket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| {
                variant.stats().open_fail();
                NetError::from(e)
            })?;
        socket.set_nonblocking(true)?;
        // Hard cap on the OS-level connection attempt.
        sockopt::connection_timeout(&socket, 120_000)?;
        let _ = sockopt::tcp_nodelay(&socket);
        sockopt::net_buffers(
            &socket,
            self.inner().tcp_recv_buffer.load(Ordering::Relaxed) as usize,
            self.inner().tcp_send_buffer.load(Ordering::Relaxed) as usize,
        )?;
        if let Some(local) = local {
            socket.bind(&local.into()).map_err(|e| {
                variant.stats().bind_fail();
                NetError::from(e)
            })?;
        }
        variant.stats().open();

        let mut req = Request::get(&sock);
        req.cb = CompletionCb::Connect(cb);
        req.peer = Some(peer);
        req.local = local;
        req.handle = Some(handle_get(&sock, Some(peer), Some(handle_local)));

        let mut owned = OwnedSocket::new(sock.clone(), SockIo::Pending(socket));
        owned.tls = tls.map(TlsState::for_client);

        if tid as isize == nm_tid() {
            connect_start(self.inner(), &self.inner().workers[tid], owned, req);
        } else {
            self.enqueue(tid, Event::Connect(owned, req));
        }

        sock.wait_result()
    }
}

/// Build a bound, listening TCP socket with the platform options the
/// listener fan-out relies on.
fn listener_socket(mgr: &Arc<ManagerInner>, addr: SocketAddr, backlog: u32) -> NetResult<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| {
            crate::metrics::StatsFamily::Tcp.open_fail();
            NetError::from(e)
        })?;
    socket.set_nonblocking(true)?;
    sockopt::reuse(&socket)?;
    if sockopt::have_reuseport_lb() {
        sockopt::reuse_lb(&socket)?;
    }
    let _ = sockopt::incoming_cpu(&socket);
    let _ = sockopt::freebind(&socket, addr.is_ipv6());
    sockopt::net_buffers(
        &socket,
        mgr.tcp_recv_buffer.load(Ordering::Relaxed) as usize,
        mgr.tcp_send_buffer.load(Ordering::Relaxed) as usize,
    )?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into()).map_err(|e| {
        crate::metrics::StatsFamily::Tcp.bind_fail();
        NetError::from(e)
    })?;
    socket.listen(backlog as i32)?;
    crate::metrics::StatsFamily::Tcp.open();
    Ok(socket)
}

/// Worker-side listener-child setup: register with the poller, report the
/// result to the parent, and rendezvous with the sibling children.
pub(crate) fn listen_child(
    _mgr: &Arc<ManagerInner>,
    wshared: &Arc<WorkerShared>,
    mut owned: Box<OwnedSocket>,
) {
    let child = owned.shared.clone();
    let parent = child.parent.clone().expect("listener child without parent");

    let result = wshared.register(&mut owned).map(|_| ());
    match &result {
        Ok(()) => {
            child.listening.store(true, Ordering::Release);
            wshared.checkin(owned);
        }
        Err(e) => {
            tracing::error!(worker = wshared.id, error = %e, "listen failed");
            child.closed.store(true, Ordering::Release);
        }
    }

    {
        let mut ctl = parent.ctl.lock();
        if result.is_err() && ctl.result.is_none() {
            ctl.result = Some(result);
        }
        parent.rchildren.fetch_add(1, Ordering::AcqRel);
        parent.cond.notify_all();
    }

    let barrier = parent.start_barrier.lock().clone();
    if let Some(barrier) = barrier {
        barrier.wait();
    }
}

/// Worker-side connect initiation.
pub(crate) fn connect_start(
    mgr: &Arc<ManagerInner>,
    wshared: &Arc<WorkerShared>,
    mut owned: Box<OwnedSocket>,
    req: Box<Request>,
) {
    let sock = owned.shared.clone();
    let peer = req.peer.expect("connect request without a peer");

    let result = (|| -> NetResult<()> {
        if mgr.closing.load(Ordering::Acquire) {
            return Err(NetError::Canceled);
        }
        let SockIo::Pending(socket) = std::mem::replace(&mut owned.io, SockIo::None) else {
            return Err(NetError::Unexpected);
        };
        match socket.connect(&peer.into()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        let stream = mio::net::TcpStream::from_std(socket.into());
        owned.io = SockIo::Tcp(stream);
        wshared.register(&mut owned)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            sock.variant.stats().connect();
            owned.connect_req = Some(req);
            let timeout = sock.connect_timeout.load(Ordering::Acquire);
            if timeout != 0 {
                // Slack on top of the configured timeout, so the OS-level
                // TCP timeout is observed first.
                let deadline =
                    std::time::Instant::now() + std::time::Duration::from_millis(timeout + 10);
                wshared.timer_arm(&mut owned, deadline, crate::socket::TimerKind::Connect);
            }
            sock.report_result(Ok(()));
            wshared.checkin(owned);
            // The request's handle keeps the socket alive from here on.
            sock.detach();
        }
        Err(e) => {
            sock.variant.stats().connect_fail();
            sock.connecting.store(false, Ordering::Release);
            sock.closed.store(true, Ordering::Release);
            mgr.enqueue(wshared.id, Event::ConnectCb(req, Err(e.clone())));
            sock.report_result(Err(e));
            sock.detach();
        }
    }
}

/// Accept as many pending connections as the backlog and quota allow.
pub(crate) fn accept_pending(
    worker: &mut Worker,
    owned: &mut OwnedSocket,
    mut deferred: Option<QuotaGuard>,
) {
    loop {
        if owned.shared.is_closing() {
            return;
        }

        let guard = match deferred.take() {
            Some(guard) => Some(guard),
            None => match owned.shared.quota.as_ref() {
                Some(quota) => {
                    let sock = owned.shared.clone();
                    let mgr = worker.mgr.clone();
                    match quota.attach_cb(move |guard| {
                        mgr.enqueue(sock.tid, Event::Accept(sock.clone(), guard));
                    }) {
                        Ok(guard) => Some(guard),
                        Err(e) => {
                            owned.shared.variant.stats().accept_fail();
                            log_accept_failure(&e);
                            return;
                        }
                    }
                }
                None => None,
            },
        };

        let accepted = {
            let SockIo::TcpListener(listener) = &mut owned.io else {
                return;
            };
            listener.accept()
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = accept_connection(worker, owned, stream, peer, guard) {
                    if e != NetError::NotConnected {
                        log_accept_failure(&e);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                owned.readable = false;
                return;
            }
            Err(e) => {
                owned.shared.variant.stats().accept_fail();
                tracing::error!(error = %e, "listener accept error");
                return;
            }
        }
    }
}

/// Take one accepted connection into a fresh child socket on this worker.
fn accept_connection(
    worker: &mut Worker,
    ssock_owned: &mut OwnedSocket,
    stream: mio::net::TcpStream,
    peer: SocketAddr,
    guard: Option<QuotaGuard>,
) -> NetResult<()> {
    let ssock = &ssock_owned.shared;
    if ssock.is_closing() {
        return Err(NetError::Canceled);
    }

    let variant = match ssock.variant {
        SocketVariant::TcpDnsListener => SocketVariant::TcpDnsSocket,
        SocketVariant::TlsDnsListener => SocketVariant::TlsDnsSocket,
        _ => unreachable!("accept on a non-stream listener"),
    };

    let csock = SockShared::new(
        ssock.mgr.clone(),
        variant,
        worker.shared.id,
        ssock.iface,
        ssock.extrahandlesize,
    );
    *csock.server.lock() = Some(ssock.attach());
    csock.accepting.store(true, Ordering::Release);
    let local = stream.local_addr().ok();
    csock.set_addrs(Some(peer), local);
    let _ = stream.set_nodelay(true);
    // The first message gets the init timeout; afterwards idle/keepalive
    // takes over.
    csock
        .read_timeout
        .store(worker.mgr.init_ms(), Ordering::Release);
    csock.resume_on_release.store(true, Ordering::Release);

    let mut owned = OwnedSocket::new(csock.clone(), SockIo::Tcp(stream));
    owned.recv_cb = ssock_owned.recv_cb.clone();
    owned.accept_cb = ssock_owned.accept_cb.clone();
    owned.quota_guard = guard;

    let result = (|| -> NetResult<()> {
        worker.shared.register(&mut owned)?;
        let handle = handle_get(&csock, Some(peer), local);

        match variant {
            SocketVariant::TcpDnsSocket => {
                if let Some(cb) = owned.accept_cb.clone() {
                    cb(&handle, Ok(()))?;
                }
            }
            SocketVariant::TlsDnsSocket => {
                let ctx = ssock_owned
                    .tls
                    .as_ref()
                    .map(|t| t.ctx.clone())
                    .ok_or(NetError::Unexpected)?;
                let engine = ctx.accept_engine()?;
                owned.tls = Some(TlsState::for_connection(ctx, engine));
                // The accept callback fires once the handshake completes.
            }
            _ => unreachable!(),
        }

        csock.accepting.store(false, Ordering::Release);
        csock.variant.stats().accept();
        // Keeps the connection alive between messages; released when the
        // connection closes.
        owned.recv_handle = Some(handle);
        Ok(())
    })();

    match result {
        Ok(()) => {
            worker.process_sock_buffer(&mut owned);
            worker.shared.checkin(owned);
            // The receive handle owns the socket from here.
            csock.detach();
            Ok(())
        }
        Err(e) => {
            csock.active.store(false, Ordering::Release);
            csock.variant.stats().accept_fail();
            csock.closing.store(true, Ordering::Release);
            worker.close_owned(&mut owned);
            drop(owned);
            csock.detach();
            Err(e)
        }
    }
}

/// Pull bytes off the TCP stream until it runs dry, feeding the framing
/// layer (TCP-DNS) or the TLS engine (TLS-DNS).
pub(crate) fn stream_read_ready(worker: &mut Worker, owned: &mut OwnedSocket) {
    loop {
        if !owned.readable
            || !owned.reading
            || owned.shared.closed.load(Ordering::Acquire)
        {
            return;
        }

        let read = {
            let SockIo::Tcp(stream) = &mut owned.io else {
                return;
            };
            stream.read(&mut worker.recv_buf[..])
        };

        match read {
            Ok(0) => {
                worker.failed_read(owned, NetError::Eof);
                return;
            }
            Ok(n) => match owned.variant() {
                SocketVariant::TcpDnsSocket => {
                    owned.buf.extend_from_slice(&worker.recv_buf[..n]);
                    worker.process_sock_buffer(owned);
                }
                SocketVariant::TlsDnsSocket => {
                    if let Err(e) = crate::tlsdns::tls_feed(worker, owned, n) {
                        worker.failed_read(owned, e);
                        return;
                    }
                }
                _ => unreachable!("stream read on a non-stream socket"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                owned.readable = false;
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                owned.shared.variant.stats().recv_fail();
                worker.failed_read(owned, e.into());
                return;
            }
        }
    }
}

/// Writable readiness: finish an outstanding connect, then flush pending
/// output.
pub(crate) fn stream_write_ready(worker: &mut Worker, owned: &mut OwnedSocket) {
    if owned.shared.connecting.load(Ordering::Acquire) && owned.connect_req.is_some() {
        finish_connect(worker, owned);
        if owned.shared.closed.load(Ordering::Acquire) {
            return;
        }
    }

    flush_pending(worker, owned);

    // Fresh output may have become sendable (TLS records waiting on a
    // previously blocked socket).
    if owned.tls.is_some()
        && owned.pending_send.is_none()
        && !owned.shared.closed.load(Ordering::Acquire)
    {
        if let Err(e) = crate::tlsdns::tls_cycle(worker, owned) {
            crate::tlsdns::tls_error(worker, owned, e);
        }
    }
}

fn finish_connect(worker: &mut Worker, owned: &mut OwnedSocket) {
    enum Outcome {
        NotYet,
        Ready(SocketAddr, Option<SocketAddr>),
        Failed(NetError),
    }

    let outcome = {
        let SockIo::Tcp(stream) = &mut owned.io else {
            return;
        };
        match stream.take_error() {
            Ok(Some(e)) => Outcome::Failed(e.into()),
            Err(e) => Outcome::Failed(e.into()),
            Ok(None) => match stream.peer_addr() {
                Ok(peer) => Outcome::Ready(peer, stream.local_addr().ok()),
                Err(e)
                    if e.kind() == std::io::ErrorKind::NotConnected
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    Outcome::NotYet
                }
                Err(e) => Outcome::Failed(e.into()),
            },
        }
    };

    match outcome {
        Outcome::NotYet => {}
        Outcome::Failed(e) => {
            let req = owned.connect_req.take().expect("connect without request");
            worker.failed_connect(owned, req, e);
        }
        Outcome::Ready(peer, local) => {
            owned.shared.set_addrs(Some(peer), local);
            owned.shared.connected.store(true, Ordering::Release);

            match owned.variant() {
                SocketVariant::TcpDnsSocket => {
                    worker.shared.timer_disarm(owned);
                    owned.shared.connecting.store(false, Ordering::Release);
                    let req = owned.connect_req.take().expect("connect without request");
                    worker
                        .mgr
                        .enqueue(worker.shared.id, Event::ConnectCb(req, Ok(())));
                }
                SocketVariant::TlsDnsSocket => {
                    // TLS handshake still ahead; the connect timer keeps
                    // running and the deferred callback fires when the
                    // handshake completes.
                    let req = owned.connect_req.take().expect("connect without request");
                    if let Err(e) = crate::tlsdns::tls_engine_start(owned, req) {
                        if let Some(req) = crate::tlsdns::take_pending_connect(owned) {
                            worker.failed_connect(owned, req, e);
                        }
                        return;
                    }
                    owned.reading = true;
                    if let Err(e) = crate::tlsdns::tls_cycle(worker, owned) {
                        crate::tlsdns::tls_error(worker, owned, e);
                    }
                }
                _ => unreachable!(),
            }
        }
    }
}

/// Flush the single outstanding send buffer; when it completes, deliver
/// its completion (TCP-DNS) or re-enter the TLS cycle, then start the next
/// queued send.
fn flush_pending(worker: &mut Worker, owned: &mut OwnedSocket) {
    loop {
        if owned.pending_send.is_none() || !owned.writable {
            return;
        }

        let write = {
            let pending = owned.pending_send.as_ref().unwrap();
            let SockIo::Tcp(stream) = &mut owned.io else {
                return;
            };
            stream.write(&pending.data[pending.pos..])
        };

        match write {
            Ok(0) => {
                worker.failed_read(owned, NetError::Io(std::io::ErrorKind::WriteZero));
                return;
            }
            Ok(n) => {
                let finished = {
                    let pending = owned.pending_send.as_mut().unwrap();
                    pending.pos += n;
                    pending.pos >= pending.data.len()
                };
                if !finished {
                    continue;
                }

                let done = owned.pending_send.take().unwrap();
                if let Some(req) = done.req {
                    worker
                        .mgr
                        .enqueue(worker.shared.id, Event::SendCb(req, Ok(())));
                } else if owned.tls.is_some() {
                    if let Err(e) = crate::tlsdns::tls_cycle(worker, owned) {
                        crate::tlsdns::tls_error(worker, owned, e);
                        return;
                    }
                }

                if !owned.send_queue.is_empty() && owned.tls.is_none() {
                    let next = owned.send_queue.remove(0);
                    tcpdns_send(worker, owned, next);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                owned.writable = false;
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                owned.shared.variant.stats().send_fail();
                let error = NetError::from(e);
                let done = owned.pending_send.take().unwrap();
                if let Some(req) = done.req {
                    worker
                        .mgr
                        .enqueue(worker.shared.id, Event::SendCb(req, Err(error.clone())));
                }
                worker.failed_read(owned, error);
                return;
            }
        }
    }
}

/// Send one framed message: length prefix plus the caller's region,
/// written without copying unless the socket only takes part of it.
pub(crate) fn tcpdns_send(worker: &mut Worker, owned: &mut OwnedSocket, req: Box<Request>) {
    if owned.shared.is_closing() {
        owned.shared.variant.stats().send_fail();
        worker
            .mgr
            .enqueue(worker.shared.id, Event::SendCb(req, Err(NetError::Canceled)));
        return;
    }

    if owned.pending_send.is_some() {
        owned.send_queue.push(req);
        return;
    }

    let total = 2 + req.buf.len();
    let written = if owned.writable {
        let SockIo::Tcp(stream) = &mut owned.io else {
            worker
                .mgr
                .enqueue(worker.shared.id, Event::SendCb(req, Err(NetError::Canceled)));
            return;
        };
        match stream.write_vectored(&[IoSlice::new(&req.tcplen), IoSlice::new(&req.buf)]) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                owned.writable = false;
                0
            }
            Err(e) => {
                owned.shared.variant.stats().send_fail();
                worker
                    .mgr
                    .enqueue(worker.shared.id, Event::SendCb(req, Err(e.into())));
                return;
            }
        }
    } else {
        0
    };

    if written == total {
        worker
            .mgr
            .enqueue(worker.shared.id, Event::SendCb(req, Ok(())));
        return;
    }

    // Partial or blocked: keep the remainder as the one in-flight buffer.
    let mut data = Vec::with_capacity(total - written);
    if written < 2 {
        data.extend_from_slice(&req.tcplen[written..]);
        data.extend_from_slice(&req.buf);
    } else {
        data.extend_from_slice(&req.buf[written - 2..]);
    }
    owned.pending_send = Some(SendData {
        data,
        pos: 0,
        req: Some(req),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unspecified_for_families() {
        let v4: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert!(unspecified_for(v4).ip().is_unspecified());
        assert!(unspecified_for(v4).is_ipv4());
        assert!(unspecified_for(v6).is_ipv6());
    }
}
