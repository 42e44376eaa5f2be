//! UDP listeners and sockets.
//!
//! A UDP listener fans out one socket per worker, load-balanced by the
//! kernel where the platform supports it. Each received datagram is
//! delivered to the receive callback with a fresh handle carrying the
//! peer address; client sockets deliver to their single conversation
//! handle, one datagram per read request.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};

use crate::event::Event;
use crate::handle::handle_get;
use crate::manager::{Manager, ManagerInner};
use crate::request::{CompletionCb, Request};
use crate::result::{NetError, NetResult};
use crate::socket::{
    Listener, OwnedSocket, RecvFn, SockIo, SockRefExt, SockShared, SocketVariant,
};
use crate::sockopt;
use crate::worker::{nm_tid, Worker, WorkerShared};
use crate::Handle;

impl Manager {
    /// Listen for UDP datagrams on `iface`; `recv` fires once per
    /// datagram with a handle carrying the sender's address.
    pub fn listen_udp(
        &self,
        iface: SocketAddr,
        recv: impl Fn(&Handle, Result<&[u8], NetError>) + Send + Sync + 'static,
        extrahandlesize: usize,
    ) -> NetResult<Listener> {
        let nworkers = self.workers();
        let parent = SockShared::new(
            self.clone(),
            SocketVariant::UdpListener,
            0,
            Some(iface),
            extrahandlesize,
        );

        let mut sockets: Vec<std::net::UdpSocket> = Vec::with_capacity(nworkers);
        let first = udp_socket(self.inner(), iface, true)?;
        let bound = first
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .ok_or(NetError::Unexpected)?;
        sockets.push(first.into());
        for _ in 1..nworkers {
            let socket = if sockopt::have_reuseport_lb() {
                udp_socket(self.inner(), bound, true)?.into()
            } else {
                sockets[0].try_clone()?
            };
            sockets.push(socket);
        }

        parent.set_addrs(None, Some(bound));
        *parent.start_barrier.lock() = Some(Arc::new(std::sync::Barrier::new(nworkers)));

        let recv: RecvFn = Arc::new(recv);
        for (tid, socket) in sockets.into_iter().enumerate() {
            let child = SockShared::new_child(&parent, SocketVariant::UdpListener, tid, None);
            let child = child.attach();
            child.set_addrs(None, Some(bound));
            parent.children.lock().push(child.clone());

            let mut owned = OwnedSocket::new(
                child,
                SockIo::Udp(mio::net::UdpSocket::from_std(socket)),
            );
            owned.recv_cb = Some(recv.clone());
            owned.reading = true;

            if tid as isize == nm_tid() {
                crate::tcpdns::listen_child(self.inner(), &self.inner().workers[tid], owned);
            } else {
                self.enqueue(tid, Event::Listen(owned));
            }
        }

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
                tracing::info!(address = %bound, "listening for UDP");
                Ok(listener)
            }
            Err(e) => {
                listener.stop_listening();
                Err(e)
            }
        }
    }

    /// Create a connected UDP socket to `peer`. Completion (immediate for
    /// UDP) is delivered to `cb` with the conversation handle.
    pub fn connect_udp(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: impl FnOnce(&Handle, NetResult<()>) + Send + 'static,
        timeout_ms: u64,
        extrahandlesize: usize,
    ) -> NetResult<()> {
        let tid = self.choose_tid();
        let sock = SockShared::new(
            self.clone(),
            SocketVariant::UdpSocket,
            tid,
            local,
            extrahandlesize,
        );
        sock.client.store(true, Ordering::Release);
        sock.read_timeout.store(timeout_ms, Ordering::Release);
        let handle_local = local.unwrap_or(match peer {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
        });
        sock.set_addrs(Some(peer), Some(handle_local));

        let socket = udp_socket_unbound(self.inner(), peer)?;
        if let Some(local) = local {
            socket.bind(&local.into()).map_err(|e| {
                SocketVariant::UdpSocket.stats().bind_fail();
                NetError::from(e)
            })?;
        }

        let mut req = Request::get(&sock);
        req.cb = CompletionCb::Connect(Box::new(cb));
        req.peer = Some(peer);
        req.local = local;
        req.handle = Some(handle_get(&sock, Some(peer), Some(handle_local)));

        let owned = OwnedSocket::new(sock.clone(), SockIo::Pending(socket));

        if tid as isize == nm_tid() {
            connect_start(self.inner(), &self.inner().workers[tid], owned, req);
        } else {
            self.enqueue(tid, Event::Connect(owned, req));
        }

        sock.wait_result()
    }
}

fn udp_socket_unbound(mgr: &Arc<ManagerInner>, peer: SocketAddr) -> NetResult<Socket> {
    let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| {
            crate::metrics::StatsFamily::Udp.open_fail();
            NetError::from(e)
        })?;
    socket.set_nonblocking(true)?;
    let _ = sockopt::dontfrag(&socket, peer.is_ipv6());
    sockopt::net_buffers(
        &socket,
        mgr.udp_recv_buffer.load(Ordering::Relaxed) as usize,
        mgr.udp_send_buffer.load(Ordering::Relaxed) as usize,
    )?;
    crate::metrics::StatsFamily::Udp.open();
    Ok(socket)
}

fn udp_socket(mgr: &Arc<ManagerInner>, addr: SocketAddr, listener: bool) -> NetResult<Socket> {
    let socket = udp_socket_unbound(mgr, addr)?;
    if listener {
        sockopt::reuse(&socket)?;
        if sockopt::have_reuseport_lb() {
            sockopt::reuse_lb(&socket)?;
        }
        let _ = sockopt::incoming_cpu(&socket);
        let _ = sockopt::freebind(&socket, addr.is_ipv6());
    }
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into()).map_err(|e| {
        crate::metrics::StatsFamily::Udp.bind_fail();
        NetError::from(e)
    })?;
    Ok(socket)
}

/// Worker-side connect initiation; UDP connects complete immediately.
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
        socket.connect(&peer.into())?;
        let local = socket.local_addr().ok().and_then(|a| a.as_socket());
        sock.set_addrs(Some(peer), local);
        owned.io = SockIo::Udp(mio::net::UdpSocket::from_std(socket.into()));
        wshared.register(&mut owned)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            sock.variant.stats().connect();
            sock.connected.store(true, Ordering::Release);
            mgr.enqueue(wshared.id, Event::ConnectCb(req, Ok(())));
            sock.report_result(Ok(()));
            wshared.checkin(owned);
            sock.detach();
        }
        Err(e) => {
            sock.variant.stats().connect_fail();
            sock.closed.store(true, Ordering::Release);
            mgr.enqueue(wshared.id, Event::ConnectCb(req, Err(e.clone())));
            sock.report_result(Err(e));
            sock.detach();
        }
    }
}

/// Deliver pending datagrams. Server sockets deliver everything queued;
/// client sockets deliver one datagram per outstanding read.
pub(crate) fn udp_read_ready(worker: &mut Worker, owned: &mut OwnedSocket) {
    let client = owned.shared.client.load(Ordering::Acquire);
    loop {
        if !owned.readable || owned.shared.is_closing() {
            return;
        }
        if client && !owned.reading {
            return;
        }

        let received = {
            let SockIo::Udp(socket) = &mut owned.io else {
                return;
            };
            socket.recv_from(&mut worker.recv_buf[..])
        };

        match received {
            Ok((n, peer)) => {
                let handle = if client {
                    match owned.shared.statichandle() {
                        Some(handle) => handle,
                        None => return,
                    }
                } else {
                    handle_get(&owned.shared, Some(peer), None)
                };

                if client {
                    worker.shared.timer_disarm(owned);
                    owned.recv_read = false;
                    owned.reading = false;
                }

                if let Some(cb) = owned.recv_cb.clone() {
                    cb(&handle, Ok(&worker.recv_buf[..n]));
                }

                if client {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                owned.readable = false;
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                owned.shared.variant.stats().recv_fail();
                if client {
                    worker.failed_read(owned, e.into());
                    return;
                }
                // Asynchronous errors (ICMP) on a shared server socket
                // affect one peer only; keep serving.
                tracing::debug!(error = %e, "UDP receive error");
            }
        }
    }
}

/// Start a client read: one datagram, delivered to the read callback, or
/// a timeout.
pub(crate) fn udp_read_start(worker: &mut Worker, owned: &mut OwnedSocket) {
    owned.reading = true;
    worker.timer_restart(owned);
    if owned.readable {
        udp_read_ready(worker, owned);
    }
}

/// Send one datagram to the handle's peer. Oversized datagrams (beyond
/// the configured cap) are treated as sent and dropped, as if lost in
/// flight.
pub(crate) fn udp_send(worker: &mut Worker, owned: &mut OwnedSocket, req: Box<Request>) {
    if owned.shared.is_closing() {
        owned.shared.variant.stats().send_fail();
        worker
            .mgr
            .enqueue(worker.shared.id, Event::SendCb(req, Err(NetError::Canceled)));
        return;
    }

    let max_udp = worker.mgr.max_udp.load(Ordering::Relaxed);
    if max_udp != 0 && req.buf.len() > max_udp {
        worker
            .mgr
            .enqueue(worker.shared.id, Event::SendCb(req, Ok(())));
        return;
    }

    let peer = req
        .handle
        .as_ref()
        .map(|h| h.peer_addr())
        .or(req.peer)
        .or_else(|| owned.shared.peer());
    let Some(peer) = peer else {
        worker
            .mgr
            .enqueue(worker.shared.id, Event::SendCb(req, Err(NetError::Unexpected)));
        return;
    };

    let sent = {
        let SockIo::Udp(socket) = &mut owned.io else {
            worker
                .mgr
                .enqueue(worker.shared.id, Event::SendCb(req, Err(NetError::Canceled)));
            return;
        };
        socket.send_to(&req.buf, peer)
    };

    match sent {
        Ok(_) => {
            worker
                .mgr
                .enqueue(worker.shared.id, Event::SendCb(req, Ok(())));
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            owned.writable = false;
            owned.send_queue.push(req);
        }
        Err(e) => {
            owned.shared.variant.stats().send_fail();
            worker
                .mgr
                .enqueue(worker.shared.id, Event::SendCb(req, Err(e.into())));
        }
    }
}

/// Writable readiness: retry sends that hit a full socket buffer.
pub(crate) fn udp_flush(worker: &mut Worker, owned: &mut OwnedSocket) {
    while owned.writable && !owned.send_queue.is_empty() {
        let req = owned.send_queue.remove(0);
        udp_send(worker, owned, req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_udp_socket_binds_ephemeral() {
        let mgr = Manager::new(Config::with_workers(1)).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = udp_socket(mgr.inner(), addr, true).unwrap();
        let bound = socket.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(bound.port(), 0);
        mgr.destroy();
    }
}
