//! DNS over TLS: the engine between the asynchronous TCP byte stream and
//! the synchronous TLS library.
//!
//! The rustls connection plays the role the memory-BIO pairs play in an
//! OpenSSL deployment: ciphertext from TCP is pushed in with `read_tls`
//! (the write side of the inbound pair) and pulled out with `write_tls`
//! (the read side of the outbound pair); plaintext crosses the boundary
//! through the engine's reader and writer.
//!
//! Everything is driven by the cycle pump: one input pass (ciphertext in,
//! handshake progress, plaintext out into the reassembly buffer) followed
//! by one output pass (pending ciphertext drained into bounded chunks and
//! written to TCP, at most one chunk in flight).

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::event::Event;
use crate::manager::Manager;
use crate::quota::Quota;
use crate::request::Request;
use crate::result::{NetError, NetResult};
use crate::socket::{Listener, OwnedSocket, SendData, SockIo, SockRefExt, SocketVariant};
use crate::tls::TlsContext;
use crate::worker::Worker;
use crate::Handle;

/// Upper bound on one outbound ciphertext chunk.
const TLS_CHUNK_SIZE: usize = 16 * 1024;

/// TLS engine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TlsPhase {
    /// Engine created, first cycle not yet run.
    Initial,
    /// SSL accept/connect in progress.
    Handshake,
    /// Application data flowing.
    Io,
    /// Terminal; the pending error is reported once.
    Error,
}

/// Per-socket TLS engine state.
pub(crate) struct TlsState {
    pub ctx: Arc<TlsContext>,
    pub engine: Option<rustls::Connection>,
    pub phase: TlsPhase,
    /// Connect request deferred until the handshake completes.
    pub pending_req: Option<Box<Request>>,
    pub pending_error: Option<NetError>,
    /// Re-entrancy sentinel for the cycle pump.
    pub cycle: bool,
}

impl TlsState {
    /// Listener children only carry the context; each accepted connection
    /// gets its own engine.
    pub(crate) fn for_listener(ctx: Arc<TlsContext>) -> TlsState {
        TlsState {
            ctx,
            engine: None,
            phase: TlsPhase::Initial,
            pending_req: None,
            pending_error: None,
            cycle: false,
        }
    }

    /// Client sockets carry the context until the TCP connection is
    /// established, then instantiate the engine.
    pub(crate) fn for_client(ctx: Arc<TlsContext>) -> TlsState {
        TlsState::for_listener(ctx)
    }

    pub(crate) fn for_connection(ctx: Arc<TlsContext>, engine: rustls::Connection) -> TlsState {
        TlsState {
            ctx,
            engine: Some(engine),
            phase: TlsPhase::Initial,
            pending_req: None,
            pending_error: None,
            cycle: false,
        }
    }
}

impl Manager {
    /// Listen for DNS-over-TLS connections on `iface`. The accept
    /// callback fires once the TLS handshake has completed; `recv` fires
    /// for every framed message after that.
    #[allow(clippy::too_many_arguments)]
    pub fn listen_tlsdns(
        &self,
        iface: SocketAddr,
        recv: impl Fn(&Handle, Result<&[u8], NetError>) + Send + Sync + 'static,
        accept: impl Fn(&Handle, NetResult<()>) -> NetResult<()> + Send + Sync + 'static,
        extrahandlesize: usize,
        backlog: u32,
        quota: Option<Arc<Quota>>,
        tls: Arc<TlsContext>,
    ) -> NetResult<Listener> {
        assert!(tls.is_server(), "listener needs a server TLS context");
        self.listen_stream(
            SocketVariant::TlsDnsListener,
            iface,
            Arc::new(recv),
            Arc::new(accept),
            extrahandlesize,
            backlog,
            quota,
            Some(tls),
        )
    }

    /// Connect to a DNS-over-TLS server. The connect callback is deferred
    /// until the TLS handshake completes.
    pub fn connect_tlsdns(
        &self,
        local: Option<SocketAddr>,
        peer: SocketAddr,
        cb: impl FnOnce(&Handle, NetResult<()>) + Send + 'static,
        timeout_ms: u64,
        extrahandlesize: usize,
        tls: Arc<TlsContext>,
    ) -> NetResult<()> {
        assert!(!tls.is_server(), "connect needs a client TLS context");
        self.connect_stream(
            SocketVariant::TlsDnsSocket,
            local,
            peer,
            Box::new(cb),
            timeout_ms,
            extrahandlesize,
            Some(tls),
        )
    }
}

/// Take a deferred connect request, if one is pending on the socket.
pub(crate) fn take_pending_connect(owned: &mut OwnedSocket) -> Option<Box<Request>> {
    owned.tls.as_mut()?.pending_req.take()
}

/// Instantiate the client engine once the TCP connection is up, parking
/// the connect request until the handshake completes.
pub(crate) fn tls_engine_start(owned: &mut OwnedSocket, req: Box<Request>) -> NetResult<()> {
    let tls = owned.tls.as_mut().ok_or(NetError::Unexpected)?;
    tls.engine = Some(tls.ctx.connect_engine()?);
    tls.pending_req = Some(req);
    Ok(())
}

/// Report the pending error exactly once; later cycles fail generically.
fn pop_error(owned: &mut OwnedSocket) -> Option<NetError> {
    let tls = owned.tls.as_mut()?;
    if tls.phase != TlsPhase::Error {
        return None;
    }
    Some(tls.pending_error.take().unwrap_or(NetError::Tls))
}

/// Feed `n` ciphertext bytes from the worker's receive buffer into the
/// engine, then run one cycle.
pub(crate) fn tls_feed(worker: &mut Worker, owned: &mut OwnedSocket, n: usize) -> NetResult<()> {
    let mut consumed = 0;
    while consumed < n {
        let taken = {
            let tls = owned.tls.as_mut().ok_or(NetError::Unexpected)?;
            let engine = tls.engine.as_mut().ok_or(NetError::Unexpected)?;
            let mut cursor = &worker.recv_buf[consumed..n];
            match engine.read_tls(&mut cursor) {
                Ok(taken) => {
                    // Deframe eagerly so the engine's buffers never fill.
                    if let Err(e) = engine.process_new_packets() {
                        tracing::debug!(error = %e, "TLS record processing failed");
                        return Err(NetError::Tls);
                    }
                    taken
                }
                Err(e) => {
                    tracing::debug!(error = %e, "TLS input rejected");
                    return Err(NetError::Tls);
                }
            }
        };
        if taken == 0 {
            return Err(NetError::Tls);
        }
        consumed += taken;
    }

    tls_cycle(worker, owned)
}

/// The cycle pump. Re-entrant calls return immediately; the running
/// iteration picks up whatever state they would have processed.
pub(crate) fn tls_cycle(worker: &mut Worker, owned: &mut OwnedSocket) -> NetResult<()> {
    if owned.shared.is_closing() {
        return Err(NetError::Canceled);
    }
    if let Some(e) = pop_error(owned) {
        return Err(e);
    }

    {
        let Some(tls) = owned.tls.as_mut() else {
            return Ok(());
        };
        if tls.engine.is_none() || tls.cycle {
            return Ok(());
        }
        tls.cycle = true;
    }

    let result = cycle_input(worker, owned).and_then(|()| cycle_output(worker, owned));

    if let Some(tls) = owned.tls.as_mut() {
        tls.cycle = false;
    }
    result
}

fn cycle_input(worker: &mut Worker, owned: &mut OwnedSocket) -> NetResult<()> {
    {
        let tls = owned.tls.as_mut().expect("cycle without TLS state");
        let engine = tls.engine.as_mut().expect("cycle without engine");

        if let Err(e) = engine.process_new_packets() {
            tracing::debug!(error = %e, "TLS engine error");
            return Err(NetError::Tls);
        }

        if tls.phase == TlsPhase::Initial && engine.is_handshaking() {
            tls.phase = TlsPhase::Handshake;
        }
    }

    // Drain decrypted application data into the reassembly buffer,
    // handing complete messages up after every chunk. When the engine
    // runs dry, process whatever is already buffered (a read request may
    // be waiting on a message that arrived earlier).
    while owned.tls.as_ref().is_some_and(|t| t.phase == TlsPhase::Io) {
        let n = {
            let engine = owned
                .tls
                .as_mut()
                .and_then(|t| t.engine.as_mut())
                .expect("cycle without engine");
            // The send buffer doubles as plaintext scratch here: sends
            // finish consuming it before any cycle runs.
            match engine.reader().read(&mut worker.send_buf[..TLS_CHUNK_SIZE]) {
                Ok(0) => return Err(NetError::Eof),
                Ok(n) => Some(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
                Err(e) => {
                    tracing::debug!(error = %e, "TLS read failed");
                    return Err(NetError::Tls);
                }
            }
        };
        match n {
            Some(n) => {
                owned.buf.extend_from_slice(&worker.send_buf[..n]);
                worker.process_sock_buffer(owned);
            }
            None => {
                worker.process_sock_buffer(owned);
                break;
            }
        }
    }

    // Handshake completion.
    let completed = {
        let tls = owned.tls.as_ref().expect("cycle without TLS state");
        tls.phase == TlsPhase::Handshake
            && tls
                .engine
                .as_ref()
                .is_some_and(|engine| !engine.is_handshaking())
    };
    if completed {
        handshake_done(worker, owned)?;
    }

    // Entering the handshake means we need bytes from the peer: make sure
    // the stream is being read and the timer armed.
    if owned
        .tls
        .as_ref()
        .is_some_and(|t| t.phase == TlsPhase::Handshake)
        && !owned.reading
    {
        worker.process_sock_buffer(owned);
    }

    Ok(())
}

fn handshake_done(worker: &mut Worker, owned: &mut OwnedSocket) -> NetResult<()> {
    owned.tls.as_mut().expect("no TLS state").phase = TlsPhase::Io;

    let is_server = owned.tls.as_ref().expect("no TLS state").ctx.is_server();
    if is_server {
        let handle = owned.recv_handle.clone().ok_or(NetError::Unexpected)?;
        if let Some(cb) = owned.accept_cb.clone() {
            if let Err(e) = cb(&handle, Ok(())) {
                owned.recv_handle = None;
                return Err(e);
            }
        }
    } else {
        let req = take_pending_connect(owned).ok_or(NetError::Unexpected)?;
        worker.shared.timer_disarm(owned);
        let was_connecting = owned
            .shared
            .connecting
            .swap(false, Ordering::AcqRel);
        debug_assert!(was_connecting);
        worker
            .mgr
            .enqueue(worker.shared.id, Event::ConnectCb(req, Ok(())));
    }

    // Sends parked behind the handshake can go out now.
    let sock = owned.shared.clone();
    for req in owned.send_queue.drain(..) {
        worker
            .mgr
            .enqueue(worker.shared.id, Event::Send(sock.clone(), req));
    }

    // Kick another cycle asynchronously; application data may already be
    // waiting inside the engine.
    worker
        .mgr
        .enqueue(worker.shared.id, Event::TlsCycle(sock));
    Ok(())
}

/// An `io::Write` that accepts at most `cap` bytes in total.
struct ChunkWriter<'a> {
    buf: &'a mut Vec<u8>,
    cap: usize,
}

impl Write for ChunkWriter<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let room = self.cap - self.buf.len();
        if room == 0 {
            return Err(std::io::ErrorKind::WouldBlock.into());
        }
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn cycle_output(worker: &mut Worker, owned: &mut OwnedSocket) -> NetResult<()> {
    loop {
        if owned.pending_send.is_some() {
            // One outbound buffer at a time; the write completion re-enters
            // the cycle.
            return Ok(());
        }

        let mut chunk = Vec::new();
        {
            let Some(engine) = owned.tls.as_mut().and_then(|t| t.engine.as_mut()) else {
                return Ok(());
            };
            while engine.wants_write() && chunk.len() < TLS_CHUNK_SIZE {
                match engine.write_tls(&mut ChunkWriter {
                    buf: &mut chunk,
                    cap: TLS_CHUNK_SIZE,
                }) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if chunk.is_empty() {
            return Ok(());
        }

        let mut pos = 0;
        while pos < chunk.len() {
            let write = {
                let SockIo::Tcp(stream) = &mut owned.io else {
                    return Err(NetError::Canceled);
                };
                stream.write(&chunk[pos..])
            };
            match write {
                Ok(0) => return Err(NetError::Io(std::io::ErrorKind::WriteZero)),
                Ok(n) => pos += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    owned.writable = false;
                    owned.pending_send = Some(SendData {
                        data: chunk,
                        pos,
                        req: None,
                    });
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        // Chunk fully written; loop for more pending ciphertext.
    }
}

/// Terminal TLS failure: fail the in-flight operation, remember the error
/// for the next cycle, and shut the socket down.
pub(crate) fn tls_error(worker: &mut Worker, owned: &mut OwnedSocket, error: NetError) {
    let phase = owned.tls.as_ref().map(|t| t.phase);
    match phase {
        Some(TlsPhase::Handshake) | Some(TlsPhase::Io) => {
            if owned.shared.connecting.load(Ordering::Acquire) {
                if let Some(req) = take_pending_connect(owned) {
                    worker.failed_connect(owned, req, error.clone());
                }
            } else {
                worker.failed_read(owned, error.clone());
            }
        }
        Some(TlsPhase::Error) => return,
        _ => {}
    }

    if let Some(tls) = owned.tls.as_mut() {
        tls.phase = TlsPhase::Error;
        tls.pending_error = Some(error);
    }

    worker.sock_shutdown(owned);
}

/// Send one framed message through the engine. `SSL_write`-style, the
/// engine accepts the whole message or nothing: success is reported only
/// once the full length has been taken.
pub(crate) fn tlsdns_send(worker: &mut Worker, owned: &mut OwnedSocket, req: Box<Request>) {
    if let Some(e) = pop_error(owned) {
        owned.shared.variant.stats().send_fail();
        worker
            .mgr
            .enqueue(worker.shared.id, Event::SendCb(req, Err(e)));
        return;
    }
    if owned.shared.is_closing() {
        worker
            .mgr
            .enqueue(worker.shared.id, Event::SendCb(req, Err(NetError::Canceled)));
        return;
    }

    // Writes cannot succeed until the handshake ends; park the request.
    let handshaking = owned
        .tls
        .as_ref()
        .and_then(|t| t.engine.as_ref())
        .map(|engine| engine.is_handshaking())
        .unwrap_or(true);
    if handshaking {
        owned.send_queue.push(req);
        return;
    }

    let len = req.buf.len();
    worker.send_buf[..2].copy_from_slice(&req.tcplen);
    worker.send_buf[2..2 + len].copy_from_slice(&req.buf);

    let written = {
        let engine = owned
            .tls
            .as_mut()
            .and_then(|t| t.engine.as_mut())
            .expect("send without engine");
        engine.writer().write_all(&worker.send_buf[..2 + len])
    };

    match written {
        Ok(()) => {
            worker
                .mgr
                .enqueue(worker.shared.id, Event::SendCb(req, Ok(())));
            if let Err(e) = tls_cycle(worker, owned) {
                tls_error(worker, owned, e);
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "TLS write failed");
            owned.shared.variant.stats().send_fail();
            worker
                .mgr
                .enqueue(worker.shared.id, Event::SendCb(req, Err(NetError::Tls)));
        }
    }
}

/// Queue a close_notify and flush it on a best-effort basis.
pub(crate) fn tls_send_shutdown(worker: &mut Worker, owned: &mut OwnedSocket) {
    let Some(engine) = owned.tls.as_mut().and_then(|t| t.engine.as_mut()) else {
        return;
    };
    engine.send_close_notify();
    let _ = cycle_output(worker, owned);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_writer_caps_at_limit() {
        let mut buf = Vec::new();
        let mut writer = ChunkWriter {
            buf: &mut buf,
            cap: 8,
        };
        assert_eq!(writer.write(&[0u8; 5]).unwrap(), 5);
        assert_eq!(writer.write(&[1u8; 5]).unwrap(), 3);
        let err = writer.write(&[2u8; 1]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_phase_transitions_are_terminal_on_error() {
        assert_ne!(TlsPhase::Error, TlsPhase::Io);
        assert_ne!(TlsPhase::Initial, TlsPhase::Handshake);
    }
}
