//! Worker event loops.
//!
//! A worker is one OS thread running one mio poll loop. It owns the mutable
//! half of every socket assigned to it; other threads communicate with it
//! exclusively through its four event queues and its waker.
//!
//! One loop iteration polls for readiness, records and services socket
//! readiness, then drains the queues in priority order. When a pause or
//! stop event is processed, the remaining queues are left untouched for
//! that round and the loop driver takes over: a pausing worker parks on the
//! priority-queue condition variable (servicing only priority events) until
//! a resume arrives.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;

use crate::event::{Event, QueueKind, QUEUE_KINDS};
use crate::handle::{handle_detach_cb, Handle};
use crate::manager::ManagerInner;
use crate::queue::EventQueues;
use crate::request::{CompletionCb, Request};
use crate::result::{BufferOutcome, NetError, NetResult, QueueOutcome};
use crate::socket::{
    OwnedSocket, SockIo, SockRef, SockRefExt, SocketVariant, TimerKind, STREAM_CLIENTS_PER_CONN,
};

/// Token reserved for the cross-thread waker; socket tokens are slab
/// keys and never reach this value.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Fixed per-worker receive buffer size; large enough for any DNS message.
pub(crate) const RECV_BUF_SIZE: usize = 65_536;

/// Fixed per-worker send buffer: a full message plus its length prefix.
pub(crate) const SEND_BUF_SIZE: usize = 65_536 + 2;

thread_local! {
    static NET_TID: Cell<isize> = const { Cell::new(-1) };
}

/// The calling thread's worker id, or -1 outside the net threads.
pub(crate) fn nm_tid() -> isize {
    NET_TID.with(|tid| tid.get())
}

pub(crate) fn in_net_thread() -> bool {
    nm_tid() >= 0
}

/// Cross-thread half of a worker.
pub(crate) struct WorkerShared {
    pub id: usize,
    pub queues: EventQueues,
    pub waker: Waker,
    pub registry: Registry,
    /// Socket table: the slab key is the socket's poll token, and freed
    /// keys are reused when sockets close. The owning worker (or an
    /// inline listen/connect running on its thread) checks the `Option`
    /// out for the duration of one event and checks it back in; a lookup
    /// miss means the socket is gone or busy up-stack, and the operation
    /// is re-posted or dropped.
    pub sockets: Mutex<Slab<Option<Box<OwnedSocket>>>>,
    /// Armed socket timers, keyed by deadline and token.
    pub timers: Mutex<BTreeMap<(Instant, usize), TimerKind>>,
    /// Single-writer flags (the worker itself, or the manager while it
    /// holds the interlock).
    pub paused: AtomicBool,
    pub finished: AtomicBool,
}

impl WorkerShared {
    pub(crate) fn new(id: usize, waker: Waker, registry: Registry) -> Self {
        Self {
            id,
            queues: EventQueues::new(),
            waker,
            registry,
            sockets: Mutex::new(Slab::with_capacity(64)),
            timers: Mutex::new(BTreeMap::new()),
            paused: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Register an owned socket's I/O source with the poller and assign
    /// its token (a freshly claimed slab key). The caller places it in
    /// the table with [`WorkerShared::checkin`] once its remaining setup
    /// is done.
    pub(crate) fn register(&self, owned: &mut OwnedSocket) -> NetResult<usize> {
        if matches!(owned.io, SockIo::Pending(_) | SockIo::None) {
            return Err(NetError::Unexpected);
        }

        let token = self.sockets.lock().insert(None);
        let registered = match &mut owned.io {
            SockIo::TcpListener(listener) => {
                self.registry
                    .register(listener, Token(token), Interest::READABLE)
            }
            SockIo::Tcp(stream) => self.registry.register(
                stream,
                Token(token),
                Interest::READABLE | Interest::WRITABLE,
            ),
            SockIo::Udp(socket) => self.registry.register(
                socket,
                Token(token),
                Interest::READABLE | Interest::WRITABLE,
            ),
            SockIo::Pending(_) | SockIo::None => unreachable!(),
        };
        if let Err(e) = registered {
            self.sockets.lock().remove(token);
            return Err(e.into());
        }
        owned.shared.token.store(token, Ordering::Release);
        Ok(token)
    }

    pub(crate) fn checkout(&self, token: usize) -> Option<Box<OwnedSocket>> {
        self.sockets.lock().get_mut(token)?.take()
    }

    /// Check out the owned half of `sock`, verifying identity so a reused
    /// slab key can never alias another socket.
    pub(crate) fn checkout_ref(&self, sock: &SockRef) -> Option<Box<OwnedSocket>> {
        let token = sock.token.load(Ordering::Acquire);
        if token == crate::socket::INVALID_TOKEN {
            return None;
        }
        let mut sockets = self.sockets.lock();
        let slot = sockets.get_mut(token)?;
        if !slot
            .as_ref()
            .is_some_and(|owned| Arc::ptr_eq(&owned.shared, sock))
        {
            return None;
        }
        slot.take()
    }

    pub(crate) fn checkin(&self, owned: Box<OwnedSocket>) {
        let token = owned.shared.token.load(Ordering::Acquire);
        debug_assert_ne!(token, crate::socket::INVALID_TOKEN);
        let mut sockets = self.sockets.lock();
        match sockets.get_mut(token) {
            Some(slot) => {
                debug_assert!(slot.is_none());
                *slot = Some(owned);
            }
            None => debug_assert!(false, "checkin without a reserved slot"),
        }
    }

    /// Release a closed socket's slot, making its key available for
    /// reuse.
    pub(crate) fn release_token(&self, token: usize) {
        if token == crate::socket::INVALID_TOKEN {
            return;
        }
        self.sockets.lock().try_remove(token);
    }

    /// Arm the socket's logical timer. The caller wakes the worker if it
    /// is not the worker itself.
    pub(crate) fn timer_arm(&self, owned: &mut OwnedSocket, deadline: Instant, kind: TimerKind) {
        self.timer_disarm(owned);
        let token = owned.shared.token.load(Ordering::Acquire);
        self.timers.lock().insert((deadline, token), kind);
        owned.timer = Some((deadline, kind));
    }

    /// Stop is idempotent.
    pub(crate) fn timer_disarm(&self, owned: &mut OwnedSocket) {
        if let Some((deadline, _)) = owned.timer.take() {
            let token = owned.shared.token.load(Ordering::Acquire);
            self.timers.lock().remove(&(deadline, token));
        }
    }
}

/// Thread-owned worker state.
pub(crate) struct Worker {
    pub mgr: Arc<ManagerInner>,
    pub shared: Arc<WorkerShared>,
    poll: Poll,
    events: Events,
    /// Single receive buffer per worker: one read is in flight at a time,
    /// which bounds memory and serializes reads across this worker's
    /// sockets. Callers must copy out or finish processing before the
    /// next read completes.
    pub recv_buf: Box<[u8]>,
    /// Assembly buffer for prefixed sends.
    pub send_buf: Box<[u8]>,
}

/// Entry point for worker threads.
pub(crate) fn worker_main(
    mgr: Arc<ManagerInner>,
    shared: Arc<WorkerShared>,
    poll: Poll,
    cpu: Option<usize>,
) {
    NET_TID.with(|tid| tid.set(shared.id as isize));
    if let Some(cpu) = cpu {
        if let Err(e) = set_cpu_affinity(cpu) {
            tracing::debug!(worker = shared.id, cpu, error = %e, "CPU pinning failed");
        }
    }

    let mut worker = Worker {
        mgr,
        shared,
        poll,
        events: Events::with_capacity(1024),
        recv_buf: vec![0u8; RECV_BUF_SIZE].into_boxed_slice(),
        send_buf: vec![0u8; SEND_BUF_SIZE].into_boxed_slice(),
    };
    worker.run();
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpu: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_cpu: usize) -> std::io::Result<()> {
    Ok(())
}

impl Worker {
    fn run(&mut self) {
        loop {
            self.run_until_suspend();

            if self.shared.paused.load(Ordering::Acquire) {
                debug_assert_ne!(
                    self.mgr.interlocked.load(Ordering::Acquire),
                    self.shared.id as isize
                );

                self.mgr.workers_paused.fetch_add(1, Ordering::AcqRel);
                if self.mgr.pausing.wait().is_leader() {
                    self.mgr.signal_state();
                }

                while self.shared.paused.load(Ordering::Acquire) {
                    self.wait_for_priority_queue();
                }

                // Every worker clears its privileged queue before any of
                // them proceeds past the resuming barrier.
                self.drain_queue(QueueKind::Privileged);

                self.mgr.workers_paused.fetch_sub(1, Ordering::AcqRel);
                if self.mgr.resuming.wait().is_leader() {
                    self.mgr.signal_state();
                }
            }

            if self.shared.finished.load(Ordering::Acquire) {
                break;
            }
        }

        // Shutting down: deliver any shutdown tasks still queued, but do
        // not touch the normal queue.
        self.drain_queue(QueueKind::Privileged);
        self.drain_queue(QueueKind::Task);

        self.mgr.worker_exited();
    }

    /// Run the poll loop until a pause or stop event was processed.
    fn run_until_suspend(&mut self) {
        loop {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                panic!("event loop poll failed: {e}");
            }

            let mut woke = false;
            let mut batch: Vec<(usize, bool, bool)> = Vec::with_capacity(self.events.iter().count());
            for event in self.events.iter() {
                if event.token() == WAKER_TOKEN {
                    woke = true;
                    continue;
                }
                batch.push((
                    event.token().0,
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable() || event.is_write_closed(),
                ));
            }

            for (token, readable, writable) in batch {
                self.handle_ready(token, readable, writable);
            }

            if woke && self.dispatch_all() {
                // Events remain (or a suspension was requested): make sure
                // the next iteration re-runs dispatch rather than parking
                // in poll.
                let _ = self.shared.waker.wake();
            }

            self.fire_timers();

            if self.shared.paused.load(Ordering::Acquire)
                || self.shared.finished.load(Ordering::Acquire)
            {
                return;
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let timers = self.shared.timers.lock();
        let (deadline, _) = timers.keys().next()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Drain all four queues in priority order. Returns true when the
    /// dispatcher should be re-armed.
    fn dispatch_all(&mut self) -> bool {
        let mut reschedule = false;
        for kind in QUEUE_KINDS {
            match self.process_queue(kind) {
                QueueOutcome::Suspend => return true,
                QueueOutcome::Empty => {}
                QueueOutcome::Progress => reschedule = true,
            }
        }
        reschedule
    }

    /// Process one round of a queue. The depth counter observed at entry
    /// is the round's quota, so a hot producer cannot live-lock us; the
    /// counter may also run ahead of the physically visible items, in
    /// which case "counted but not visible" reports progress and the item
    /// is picked up next round.
    fn process_queue(&mut self, kind: QueueKind) -> QueueOutcome {
        let mut waiting = self.shared.queues.depth(kind);
        let mut event = self.shared.queues.try_pop(kind);

        if event.is_none() {
            return if waiting == 0 {
                QueueOutcome::Empty
            } else {
                QueueOutcome::Progress
            };
        }

        while let Some(ev) = event {
            if !self.process_event(ev) {
                return QueueOutcome::Suspend;
            }
            if waiting == 0 {
                break;
            }
            waiting -= 1;
            event = self.shared.queues.try_pop(kind);
        }

        QueueOutcome::Progress
    }

    pub(crate) fn drain_queue(&mut self, kind: QueueKind) {
        let shared = self.shared.clone();
        while let Some(event) = shared.queues.try_pop(kind) {
            let _ = self.process_event(event);
        }
    }

    /// Service priority events while parked during a pause. Waits for the
    /// first event, then drains without waiting and returns once the
    /// queue is empty.
    fn wait_for_priority_queue(&mut self) {
        let mut wait_for_work = true;
        loop {
            let event = {
                let mut guard = self.shared.queues.prio_lock.lock();
                let mut event = self.shared.queues.try_pop(QueueKind::Priority);
                if wait_for_work {
                    while event.is_none() {
                        self.shared.queues.prio_cond.wait(&mut guard);
                        event = self.shared.queues.try_pop(QueueKind::Priority);
                    }
                }
                event
            };
            wait_for_work = false;

            let Some(event) = event else {
                return;
            };
            self.process_event(event);
        }
    }

    /// Returns false when queue processing must stop for this round.
    fn process_event(&mut self, event: Event) -> bool {
        tracing::trace!(worker = self.shared.id, event = event.kind_name(), "processing event");
        match event {
            Event::Stop => {
                self.shared.finished.store(true, Ordering::Release);
                return false;
            }
            Event::Pause => {
                debug_assert!(!self.shared.paused.load(Ordering::Acquire));
                self.shared.paused.store(true, Ordering::Release);
                return false;
            }
            Event::Resume => {
                debug_assert!(self.shared.paused.load(Ordering::Acquire));
                self.shared.paused.store(false, Ordering::Release);
            }
            Event::Shutdown => self.shutdown_walk(),
            Event::Listen(owned) => crate::tcpdns::listen_child(&self.mgr, &self.shared, owned),
            Event::StopListening(sock) => self.stop_listening(&sock),
            Event::PrivilegedTask(task) | Event::Task(task) => task(),
            Event::Connect(owned, req) => match owned.variant() {
                SocketVariant::UdpSocket => {
                    crate::udp::connect_start(&self.mgr, &self.shared, owned, req);
                }
                _ => crate::tcpdns::connect_start(&self.mgr, &self.shared, owned, req),
            },
            Event::Read(sock, cb) => self.read_start(&sock, cb),
            Event::Send(sock, req) => self.send_start(&sock, req),
            Event::Cancel(sock) => {
                self.with_sock(&sock, |worker, owned| {
                    worker.failed_read(owned, NetError::Canceled);
                });
            }
            Event::PauseRead(sock) => {
                self.with_sock(&sock, |worker, owned| {
                    worker.shared.timer_disarm(owned);
                    owned.reading = false;
                });
            }
            Event::ResumeRead(sock) => {
                self.with_sock(&sock, |worker, owned| {
                    if !owned.shared.is_closing() {
                        worker.resume_stream(owned);
                    }
                });
            }
            Event::TimerRestart(sock) => {
                self.with_sock(&sock, |worker, owned| {
                    worker.timer_restart(owned);
                });
            }
            Event::Close(sock) => self.close_sock(&sock),
            Event::Detach(core) => handle_detach_cb(&core),
            Event::Accept(sock, guard) => {
                self.with_sock(&sock, |worker, owned| {
                    crate::tcpdns::accept_pending(worker, owned, Some(guard));
                });
            }
            Event::TlsCycle(sock) => {
                self.with_sock(&sock, |worker, owned| {
                    if let Err(e) = crate::tlsdns::tls_cycle(worker, owned) {
                        crate::tlsdns::tls_error(worker, owned, e);
                    }
                });
            }
            Event::ResumeProcessing(sock) => {
                self.with_sock(&sock, |worker, owned| {
                    if owned.shared.client.load(Ordering::Acquire) || owned.shared.is_closing() {
                        return;
                    }
                    worker.resume_stream(owned);
                });
            }
            Event::ConnectCb(req, result) => deliver_connect_cb(req, result),
            Event::SendCb(req, result) => deliver_send_cb(req, result),
        }
        true
    }

    /// Check out `sock`'s owned half, run `f`, and check it back in
    /// unless the socket closed while `f` ran.
    pub(crate) fn with_sock(
        &mut self,
        sock: &SockRef,
        f: impl FnOnce(&mut Worker, &mut OwnedSocket),
    ) {
        let Some(mut owned) = self.shared.checkout_ref(sock) else {
            return;
        };
        f(self, &mut owned);
        self.checkin_or_drop(owned);
    }

    pub(crate) fn checkin_or_drop(&mut self, owned: Box<OwnedSocket>) {
        if owned.shared.closed.load(Ordering::Acquire) {
            // The socket closed while checked out; its resources were
            // already released by the close path.
            return;
        }
        self.shared.checkin(owned);
    }

    /// Readiness fan-out for one socket.
    fn handle_ready(&mut self, token: usize, readable: bool, writable: bool) {
        let Some(mut owned) = self.shared.checkout(token) else {
            return;
        };
        owned.readable |= readable;
        owned.writable |= writable;

        match owned.variant() {
            SocketVariant::TcpDnsListener | SocketVariant::TlsDnsListener => {
                if owned.readable {
                    crate::tcpdns::accept_pending(self, &mut owned, None);
                }
            }
            SocketVariant::UdpListener => {
                if owned.writable {
                    crate::udp::udp_flush(self, &mut owned);
                }
                if owned.readable {
                    crate::udp::udp_read_ready(self, &mut owned);
                }
            }
            SocketVariant::UdpSocket => {
                if owned.writable {
                    crate::udp::udp_flush(self, &mut owned);
                }
                if owned.readable {
                    crate::udp::udp_read_ready(self, &mut owned);
                }
            }
            SocketVariant::TcpDnsSocket | SocketVariant::TlsDnsSocket => {
                if owned.writable {
                    crate::tcpdns::stream_write_ready(self, &mut owned);
                }
                if owned.readable && !owned.shared.closed.load(Ordering::Acquire) {
                    crate::tcpdns::stream_read_ready(self, &mut owned);
                }
            }
        }

        self.checkin_or_drop(owned);
    }

    fn fire_timers(&mut self) {
        loop {
            let now = Instant::now();
            let due = {
                let mut timers = self.shared.timers.lock();
                match timers.keys().next().copied() {
                    Some(key) if key.0 <= now => {
                        let kind = timers.remove(&key).unwrap();
                        Some((key, kind))
                    }
                    _ => None,
                }
            };
            let Some(((deadline, token), kind)) = due else {
                return;
            };

            let Some(mut owned) = self.shared.checkout(token) else {
                continue;
            };
            match owned.timer {
                Some((armed, _)) if armed == deadline => owned.timer = None,
                _ => {
                    // Stale entry from a restart.
                    self.shared.checkin(owned);
                    continue;
                }
            }

            match kind {
                TimerKind::Connect => self.connect_timeout_fired(&mut owned),
                TimerKind::Read => self.read_timeout_fired(&mut owned),
            }
            self.checkin_or_drop(owned);
        }
    }

    /// Arm the socket timer according to its state: connect timeout (with
    /// slack, so the OS-level TCP timeout is observed first) while
    /// connecting, read timeout otherwise. Zero disables.
    pub(crate) fn timer_restart(&mut self, owned: &mut OwnedSocket) {
        if owned.shared.connecting.load(Ordering::Acquire) {
            let timeout = owned.shared.connect_timeout.load(Ordering::Acquire);
            if timeout == 0 {
                return;
            }
            let deadline = Instant::now() + Duration::from_millis(timeout + 10);
            self.shared.timer_arm(owned, deadline, TimerKind::Connect);
        } else {
            let timeout = owned.shared.read_timeout.load(Ordering::Acquire);
            if timeout == 0 {
                self.shared.timer_disarm(owned);
                return;
            }
            let deadline = Instant::now() + Duration::from_millis(timeout);
            self.shared.timer_arm(owned, deadline, TimerKind::Read);
        }
    }

    pub(crate) fn timer_start(&mut self, owned: &mut OwnedSocket) {
        if owned.timer.is_some() {
            return;
        }
        self.timer_restart(owned);
    }

    fn connect_timeout_fired(&mut self, owned: &mut OwnedSocket) {
        debug_assert!(owned.shared.connecting.load(Ordering::Acquire));

        let req = crate::tlsdns::take_pending_connect(owned).or_else(|| owned.connect_req.take());
        let Some(req) = req else {
            return;
        };

        // Deliver the timeout directly; if the callback did not re-arm a
        // timer, tear the socket down.
        deliver_connect_cb_borrowed(req, Err(NetError::TimedOut));

        if owned.timer.is_none() {
            owned
                .shared
                .connecting
                .store(false, Ordering::Release);
            self.clear_callbacks(owned);
            self.sock_shutdown(owned);
        }
    }

    fn read_timeout_fired(&mut self, owned: &mut OwnedSocket) {
        if !owned.reading {
            return;
        }

        if owned.shared.client.load(Ordering::Acquire) {
            if let (Some(cb), Some(handle)) =
                (owned.recv_cb.clone(), owned.shared.statichandle())
            {
                owned.recv_read = false;
                cb(&handle, Err(NetError::TimedOut));
            }
            // The callback may have issued another read (re-arming the
            // timer); only tear down when it did not.
            if owned.timer.is_none() {
                self.clear_callbacks(owned);
                self.failed_read(owned, NetError::Canceled);
            }
        } else {
            self.failed_read(owned, NetError::TimedOut);
        }
    }

    pub(crate) fn clear_callbacks(&mut self, owned: &mut OwnedSocket) {
        owned.recv_cb = None;
        owned.accept_cb = None;
    }

    /// Terminal read failure: deliver the error to the read callback (at
    /// most once), cancel a pending TLS connect, and begin teardown.
    pub(crate) fn failed_read(&mut self, owned: &mut OwnedSocket, error: NetError) {
        self.shared.timer_disarm(owned);
        owned.reading = false;

        if let Some(req) = crate::tlsdns::take_pending_connect(owned) {
            self.failed_connect(owned, req, NetError::Canceled);
            return;
        }

        if let Some(cb) = owned.recv_cb.clone() {
            let handle = if owned.shared.client.load(Ordering::Acquire) {
                owned.shared.statichandle()
            } else {
                owned.recv_handle.clone()
            };
            if let Some(handle) = handle {
                owned.recv_read = false;
                self.clear_callbacks(owned);
                cb(&handle, Err(error));
            }
        }

        owned.quota_guard = None;
        owned.shared.prep_destroy_root();
    }

    /// Terminal connect failure: deliver the error, clear state, and tear
    /// the socket down.
    pub(crate) fn failed_connect(
        &mut self,
        owned: &mut OwnedSocket,
        req: Box<Request>,
        error: NetError,
    ) {
        self.shared.timer_disarm(owned);
        owned.shared.connecting.store(false, Ordering::Release);
        self.clear_callbacks(owned);
        owned.shared.variant.stats().connect_fail();

        self.mgr
            .enqueue(self.shared.id, Event::ConnectCb(req, Err(error)));

        owned.shared.prep_destroy_root();
    }

    fn read_start(&mut self, sock: &SockRef, cb: Option<crate::socket::RecvFn>) {
        self.with_sock(sock, |worker, owned| {
            if let Some(cb) = cb {
                owned.recv_cb = Some(cb);
            }
            owned.recv_read = true;

            if owned.shared.is_closing() {
                owned.reading = true;
                worker.failed_read(owned, NetError::Canceled);
                return;
            }

            if owned.shared.read_timeout.load(Ordering::Acquire) == 0 {
                let timeout = if owned.shared.keepalive.load(Ordering::Acquire) {
                    worker.mgr.keepalive_ms()
                } else {
                    worker.mgr.idle_ms()
                };
                owned.shared.read_timeout.store(timeout, Ordering::Release);
            }

            match owned.variant() {
                SocketVariant::UdpSocket => crate::udp::udp_read_start(worker, owned),
                SocketVariant::TcpDnsSocket => worker.resume_stream(owned),
                SocketVariant::TlsDnsSocket => {
                    if let Err(e) = crate::tlsdns::tls_cycle(worker, owned) {
                        worker.failed_read(owned, e);
                    }
                }
                _ => unreachable!("read on a listener socket"),
            }
        });
    }

    fn send_start(&mut self, sock: &SockRef, req: Box<Request>) {
        let Some(mut owned) = self.shared.checkout_ref(sock) else {
            sock.variant.stats().send_fail();
            self.mgr
                .enqueue(self.shared.id, Event::SendCb(req, Err(NetError::Canceled)));
            return;
        };

        match owned.variant() {
            SocketVariant::UdpSocket | SocketVariant::UdpListener => {
                crate::udp::udp_send(self, &mut owned, req);
            }
            SocketVariant::TcpDnsSocket => {
                crate::tcpdns::tcpdns_send(self, &mut owned, req);
            }
            SocketVariant::TlsDnsSocket => {
                crate::tlsdns::tlsdns_send(self, &mut owned, req);
            }
            _ => unreachable!("send on a listener socket"),
        }

        self.checkin_or_drop(owned);
    }

    /// Pick stream processing back up: deliver whatever complete messages
    /// are already buffered, then read more if the socket is readable.
    pub(crate) fn resume_stream(&mut self, owned: &mut OwnedSocket) {
        self.process_sock_buffer(owned);
        if owned.reading && owned.readable {
            crate::tcpdns::stream_read_ready(self, owned);
        }
    }

    /// Deliver complete DNS messages from the reassembly buffer until it
    /// runs dry or backpressure stops us.
    ///
    /// On an incomplete message the timer is left alone unless the socket
    /// is otherwise idle; on every complete message it is reset. Reading
    /// stops for client sockets (one response per read), sequential-mode
    /// sockets, and when the number of in-flight handles reaches the
    /// per-connection ceiling; it resumes when the in-flight handle is
    /// released.
    pub(crate) fn process_sock_buffer(&mut self, owned: &mut OwnedSocket) {
        loop {
            let ah = owned.shared.ah.load(Ordering::Acquire);
            match self.process_buffer(owned) {
                BufferOutcome::NoMore => {
                    self.start_reading(owned);
                    if ah <= 1 {
                        self.timer_start(owned);
                    }
                    return;
                }
                BufferOutcome::Canceled => {
                    self.shared.timer_disarm(owned);
                    owned.reading = false;
                    return;
                }
                BufferOutcome::Delivered => {
                    self.shared.timer_disarm(owned);

                    if !owned.shared.client.load(Ordering::Acquire) {
                        let timeout = if owned.shared.keepalive.load(Ordering::Acquire) {
                            self.mgr.keepalive_ms()
                        } else {
                            self.mgr.idle_ms()
                        };
                        owned.shared.read_timeout.store(timeout, Ordering::Release);
                    }

                    if owned.shared.client.load(Ordering::Acquire)
                        || owned.shared.sequential.load(Ordering::Acquire)
                        || ah >= STREAM_CLIENTS_PER_CONN
                    {
                        owned.reading = false;
                        return;
                    }
                }
            }
        }
    }

    /// Carve one length-prefixed message out of the reassembly buffer and
    /// deliver it, zero-copy, to the read callback.
    fn process_buffer(&mut self, owned: &mut OwnedSocket) -> BufferOutcome {
        if owned.shared.is_closing() {
            return BufferOutcome::Canceled;
        }

        if owned.buf.len() < 2 {
            return BufferOutcome::NoMore;
        }
        let len = u16::from_be_bytes([owned.buf[0], owned.buf[1]]) as usize;
        if owned.buf.len() - 2 < len {
            return BufferOutcome::NoMore;
        }

        let handle = if owned.shared.client.load(Ordering::Acquire) {
            match owned.shared.statichandle() {
                Some(handle) => handle,
                None => return BufferOutcome::Canceled,
            }
        } else {
            crate::handle::handle_get(&owned.shared, None, None)
        };

        owned.recv_read = false;

        let cb = owned.recv_cb.clone();
        if let Some(cb) = cb {
            // A detach from inside the callback must not re-enter buffer
            // processing; resumption is always deferred to an event.
            assert!(!owned.processing, "re-entrant stream processing");
            owned.processing = true;
            let region = &owned.buf[2..2 + len];
            cb(&handle, Ok(region));
            owned.processing = false;
        }

        use bytes::Buf;
        owned.buf.advance(2 + len);
        drop(handle);

        BufferOutcome::Delivered
    }

    pub(crate) fn start_reading(&mut self, owned: &mut OwnedSocket) {
        if owned.shared.read_paused.load(Ordering::Acquire) {
            return;
        }
        owned.reading = true;
    }

    fn close_sock(&mut self, sock: &SockRef) {
        if sock
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match self.shared.checkout_ref(sock) {
            Some(mut owned) => {
                // Dropped here; close_owned released the slab slot.
                self.close_owned(&mut owned);
            }
            None => {
                // Never registered (early connect failure): finish the
                // lifecycle directly.
                sock.closed.store(true, Ordering::Release);
                sock.variant.stats().close();
                sock.maybe_destroy();
            }
        }
    }

    /// Release the worker-owned half of a socket. The caller must not
    /// check the socket back in afterwards.
    pub(crate) fn close_owned(&mut self, owned: &mut OwnedSocket) {
        let sock = owned.shared.clone();

        self.shared.timer_disarm(owned);
        owned.reading = false;

        match &mut owned.io {
            SockIo::TcpListener(listener) => {
                let _ = self.shared.registry.deregister(listener);
            }
            SockIo::Tcp(stream) => {
                let _ = self.shared.registry.deregister(stream);
            }
            SockIo::Udp(socket) => {
                let _ = self.shared.registry.deregister(socket);
            }
            SockIo::Pending(_) | SockIo::None => {}
        }
        owned.io = SockIo::None;

        // Fail whatever was still in flight.
        if let Some(req) = owned.connect_req.take() {
            self.mgr
                .enqueue(self.shared.id, Event::ConnectCb(req, Err(NetError::Canceled)));
        }
        if let Some(req) = crate::tlsdns::take_pending_connect(owned) {
            self.mgr
                .enqueue(self.shared.id, Event::ConnectCb(req, Err(NetError::Canceled)));
        }
        if let Some(pending) = owned.pending_send.take() {
            if let Some(req) = pending.req {
                self.mgr
                    .enqueue(self.shared.id, Event::SendCb(req, Err(NetError::Canceled)));
            }
        }
        for req in owned.send_queue.drain(..) {
            self.mgr
                .enqueue(self.shared.id, Event::SendCb(req, Err(NetError::Canceled)));
        }

        owned.tls = None;
        owned.quota_guard = None;
        owned.recv_handle = None;
        self.clear_callbacks(owned);

        if let Some(server) = sock.server.lock().take() {
            server.detach();
        }

        // Free the slab slot; the key becomes available for reuse.
        self.shared
            .release_token(sock.token.swap(crate::socket::INVALID_TOKEN, Ordering::AcqRel));

        sock.connected.store(false, Ordering::Release);
        sock.listening.store(false, Ordering::Release);
        sock.closed.store(true, Ordering::Release);
        sock.variant.stats().close();

        sock.maybe_destroy();
    }

    /// Variant-specific shutdown, issued for every live socket when the
    /// manager begins closing.
    fn shutdown_walk(&mut self) {
        let tokens: Vec<usize> = self
            .shared
            .sockets
            .lock()
            .iter()
            .map(|(token, _)| token)
            .collect();
        for token in tokens {
            let Some(mut owned) = self.shared.checkout(token) else {
                continue;
            };
            self.sock_shutdown(&mut owned);
            self.checkin_or_drop(owned);
        }
    }

    pub(crate) fn sock_shutdown(&mut self, owned: &mut OwnedSocket) {
        match owned.variant() {
            SocketVariant::UdpListener
            | SocketVariant::TcpDnsListener
            | SocketVariant::TlsDnsListener => {
                // Listeners are quiesced by stop_listening; shutdown only
                // stops them from accepting further connections.
                owned.shared.deactivate();
            }
            SocketVariant::UdpSocket => {
                if !owned.shared.deactivate() {
                    return;
                }
                if owned.shared.statichandle().is_some() {
                    self.failed_read(owned, NetError::Canceled);
                } else {
                    owned.shared.prep_destroy_root();
                }
            }
            SocketVariant::TcpDnsSocket | SocketVariant::TlsDnsSocket => {
                if !owned.shared.deactivate() {
                    return;
                }

                crate::tlsdns::tls_send_shutdown(self, owned);

                if owned.shared.accepting.load(Ordering::Acquire) {
                    return;
                }

                if owned.shared.connecting.load(Ordering::Acquire) {
                    let req = crate::tlsdns::take_pending_connect(owned)
                        .or_else(|| owned.connect_req.take());
                    if let Some(req) = req {
                        self.failed_connect(owned, req, NetError::Canceled);
                    }
                    return;
                }

                if owned.shared.statichandle().is_some() || owned.recv_handle.is_some() {
                    self.failed_read(owned, NetError::Canceled);
                    return;
                }

                owned.shared.prep_destroy_root();
            }
        }
    }

    fn stop_listening(&mut self, sock: &SockRef) {
        if sock.parent.is_some() {
            self.stop_listening_child(sock);
        } else {
            self.stop_listening_parent(sock);
        }
    }

    fn stop_listening_parent(&mut self, parent: &SockRef) {
        let children: Vec<SockRef> = parent.children.lock().clone();
        if children.is_empty() {
            parent.closed.store(true, Ordering::Release);
            parent.prep_destroy_root();
            return;
        }
        let barrier = Arc::new(std::sync::Barrier::new(children.len()));
        *parent.stop_barrier.lock() = Some(barrier);

        let mut own_child = None;
        for child in children {
            child.active.store(false, Ordering::Release);
            if child.tid == self.shared.id {
                own_child = Some(child);
            } else {
                self.mgr.enqueue(child.tid, Event::StopListening(child.clone()));
            }
        }

        // Our own child last: its barrier wait synchronizes with the rest.
        if let Some(child) = own_child {
            self.stop_listening_child(&child);
        }

        parent.closed.store(true, Ordering::Release);
        parent.prep_destroy_root();
    }

    fn stop_listening_child(&mut self, child: &SockRef) {
        if child
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(mut owned) = self.shared.checkout_ref(child) {
            self.close_owned(&mut owned);
        } else {
            child.closed.store(true, Ordering::Release);
            child.variant.stats().close();
        }

        let parent = child.parent.clone().expect("listener child without parent");
        parent.rchildren.fetch_sub(1, Ordering::AcqRel);

        // The per-child reference taken at listen time.
        child.detach();

        let barrier = parent.stop_barrier.lock().clone();
        if let Some(barrier) = barrier {
            barrier.wait();
        }
    }
}

/// Deliver a connect completion, releasing the request afterwards.
pub(crate) fn deliver_connect_cb(req: Box<Request>, result: NetResult<()>) {
    deliver_connect_cb_borrowed(req, result);
}

fn deliver_connect_cb_borrowed(mut req: Box<Request>, result: NetResult<()>) {
    let cb = std::mem::replace(&mut req.cb, CompletionCb::None);
    if let (CompletionCb::Connect(cb), Some(handle)) = (cb, req.handle.as_ref()) {
        cb(handle, result);
    }
    Request::put(req);
}

/// Deliver a send completion, releasing the request afterwards.
pub(crate) fn deliver_send_cb(mut req: Box<Request>, result: NetResult<()>) {
    let cb = std::mem::replace(&mut req.cb, CompletionCb::None);
    if let (CompletionCb::Send(cb), Some(handle)) = (cb, req.handle.as_ref()) {
        cb(handle, result);
    }
    Request::put(req);
}

impl Handle {
    /// The worker that owns this handle's socket; for diagnostics.
    pub fn worker_id(&self) -> usize {
        self.sock().tid
    }
}
