//! The network manager: owner of the worker pool.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;
use std::time::Duration;

use mio::{Poll, Waker};
use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::event::Event;
use crate::result::NetResult;
use crate::worker::{in_net_thread, nm_tid, worker_main, WorkerShared, WAKER_TOKEN};

/// Interlock token value when no worker holds it.
const NOT_INTERLOCKED: isize = -1;

pub(crate) struct MgrState {
    pub workers_running: usize,
}

pub(crate) struct ManagerInner {
    pub nworkers: usize,

    /// External references: user-held [`Manager`] clones plus one per
    /// live socket.
    refs: AtomicUsize,

    pub closing: AtomicBool,
    pub paused: AtomicBool,
    pub workers_paused: AtomicUsize,

    /// Single-writer token serializing manager control operations against
    /// worker zero; -1 when not held.
    pub interlocked: AtomicIsize,

    init_ms: AtomicU64,
    idle_ms: AtomicU64,
    keepalive_ms: AtomicU64,
    advertised_ms: AtomicU64,

    pub tcp_recv_buffer: AtomicI64,
    pub tcp_send_buffer: AtomicI64,
    pub udp_recv_buffer: AtomicI64,
    pub udp_send_buffer: AtomicI64,
    pub max_udp: AtomicUsize,
    pub backlog: u32,

    pub lock: Mutex<MgrState>,
    pub wkstate: Condvar,

    pub pausing: Barrier,
    pub resuming: Barrier,

    pub workers: Vec<Arc<WorkerShared>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,

    /// Round-robin assignment of outbound connections to workers.
    connect_rr: AtomicUsize,
}

impl ManagerInner {
    pub(crate) fn enqueue(&self, tid: usize, event: Event) {
        let worker = &self.workers[tid];
        worker.queues.push(event);
        if let Err(e) = worker.waker.wake() {
            tracing::error!(worker = tid, error = %e, "failed to wake worker");
        }
    }

    pub(crate) fn signal_state(&self) {
        let _state = self.lock.lock();
        self.wkstate.notify_all();
    }

    pub(crate) fn worker_exited(&self) {
        let mut state = self.lock.lock();
        state.workers_running -= 1;
        self.wkstate.notify_all();
    }

    pub(crate) fn init_ms(&self) -> u64 {
        self.init_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_ms(&self) -> u64 {
        self.idle_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn keepalive_ms(&self) -> u64 {
        self.keepalive_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn attach_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach_ref(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn acquire_interlocked_force(&self) {
        if !in_net_thread() {
            return;
        }
        let mut state = self.lock.lock();
        while self
            .interlocked
            .compare_exchange(NOT_INTERLOCKED, nm_tid(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.wkstate.wait(&mut state);
        }
    }

    fn drop_interlocked(&self) {
        if !in_net_thread() {
            return;
        }
        let _state = self.lock.lock();
        let previous = self.interlocked.swap(NOT_INTERLOCKED, Ordering::AcqRel);
        assert_ne!(previous, NOT_INTERLOCKED);
        self.wkstate.notify_all();
    }

    fn shutdown_all(&self) {
        self.closing.store(true, Ordering::Release);
        for tid in 0..self.nworkers {
            self.enqueue(tid, Event::Shutdown);
        }
    }

    /// Tear the pool down once at most `keep` references remain (the
    /// caller's own, when called from an explicit destroy).
    fn destroy_inner(&self, keep: usize) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        assert!(
            !in_net_thread(),
            "manager destroyed from inside a worker callback"
        );

        self.shutdown_all();

        // Wait for external users to let go of their sockets and handles;
        // bounded so a leaked reference cannot hang teardown forever.
        let mut spins = 0;
        while self.refs.load(Ordering::Acquire) > keep && spins < 1000 {
            std::thread::sleep(Duration::from_millis(10));
            spins += 1;
        }
        if self.refs.load(Ordering::Acquire) > keep {
            tracing::warn!(
                references = self.refs.load(Ordering::Acquire),
                "destroying network manager with outstanding references"
            );
        }

        for tid in 0..self.nworkers {
            self.enqueue(tid, Event::Stop);
        }

        {
            let mut state = self.lock.lock();
            while state.workers_running > 0 {
                self.wkstate.wait(&mut state);
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            let _ = thread.join();
        }

        // Leftover control events are dropped; the task queues were
        // drained by the workers on their way out.
        for worker in &self.workers {
            for kind in crate::event::QUEUE_KINDS {
                while worker.queues.try_pop(kind).is_some() {}
            }
        }
    }
}

/// Handle to the network manager. Clones are counted references; the
/// manager shuts down once [`Manager::destroy`] is called (or every
/// reference is dropped) and all workers have exited.
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a manager with `config.workers` event-loop workers. Threads
    /// are spawned immediately, named `net-0`..`net-N`, and pinned when a
    /// CPU list is configured.
    pub fn new(config: Config) -> NetResult<Manager> {
        assert!(config.workers >= 1, "at least one worker is required");
        let nworkers = config.workers;

        let mut polls = Vec::with_capacity(nworkers);
        let mut workers = Vec::with_capacity(nworkers);
        for id in 0..nworkers {
            let poll = Poll::new()?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
            let registry = poll.registry().try_clone()?;
            workers.push(Arc::new(WorkerShared::new(id, waker, registry)));
            polls.push(poll);
        }

        let inner = Arc::new(ManagerInner {
            nworkers,
            refs: AtomicUsize::new(1),
            closing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            workers_paused: AtomicUsize::new(0),
            interlocked: AtomicIsize::new(NOT_INTERLOCKED),
            init_ms: AtomicU64::new(config.init_timeout_ms),
            idle_ms: AtomicU64::new(config.idle_timeout_ms),
            keepalive_ms: AtomicU64::new(config.keepalive_timeout_ms),
            advertised_ms: AtomicU64::new(config.advertised_timeout_ms),
            tcp_recv_buffer: AtomicI64::new(config.tcp_recv_buffer_size as i64),
            tcp_send_buffer: AtomicI64::new(config.tcp_send_buffer_size as i64),
            udp_recv_buffer: AtomicI64::new(config.udp_recv_buffer_size as i64),
            udp_send_buffer: AtomicI64::new(config.udp_send_buffer_size as i64),
            max_udp: AtomicUsize::new(config.max_udp_size),
            backlog: config.backlog,
            lock: Mutex::new(MgrState {
                workers_running: nworkers,
            }),
            wkstate: Condvar::new(),
            pausing: Barrier::new(nworkers),
            resuming: Barrier::new(nworkers),
            workers,
            threads: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            connect_rr: AtomicUsize::new(0),
        });

        let mut threads = Vec::with_capacity(nworkers);
        for (id, poll) in polls.into_iter().enumerate() {
            let mgr = inner.clone();
            let shared = inner.workers[id].clone();
            let cpu = if config.cpu_affinity.is_empty() {
                None
            } else {
                Some(config.cpu_affinity[id % config.cpu_affinity.len()])
            };
            let thread = std::thread::Builder::new()
                .name(format!("net-{id}"))
                .spawn(move || worker_main(mgr, shared, poll, cpu))
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }
        *inner.threads.lock() = threads;

        tracing::info!(workers = nworkers, "network manager started");
        Ok(Manager { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }

    pub(crate) fn enqueue(&self, tid: usize, event: Event) {
        self.inner.enqueue(tid, event);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Worker an outbound connection lands on: the calling worker when on
    /// a net thread, round-robin otherwise.
    pub(crate) fn choose_tid(&self) -> usize {
        if in_net_thread() {
            nm_tid() as usize
        } else {
            self.inner.connect_rr.fetch_add(1, Ordering::Relaxed) % self.inner.nworkers
        }
    }

    /// Number of workers in the pool.
    pub fn workers(&self) -> usize {
        self.inner.nworkers
    }

    /// Set the init/idle/keepalive/advertised timeouts, in milliseconds.
    pub fn set_timeouts(&self, init: u64, idle: u64, keepalive: u64, advertised: u64) {
        self.inner.init_ms.store(init, Ordering::Relaxed);
        self.inner.idle_ms.store(idle, Ordering::Relaxed);
        self.inner.keepalive_ms.store(keepalive, Ordering::Relaxed);
        self.inner.advertised_ms.store(advertised, Ordering::Relaxed);
    }

    /// Current (init, idle, keepalive, advertised) timeouts in
    /// milliseconds.
    pub fn timeouts(&self) -> (u64, u64, u64, u64) {
        (
            self.inner.init_ms.load(Ordering::Relaxed),
            self.inner.idle_ms.load(Ordering::Relaxed),
            self.inner.keepalive_ms.load(Ordering::Relaxed),
            self.inner.advertised_ms.load(Ordering::Relaxed),
        )
    }

    /// Set kernel receive/send buffer sizes applied to new sockets; zero
    /// keeps the OS defaults.
    pub fn set_net_buffers(&self, tcp_recv: usize, tcp_send: usize, udp_recv: usize, udp_send: usize) {
        self.inner.tcp_recv_buffer.store(tcp_recv as i64, Ordering::Relaxed);
        self.inner.tcp_send_buffer.store(tcp_send as i64, Ordering::Relaxed);
        self.inner.udp_recv_buffer.store(udp_recv as i64, Ordering::Relaxed);
        self.inner.udp_send_buffer.store(udp_send as i64, Ordering::Relaxed);
    }

    /// Cap outbound UDP datagrams at `size` bytes; larger sends are
    /// dropped as if truncated in flight. Zero disables the cap.
    pub fn set_max_udp(&self, size: usize) {
        self.inner.max_udp.store(size, Ordering::Relaxed);
    }

    /// Pause every worker. When this returns, no task or normal events are
    /// executing, and none will execute until [`Manager::resume`].
    ///
    /// May be called from a non-worker thread, or from worker zero (in
    /// which case resume must be called before the current callback
    /// returns).
    pub fn pause(&self) {
        let inner = &self.inner;
        assert!(!inner.paused.load(Ordering::Acquire), "manager already paused");

        inner.acquire_interlocked_force();

        if in_net_thread() {
            assert_eq!(nm_tid(), 0, "pause must come from worker zero");
        }

        for tid in 0..inner.nworkers {
            if tid as isize == nm_tid() {
                let worker = &inner.workers[tid];
                debug_assert!(!worker.paused.load(Ordering::Acquire));
                worker.paused.store(true, Ordering::Release);
            } else {
                self.enqueue(tid, Event::Pause);
            }
        }

        if in_net_thread() {
            inner.workers_paused.fetch_add(1, Ordering::AcqRel);
            if inner.pausing.wait().is_leader() {
                inner.signal_state();
            }
        }

        {
            let mut state = inner.lock.lock();
            while inner.workers_paused.load(Ordering::Acquire) != state.workers_running {
                inner.wkstate.wait(&mut state);
            }
        }

        let was = inner.paused.swap(true, Ordering::AcqRel);
        assert!(!was);
    }

    /// Resume workers paused by [`Manager::pause`] and release the
    /// interlock.
    pub fn resume(&self) {
        let inner = &self.inner;
        assert!(inner.paused.load(Ordering::Acquire), "manager not paused");

        if in_net_thread() {
            assert_eq!(nm_tid(), 0, "resume must come from worker zero");
        }

        for tid in 0..inner.nworkers {
            if tid as isize == nm_tid() {
                let worker = &inner.workers[tid];
                debug_assert!(worker.paused.load(Ordering::Acquire));
                worker.paused.store(false, Ordering::Release);
            } else {
                self.enqueue(tid, Event::Resume);
            }
        }

        if in_net_thread() {
            inner.workers_paused.fetch_sub(1, Ordering::AcqRel);
            if inner.resuming.wait().is_leader() {
                inner.signal_state();
            }
        }

        {
            let mut state = inner.lock.lock();
            while inner.workers_paused.load(Ordering::Acquire) != 0 {
                inner.wkstate.wait(&mut state);
            }
        }

        let was = inner.paused.swap(false, Ordering::AcqRel);
        assert!(was);

        inner.drop_interlocked();
    }

    /// Run a closure on a worker's task queue. Tasks run in enqueue order
    /// and are drained when the worker exits, but not while the manager is
    /// paused. `tid` of `None` picks a worker round-robin.
    pub fn task_enqueue(&self, tid: Option<usize>, task: impl FnOnce() + Send + 'static) {
        let tid = tid.map_or_else(|| self.choose_tid(), |t| t % self.inner.nworkers);
        self.enqueue(tid, Event::Task(Box::new(task)));
    }

    /// Like [`Manager::task_enqueue`], but on the privileged queue: these
    /// run before normal events whenever the manager resumes from a
    /// pause.
    pub fn privileged_task_enqueue(
        &self,
        tid: Option<usize>,
        task: impl FnOnce() + Send + 'static,
    ) {
        let tid = tid.map_or_else(|| self.choose_tid(), |t| t % self.inner.nworkers);
        self.enqueue(tid, Event::PrivilegedTask(Box::new(task)));
    }

    /// Begin closing: every worker walks its live sockets and issues
    /// variant-specific shutdown on each.
    pub fn shutdown(&self) {
        self.inner.shutdown_all();
    }

    /// Shut down, wait for outstanding references to drain, stop and join
    /// every worker, and release resources.
    pub fn destroy(self) {
        self.inner.destroy_inner(1);
        // Dropping self releases the final reference.
    }
}

impl Clone for Manager {
    fn clone(&self) -> Self {
        self.inner.attach_ref();
        Manager {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.inner.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last reference gone without an explicit destroy. Worker threads
        // must not tear the pool down from inside themselves.
        if !in_net_thread() {
            self.inner.destroy_inner(0);
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("workers", &self.inner.nworkers)
            .field("closing", &self.inner.closing.load(Ordering::Relaxed))
            .field("paused", &self.inner.paused.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_destroy() {
        let mgr = Manager::new(Config::with_workers(2)).unwrap();
        assert_eq!(mgr.workers(), 2);
        mgr.destroy();
    }

    #[test]
    fn test_timeouts_roundtrip() {
        let mgr = Manager::new(Config::with_workers(1)).unwrap();
        mgr.set_timeouts(100, 200, 300, 400);
        assert_eq!(mgr.timeouts(), (100, 200, 300, 400));
        mgr.destroy();
    }

    #[test]
    fn test_pause_resume_from_external_thread() {
        let mgr = Manager::new(Config::with_workers(2)).unwrap();
        for _ in 0..3 {
            mgr.pause();
            assert!(mgr.inner.paused.load(Ordering::Acquire));
            mgr.resume();
            assert!(!mgr.inner.paused.load(Ordering::Acquire));
        }
        mgr.destroy();
    }

    #[test]
    fn test_task_queue_runs_closures() {
        let mgr = Manager::new(Config::with_workers(1)).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        mgr.enqueue(
            0,
            Event::Task(Box::new(move || {
                tx.send(42u32).unwrap();
            })),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        mgr.destroy();
    }

    #[test]
    fn test_privileged_tasks_run_first_on_resume() {
        let mgr = Manager::new(Config::with_workers(2)).unwrap();
        mgr.pause();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (order_a, order_b) = (order.clone(), order.clone());
        mgr.task_enqueue(Some(0), move || order_a.lock().push("task"));
        mgr.privileged_task_enqueue(Some(0), move || order_b.lock().push("privileged"));

        std::thread::sleep(Duration::from_millis(200));
        assert!(order.lock().is_empty(), "tasks ran while paused");

        mgr.resume();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while order.lock().len() < 2 {
            assert!(std::time::Instant::now() < deadline, "tasks never ran");
            std::thread::sleep(Duration::from_millis(10));
        }
        // The privileged queue is drained before normal operation resumes,
        // even though it was enqueued second.
        assert_eq!(*order.lock(), vec!["privileged", "task"]);
        mgr.destroy();
    }

    #[test]
    fn test_pause_fences_task_events() {
        let mgr = Manager::new(Config::with_workers(2)).unwrap();
        mgr.pause();

        let (tx, rx) = std::sync::mpsc::channel();
        mgr.enqueue(
            0,
            Event::Task(Box::new(move || {
                tx.send(()).unwrap();
            })),
        );

        // While paused, the task queue does not run.
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        mgr.resume();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        mgr.destroy();
    }
}
