//! Cross-thread events delivered to worker queues.

use std::sync::Arc;

use crate::handle::HandleCore;
use crate::quota::QuotaGuard;
use crate::request::Request;
use crate::result::NetResult;
use crate::socket::{OwnedSocket, RecvFn, SockRef};

/// A closure run on a worker via the task queues.
pub(crate) type TaskFn = Box<dyn FnOnce() + Send>;

/// Queue classes, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    /// Runs even while the worker is paused: pause/resume/stop/shutdown
    /// and listener start/stop.
    Priority = 0,
    /// Drained by every worker before it resumes from a pause, and on
    /// worker exit.
    Privileged = 1,
    /// Drained on worker exit so shutdown tasks still run.
    Task = 2,
    /// User I/O callbacks and socket control events.
    Normal = 3,
}

pub(crate) const QUEUE_KINDS: [QueueKind; 4] = [
    QueueKind::Priority,
    QueueKind::Privileged,
    QueueKind::Task,
    QueueKind::Normal,
];

/// The netmgr event vocabulary. Every cross-thread operation on a socket
/// is expressed as one of these, posted to the owning worker.
pub(crate) enum Event {
    // Priority class.
    Stop,
    Pause,
    Resume,
    Shutdown,
    /// Register a fully-constructed listener child with its worker.
    Listen(Box<OwnedSocket>),
    StopListening(SockRef),

    // Task classes.
    PrivilegedTask(TaskFn),
    Task(TaskFn),

    // Normal class.
    /// Initiate an outbound connection (the owned half carries the
    /// still-unconnected socket).
    Connect(Box<OwnedSocket>, Box<Request>),
    /// Install a read callback (when given) and start reading.
    Read(SockRef, Option<RecvFn>),
    Send(SockRef, Box<Request>),
    Cancel(SockRef),
    PauseRead(SockRef),
    ResumeRead(SockRef),
    TimerRestart(SockRef),
    Close(SockRef),
    /// Final release of a handle posted from a non-owning thread; the
    /// `Arc` itself is the implicit reference.
    Detach(Arc<HandleCore>),
    /// Deferred accept granted by the quota.
    Accept(SockRef, QuotaGuard),
    /// Kick the TLS cycle pump.
    TlsCycle(SockRef),
    /// A handle was released on a socket that paused its stream; pick the
    /// reassembly buffer back up.
    ResumeProcessing(SockRef),
    /// Deferred connect-completion callback.
    ConnectCb(Box<Request>, NetResult<()>),
    /// Deferred send-completion callback.
    SendCb(Box<Request>, NetResult<()>),
}

impl Event {
    pub(crate) fn class(&self) -> QueueKind {
        match self {
            Event::Stop
            | Event::Pause
            | Event::Resume
            | Event::Shutdown
            | Event::Listen(_)
            | Event::StopListening(_) => QueueKind::Priority,
            Event::PrivilegedTask(_) => QueueKind::Privileged,
            Event::Task(_) => QueueKind::Task,
            _ => QueueKind::Normal,
        }
    }

    /// Events that suspend queue processing for the rest of the dispatch
    /// round (the worker is pausing or stopping).
    pub(crate) fn suspends(&self) -> bool {
        matches!(self, Event::Stop | Event::Pause)
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Event::Stop => "stop",
            Event::Pause => "pause",
            Event::Resume => "resume",
            Event::Shutdown => "shutdown",
            Event::Listen(_) => "listen",
            Event::StopListening(_) => "stoplistening",
            Event::PrivilegedTask(_) => "privilegedtask",
            Event::Task(_) => "task",
            Event::Connect(..) => "connect",
            Event::Read(..) => "read",
            Event::Send(..) => "send",
            Event::Cancel(_) => "cancel",
            Event::PauseRead(_) => "pauseread",
            Event::ResumeRead(_) => "resumeread",
            Event::TimerRestart(_) => "timerrestart",
            Event::Close(_) => "close",
            Event::Detach(_) => "detach",
            Event::Accept(..) => "accept",
            Event::TlsCycle(_) => "tlscycle",
            Event::ResumeProcessing(_) => "resumeprocessing",
            Event::ConnectCb(..) => "connectcb",
            Event::SendCb(..) => "sendcb",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(Event::Stop.class(), QueueKind::Priority);
        assert_eq!(Event::Shutdown.class(), QueueKind::Priority);
        assert_eq!(
            Event::Task(Box::new(|| {})).class(),
            QueueKind::Task
        );
        assert_eq!(
            Event::PrivilegedTask(Box::new(|| {})).class(),
            QueueKind::Privileged
        );
    }

    #[test]
    fn test_suspends() {
        assert!(Event::Stop.suspends());
        assert!(Event::Pause.suspends());
        assert!(!Event::Resume.suspends());
        assert!(!Event::Shutdown.suspends());
    }
}
