//! Result codes delivered to user callbacks and internal control outcomes.

use std::io;

/// Errors reported by the network manager.
///
/// User-supplied callbacks always receive an explicit result; the manager
/// never panics across the callback boundary. Operating-system errors are
/// translated once, at the I/O boundary, into the `Io` variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// The operation was canceled, either explicitly or because the
    /// manager or socket is shutting down.
    #[error("operation canceled")]
    Canceled,

    /// A connect or read timer expired before the operation completed.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed the stream cleanly.
    #[error("end of stream")]
    Eof,

    /// The peer aborted the connection during accept.
    #[error("peer not connected")]
    NotConnected,

    /// Admission control rejected the connection outright.
    #[error("connection quota exceeded")]
    Quota,

    /// Admission control is over its soft limit; the connection was
    /// admitted but should be treated as expendable.
    #[error("connection quota soft limit exceeded")]
    SoftQuota,

    /// The TLS engine reported a fatal error.
    #[error("TLS error")]
    Tls,

    /// The operating system ran out of descriptors or buffers.
    #[error("out of resources")]
    NoResources,

    /// The requested address family is not supported on this host.
    #[error("address family not supported")]
    FamilyNotSupported,

    /// An optional platform feature (typically a socket option) is not
    /// available; the socket itself remains usable.
    #[error("not implemented on this platform")]
    NotImplemented,

    /// A fault that should not occur in correct usage.
    #[error("unexpected failure")]
    Unexpected,

    /// An operating-system error, reduced to its kind.
    #[error("i/o error: {0:?}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => NetError::TimedOut,
            io::ErrorKind::UnexpectedEof => NetError::Eof,
            io::ErrorKind::NotConnected => NetError::NotConnected,
            io::ErrorKind::ConnectionRefused => NetError::NotConnected,
            io::ErrorKind::OutOfMemory => NetError::NoResources,
            kind => NetError::Io(kind),
        }
    }
}

impl NetError {
    /// Translate the last OS error after a failed libc call.
    pub(crate) fn last_os_error() -> Self {
        io::Error::last_os_error().into()
    }
}

pub type NetResult<T> = Result<T, NetError>;

/// Outcome of draining one event queue for one dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOutcome {
    /// Nothing was scheduled.
    Empty,
    /// At least one event was processed, or an enqueue was counted but the
    /// item was not yet visible; the dispatcher should be re-armed.
    Progress,
    /// A stop or pause event was processed; remaining queues must not be
    /// touched this round.
    Suspend,
}

/// Outcome of scanning the stream reassembly buffer for one DNS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferOutcome {
    /// One full message was delivered to the read callback.
    Delivered,
    /// Fewer than `length-prefix + 2` bytes are buffered; not an error.
    NoMore,
    /// The socket is closing; stop processing.
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_translation() {
        let e: NetError = io::Error::new(io::ErrorKind::TimedOut, "t").into();
        assert_eq!(e, NetError::TimedOut);

        let e: NetError = io::Error::new(io::ErrorKind::UnexpectedEof, "e").into();
        assert_eq!(e, NetError::Eof);

        let e: NetError = io::Error::new(io::ErrorKind::ConnectionReset, "r").into();
        assert_eq!(e, NetError::Io(io::ErrorKind::ConnectionReset));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(NetError::TimedOut.to_string(), "operation timed out");
        assert_eq!(NetError::Eof.to_string(), "end of stream");
    }
}
