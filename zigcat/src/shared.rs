use std::io;
use std::net;

pub type RelayResult<T> = Result<T, RelayError>;

/// Two-level error plumbing for all relay paths. `Wait` means the operation
/// would block and should be retried once readiness returns; everything that
/// actually terminates a direction, a client or a session is `Fatal`.
#[derive(Debug, Eq, PartialEq)]
pub enum RelayError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    PeerClosed,
    MessageTooLong,
    BufferOverflow,
    InvalidNickname,
    TooManyAttempts,
    SubnegOverflow,
    AccessDenied,
    PoolExhausted,
    FlowControlActive,
    FlowCapExceeded,
    Timeout(TimeoutKind),
    ChildSpawn(io::ErrorKind),
    Unsupported,
    AddrParse,
    Io(io::ErrorKind),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeoutKind {
    Execution,
    Idle,
    Connection,
}

impl From<io::Error> for RelayError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => RelayError::Wait,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => RelayError::Fatal(ErrorKind::PeerClosed),
            kind => RelayError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for RelayError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        RelayError::Fatal(ErrorKind::AddrParse)
    }
}

pub trait ErrorUtils {
    /// True only for fatal outcomes; `Ok` and `Wait` both count as alive.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for RelayResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(RelayError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: RelayError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, RelayError::Wait);

        let err: RelayError = io::Error::from(io::ErrorKind::Interrupted).into();
        assert_eq!(err, RelayError::Wait);
    }

    #[test]
    fn test_peer_disconnects_fold_to_peer_closed() {
        for kind in &[
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            let err: RelayError = io::Error::from(*kind).into();
            assert_eq!(err, RelayError::Fatal(ErrorKind::PeerClosed));
        }
    }

    #[test]
    fn test_other_io_errors_keep_their_kind() {
        let err: RelayError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(
            err,
            RelayError::Fatal(ErrorKind::Io(io::ErrorKind::PermissionDenied))
        );
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), RelayError>(()).has_failed());
        assert!(!Err::<(), _>(RelayError::Wait).has_failed());
        assert!(Err::<(), _>(RelayError::Fatal(ErrorKind::PeerClosed)).has_failed());
    }
}
