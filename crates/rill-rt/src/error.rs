// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error kinds.
//!
//! I/O operations return `Result<T, ErrorKind>` — no panics on hot paths.
//! Each kind maps to a stable integer code for user inspection; raw OS
//! errors that have no dedicated kind are carried through as `Os(errno)`.

use thiserror::Error;

/// Error kinds surfaced by reactor, timer, and socket operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation was cancelled or its registration was torn down.
    #[error("operation aborted")]
    OperationAborted,

    /// A timeout combinator observed its own timer fire.
    #[error("operation timed out")]
    TimedOut,

    /// The peer closed the connection (read side).
    #[error("end of file")]
    Eof,

    /// Write on a socket whose write side is shut down.
    #[error("broken pipe")]
    BrokenPipe,

    /// The connection was reset by the peer.
    #[error("connection reset")]
    ConnectionReset,

    /// The object has no open file descriptor.
    #[error("not open")]
    NotOpen,

    /// Stream operation on a socket that is not connected.
    #[error("not connected")]
    NotConnected,

    /// Accept on an acceptor that is not listening.
    #[error("not listening")]
    NotListening,

    /// Receive on a datagram socket with no local address.
    #[error("not bound")]
    NotBound,

    /// Connect on an already-connected socket.
    #[error("already connected")]
    AlreadyConnected,

    /// A conflicting operation is already in flight.
    #[error("busy")]
    Busy,

    /// An argument failed validation.
    #[error("invalid argument")]
    InvalidArgument,

    /// An endpoint could not be parsed or encoded.
    #[error("invalid endpoint")]
    InvalidEndpoint,

    /// The endpoint's address family is not supported by the socket.
    #[error("unsupported address family")]
    UnsupportedAddressFamily,

    /// A datagram did not fit the provided buffer or the send limit.
    #[error("message size")]
    MessageSize,

    /// Unclassified OS error (raw errno).
    #[error("os error {0}")]
    Os(i32),
}

impl ErrorKind {
    /// Stable integer code. `Os(errno)` maps to `1000 + errno`.
    pub fn code(self) -> i32 {
        match self {
            Self::OperationAborted => 1,
            Self::TimedOut => 2,
            Self::Eof => 3,
            Self::BrokenPipe => 4,
            Self::ConnectionReset => 5,
            Self::NotOpen => 6,
            Self::NotConnected => 7,
            Self::NotListening => 8,
            Self::NotBound => 9,
            Self::AlreadyConnected => 10,
            Self::Busy => 11,
            Self::InvalidArgument => 12,
            Self::InvalidEndpoint => 13,
            Self::UnsupportedAddressFamily => 14,
            Self::MessageSize => 15,
            Self::Os(errno) => 1000 + errno,
        }
    }

    /// Map a raw errno to the closest kind.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECANCELED => Self::OperationAborted,
            libc::ETIMEDOUT => Self::TimedOut,
            libc::EPIPE => Self::BrokenPipe,
            libc::ECONNRESET => Self::ConnectionReset,
            libc::EBADF => Self::NotOpen,
            libc::ENOTCONN => Self::NotConnected,
            libc::EISCONN => Self::AlreadyConnected,
            libc::EINVAL => Self::InvalidArgument,
            libc::EAFNOSUPPORT => Self::UnsupportedAddressFamily,
            libc::EMSGSIZE => Self::MessageSize,
            other => Self::Os(other),
        }
    }

    /// The calling thread's current errno, mapped.
    pub fn last_os_error() -> Self {
        Self::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::OperationAborted.code(), 1);
        assert_eq!(ErrorKind::TimedOut.code(), 2);
        assert_eq!(ErrorKind::MessageSize.code(), 15);
        assert_eq!(ErrorKind::Os(libc::ENOENT).code(), 1000 + libc::ENOENT);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(ErrorKind::from_errno(libc::EPIPE), ErrorKind::BrokenPipe);
        assert_eq!(
            ErrorKind::from_errno(libc::ECONNRESET),
            ErrorKind::ConnectionReset
        );
        assert_eq!(
            ErrorKind::from_errno(libc::ECANCELED),
            ErrorKind::OperationAborted
        );
        assert_eq!(ErrorKind::from_errno(libc::ENOSPC), ErrorKind::Os(libc::ENOSPC));
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(ErrorKind::Busy.to_string(), "busy");
        assert_eq!(ErrorKind::Eof.to_string(), "end of file");
    }
}
