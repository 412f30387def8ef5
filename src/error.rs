use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::member::MemberId;

/// Errors surfaced by the connection engine. The taxonomy matters to callers: transient
///  conditions are retried internally and never show up here, while everything below
///  requires a caller decision (re-dial, give up on the member, or unwind).
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer violated the wire protocol; the connection is closed with no retry.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The handshake waiter was woken by a close instead of a handshake.
    #[error("handshake cancelled: {0}")]
    HandshakeCancelled(String),

    #[error("timed out reading a direct-ack reply")]
    AckTimeout,

    /// This end decided the receiver is too slow and gave up on it.
    #[error("forced disconnect sent to {0:?}")]
    ForcedDisconnect(MemberId),

    #[error("connection to {remote:?} is closing: {reason}")]
    Closing { remote: Option<MemberId>, reason: String },

    #[error("member {0:?} left the group")]
    MemberLeft(MemberId),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Sockets get torn down all the time in a healthy cluster - peers restart, idle
///  connections are reaped on the far side, members are kicked. The OS reports all of
///  these with a handful of well-known signatures that warrant debug logging at most.
pub fn is_ignorable_io_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => true,
        _ => {
            let msg = e.to_string();
            msg.contains("forcibly closed")
                || msg.contains("reset by peer")
                || msg.contains("connection reset")
                || msg.contains("closed channel")
        }
    }
}

impl ConnectionError {
    /// protocol errors and forced disconnects must not trigger a re-dial of the peer
    pub fn is_fatal_for_endpoint(&self) -> bool {
        matches!(self, ConnectionError::Protocol(_) | ConnectionError::ForcedDisconnect(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::reset(io::ErrorKind::ConnectionReset, true)]
    #[case::aborted(io::ErrorKind::ConnectionAborted, true)]
    #[case::broken_pipe(io::ErrorKind::BrokenPipe, true)]
    #[case::eof(io::ErrorKind::UnexpectedEof, true)]
    #[case::refused(io::ErrorKind::ConnectionRefused, false)]
    #[case::other(io::ErrorKind::Other, false)]
    fn test_ignorable_by_kind(#[case] kind: io::ErrorKind, #[case] expected: bool) {
        assert_eq!(is_ignorable_io_error(&io::Error::new(kind, "boom")), expected);
    }

    #[rstest]
    #[case::forcibly("An existing connection was forcibly closed by the remote host", true)]
    #[case::reset_by_peer("Connection reset by peer (os error 104)", true)]
    #[case::unrelated("no route to host", false)]
    fn test_ignorable_by_message(#[case] msg: &str, #[case] expected: bool) {
        assert_eq!(is_ignorable_io_error(&io::Error::other(msg)), expected);
    }
}
