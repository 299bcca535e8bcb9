//! Error and disconnect types shared across the session layers.

use std::fmt;
use std::io;

use crate::messages::{Role, SnapshotError, UnitId};

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its end of the stream.
    RemoteClosed,
    /// The connection was reset or aborted by the peer or the network.
    Reset,
    /// The connection stopped making progress.
    TimedOut,
    /// Any other I/O failure.
    Io(String),
    /// Too many protocol violations from the peer.
    Protocol(String),
    /// The peer announced it was leaving.
    PeerLeft(String),
    /// Closed locally.
    Local,
}

impl DisconnectReason {
    /// Map an I/O error observed on a live connection to a reason.
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => DisconnectReason::Reset,
            io::ErrorKind::TimedOut => DisconnectReason::TimedOut,
            io::ErrorKind::UnexpectedEof => DisconnectReason::RemoteClosed,
            _ => DisconnectReason::Io(err.to_string()),
        }
    }

    /// Whether the connection was lost without either side meaning to end it.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            DisconnectReason::RemoteClosed
                | DisconnectReason::Reset
                | DisconnectReason::TimedOut
                | DisconnectReason::Io(_)
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::RemoteClosed => f.write_str("remote-closed"),
            DisconnectReason::Reset => f.write_str("reset"),
            DisconnectReason::TimedOut => f.write_str("timed-out"),
            DisconnectReason::Io(detail) => write!(f, "io: {detail}"),
            DisconnectReason::Protocol(detail) => write!(f, "protocol: {detail}"),
            DisconnectReason::PeerLeft(reason) => write!(f, "peer-left: {reason}"),
            DisconnectReason::Local => f.write_str("local"),
        }
    }
}

/// Category of a session error reported to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    Bind,
    Connect,
    Handshake,
    Protocol,
    Sync,
    Disconnect,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionErrorKind::Bind => "bind",
            SessionErrorKind::Connect => "connect",
            SessionErrorKind::Handshake => "handshake",
            SessionErrorKind::Protocol => "protocol",
            SessionErrorKind::Sync => "sync",
            SessionErrorKind::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// The engine could not apply a remote action or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// An action referred to a unit the local board does not have.
    #[error("unknown unit {0}")]
    UnknownUnit(UnitId),

    /// A snapshot could not be read.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// The snapshot disagrees with the roles fixed at connect time.
    #[error("snapshot says host is {asserted}, expected {expected}")]
    RoleMismatch {
        /// Role this session assigned to the host.
        expected: Role,
        /// Role the snapshot claimed.
        asserted: Role,
    },

    /// The engine refused the action for its own reasons.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<SnapshotError> for SyncError {
    fn from(err: SnapshotError) -> Self {
        SyncError::InvalidSnapshot(err.to_string())
    }
}
