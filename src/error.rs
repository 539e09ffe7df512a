use thiserror::Error;

use crate::wire::Status;

/// A Gungnir Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Gungnir errors.
#[derive(Debug, Error)]
pub enum Error {
    /// An IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end closed the connection. The framing layer matches on
    /// this to distinguish orderly shutdown from transport faults.
    #[error("connection closed by peer")]
    PeerClosed,

    /// A transport-level failure other than peer close (failed send,
    /// refused connection, self-connect).
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or oversize wire data, unknown opcodes, short payloads.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The server answered with a non-OK status.
    #[error("request failed with status {0:?}")]
    Rpc(Status),

    /// The session was aborted; all pending requests have been failed.
    #[error("session aborted")]
    SessionAborted,
}

impl Error {
    /// True when retrying the operation on a fresh session could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::PeerClosed | Error::SessionAborted | Error::Rpc(Status::Retry))
    }
}
