//! Error taxonomy for the protocol engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a front end or a remote peer can surface. None of these
/// are fatal: the engine keeps serving other peers after any of them.
#[derive(Debug, Error)]
pub enum Error {
    /// An expected response did not arrive within [`crate::IO_TIMEOUT`].
    #[error("operation timed out")]
    Timeout,

    /// Connection or transport failure talking to a peer or the tracker.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The named resource does not exist on this device.
    #[error("unknown resource: {0}")]
    NotFound(String),

    /// The named resource already exists on this device.
    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    /// A lock for the named resource is already WANTED or HELD here.
    #[error("resource already requested: {0}")]
    AlreadyRequested(String),

    /// The operation requires the lock to be HELD by this device.
    #[error("resource not held: {0}")]
    NotHeld(String),

    /// A frame or payload failed to parse per its header's schema. The
    /// offending message is logged and dropped, never propagated to peers.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
