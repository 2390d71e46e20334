use std::io;

use thiserror::Error;

/// Result type for broker operations
pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

/// Errors that can occur while brokering executions
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("unknown namespace \"{0}\"")]
    NamespaceUnknown(String),

    #[error("namespace \"{0}\" already registered")]
    NamespaceAlreadyRegistered(String),

    #[error("locking namespace \"{0}\" failed")]
    LockAcquisitionFailed(String),

    #[error("no connection to namespace \"{0}\"")]
    RemoteUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("disconnected")]
    Disconnected,

    #[error("invalid result id: \"{0}\"")]
    InvalidResultId(String),

    #[error("remote code raised: {0}")]
    RemoteExec(String),

    #[error("remote expression raised: {0}")]
    RemoteEval(String),

    #[error("namespace operation failed: {0}")]
    NamespaceOperation(String),

    #[error("invalid host spec \"{0}\"")]
    InvalidHostSpec(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BrokerError {
    /// Whether the error means the peer on the other end of a channel is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::RemoteUnavailable(_))
    }
}

/// Map a transport error to `Disconnected`.
///
/// Any failure on a channel's byte stream leaves its framing in an unknown
/// state, so callers treat it the same way as end-of-stream.
pub(crate) fn disconnected(err: io::Error) -> BrokerError {
    tracing::trace!(error = %err, "channel transport error");
    BrokerError::Disconnected
}
