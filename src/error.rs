use crate::wire::alert::AlertDescription;

/// Crate-wide error taxonomy. Mirrors the cause categories a DTLS stack must
/// let callers distinguish: `HandshakeTimeout` is never reported as a
/// `HandshakeFailure`, replay/decrypt failures stay silent at the call site
/// and are only ever logged, never bubbled as an error a peer could probe.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("decode error at offset {offset}: {reason}")]
    DecodeError { offset: usize, reason: String },

    #[error("bad record MAC")]
    BadRecordMac,

    #[error("replay window rejected sequence number")]
    ReplayDropped,

    #[error("handshake timed out after exhausting retransmissions")]
    HandshakeTimeout,

    #[error("handshake failed: {0:?}")]
    HandshakeFailure(AlertDescription),

    #[error("peer closed the connection: {0}")]
    PeerClosed(String),

    #[error("connection store is at capacity")]
    ConnectionStoreFull,

    #[error("i/o error: {0}")]
    IoError(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("sequence number space exhausted")]
    SeqExhausted,

    #[error("unknown PSK identity")]
    UnknownPskIdentity,

    #[error("unsupported named curve")]
    UnsupportedCurve,

    #[error("no common cipher suite")]
    NoCipherSuiteOverlap,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

impl From<ring::error::Unspecified> for Error {
    fn from(_: ring::error::Unspecified) -> Self {
        Error::InternalError("cryptographic operation failed".to_owned())
    }
}

impl From<ring::error::KeyRejected> for Error {
    fn from(e: ring::error::KeyRejected) -> Self {
        Error::InternalError(format!("key rejected: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
