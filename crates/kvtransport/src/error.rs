use thiserror::Error;

/// Errors surfaced by connections, pools and the dispatcher.
///
/// Whether a variant is retried is decided by the dispatcher's registered
/// [`RetryClassifier`](crate::RetryClassifier)s; `Io` is always transient.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The binary protocol socket was closed by the peer mid-request.
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("bad HTTP status line: {0}")]
    BadStatusLine(String),

    #[error("cannot send HTTP request: {0}")]
    CannotSendRequest(String),

    /// A well-formed error reply from the database.
    #[error("server error: {0}")]
    Server(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no nodes available")]
    NoNodes,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
