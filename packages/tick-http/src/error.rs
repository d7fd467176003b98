use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Connecting to {host}:{port} failed: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("The peer closed the connection")]
    ConnectionClosed,
    #[error("Timed out waiting for data")]
    Timeout,
    #[error("Malformed start line: {0:?}")]
    BadStartLine(String),
    #[error("Malformed header line: {0:?}")]
    BadHeader(String),
    #[error("Header names must be tokens and values must be a single line")]
    ForbiddenHeaderChar,
    #[error("Malformed chunk size line: {0:?}")]
    BadChunkSize(String),
    #[error("A chunk payload must not be empty")]
    EmptyChunk,
    #[error("The reply body has already been consumed")]
    BodyConsumed,
    #[error("Header exceeds the configured buffer size")]
    HeaderOverflow,
    #[error("URL {0} has no usable host")]
    BadUrl(String),
}

impl HttpError {
    /// True for failures of the underlying transport rather than of the
    /// protocol framing carried over it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HttpError::Io { .. }
                | HttpError::ConnectFailed { .. }
                | HttpError::ConnectionClosed
                | HttpError::Timeout
        )
    }
}

pub type HttpResult<T> = Result<T, HttpError>;
