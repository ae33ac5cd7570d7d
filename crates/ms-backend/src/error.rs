use thiserror::Error;

/// Failure while decoding one event or reading the response body.
///
/// Decode failures are per event: the session reports them and keeps going.
/// Transport failures end the session.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid event payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("event payload has no `type` field")]
    MissingType,
    #[error("tool input for block {index} is not a single JSON value: {source}")]
    ToolInput {
        index: u32,
        source: serde_json::Error,
    },
}

impl StreamError {
    /// Whether the session can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StreamError::Http(_) | StreamError::Io(_))
    }
}
