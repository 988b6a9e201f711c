use thiserror::Error;

/// Parser-level failures.  Any of these closes the connection; the protocol
/// layer answers with a 400/413 first when the response has not started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed header line")]
    BadHeader,
    #[error("conflicting content-length headers")]
    ContentLengthConflict,
    #[error("malformed chunked encoding")]
    BadChunk,
    #[error("headers exceed the configured limit")]
    HeadersTooLarge,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("body exceeds the configured limit")]
    BodyTooLarge,
    #[error("callback rejected the request")]
    Rejected,
}

impl ParseError {
    /// The status the protocol sends before closing, when still possible.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::HeadersTooLarge
            | ParseError::TooManyHeaders
            | ParseError::BodyTooLarge => 413,
            _ => 400,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("not a websocket upgrade request")]
    NotWebSocket,
    #[error("unsupported websocket version")]
    WebSocketVersion,
    #[error("response already sent")]
    AlreadySent,
    #[error(transparent)]
    Core(#[from] brisk_core::CoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
