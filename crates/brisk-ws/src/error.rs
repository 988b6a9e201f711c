use thiserror::Error;

/// Framing and protocol violations.  All of them are fatal for the
/// connection that produced them — and only for that connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WsError {
    #[error("reserved opcode {0:#x}")]
    BadOpcode(u8),
    #[error("client frame arrived unmasked")]
    MissingMask,
    #[error("server frame arrived masked")]
    UnexpectedMask,
    #[error("control frame fragmented or over 125 bytes")]
    BadControlFrame,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),
    #[error("assembled message exceeds the {0} byte limit")]
    MessageTooLarge(usize),
    #[error("continuation frame without a message in progress")]
    StrayContinuation,
    #[error("data frame interleaved inside a fragmented message")]
    InterleavedMessage,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WsError {
    fn from(err: std::io::Error) -> Self {
        WsError::Io(err.to_string())
    }
}
