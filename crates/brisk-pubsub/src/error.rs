use thiserror::Error;

/// Failures at the bus's wire boundary (the cluster mesh codec).
///
/// In-process routing cannot fail: publishing to a channel nobody holds is
/// a no-op and dead subscribers are dropped silently.  What can fail is the
/// framing between processes — a frame that never fits its header, a
/// channel name too long for the 16-bit length field, or a body shorter
/// than its declared layout.
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("cluster frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("channel name exceeds the 16-bit length field")]
    ChannelTooLong,
    #[error("cluster frame truncated: {0}")]
    Truncated(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
