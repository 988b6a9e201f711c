use thiserror::Error;

/// Errors surfaced by reactor operations.
///
/// Transient socket conditions (would-block, EINTR) never reach the caller;
/// they are retried inside the connection task.  A stale [`ConnId`] is not an
/// error for fire-and-forget operations (`write`, `close`) — those are logged
/// no-ops — but handle-returning operations report it.
///
/// [`ConnId`]: crate::ConnId
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("bind failed for {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect failed for {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("stale connection handle")]
    StaleHandle,

    #[error("TLS requested but no provider is configured")]
    TlsUnavailable,

    #[error("reactor is shutting down")]
    ShuttingDown,

    #[error("worker spawn failed: {0}")]
    WorkerSpawn(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
