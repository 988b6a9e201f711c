use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RedisError {
    #[error("redis protocol error: {0}")]
    Protocol(String),
    #[error("redis server error: {0}")]
    Server(String),
    #[error("connection to redis lost")]
    Disconnected,
}
