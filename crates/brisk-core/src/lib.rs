//! brisk-core: the evented socket reactor.
//!
//! Owns every live socket behind a generation-tagged [`ConnId`], multiplexes
//! readiness through per-connection tasks, runs [`Protocol`] callbacks under
//! per-connection serialization, schedules deferred work, and coordinates
//! graceful shutdown and worker supervision.
//!
//! Higher layers (HTTP, WebSocket, pub/sub, Redis) are separate crates built
//! on this one; nothing here knows about any particular wire protocol.

mod conn;
mod error;
mod lifecycle;
mod protocol;
mod reactor;
mod tls;
mod workers;
mod write;

pub use conn::{Conn, ConnId, IoTask};
pub use error::CoreError;
pub use lifecycle::StateEvent;
pub use protocol::Protocol;
pub use reactor::{
    ConnectOptions, Listener, ListenOptions, ProtocolFactory, Reactor, ReactorSettings,
};
pub use tls::{Duplex, IoStream, Tls, TlsProvider};
pub use workers::{ROOT_PID_ENV, StartOptions, WORKER_ENV, is_worker_process, root_pid, start};
pub use write::OutChunk;
