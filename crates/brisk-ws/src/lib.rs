//! brisk-ws: RFC 6455 framing, WebSocket connections, and EventSource.
//!
//! Sits on top of the HTTP upgrade gateway: `upgrade` answers the handshake
//! and swaps the connection's protocol to the framing layer.  The pub/sub
//! bridge turns bus subscriptions into direct socket writes, with optional
//! once-per-message pre-wrapping shared across every recipient.

mod broadcast;
mod conn;
mod error;
mod frame;
pub mod sse;

pub use broadcast::{BroadcastMode, optimize_broadcasts, optimize_broadcasts_on};
pub use conn::{WsConn, WsHandle, WsSettings, WsSubscribeOptions, upgrade};
pub use error::WsError;
pub use frame::{Frame, FrameCodec, OpCode, WRITE_FRAGMENT, wrap_message, write_frame};
pub use sse::{SseConn, SseEvent, SseHandle, SseSettings, SseSubscribeOptions};
