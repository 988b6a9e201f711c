//! WebSocket connections: upgrade, reassembly, control frames, and the
//! pub/sub bridge.
//!
//! The protocol sits directly on a reactor connection after the HTTP 101
//! handshake.  Fragmented messages reassemble above the codec, bounded by
//! the listener's `ws_max_msg_size`; pings are answered in kind; an idle
//! timeout sends a zero-length ping.  Subscriptions made through a
//! connection die with it — they are cancelled before the user's `on_close`
//! runs.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use brisk_core::{Conn, ConnId, Protocol, Reactor};
use brisk_http::{HttpError, HttpRequest};
use brisk_pubsub::{Bus, Message, SubscribeOptions, Subscription};

use crate::broadcast::{BroadcastMode, metadata_kind};
use crate::error::WsError;
use crate::frame::{Frame, FrameCodec, OpCode, wrap_message, write_frame};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

type OnOpen = Box<dyn FnOnce(&mut WsConn<'_, '_>) + Send>;
type OnMessage = Arc<dyn Fn(&mut WsConn<'_, '_>, Bytes, bool) + Send + Sync>;
type OnEvent = Arc<dyn Fn(&mut WsConn<'_, '_>) + Send + Sync>;
type OnClose = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct WsSettings {
    pub on_open: Option<OnOpen>,
    /// `(conn, payload, is_text)` per completed message.
    pub on_message: Option<OnMessage>,
    pub on_ready: Option<OnEvent>,
    pub on_shutdown: Option<OnEvent>,
    /// Fires exactly once, after the connection's subscriptions are gone.
    pub on_close: Option<OnClose>,
    /// 0 inherits the HTTP listener's `ws_max_msg_size`.
    pub max_msg_size: usize,
    /// 0 inherits the HTTP listener's `ws_timeout`.
    pub timeout: u32,
}

/// Answer a WebSocket upgrade request: validate the handshake, emit
/// `101 Switching Protocols`, and hand the socket (with any buffered bytes)
/// to the framing layer.  A failed handshake is answered with 400/426.
pub fn upgrade(req: HttpRequest, settings: WsSettings) {
    let accept = match req.websocket_accept() {
        Ok(accept) => accept,
        Err(HttpError::WebSocketVersion) => {
            let mut req = req;
            req.set_header("sec-websocket-version", &b"13"[..]);
            req.reply(426, "Upgrade Required");
            return;
        }
        Err(_) => {
            req.reply(400, "Bad Request");
            return;
        }
    };

    let http = req.settings().clone();
    let max_msg = if settings.max_msg_size == 0 {
        http.ws_max_msg_size
    } else {
        settings.max_msg_size
    };
    let timeout = if settings.timeout == 0 {
        http.ws_timeout
    } else {
        settings.timeout
    };

    let head = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    let proto = WsProtocol::new(settings, false, max_msg, timeout);
    req.upgrade(head.into_bytes(), Box::new(proto));
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A cheap, cloneable way to write to a WebSocket from anywhere (pub/sub
/// callbacks, timers, other tasks).  Writes on a dead connection are
/// silently dropped.
#[derive(Clone)]
pub struct WsHandle {
    reactor: Reactor,
    id: ConnId,
    is_client: bool,
}

impl WsHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.reactor.is_valid(self.id)
    }

    pub fn write_text(&self, payload: impl AsRef<[u8]>) {
        self.reactor
            .write(self.id, wrap_message(payload.as_ref(), true, self.is_client));
    }

    pub fn write_binary(&self, payload: impl AsRef<[u8]>) {
        self.reactor
            .write(self.id, wrap_message(payload.as_ref(), false, self.is_client));
    }

    /// Write pre-framed bytes (the broadcast fast path).
    pub fn write_raw(&self, frame: Bytes) {
        self.reactor.write(self.id, frame);
    }

    pub fn close(&self) {
        let mut buf = BytesMut::new();
        let mask = self.is_client.then(rand::random::<[u8; 4]>);
        write_frame(&mut buf, b"", OpCode::Close, true, false, mask);
        self.reactor.write(self.id, buf.freeze());
        self.reactor.close(self.id);
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

pub struct WsSubscribeOptions {
    pub channel: Bytes,
    pub is_pattern: bool,
    pub filter: i32,
    /// Custom delivery; `None` writes the message straight to the socket.
    pub on_message: Option<Arc<dyn Fn(&WsHandle, &Message) + Send + Sync>>,
    pub on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
    /// Direct-write framing mode; `Auto` sniffs UTF-8 with a size cutoff.
    pub mode: BroadcastMode,
}

impl WsSubscribeOptions {
    pub fn channel(channel: impl Into<Bytes>) -> Self {
        WsSubscribeOptions {
            channel: channel.into(),
            is_pattern: false,
            filter: 0,
            on_message: None,
            on_unsubscribe: None,
            mode: BroadcastMode::Auto,
        }
    }

    pub fn pattern(pattern: impl Into<Bytes>) -> Self {
        let mut opts = Self::channel(pattern);
        opts.is_pattern = true;
        opts
    }

    pub fn mode(mut self, mode: BroadcastMode) -> Self {
        self.mode = mode;
        self
    }
}

fn bridge_subscription(bus: &Bus, handle: WsHandle, opts: WsSubscribeOptions) -> Subscription {
    let mode = opts.mode;
    let on_message: brisk_pubsub::OnMessage = match opts.on_message {
        Some(user) => {
            let handle = handle.clone();
            Arc::new(move |msg: &Message| user(&handle, msg))
        }
        None => Arc::new(move |msg: &Message| {
            // Prefer the pre-wrapped representation computed once per
            // message; masking makes it unusable for client-mode sockets.
            if !handle.is_client {
                if let Some(wrapped) = msg.metadata(metadata_kind(mode)) {
                    handle.write_raw(wrapped.clone());
                    return;
                }
            }
            let is_text = match mode {
                BroadcastMode::Text => true,
                BroadcastMode::Binary => false,
                BroadcastMode::Auto => sniff_text(&msg.payload),
            };
            handle.write_raw(wrap_message(&msg.payload, is_text, handle.is_client));
        }),
    };

    bus.subscribe(SubscribeOptions {
        filter: opts.filter,
        channel: opts.channel,
        is_pattern: opts.is_pattern,
        matcher: None,
        on_message,
        on_unsubscribe: opts.on_unsubscribe,
    })
}

/// Autodetect cutoff: large payloads are assumed binary without scanning.
pub(crate) fn sniff_text(payload: &[u8]) -> bool {
    payload.len() < (2 << 14) && std::str::from_utf8(payload).is_ok()
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

struct WsState {
    subscriptions: Vec<Subscription>,
    is_client: bool,
}

pub(crate) struct WsProtocol {
    codec: FrameCodec,
    buf: BytesMut,
    /// In-progress fragmented message: text flag + accumulated payload.
    fragments: Option<(bool, BytesMut)>,
    max_msg: usize,
    timeout: u32,
    close_sent: bool,
    state: WsState,
    on_open: Option<OnOpen>,
    on_message: Option<OnMessage>,
    on_ready: Option<OnEvent>,
    on_shutdown_cb: Option<OnEvent>,
    on_close_cb: Option<OnClose>,
}

impl WsProtocol {
    pub fn new(settings: WsSettings, is_client: bool, max_msg: usize, timeout: u32) -> Self {
        WsProtocol {
            codec: if is_client {
                FrameCodec::client()
            } else {
                FrameCodec::server()
            },
            buf: BytesMut::new(),
            fragments: None,
            max_msg,
            timeout,
            close_sent: false,
            state: WsState {
                subscriptions: Vec::new(),
                is_client,
            },
            on_open: settings.on_open,
            on_message: settings.on_message,
            on_ready: settings.on_ready,
            on_shutdown_cb: settings.on_shutdown,
            on_close_cb: settings.on_close,
        }
    }

    fn control_frame(&self, opcode: OpCode, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        let mask = self.state.is_client.then(rand::random::<[u8; 4]>);
        write_frame(&mut buf, payload, opcode, true, false, mask);
        buf.freeze()
    }

    fn fail(&mut self, conn: &mut Conn<'_>, err: &WsError) {
        debug!(conn = %conn.id(), %err, "websocket protocol violation");
        if !self.close_sent {
            let frame = self.control_frame(OpCode::Close, b"");
            conn.write(frame);
            self.close_sent = true;
        }
        conn.close();
    }

    fn deliver(&mut self, conn: &mut Conn<'_>, payload: Bytes, is_text: bool) {
        if let Some(cb) = self.on_message.clone() {
            let mut ws = WsConn {
                conn,
                state: &mut self.state,
            };
            cb(&mut ws, payload, is_text);
        }
    }

    fn handle_frame(&mut self, conn: &mut Conn<'_>, frame: Frame) -> Result<(), WsError> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragments.is_some() {
                    return Err(WsError::InterleavedMessage);
                }
                if frame.payload.len() > self.max_msg {
                    return Err(WsError::MessageTooLarge(self.max_msg));
                }
                let is_text = frame.opcode == OpCode::Text;
                if frame.fin {
                    self.deliver(conn, frame.payload, is_text);
                } else {
                    self.fragments = Some((is_text, BytesMut::from(&frame.payload[..])));
                }
            }
            OpCode::Continuation => {
                let Some((is_text, mut acc)) = self.fragments.take() else {
                    return Err(WsError::StrayContinuation);
                };
                if acc.len() + frame.payload.len() > self.max_msg {
                    return Err(WsError::MessageTooLarge(self.max_msg));
                }
                acc.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.deliver(conn, acc.freeze(), is_text);
                } else {
                    self.fragments = Some((is_text, acc));
                }
            }
            OpCode::Ping => {
                let pong = self.control_frame(OpCode::Pong, &frame.payload);
                conn.write(pong);
            }
            OpCode::Pong => {
                trace!(conn = %conn.id(), "pong");
            }
            OpCode::Close => {
                if !self.close_sent {
                    let close = self.control_frame(OpCode::Close, &frame.payload);
                    conn.write(close);
                    self.close_sent = true;
                }
                conn.close();
            }
        }
        Ok(())
    }
}

impl Protocol for WsProtocol {
    fn on_attach(&mut self, conn: &mut Conn<'_>) {
        conn.timeout_set(self.timeout);
        if let Some(on_open) = self.on_open.take() {
            let mut ws = WsConn {
                conn,
                state: &mut self.state,
            };
            on_open(&mut ws);
        }
    }

    fn on_data(&mut self, conn: &mut Conn<'_>) {
        let incoming = conn.take_input();
        self.buf.unsplit(incoming);

        loop {
            let frame = match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    self.fail(conn, &err);
                    return;
                }
            };
            if let Err(err) = self.handle_frame(conn, frame) {
                self.fail(conn, &err);
                return;
            }
        }
    }

    fn on_ready(&mut self, conn: &mut Conn<'_>) {
        if let Some(cb) = self.on_ready.clone() {
            let mut ws = WsConn {
                conn,
                state: &mut self.state,
            };
            cb(&mut ws);
        }
    }

    fn on_shutdown(&mut self, conn: &mut Conn<'_>) -> u8 {
        if let Some(cb) = self.on_shutdown_cb.clone() {
            let mut ws = WsConn {
                conn,
                state: &mut self.state,
            };
            cb(&mut ws);
        }
        if !self.close_sent {
            let close = self.control_frame(OpCode::Close, b"");
            conn.write(close);
            self.close_sent = true;
        }
        1
    }

    fn ping(&mut self, conn: &mut Conn<'_>) {
        let ping = self.control_frame(OpCode::Ping, b"");
        conn.write(ping);
        conn.touch();
    }

    fn on_close(&mut self, id: ConnId) {
        // Subscriptions go first: the contract is that no delivery runs
        // after on_close.
        self.state.subscriptions.clear();
        if let Some(cb) = self.on_close_cb.take() {
            cb();
        }
        trace!(conn = %id, "websocket closed");
    }
}

// ---------------------------------------------------------------------------
// Callback-context view
// ---------------------------------------------------------------------------

/// The connection as seen from inside a protocol callback.
pub struct WsConn<'a, 'b> {
    conn: &'a mut Conn<'b>,
    state: &'a mut WsState,
}

impl WsConn<'_, '_> {
    pub fn id(&self) -> ConnId {
        self.conn.id()
    }

    pub fn is_client(&self) -> bool {
        self.state.is_client
    }

    /// A handle usable outside this callback.
    pub fn handle(&self) -> WsHandle {
        WsHandle {
            reactor: self.conn.reactor().clone(),
            id: self.conn.id(),
            is_client: self.state.is_client,
        }
    }

    pub fn write_text(&mut self, payload: impl AsRef<[u8]>) {
        let frame = wrap_message(payload.as_ref(), true, self.state.is_client);
        self.conn.write(frame);
    }

    pub fn write_binary(&mut self, payload: impl AsRef<[u8]>) {
        let frame = wrap_message(payload.as_ref(), false, self.state.is_client);
        self.conn.write(frame);
    }

    /// Send a close frame and flush-close the connection.
    pub fn close(&mut self) {
        let mut buf = BytesMut::new();
        let mask = self.state.is_client.then(rand::random::<[u8; 4]>);
        write_frame(&mut buf, b"", OpCode::Close, true, false, mask);
        self.conn.write(buf.freeze());
        self.conn.close();
    }

    /// Subscribe this connection on the global bus.  The subscription is
    /// cancelled automatically when the connection closes.
    pub fn subscribe(&mut self, opts: WsSubscribeOptions) {
        let sub = bridge_subscription(Bus::global(), self.handle(), opts);
        self.state.subscriptions.push(sub);
    }

    /// Subscribe against an explicit bus (tests, embedded setups).
    pub fn subscribe_on(&mut self, bus: &Bus, opts: WsSubscribeOptions) {
        let sub = bridge_subscription(bus, self.handle(), opts);
        self.state.subscriptions.push(sub);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_sniffing_cuts_off_on_size_and_validity() {
        assert!(sniff_text(b"hello"));
        assert!(!sniff_text(&[0xff, 0xfe]));
        let big = vec![b'a'; 2 << 14];
        assert!(!sniff_text(&big));
    }
}
