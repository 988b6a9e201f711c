//! The HTTP request/response handle.
//!
//! One `HttpRequest` exists per parsed request.  The handler receives it by
//! value: answering consumes it (`reply`, `sendfile`, `finish`), streaming
//! borrows it (`send_body`), and *keeping* it is the suspension mechanism —
//! move it into a task or a queue and respond later; reads stay paused until
//! the response completes.  A handle dropped without a response produces a
//! 500 so a lost request can never wedge the connection.

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::trace;

use brisk_core::{Conn, ConnId, Protocol, Reactor};

use crate::error::{HttpError, ParseError};
use crate::headers::HeaderMap;
use crate::params::{ParamValue, from_json, parse_query};
use crate::protocol::HttpSettings;
use crate::response::{cached_date, status_text};

/// RFC 6455 handshake GUID.
const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// ---------------------------------------------------------------------------
// Body storage
// ---------------------------------------------------------------------------

/// Where request body bytes live.  Small bodies stay in memory; larger ones
/// spill to an unlinked temporary file while streaming in.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Memory(Bytes),
    File {
        file: Arc<std::fs::File>,
        len: u64,
    },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Memory(b) => b.len() as u64,
            Body::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The whole body as bytes; file-backed bodies are read in.
    pub fn to_bytes(&self) -> std::io::Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Memory(b) => Ok(b.clone()),
            Body::File { file, len } => {
                let mut clone = file.try_clone()?;
                clone.rewind()?;
                let mut out = Vec::with_capacity(usize::try_from(*len).unwrap_or(0));
                clone.read_to_end(&mut out)?;
                Ok(Bytes::from(out))
            }
        }
    }
}

/// Accumulates body bytes while a request streams in.
pub(crate) struct BodyStore {
    mem: BytesMut,
    file: Option<(std::fs::File, u64)>,
    spill_at: usize,
    limit: u64,
    total: u64,
}

impl BodyStore {
    pub fn new(limit: u64, spill_at: usize) -> Self {
        BodyStore {
            mem: BytesMut::new(),
            file: None,
            spill_at,
            limit,
            total: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.total += data.len() as u64;
        if self.total > self.limit {
            return Err(ParseError::BodyTooLarge);
        }
        if let Some((file, len)) = self.file.as_mut() {
            file.write_all(data).map_err(|_| ParseError::BodyTooLarge)?;
            *len += data.len() as u64;
            return Ok(());
        }
        self.mem.extend_from_slice(data);
        if self.mem.len() > self.spill_at {
            let mut file = tempfile::tempfile().map_err(|_| ParseError::BodyTooLarge)?;
            file.write_all(&self.mem)
                .map_err(|_| ParseError::BodyTooLarge)?;
            let len = self.mem.len() as u64;
            self.mem = BytesMut::new();
            self.file = Some((file, len));
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Body {
        if let Some((file, len)) = self.file.take() {
            return Body::File {
                file: Arc::new(file),
                len,
            };
        }
        if self.mem.is_empty() {
            Body::Empty
        } else {
            Body::Memory(std::mem::take(&mut self.mem).freeze())
        }
    }
}

// ---------------------------------------------------------------------------
// Connection linkage
// ---------------------------------------------------------------------------

/// Per-connection flags shared between in-flight requests and the protocol.
pub(crate) struct SharedConnState {
    /// A request is awaiting its response; the next pipelined request must
    /// not dispatch yet.
    pub busy: AtomicBool,
}

pub(crate) struct ConnLink {
    pub reactor: Reactor,
    pub id: ConnId,
    pub shared: Arc<SharedConnState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    NotSent,
    Streaming,
    Done,
}

// ---------------------------------------------------------------------------
// HttpRequest
// ---------------------------------------------------------------------------

pub struct HttpRequest {
    pub(crate) method: Bytes,
    pub(crate) path: Bytes,
    pub(crate) query: Bytes,
    pub(crate) version_11: bool,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) received: u64,
    pub(crate) keep_alive: bool,

    status: u16,
    reason: Option<String>,
    out_headers: HeaderMap,
    state: SendState,

    pub(crate) link: Option<ConnLink>,
    pub(crate) settings: Arc<HttpSettings>,
}

impl HttpRequest {
    pub(crate) fn new(settings: Arc<HttpSettings>) -> Self {
        HttpRequest {
            method: Bytes::new(),
            path: Bytes::new(),
            query: Bytes::new(),
            version_11: true,
            headers: HeaderMap::new(),
            body: Body::Empty,
            received: 0,
            keep_alive: true,
            status: 200,
            reason: None,
            out_headers: HeaderMap::new(),
            state: SendState::NotSent,
            link: None,
            settings,
        }
    }

    // -----------------------------------------------------------------------
    // Request accessors
    // -----------------------------------------------------------------------

    pub fn method(&self) -> &[u8] {
        &self.method
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn query(&self) -> &[u8] {
        &self.query
    }

    pub fn is_http11(&self) -> bool {
        self.version_11
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers.get(name)
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get_str(name)
    }

    /// A cookie value from the request's `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let cookies = self.headers.get_str("cookie")?;
        for pair in cookies.split(';') {
            let pair = pair.trim();
            if let Some((k, v)) = pair.split_once('=') {
                if k == name {
                    return Some(v.to_owned());
                }
            }
        }
        None
    }

    /// Query-string and body parameters as one value tree.  Urlencoded and
    /// JSON bodies contribute; other content types leave the body opaque.
    pub fn params(&self) -> BTreeMap<String, ParamValue> {
        let mut params = parse_query(&self.query);
        let content_type = self.header_str("content-type").unwrap_or("");
        if content_type.starts_with("application/x-www-form-urlencoded") {
            if let Ok(bytes) = self.body.to_bytes() {
                for (k, v) in parse_query(&bytes) {
                    params.insert(k, v);
                }
            }
        } else if content_type.starts_with("application/json") {
            if let Ok(bytes) = self.body.to_bytes() {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                    if let ParamValue::Map(map) = from_json(value) {
                        params.extend(map);
                    }
                }
            }
        }
        params
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Coarse unix timestamp of when the request line was seen.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case(b"HEAD")
    }

    /// The connection this request arrived on.
    pub fn conn_id(&self) -> Option<ConnId> {
        self.link.as_ref().map(|l| l.id)
    }

    /// The listener settings this request was served under.
    pub fn settings(&self) -> &Arc<HttpSettings> {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Response composition
    // -----------------------------------------------------------------------

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_status_text(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    /// Replace a response header (headers are emitted in insertion order).
    pub fn set_header(&mut self, name: &str, value: impl Into<Bytes>) {
        self.out_headers.set(name.as_bytes(), value);
    }

    /// Append a response header, keeping earlier values.
    pub fn add_header(&mut self, name: &str, value: impl Into<Bytes>) {
        self.out_headers.append(name.as_bytes(), value);
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.out_headers
            .append(b"set-cookie", format!("{name}={value}; Path=/"));
    }

    /// Send a complete response and finish the request.
    pub fn reply(mut self, status: u16, body: impl Into<Bytes>) {
        self.status = status;
        self.send_full(body.into());
    }

    /// Send a complete response with the already-set status.
    pub fn send(mut self, body: impl Into<Bytes>) {
        self.send_full(body.into());
    }

    fn send_full(&mut self, body: Bytes) {
        if self.state != SendState::NotSent {
            trace!("response already started; send ignored");
            return;
        }
        let head = self.compose_head(Some(body.len() as u64));
        if let Some(link) = self.link.as_ref() {
            link.reactor.write(link.id, head);
            if !body.is_empty() && !self.is_head() {
                link.reactor.write(link.id, body);
            }
        }
        self.state = SendState::Done;
        self.complete();
    }

    /// Stream part of a response body.  The first call emits the header
    /// section; without a pre-set `content-length` the connection stops
    /// being keep-alive and the body is delimited by close.
    pub fn send_body(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if self.state == SendState::Done {
            trace!("response already finished; send_body ignored");
            return;
        }
        if self.state == SendState::NotSent {
            if !self.out_headers.contains("content-length") {
                self.keep_alive = false;
            }
            let head = self.compose_head(None);
            if let Some(link) = self.link.as_ref() {
                link.reactor.write(link.id, head);
            }
            self.state = SendState::Streaming;
        }
        if let Some(link) = self.link.as_ref() {
            if !self.is_head() {
                link.reactor.write(link.id, chunk);
            }
        }
    }

    /// Respond with a file range; exactly `len` bytes of `file` from
    /// `offset` follow the headers.
    pub fn sendfile(mut self, file: Arc<std::fs::File>, offset: u64, len: u64) {
        if self.state != SendState::NotSent {
            trace!("response already started; sendfile ignored");
            return;
        }
        let head = self.compose_head(Some(len));
        if let Some(link) = self.link.as_ref() {
            link.reactor.write(link.id, head);
            if !self.is_head() && len > 0 {
                link.reactor.sendfile(link.id, file, offset, len);
            }
        }
        self.state = SendState::Done;
        self.complete();
    }

    /// Complete the response.  For an unstarted response this sends an
    /// empty-bodied reply with the current status.
    pub fn finish(mut self) {
        match self.state {
            SendState::NotSent => self.send_full(Bytes::new()),
            SendState::Streaming => {
                self.state = SendState::Done;
                self.complete();
            }
            SendState::Done => {}
        }
    }

    /// Serialize the status line and headers, injecting `Date`,
    /// `Content-Length`, `Content-Type` and the derived `Connection`.
    fn compose_head(&mut self, content_length: Option<u64>) -> Vec<u8> {
        let reason = self
            .reason
            .clone()
            .unwrap_or_else(|| status_text(self.status).to_owned());

        if !self.out_headers.contains("date") {
            let now = self
                .link
                .as_ref()
                .map_or_else(now_fallback, |l| l.reactor.last_tick());
            self.out_headers.set(b"date", cached_date(now));
        }
        if let Some(len) = content_length {
            if !self.out_headers.contains("content-length") {
                self.out_headers.set(b"content-length", len.to_string());
            }
        }
        if !self.out_headers.contains("content-type") && content_length.unwrap_or(1) > 0 {
            self.out_headers.set(b"content-type", &b"text/html"[..]);
        }
        if !self.out_headers.contains("connection") {
            let value: &[u8] = if self.keep_alive {
                b"keep-alive"
            } else {
                b"close"
            };
            self.out_headers.set(b"connection", value);
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(b"HTTP/1.1 ");
        head.extend_from_slice(self.status.to_string().as_bytes());
        head.push(b' ');
        head.extend_from_slice(reason.as_bytes());
        head.extend_from_slice(b"\r\n");
        self.out_headers.write_to(&mut head);
        head.extend_from_slice(b"\r\n");
        head
    }

    /// Release the connection for the next pipelined request (or close it
    /// when this response ends the session).
    fn complete(&mut self) {
        let Some(link) = self.link.take() else { return };
        link.shared.busy.store(false, Ordering::Release);
        if self.keep_alive {
            link.reactor.defer_io(
                link.id,
                Box::new(|proto: &mut dyn Protocol, conn: &mut Conn<'_>| {
                    conn.resume_reads();
                    if !conn.input().is_empty() {
                        proto.on_data(conn);
                    }
                }),
                None,
            );
        } else {
            link.reactor.close(link.id);
        }
    }

    // -----------------------------------------------------------------------
    // Upgrades
    // -----------------------------------------------------------------------

    /// The lowercased `Upgrade` token when the request asks for one, or
    /// `"sse"` for an EventSource request.
    pub fn upgrade_requested(&self) -> Option<String> {
        if let Some(upgrade) = self.header_str("upgrade") {
            return Some(upgrade.to_ascii_lowercase());
        }
        let accepts_events = self
            .header_str("accept")
            .is_some_and(|a| a.contains("text/event-stream"));
        if accepts_events {
            return Some("sse".to_owned());
        }
        None
    }

    /// Validate the WebSocket handshake and compute `Sec-WebSocket-Accept`.
    pub fn websocket_accept(&self) -> Result<String, HttpError> {
        let is_ws = self
            .header_str("upgrade")
            .is_some_and(|u| u.eq_ignore_ascii_case("websocket"));
        if !is_ws {
            return Err(HttpError::NotWebSocket);
        }
        if self.header_str("sec-websocket-version") != Some("13") {
            return Err(HttpError::WebSocketVersion);
        }
        let key = self
            .header_str("sec-websocket-key")
            .ok_or(HttpError::NotWebSocket)?;
        Ok(derive_accept_key(key))
    }

    /// Switch the connection to another protocol: `head` is written first,
    /// then `proto` takes over (receiving any bytes that followed this
    /// request in the buffer).
    ///
    /// `busy` intentionally stays set: the HTTP parser must never touch the
    /// bytes that belong to the new protocol, and the protocol swap makes
    /// the flag moot.
    pub fn upgrade(mut self, head: Vec<u8>, proto: Box<dyn Protocol>) {
        let Some(link) = self.link.take() else { return };
        self.state = SendState::Done;
        link.reactor.write(link.id, head);
        link.reactor.attach_protocol(link.id, proto);
    }

    /// Detach the socket from HTTP entirely.  `f` receives the connection
    /// handle and any unconsumed buffered bytes; no protocol is attached
    /// until the caller installs one.
    pub fn hijack(mut self, f: impl FnOnce(ConnId, BytesMut) + Send + 'static) {
        let Some(link) = self.link.take() else { return };
        self.state = SendState::Done;
        let id = link.id;
        link.reactor.defer_io(
            id,
            Box::new(move |_proto: &mut dyn Protocol, conn: &mut Conn<'_>| {
                let leftover = conn.hijack();
                f(conn.id(), leftover);
            }),
            Some(Box::new(move |id| {
                trace!(conn = %id, "hijack target disappeared");
            })),
        );
    }
}

impl Drop for HttpRequest {
    fn drop(&mut self) {
        if self.link.is_some() && self.state != SendState::Done {
            // A handler dropped the request without answering.
            if self.state == SendState::NotSent {
                self.status = 500;
                self.send_full(Bytes::from_static(b"Internal Server Error"));
            } else {
                self.state = SendState::Done;
                self.complete();
            }
        }
    }
}

fn now_fallback() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `base64(sha1(key || GUID))` per RFC 6455.
pub fn derive_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}
