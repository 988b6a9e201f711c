//! The per-connection HTTP/1.1 protocol.
//!
//! Request flow: bytes → parser events → a pending request record → the
//! dispatch path (Host enforcement, upgrade gateway, static files, then the
//! application handler).  Pipelined requests are strictly serialized: while
//! a response is outstanding the connection's reads stay paused, and the
//! response's completion re-arms parsing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tracing::{debug, info};

use brisk_core::{Conn, ConnId, ListenOptions, Listener, Protocol, Reactor, Tls};

use crate::error::{HttpError, ParseError};
use crate::headers::HeaderMap;
use crate::parser::{Http1Events, Http1Options, Http1Parser, ParseStep};
use crate::request::{BodyStore, ConnLink, HttpRequest, SharedConnState};
use crate::response::status_text;
use crate::static_files;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub type RequestHandler = Arc<dyn Fn(HttpRequest) + Send + Sync>;
/// Upgrade gateway: receives the request and the lowercased upgrade token
/// (`"websocket"`, `"sse"`, ...).  Not answering the upgrade means dropping
/// the request, which produces a 500.
pub type UpgradeHandler = Arc<dyn Fn(HttpRequest, &str) + Send + Sync>;

pub struct HttpSettings {
    pub on_request: Option<RequestHandler>,
    pub on_upgrade: Option<UpgradeHandler>,
    /// Serve files from this directory before consulting `on_request`.
    pub public_folder: Option<std::path::PathBuf>,
    /// `Cache-Control: max-age` for static responses, seconds.
    pub static_max_age: u32,
    pub max_header_size: usize,
    pub max_header_line: usize,
    pub max_header_count: usize,
    pub max_body_size: u64,
    /// Bodies above this spill from memory to a temporary file.
    pub body_spill_at: usize,
    /// Idle timeout, seconds.
    pub timeout: u32,
    /// Limits handed to WebSocket connections created from this listener.
    pub ws_max_msg_size: usize,
    pub ws_timeout: u32,
    pub tolerant_chunked: bool,
    /// Log one line per dispatched request.
    pub log: bool,
    pub tls: Option<Tls>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            on_request: None,
            on_upgrade: None,
            public_folder: None,
            static_max_age: 3600,
            max_header_size: 32 * 1024,
            max_header_line: 8 * 1024,
            max_header_count: 128,
            max_body_size: 50 * 1024 * 1024,
            body_spill_at: 64 * 1024,
            timeout: 40,
            ws_max_msg_size: 262_144,
            ws_timeout: 40,
            tolerant_chunked: false,
            log: false,
            tls: None,
        }
    }
}

/// Serve HTTP on `addr`.
pub fn listen(reactor: &Reactor, addr: &str, settings: HttpSettings) -> Result<Listener, HttpError> {
    let timeout = settings.timeout;
    let tls = settings.tls.clone();
    let settings = Arc::new(settings);
    let factory_settings = settings;
    let mut opts = ListenOptions::new(Arc::new(move |_id| {
        Some(Box::new(Http1Protocol::new(factory_settings.clone())) as Box<dyn Protocol>)
    }));
    opts.timeout = timeout;
    opts.tls = tls;
    opts.busy_response = Some(Bytes::from_static(
        b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    ));
    Ok(reactor.listen(addr, opts)?)
}

// ---------------------------------------------------------------------------
// Request assembly (parser event sink)
// ---------------------------------------------------------------------------

struct Partial {
    method: Bytes,
    path: Bytes,
    query: Bytes,
    version_11: bool,
    headers: HeaderMap,
    body: BodyStore,
    received: u64,
}

#[derive(Default)]
struct RequestBuilder {
    current: Option<Partial>,
    done: Option<Partial>,
    max_body_size: u64,
    body_spill_at: usize,
    /// Coarse clock sampled just before each parse call.
    now: u64,
}

impl Http1Events for RequestBuilder {
    fn on_method(&mut self, method: &[u8]) -> ParseStep {
        self.current = Some(Partial {
            method: Bytes::copy_from_slice(method),
            path: Bytes::new(),
            query: Bytes::new(),
            version_11: true,
            headers: HeaderMap::new(),
            body: BodyStore::new(self.max_body_size, self.body_spill_at),
            received: self.now,
        });
        Ok(())
    }

    fn on_path(&mut self, path: &[u8]) -> ParseStep {
        if let Some(partial) = self.current.as_mut() {
            partial.path = Bytes::copy_from_slice(path);
        }
        Ok(())
    }

    fn on_query(&mut self, query: &[u8]) -> ParseStep {
        if let Some(partial) = self.current.as_mut() {
            partial.query = Bytes::copy_from_slice(query);
        }
        Ok(())
    }

    fn on_version(&mut self, version: &[u8]) -> ParseStep {
        if let Some(partial) = self.current.as_mut() {
            partial.version_11 = version != b"HTTP/1.0";
        }
        Ok(())
    }

    fn on_header(&mut self, name: &[u8], value: &[u8]) -> ParseStep {
        if let Some(partial) = self.current.as_mut() {
            if name == b"content-length" {
                // One canonical value; the chunked decoder re-sets it to the
                // decoded length.
                partial.headers.set(name, Bytes::copy_from_slice(value));
            } else {
                partial.headers.append(name, Bytes::copy_from_slice(value));
            }
        }
        Ok(())
    }

    fn on_body_chunk(&mut self, data: &[u8]) -> ParseStep {
        match self.current.as_mut() {
            Some(partial) => partial.body.push(data),
            None => Ok(()),
        }
    }

    fn on_request(&mut self) -> ParseStep {
        self.done = self.current.take();
        Ok(())
    }

    fn on_response(&mut self) -> ParseStep {
        // A server connection has no business receiving responses.
        Err(ParseError::BadRequestLine)
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

pub(crate) struct Http1Protocol {
    settings: Arc<HttpSettings>,
    parser: Http1Parser,
    builder: RequestBuilder,
    shared: Arc<SharedConnState>,
}

impl Http1Protocol {
    pub fn new(settings: Arc<HttpSettings>) -> Self {
        let parser = Http1Parser::new(Http1Options {
            max_header_size: settings.max_header_size,
            max_header_line: settings.max_header_line,
            max_header_count: settings.max_header_count,
            tolerant_chunked: settings.tolerant_chunked,
        });
        let builder = RequestBuilder {
            max_body_size: settings.max_body_size,
            body_spill_at: settings.body_spill_at,
            ..RequestBuilder::default()
        };
        Http1Protocol {
            settings,
            parser,
            builder,
            shared: Arc::new(SharedConnState {
                busy: AtomicBool::new(false),
            }),
        }
    }

    fn dispatch(&mut self, conn: &mut Conn<'_>, partial: Partial) {
        let mut partial = partial;
        let body = partial.body.finish();
        let keep_alive = derive_keep_alive(partial.version_11, &partial.headers);

        let mut req = HttpRequest::new(self.settings.clone());
        req.method = partial.method;
        req.path = partial.path;
        req.query = partial.query;
        req.version_11 = partial.version_11;
        req.headers = partial.headers;
        req.body = body;
        req.received = partial.received;
        req.keep_alive = keep_alive;
        req.link = Some(ConnLink {
            reactor: conn.reactor().clone(),
            id: conn.id(),
            shared: self.shared.clone(),
        });

        self.shared.busy.store(true, Ordering::Release);

        if self.settings.log {
            info!(
                method = %String::from_utf8_lossy(req.method()),
                path = %String::from_utf8_lossy(req.path()),
                conn = %conn.id(),
                "request"
            );
        }

        // An HTTP/1.1 origin-form request must name its host.
        if req.version_11 && !req.headers().contains("host") {
            req.keep_alive = false;
            req.reply(400, "Bad Request");
            return;
        }

        if let Some(upgrade) = req.upgrade_requested() {
            if let Some(handler) = self.settings.on_upgrade.clone() {
                handler(req, &upgrade);
                return;
            }
        }

        let req = match self.settings.public_folder.clone() {
            Some(folder) => {
                match static_files::try_serve(&folder, req, self.settings.static_max_age) {
                    Some(unserved) => unserved,
                    None => return,
                }
            }
            None => req,
        };

        match self.settings.on_request.clone() {
            Some(handler) => handler(req),
            None => req.reply(404, "Not Found"),
        }
    }

    /// Best-effort error response before giving up on the connection.
    fn reject(&mut self, conn: &mut Conn<'_>, status: u16) {
        let reason = status_text(status);
        let head = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        conn.write(head);
        conn.close();
    }
}

impl Protocol for Http1Protocol {
    fn on_data(&mut self, conn: &mut Conn<'_>) {
        loop {
            if self.shared.busy.load(Ordering::Acquire) {
                // A response is outstanding; its completion resumes reads.
                conn.suspend_reads();
                return;
            }
            if conn.input().is_empty() {
                return;
            }
            self.builder.now = conn.reactor().last_tick();
            let consumed = match self.parser.parse(conn.input(), &mut self.builder) {
                Ok(consumed) => consumed,
                Err(err) => {
                    debug!(conn = %conn.id(), %err, "request rejected");
                    self.reject(conn, err.status());
                    return;
                }
            };
            conn.consume(consumed);
            match self.builder.done.take() {
                Some(partial) => self.dispatch(conn, partial),
                None => return, // incomplete message; wait for more bytes
            }
        }
    }

    fn on_shutdown(&mut self, conn: &mut Conn<'_>) -> u8 {
        if self.shared.busy.load(Ordering::Acquire) || self.parser.mid_message() {
            // Mid-exchange: grant a short grace to finish.
            return 3;
        }
        self.reject(conn, 503);
        0
    }

    fn ping(&mut self, conn: &mut Conn<'_>) {
        // An idle keep-alive connection is expendable; one mid-response is
        // left to the shutdown path.
        if !self.shared.busy.load(Ordering::Acquire) {
            conn.close();
        }
    }

    fn on_close(&mut self, _id: ConnId) {}
}

fn derive_keep_alive(version_11: bool, headers: &HeaderMap) -> bool {
    match headers.get_str("connection") {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => version_11,
    }
}
