//! Server-Sent Events.
//!
//! The upgrade emits a `200 OK` with `text/event-stream` and pins the
//! connection open; events are written as `field: value` lines terminated
//! by a blank line.  Idle timeouts emit a comment ping.  The pub/sub bridge
//! mirrors the WebSocket one with `data:` events as the default delivery.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use brisk_core::{Conn, ConnId, Protocol, Reactor};
use brisk_http::{HttpRequest, cached_date};
use brisk_pubsub::{Bus, Message, SubscribeOptions, Subscription};

// ---------------------------------------------------------------------------
// Event formatting
// ---------------------------------------------------------------------------

/// One EventSource event.  Every field is optional; `data` spanning several
/// lines is split into repeated `data:` lines.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        SseEvent {
            data: Some(data.into()),
            ..SseEvent::default()
        }
    }

    /// Wire form: `field: value\r\n` lines plus the blank-line terminator.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::new();
        if let Some(id) = &self.id {
            out.extend_from_slice(b"id: ");
            out.extend_from_slice(id.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if let Some(event) = &self.event {
            out.extend_from_slice(b"event: ");
            out.extend_from_slice(event.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if let Some(retry) = self.retry {
            out.extend_from_slice(b"retry: ");
            out.extend_from_slice(retry.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if let Some(data) = &self.data {
            for line in data.split('\n') {
                let line = line.strip_suffix('\r').unwrap_or(line);
                out.extend_from_slice(b"data: ");
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(b"\r\n");
        Bytes::from(out)
    }
}

// ---------------------------------------------------------------------------
// Settings & upgrade
// ---------------------------------------------------------------------------

type OnOpen = Box<dyn FnOnce(&mut SseConn<'_, '_>) + Send>;
type OnClose = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct SseSettings {
    pub on_open: Option<OnOpen>,
    pub on_close: Option<OnClose>,
    /// 0 inherits the HTTP listener's `ws_timeout`.
    pub timeout: u32,
}

/// Answer an EventSource request: `200 OK`, `text/event-stream`, and a
/// long-lived connection owned by the SSE writer.
pub fn upgrade(req: HttpRequest, settings: SseSettings) {
    let timeout = if settings.timeout == 0 {
        req.settings().ws_timeout
    } else {
        settings.timeout
    };
    let date = cached_date(current_secs());
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream; charset=utf-8\r\n\
         Cache-Control: no-cache\r\n\
         Content-Encoding: identity\r\n\
         Connection: keep-alive\r\n\
         Date: {date}\r\n\r\n"
    );
    let proto = SseProtocol {
        timeout,
        on_open: settings.on_open,
        on_close: settings.on_close,
        subscriptions: Vec::new(),
    };
    req.upgrade(head.into_bytes(), Box::new(proto));
}

fn current_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Write SSE events from anywhere; drops silently once the peer is gone.
#[derive(Clone)]
pub struct SseHandle {
    reactor: Reactor,
    id: ConnId,
}

impl SseHandle {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.reactor.is_valid(self.id)
    }

    pub fn write(&self, event: &SseEvent) {
        self.reactor.write(self.id, event.to_bytes());
    }

    pub fn close(&self) {
        self.reactor.close(self.id);
    }
}

pub struct SseConn<'a, 'b> {
    conn: &'a mut Conn<'b>,
    subscriptions: &'a mut Vec<Subscription>,
}

impl SseConn<'_, '_> {
    pub fn id(&self) -> ConnId {
        self.conn.id()
    }

    pub fn handle(&self) -> SseHandle {
        SseHandle {
            reactor: self.conn.reactor().clone(),
            id: self.conn.id(),
        }
    }

    pub fn write(&mut self, event: &SseEvent) {
        self.conn.write(event.to_bytes());
    }

    pub fn close(&mut self) {
        self.conn.close();
    }

    /// Subscribe on the global bus; published payloads arrive as `data:`
    /// events unless a custom callback is given.
    pub fn subscribe(&mut self, opts: SseSubscribeOptions) {
        self.subscribe_on(Bus::global(), opts);
    }

    pub fn subscribe_on(&mut self, bus: &Bus, opts: SseSubscribeOptions) {
        let handle = self.handle();
        let on_message: brisk_pubsub::OnMessage = match opts.on_message {
            Some(user) => {
                let handle = handle.clone();
                Arc::new(move |msg: &Message| user(&handle, msg))
            }
            None => Arc::new(move |msg: &Message| {
                let event = SseEvent::data(String::from_utf8_lossy(&msg.payload).into_owned());
                handle.write(&event);
            }),
        };
        let sub = bus.subscribe(SubscribeOptions {
            filter: opts.filter,
            channel: opts.channel,
            is_pattern: opts.is_pattern,
            matcher: None,
            on_message,
            on_unsubscribe: opts.on_unsubscribe,
        });
        self.subscriptions.push(sub);
    }
}

pub struct SseSubscribeOptions {
    pub channel: Bytes,
    pub is_pattern: bool,
    pub filter: i32,
    pub on_message: Option<Arc<dyn Fn(&SseHandle, &Message) + Send + Sync>>,
    pub on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl SseSubscribeOptions {
    pub fn channel(channel: impl Into<Bytes>) -> Self {
        SseSubscribeOptions {
            channel: channel.into(),
            is_pattern: false,
            filter: 0,
            on_message: None,
            on_unsubscribe: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

struct SseProtocol {
    timeout: u32,
    on_open: Option<OnOpen>,
    on_close: Option<OnClose>,
    subscriptions: Vec<Subscription>,
}

impl Protocol for SseProtocol {
    fn on_attach(&mut self, conn: &mut Conn<'_>) {
        conn.timeout_set(self.timeout);
        if let Some(on_open) = self.on_open.take() {
            let mut sse = SseConn {
                conn,
                subscriptions: &mut self.subscriptions,
            };
            on_open(&mut sse);
        }
    }

    fn on_data(&mut self, conn: &mut Conn<'_>) {
        // EventSource is one-way; anything the client sends is discarded.
        let n = conn.input().len();
        conn.consume(n);
    }

    fn ping(&mut self, conn: &mut Conn<'_>) {
        conn.write(Bytes::from_static(b": ping\n\n"));
        conn.touch();
    }

    fn on_shutdown(&mut self, conn: &mut Conn<'_>) -> u8 {
        conn.write(Bytes::from_static(b"event: goodbye\r\ndata: shutdown\r\n\r\n"));
        1
    }

    fn on_close(&mut self, id: ConnId) {
        self.subscriptions.clear();
        if let Some(cb) = self.on_close.take() {
            cb();
        }
        trace!(conn = %id, "sse closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_covers_all_fields() {
        let event = SseEvent {
            id: Some("42".to_owned()),
            event: Some("update".to_owned()),
            data: Some("line one\nline two".to_owned()),
            retry: Some(3000),
        };
        let bytes = event.to_bytes();
        assert_eq!(
            &bytes[..],
            b"id: 42\r\nevent: update\r\nretry: 3000\r\ndata: line one\r\ndata: line two\r\n\r\n"
                .as_slice()
        );
    }

    #[test]
    fn bare_data_event_is_minimal() {
        let bytes = SseEvent::data("hi").to_bytes();
        assert_eq!(&bytes[..], b"data: hi\r\n\r\n");
    }

    #[test]
    fn crlf_data_lines_do_not_double_terminate() {
        let bytes = SseEvent::data("a\r\nb").to_bytes();
        assert_eq!(&bytes[..], b"data: a\r\ndata: b\r\n\r\n");
    }
}
