//! WebSocket and EventSource end-to-end tests: handshake, echo, broadcast
//! fan-out through the pub/sub bridge, and the SSE stream shape.

use std::sync::Arc;

use brisk::http::{HttpRequest, HttpSettings};
use brisk::ws::{self, FrameCodec, OpCode, WsSettings, WsSubscribeOptions, wrap_message};
use brisk::{Reactor, ReactorSettings};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tokio_util::codec::Decoder;

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

fn chat_settings(channel: &'static str) -> HttpSettings {
    HttpSettings {
        on_upgrade: Some(Arc::new(move |req: HttpRequest, target: &str| {
            if target != "websocket" {
                req.reply(400, "expected websocket");
                return;
            }
            let settings = WsSettings {
                on_open: Some(Box::new(move |conn| {
                    conn.subscribe(WsSubscribeOptions::channel(channel));
                })),
                on_message: Some(Arc::new(move |_conn, payload, is_text| {
                    brisk::pubsub::publish(
                        brisk::pubsub::PublishOptions::new(
                            channel,
                            payload,
                        )
                        .json(false)
                        .target(brisk::pubsub::Target::Local),
                    );
                    let _ = is_text;
                })),
                ..WsSettings::default()
            };
            ws::upgrade(req, settings);
        })),
        ..HttpSettings::default()
    }
}

async fn ws_connect(port: u16) -> TcpStream {
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!(
        "GET /chat HTTP/1.1\r\n\
         Host: x\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\n\r\n"
    );
    client.write_all(request.as_bytes()).await.unwrap();

    // Read the 101 head.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    timeout(Duration::from_secs(2), async {
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
    })
    .await
    .expect("handshake response");
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "got: {head}");
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n")));
    client
}

/// Read frames until a data frame arrives (skipping pings), with a timeout.
async fn read_data_frame(client: &mut TcpStream) -> (OpCode, Vec<u8>) {
    let mut codec = FrameCodec::client();
    let mut buf = BytesMut::new();
    timeout(Duration::from_secs(2), async {
        loop {
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                match frame.opcode {
                    OpCode::Ping | OpCode::Pong => continue,
                    opcode => return (opcode, frame.payload.to_vec()),
                }
            }
            let mut chunk = [0u8; 1024];
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "peer closed while waiting for a frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("frame timeout")
}

#[tokio::test]
async fn masked_echo_and_broadcast_exactly_once() {
    let reactor = Reactor::new(ReactorSettings::default());
    let listener = brisk::http::listen(
        &reactor,
        "127.0.0.1:0",
        chat_settings("room-echo-broadcast"),
    )
    .unwrap();

    let mut alice = ws_connect(listener.port).await;
    let mut bob = ws_connect(listener.port).await;
    // Let bob's subscription register before alice speaks.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let frame = wrap_message(b"ping", true, true);
    alice.write_all(&frame).await.unwrap();

    // Both subscribers receive the broadcast, as an unmasked text frame.
    let (opcode, payload) = read_data_frame(&mut alice).await;
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(payload, b"ping");

    let (opcode, payload) = read_data_frame(&mut bob).await;
    assert_eq!(opcode, OpCode::Text);
    assert_eq!(payload, b"ping");

    // Exactly once: no second copy shows up for bob.
    let mut extra = [0u8; 64];
    let silent = timeout(Duration::from_millis(300), bob.read(&mut extra)).await;
    assert!(silent.is_err(), "unexpected extra bytes for bob");
}

#[tokio::test]
async fn unmasked_client_frame_closes_the_connection() {
    let reactor = Reactor::new(ReactorSettings::default());
    let listener = brisk::http::listen(
        &reactor,
        "127.0.0.1:0",
        chat_settings("room-mask-check"),
    )
    .unwrap();

    let mut client = ws_connect(listener.port).await;
    // Server-style (unmasked) frame from a client violates RFC 6455.
    let bad = wrap_message(b"cheat", true, false);
    client.write_all(&bad).await.unwrap();

    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .expect("server should close")
        .unwrap();
    // Whatever trailing bytes arrived (a close frame at most), the
    // connection is gone.
}

#[tokio::test]
async fn oversized_fragmented_message_closes() {
    let reactor = Reactor::new(ReactorSettings::default());
    let mut settings = chat_settings("room-too-big");
    settings.ws_max_msg_size = 1024;
    let listener = brisk::http::listen(&reactor, "127.0.0.1:0", settings).unwrap();

    let mut client = ws_connect(listener.port).await;
    let huge = vec![b'x'; 64 * 1024];
    client
        .write_all(&wrap_message(&huge, false, true))
        .await
        .unwrap();

    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .expect("server should close on oversize")
        .unwrap();
}

#[tokio::test]
async fn sse_upgrade_streams_events() {
    let reactor = Reactor::new(ReactorSettings::default());
    let settings = HttpSettings {
        on_upgrade: Some(Arc::new(|req: HttpRequest, target: &str| {
            assert_eq!(target, "sse");
            brisk::ws::sse::upgrade(
                req,
                brisk::ws::SseSettings {
                    on_open: Some(Box::new(|conn| {
                        conn.write(&brisk::ws::SseEvent {
                            id: Some("1".to_owned()),
                            event: Some("welcome".to_owned()),
                            data: Some("first\nsecond".to_owned()),
                            retry: None,
                        });
                    })),
                    ..brisk::ws::SseSettings::default()
                },
            );
        })),
        ..HttpSettings::default()
    };
    let listener = brisk::http::listen(&reactor, "127.0.0.1:0", settings).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listener.port)).await.unwrap();
    client
        .write_all(b"GET /events HTTP/1.1\r\nHost: x\r\nAccept: text/event-stream\r\n\r\n")
        .await
        .unwrap();

    let mut collected = String::new();
    let mut buf = [0u8; 2048];
    timeout(Duration::from_secs(2), async {
        while !collected.contains("data: second\r\n\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended early: {collected}");
            collected.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    })
    .await
    .expect("sse event");

    assert!(collected.starts_with("HTTP/1.1 200 OK\r\n"), "got: {collected}");
    assert!(collected.contains("Content-Type: text/event-stream; charset=utf-8\r\n"));
    assert!(collected.contains("Cache-Control: no-cache\r\n"));
    assert!(collected.contains("id: 1\r\nevent: welcome\r\ndata: first\r\ndata: second\r\n\r\n"));
}
