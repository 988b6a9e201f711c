//! End-to-end HTTP tests over real sockets.

use std::sync::Arc;

use brisk::http::{HttpRequest, HttpSettings};
use brisk::{Reactor, ReactorSettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

async fn serve(settings: HttpSettings) -> (Reactor, u16) {
    let reactor = Reactor::new(ReactorSettings::default());
    let listener = brisk::http::listen(&reactor, "127.0.0.1:0", settings).unwrap();
    (reactor, listener.port)
}

async fn roundtrip(port: u16, request: &[u8]) -> String {
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(request).await.unwrap();
    client.shutdown().await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut response))
        .await
        .expect("response timeout")
        .unwrap();
    String::from_utf8(response).expect("utf-8 response")
}

#[tokio::test]
async fn hello_world() {
    let (_reactor, port) = serve(HttpSettings {
        on_request: Some(Arc::new(|req: HttpRequest| {
            req.reply(200, "hi");
        })),
        ..HttpSettings::default()
    })
    .await;

    let text = roundtrip(port, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Content-Length: 2\r\n"));
    assert!(text.ends_with("\r\n\r\nhi"));
}

#[tokio::test]
async fn chunked_upload_synthesizes_content_length() {
    let (_reactor, port) = serve(HttpSettings {
        on_request: Some(Arc::new(|req: HttpRequest| {
            let body = req.body().to_bytes().unwrap();
            assert_eq!(&body[..], b"hello world");
            assert_eq!(req.header_str("content-length"), Some("11"));
            req.reply(200, "ok");
        })),
        ..HttpSettings::default()
    })
    .await;

    let text = roundtrip(
        port,
        b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
          5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
}

#[tokio::test]
async fn pipelined_keep_alive_responses_stay_ordered() {
    let (_reactor, port) = serve(HttpSettings {
        on_request: Some(Arc::new(|req: HttpRequest| {
            let body = format!("saw:{}", String::from_utf8_lossy(req.path()));
            req.reply(200, body);
        })),
        ..HttpSettings::default()
    })
    .await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(b"GET /one HTTP/1.1\r\nHost: x\r\n\r\nGET /two HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut collected = String::new();
    let mut buf = vec![0u8; 4096];
    timeout(Duration::from_secs(2), async {
        while !(collected.contains("saw:/one") && collected.contains("saw:/two")) {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early: {collected}");
            collected.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    })
    .await
    .expect("both responses");

    assert!(collected.find("saw:/one").unwrap() < collected.find("saw:/two").unwrap());
    // Keep-alive: the connection is still usable for a third request.
    client
        .write_all(b"GET /three HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("third response")
        .unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).contains("saw:/three"));
}

#[tokio::test]
async fn static_files_serve_with_etag_ranges_and_gzip() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), b"hello world").unwrap();
    std::fs::write(dir.path().join("page.txt"), b"uncompressed").unwrap();
    std::fs::write(dir.path().join("page.txt.gz"), b"GZBYTES").unwrap();

    let (_reactor, port) = serve(HttpSettings {
        public_folder: Some(dir.path().to_path_buf()),
        ..HttpSettings::default()
    })
    .await;

    // Plain fetch with validators.
    let text = roundtrip(port, b"GET /data.txt HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Content-Length: 11\r\n"));
    assert!(text.contains("Accept-Ranges: bytes\r\n"));
    assert!(text.contains("Last-Modified: "));
    assert!(text.ends_with("hello world"));
    let etag_line = text
        .lines()
        .find(|line| line.starts_with("Etag: "))
        .expect("etag header");
    let etag = etag_line.trim_start_matches("Etag: ").trim();

    // Conditional fetch: 304 without a body.
    let conditional = format!(
        "GET /data.txt HTTP/1.1\r\nHost: x\r\nIf-None-Match: {etag}\r\n\r\n"
    );
    let text = roundtrip(port, conditional.as_bytes()).await;
    assert!(text.starts_with("HTTP/1.1 304 "), "got: {text}");
    assert!(!text.contains("hello world"));

    // Single range.
    let text = roundtrip(
        port,
        b"GET /data.txt HTTP/1.1\r\nHost: x\r\nRange: bytes=6-10\r\n\r\n",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 206 "), "got: {text}");
    assert!(text.contains("Content-Range: bytes 6-10/11\r\n"));
    assert!(text.ends_with("world"));

    // Gzip sibling wins when advertised.
    let text = roundtrip(
        port,
        b"GET /page.txt HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n",
    )
    .await;
    assert!(text.contains("Content-Encoding: gzip\r\n"), "got: {text}");
    assert!(text.ends_with("GZBYTES"));

    // Traversal is never served.
    let text = roundtrip(
        port,
        b"GET /%2e%2e/secret HTTP/1.1\r\nHost: x\r\n\r\n",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 404 "), "got: {text}");

    // HEAD carries headers only.
    let text = roundtrip(port, b"HEAD /data.txt HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.contains("Content-Length: 11\r\n"));
    assert!(!text.ends_with("hello world"));
}

#[tokio::test]
async fn missing_handler_yields_404() {
    let (_reactor, port) = serve(HttpSettings::default()).await;
    let text = roundtrip(port, b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 404 "), "got: {text}");
}

#[tokio::test]
async fn graceful_stop_drains_connections() {
    let (reactor, port) = serve(HttpSettings {
        on_request: Some(Arc::new(|req: HttpRequest| req.reply(200, "done"))),
        ..HttpSettings::default()
    })
    .await;

    // One request through, then stop; run() must return.
    let text = roundtrip(port, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(text.contains("done"));

    reactor.stop();
    timeout(Duration::from_secs(12), reactor.run())
        .await
        .expect("drain completes");
    assert_eq!(reactor.connection_count(), 0);
}
