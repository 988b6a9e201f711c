//! The TLS provider seam.
//!
//! The reactor itself never speaks TLS.  A provider wraps an accepted or
//! connected TCP stream into an encrypted duplex stream and owns ALPN
//! selection; without a provider, passing TLS settings to `listen`/`connect`
//! fails with [`CoreError::TlsUnavailable`].
//!
//! [`CoreError::TlsUnavailable`]: crate::CoreError::TlsUnavailable

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Any bidirectional byte stream the reactor can drive.
pub trait Duplex: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

impl<T> Duplex for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

/// The boxed stream a connection task owns.
pub type IoStream = Box<dyn Duplex>;

/// Per-socket encryption hooks plus ALPN registration.
#[async_trait]
pub trait TlsProvider: Send + Sync {
    /// Server-side handshake for an accepted stream.
    async fn accept(&self, stream: TcpStream) -> io::Result<IoStream>;

    /// Client-side handshake; `server_name` feeds SNI.
    async fn connect(&self, stream: TcpStream, server_name: &str) -> io::Result<IoStream>;

    /// Register an ALPN protocol name.  Selection order follows registration
    /// order; the first mutually supported name wins.
    fn alpn_add(&self, protocol: &str);

    /// The ALPN name negotiated for a given stream, when known.
    fn alpn_selected(&self, _stream: &dyn Duplex) -> Option<String> {
        None
    }
}

/// TLS settings accepted by `listen`/`connect`.
#[derive(Clone)]
pub struct Tls {
    pub provider: Arc<dyn TlsProvider>,
    /// SNI / certificate name.
    pub server_name: String,
}

impl Tls {
    pub fn new(provider: Arc<dyn TlsProvider>, server_name: impl Into<String>) -> Self {
        Tls {
            provider,
            server_name: server_name.into(),
        }
    }
}
