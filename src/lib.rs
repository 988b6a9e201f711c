//! brisk: an evented networking framework.
//!
//! A socket reactor with generation-tagged connection handles, an HTTP/1.1
//! server with WebSocket and EventSource upgrades, a process-local pub/sub
//! bus with cross-worker fan-out, and a Redis bridge engine.
//!
//! The subsystem crates are re-exported here; this crate adds the glue that
//! wires them together for the common deployment shapes (cluster startup,
//! environment-driven configuration).

pub use brisk_core::{
    Conn, ConnId, ConnectOptions, CoreError, IoStream, ListenOptions, Listener, OutChunk,
    Protocol, ProtocolFactory, Reactor, ReactorSettings, StartOptions, StateEvent, Tls,
    TlsProvider, is_worker_process, root_pid, start,
};

pub use brisk_http as http;
pub use brisk_pubsub as pubsub;
pub use brisk_redis as redis;
pub use brisk_ws as ws;

use std::sync::Arc;

use brisk_pubsub::{Bus, ClusterLink, ClusterRoot, Engine};
use tracing::info;

/// Wire the cluster mesh for this process and install it as the bus's
/// default engine.
///
/// In the root (or a single-process deployment) this binds the per-pid
/// rendezvous socket and returns the root handle; in a worker it connects a
/// link back to the root.  Call once, after the runtime is up and before
/// listeners start publishing.
pub fn cluster_init(bus: &Bus) -> std::io::Result<Option<ClusterRoot>> {
    if is_worker_process() {
        let link = ClusterLink::connect(bus.clone(), root_pid());
        let engine: Arc<dyn Engine> = Arc::new(link);
        bus.attach(engine.clone());
        bus.set_default_engine(Some(engine));
        info!(root = root_pid(), "cluster link initialized");
        Ok(None)
    } else {
        let root = ClusterRoot::bind(bus.clone())?;
        let engine: Arc<dyn Engine> = Arc::new(root.clone());
        bus.set_default_engine(Some(engine));
        info!(path = %root.path().display(), "cluster root initialized");
        Ok(Some(root))
    }
}

/// `ADDRESS`/`PORT` with the usual defaults (`0.0.0.0:3000`).
pub fn env_bind_address() -> String {
    let address = std::env::var("ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_owned());
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_owned());
    format!("{address}:{port}")
}

/// Serve HTTP according to the environment: `ADDRESS`, `PORT` and
/// `HTTP_PUBLIC_FOLDER`.
pub fn http_listen_from_env(
    reactor: &Reactor,
    mut settings: http::HttpSettings,
) -> Result<Listener, http::HttpError> {
    if settings.public_folder.is_none() {
        settings.public_folder = std::env::var("HTTP_PUBLIC_FOLDER")
            .ok()
            .map(std::path::PathBuf::from);
    }
    http::listen(reactor, &env_bind_address(), settings)
}

/// Attach a Redis engine when `REDIS_URL` is set; the engine becomes the
/// bus's default so publishes fan out through the server.  Call after
/// [`cluster_init`]: whatever engine was the default (the mesh) becomes the
/// Redis engine's relay for incoming messages and worker-forwarded
/// commands.  The reactor's graceful shutdown sends the server a `QUIT`.
pub fn redis_from_env(reactor: &Reactor, bus: &Bus) -> Option<Arc<redis::RedisEngine>> {
    let url = std::env::var("REDIS_URL").ok()?;
    let mesh = bus.default_engine();
    let engine = redis::activate(bus, redis::RedisSettings::from_url(&url));
    if let Some(mesh) = mesh {
        engine.set_relay(mesh);
    }
    redis::RedisEngine::register_shutdown(&engine, reactor);
    info!(%url, "redis engine attached");
    Some(engine)
}
