//! The reactor: listeners, connection tasks, deferred work, shutdown.
//!
//! Every accepted or connected socket gets its own task.  The task owns the
//! stream and the protocol object, pulls commands from an unbounded queue,
//! drains the write queue, and enforces the idle timeout.  Because all
//! callbacks for one connection run on that one task, a protocol observes the
//! reactor as single-threaded with respect to its own connection while
//! distinct connections run in parallel across the runtime's workers.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::conn::{CloseMode, Cmd, Conn, ConnId, Effects, IoTask, Registry, SlotEntry};
use crate::error::CoreError;
use crate::lifecycle::{Lifecycle, StateEvent};
use crate::protocol::Protocol;
use crate::tls::{IoStream, Tls};
use crate::write::{OutChunk, WriteQueue};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Reactor-wide tunables.
#[derive(Debug, Clone)]
pub struct ReactorSettings {
    /// Hard cap on concurrently served connections; 0 means unlimited.
    /// Accepts beyond the cap are dropped immediately.
    pub max_clients: usize,
    /// Soft write-queue threshold in bytes.  While a connection's queued
    /// output exceeds this, its reads are not scheduled (backpressure).
    pub write_backlog_soft: usize,
    /// Upper bound on the graceful-shutdown drain, in seconds.
    pub shutdown_timeout: u64,
    /// Total worker processes.  Above 1, every process (root included) binds
    /// TCP listeners with `SO_REUSEPORT` so the kernel spreads accepts.
    pub workers: usize,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        ReactorSettings {
            max_clients: 0,
            write_backlog_soft: 1 << 20,
            shutdown_timeout: 8,
            workers: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Listen / connect options
// ---------------------------------------------------------------------------

/// Builds a protocol for each accepted connection.  Returning `None` rejects
/// the connection (it is closed without further callbacks).
pub type ProtocolFactory = Arc<dyn Fn(ConnId) -> Option<Box<dyn Protocol>> + Send + Sync>;

pub struct ListenOptions {
    pub factory: ProtocolFactory,
    pub tls: Option<Tls>,
    /// Idle timeout applied to accepted connections, seconds; 0 disables.
    pub timeout: u32,
    /// Written to an accepted socket that exceeds `max_clients` before it is
    /// dropped (e.g. a canned 503).
    pub busy_response: Option<Bytes>,
}

impl ListenOptions {
    pub fn new(factory: ProtocolFactory) -> Self {
        ListenOptions {
            factory,
            tls: None,
            timeout: 0,
            busy_response: None,
        }
    }
}

/// A bound listener: its connection handle plus the discovered local port
/// (useful when binding port 0).
#[derive(Debug, Clone, Copy)]
pub struct Listener {
    pub id: ConnId,
    pub port: u16,
}

pub struct ConnectOptions {
    /// Runs once the transport is established; returns the protocol to attach.
    pub on_connect: Box<dyn FnOnce(ConnId) -> Box<dyn Protocol> + Send>,
    /// Runs instead of `on_connect` when the transport cannot be established.
    /// Exactly one of the two fires.
    pub on_fail: Option<Box<dyn FnOnce(ConnId) + Send>>,
    pub tls: Option<Tls>,
    pub timeout: u32,
}

// ---------------------------------------------------------------------------
// Reactor handle
// ---------------------------------------------------------------------------

struct ReactorInner {
    registry: Registry,
    settings: ReactorSettings,
    lifecycle: Lifecycle,
    /// Coarse wall clock, unix seconds, refreshed by the ticker task.
    tick: AtomicU64,
    conn_count: AtomicUsize,
    shutdown: watch::Sender<bool>,
    /// 0 in the root (or only) process; 1-based in spawned workers.
    worker_id: usize,
}

/// Cheaply cloneable handle to the reactor.  All methods are callable from
/// any task or thread inside the runtime.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    /// Create a reactor inside a running tokio runtime.
    pub fn new(settings: ReactorSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        let worker_id = std::env::var("BRISK_WORKER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let inner = Arc::new(ReactorInner {
            registry: Registry::new(),
            settings,
            lifecycle: Lifecycle::default(),
            tick: AtomicU64::new(unix_now()),
            conn_count: AtomicUsize::new(0),
            shutdown,
            worker_id,
        });

        // Coarse clock: good to ~0.5 s, which is all the Date cache and idle
        // timers need.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.tick.store(unix_now(), Ordering::Relaxed);
                if *inner.shutdown.borrow() {
                    break;
                }
            }
        });

        Reactor { inner }
    }

    /// 1-based worker index, or 0 in the root / single-process case.
    pub fn worker_id(&self) -> usize {
        self.inner.worker_id
    }

    /// Coarse wall clock in unix seconds.  Monotone non-decreasing between
    /// ticker updates; never hits the VDSO on the hot path.
    pub fn last_tick(&self) -> u64 {
        self.inner.tick.load(Ordering::Relaxed)
    }

    pub fn is_valid(&self, id: ConnId) -> bool {
        self.inner.registry.is_valid(id)
    }

    /// Number of live connections (listeners included).
    pub fn connection_count(&self) -> usize {
        self.inner.conn_count.load(Ordering::Relaxed)
    }

    pub fn on_state(&self, event: StateEvent, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.lifecycle.register(event, Arc::new(hook));
    }

    pub(crate) fn fire_state(&self, event: StateEvent) {
        self.inner.lifecycle.fire(event);
    }

    // -----------------------------------------------------------------------
    // Listening and connecting
    // -----------------------------------------------------------------------

    /// Bind `addr` and accept connections, attaching a protocol from the
    /// factory to each.  `addr` is `host:port`, or a filesystem path for a
    /// UNIX socket.  Closing the returned listener handle stops the accept
    /// loop.
    pub fn listen(&self, addr: &str, opts: ListenOptions) -> Result<Listener, CoreError> {
        if opts.tls.is_some() && addr.contains('/') {
            return Err(CoreError::TlsUnavailable);
        }
        let acceptor = Acceptor::bind(addr, self.multi_worker())?;
        let local = acceptor.local_label();
        let port = acceptor.port();

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.registry.allocate(SlotEntry {
            cmd: tx,
            queued: Arc::new(AtomicUsize::new(0)),
            timeout: Arc::new(AtomicU32::new(0)),
        });
        self.inner.conn_count.fetch_add(1, Ordering::Relaxed);
        debug!(listener = %id, addr = %local, "listening");

        let reactor = self.clone();
        tokio::spawn(accept_loop(reactor, id, acceptor, opts, rx));
        Ok(Listener { id, port })
    }

    /// Open an outgoing connection.  Exactly one of `on_connect` / `on_fail`
    /// fires, on the connection's task.
    pub fn connect(&self, addr: &str, opts: ConnectOptions) -> Result<ConnId, CoreError> {
        if opts.tls.is_some() && addr.contains('/') {
            return Err(CoreError::TlsUnavailable);
        }
        let addr = addr.to_owned();
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let timeout = Arc::new(AtomicU32::new(opts.timeout));
        let id = self.inner.registry.allocate(SlotEntry {
            cmd: tx,
            queued: queued.clone(),
            timeout: timeout.clone(),
        });
        self.inner.conn_count.fetch_add(1, Ordering::Relaxed);

        let reactor = self.clone();
        tokio::spawn(async move {
            let stream = open_transport(&addr, opts.tls.as_ref()).await;
            match stream {
                Ok(stream) => {
                    let proto = (opts.on_connect)(id);
                    run_connection(reactor, id, stream, Some(proto), rx, queued, timeout).await;
                }
                Err(err) => {
                    debug!(conn = %id, %addr, %err, "connect failed");
                    reactor.inner.registry.invalidate(id);
                    reactor.inner.conn_count.fetch_sub(1, Ordering::Relaxed);
                    if let Some(on_fail) = opts.on_fail {
                        on_fail(id);
                    }
                }
            }
        });
        Ok(id)
    }

    /// Adopt an already-established stream (testing, inherited sockets).
    pub fn adopt(&self, stream: IoStream, proto: Box<dyn Protocol>, timeout: u32) -> ConnId {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let timeout = Arc::new(AtomicU32::new(timeout));
        let id = self.inner.registry.allocate(SlotEntry {
            cmd: tx,
            queued: queued.clone(),
            timeout: timeout.clone(),
        });
        self.inner.conn_count.fetch_add(1, Ordering::Relaxed);
        let reactor = self.clone();
        tokio::spawn(run_connection(
            reactor,
            id,
            stream,
            Some(proto),
            rx,
            queued,
            timeout,
        ));
        id
    }

    // -----------------------------------------------------------------------
    // Per-connection operations (validated, fire-and-forget)
    // -----------------------------------------------------------------------

    /// Queue bytes on a connection.  A stale handle is a logged no-op.
    pub fn write(&self, id: ConnId, data: impl Into<Bytes>) {
        self.write_chunk(id, OutChunk::Data(data.into()));
    }

    /// Queue a file range for sending.
    pub fn sendfile(&self, id: ConnId, file: Arc<std::fs::File>, offset: u64, len: u64) {
        self.write_chunk(id, OutChunk::File { file, offset, len });
    }

    pub fn write_chunk(&self, id: ConnId, chunk: OutChunk) {
        self.send_cmd(id, Cmd::Write(chunk), "write");
    }

    /// Flush queued output, then close.
    pub fn close(&self, id: ConnId) {
        self.send_cmd(id, Cmd::Close, "close");
    }

    /// Close without flushing.
    pub fn force_close(&self, id: ConnId) {
        self.send_cmd(id, Cmd::ForceClose, "force_close");
    }

    pub fn touch(&self, id: ConnId) {
        self.send_cmd(id, Cmd::Touch, "touch");
    }

    /// Install a protocol on a hijacked (or freshly adopted) connection.
    pub fn attach_protocol(&self, id: ConnId, proto: Box<dyn Protocol>) {
        self.send_cmd(id, Cmd::Attach(proto), "attach");
    }

    pub fn timeout_set(&self, id: ConnId, seconds: u32) {
        if let Some(entry) = self.inner.registry.get(id) {
            entry.timeout.store(seconds, Ordering::Relaxed);
        }
    }

    pub fn timeout_get(&self, id: ConnId) -> Option<u32> {
        self.inner
            .registry
            .get(id)
            .map(|e| e.timeout.load(Ordering::Relaxed))
    }

    fn send_cmd(&self, id: ConnId, cmd: Cmd, what: &str) {
        match self.inner.registry.get(id) {
            Some(entry) => {
                if let Cmd::Write(ref chunk) = cmd {
                    // Account at enqueue time so backpressure sees writes that
                    // are still sitting in the command queue.
                    entry.queued.fetch_add(chunk.remaining(), Ordering::Relaxed);
                }
                if entry.cmd.send(cmd).is_err() {
                    trace!(conn = %id, what, "connection task already gone");
                }
            }
            None => trace!(conn = %id, what, "stale handle ignored"),
        }
    }

    // -----------------------------------------------------------------------
    // Deferred work
    // -----------------------------------------------------------------------

    /// Run `f` on the runtime's pool, outside any connection's serialization.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        tokio::spawn(async move { f() });
    }

    /// Run `task` under `id`'s serialization, with access to its protocol.
    /// If the connection is already gone (or dies before the task runs),
    /// `fallback` fires instead.
    pub fn defer_io(
        &self,
        id: ConnId,
        task: IoTask,
        fallback: Option<Box<dyn FnOnce(ConnId) + Send>>,
    ) {
        match self.inner.registry.get(id) {
            Some(entry) => {
                if entry.cmd.send(Cmd::Task(task)).is_err() {
                    if let Some(fb) = fallback {
                        fb(id);
                    }
                }
            }
            None => {
                if let Some(fb) = fallback {
                    fb(id);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Begin a graceful stop.  Idempotent.
    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Stop on SIGINT / SIGTERM.
    pub fn stop_on_signals(&self) {
        let reactor = self.clone();
        tokio::spawn(async move {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("signal handler registration");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            debug!("termination signal received");
            reactor.stop();
        });
    }

    /// Drive the reactor until [`stop`](Self::stop) is called, then drain:
    /// every live connection gets its `on_shutdown`, the grace hints are
    /// honored up to `shutdown_timeout`, stragglers are force-closed.
    pub async fn run(&self) {
        let mut rx = self.shutdown_rx();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        self.fire_state(StateEvent::OnShutdown);
        let live = self.inner.registry.live();
        debug!(connections = live.len(), "draining");
        for (_, entry) in &live {
            let _ = entry.cmd.send(Cmd::Shutdown);
        }

        let deadline = Instant::now() + Duration::from_secs(self.inner.settings.shutdown_timeout);
        while self.inner.conn_count.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for (id, entry) in self.inner.registry.live() {
            warn!(conn = %id, "force-closing at shutdown deadline");
            let _ = entry.cmd.send(Cmd::ForceClose);
        }
        while self.inner.conn_count.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.fire_state(StateEvent::OnFinish);
    }

    fn multi_worker(&self) -> bool {
        self.inner.settings.workers > 1 || self.inner.worker_id != 0
    }

    pub(crate) fn settings(&self) -> &ReactorSettings {
        &self.inner.settings
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub(crate) fn conn_count(&self) -> &AtomicUsize {
        &self.inner.conn_count
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Transport plumbing
// ---------------------------------------------------------------------------

enum Acceptor {
    Tcp(tokio::net::TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Acceptor {
    fn bind(addr: &str, reuse_port: bool) -> Result<Self, CoreError> {
        if addr.contains('/') {
            let path = PathBuf::from(addr);
            // A previous run may have left the socket file behind.
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path).map_err(|source| CoreError::Bind {
                addr: addr.to_owned(),
                source,
            })?;
            return Ok(Acceptor::Unix(listener, path));
        }

        let sockaddr = resolve(addr)?;
        let socket = if sockaddr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(CoreError::Io)?;
        socket.set_reuseaddr(true).map_err(CoreError::Io)?;
        if reuse_port {
            // Workers each bind their own listener; the kernel load-balances
            // accepts across them.
            socket.set_reuseport(true).map_err(CoreError::Io)?;
        }
        socket.bind(sockaddr).map_err(|source| CoreError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
        let listener = socket.listen(1024).map_err(|source| CoreError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
        Ok(Acceptor::Tcp(listener))
    }

    fn local_label(&self) -> String {
        match self {
            Acceptor::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_owned()),
            Acceptor::Unix(_, path) => path.display().to_string(),
        }
    }

    /// The bound TCP port (0 for UNIX listeners); lets callers bind port 0
    /// and discover the real port.
    pub fn port(&self) -> u16 {
        match self {
            Acceptor::Tcp(l) => l.local_addr().map(|a| a.port()).unwrap_or(0),
            Acceptor::Unix(..) => 0,
        }
    }

    async fn accept(&self) -> std::io::Result<IoStream> {
        match self {
            Acceptor::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            Acceptor::Unix(l, _) => {
                let (stream, _) = l.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    async fn accept_tcp_raw(&self) -> std::io::Result<TcpStream> {
        match self {
            Acceptor::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Acceptor::Unix(..) => unreachable!("TLS rejected on UNIX listeners at bind"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let Acceptor::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn resolve(addr: &str) -> Result<std::net::SocketAddr, CoreError> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs()
        .map_err(|_| CoreError::BadAddress(addr.to_owned()))?
        .next()
        .ok_or_else(|| CoreError::BadAddress(addr.to_owned()))
}

async fn open_transport(addr: &str, tls: Option<&Tls>) -> std::io::Result<IoStream> {
    if addr.contains('/') {
        let stream = UnixStream::connect(addr).await?;
        return Ok(Box::new(stream));
    }
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    match tls {
        Some(tls) => tls.provider.connect(stream, &tls.server_name).await,
        None => Ok(Box::new(stream)),
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

async fn accept_loop(
    reactor: Reactor,
    listener_id: ConnId,
    acceptor: Acceptor,
    opts: ListenOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
) {
    let mut shutdown = reactor.shutdown_rx();
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Close | Cmd::ForceClose | Cmd::Shutdown) | None => break,
                Some(_) => {}
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = accept_stream(&acceptor, opts.tls.as_ref()) => {
                match accepted {
                    Ok(stream) => {
                        let max = reactor.settings().max_clients;
                        if max != 0 && reactor.connection_count() >= max {
                            warn!("connection capacity reached, dropping accept");
                            if let Some(busy) = opts.busy_response.clone() {
                                tokio::spawn(async move {
                                    let mut stream = stream;
                                    let _ = stream.write_all(&busy).await;
                                });
                            }
                            continue;
                        }
                        spawn_accepted(&reactor, stream, &opts);
                    }
                    Err(err) => {
                        // Per-accept errors (including failed TLS handshakes)
                        // must not take the listener down.
                        debug!(listener = %listener_id, %err, "accept failed");
                    }
                }
            }
        }
    }
    reactor.registry().invalidate(listener_id);
    reactor.conn_count().fetch_sub(1, Ordering::Relaxed);
    debug!(listener = %listener_id, "listener closed");
}

async fn accept_stream(acceptor: &Acceptor, tls: Option<&Tls>) -> std::io::Result<IoStream> {
    match tls {
        None => acceptor.accept().await,
        Some(tls) => {
            let raw = acceptor.accept_tcp_raw().await?;
            tls.provider.accept(raw).await
        }
    }
}

fn spawn_accepted(reactor: &Reactor, stream: IoStream, opts: &ListenOptions) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    let timeout = Arc::new(AtomicU32::new(opts.timeout));
    let id = reactor.registry().allocate(SlotEntry {
        cmd: tx,
        queued: queued.clone(),
        timeout: timeout.clone(),
    });
    reactor.conn_count().fetch_add(1, Ordering::Relaxed);

    let proto = (opts.factory)(id);
    match proto {
        Some(proto) => {
            tokio::spawn(run_connection(
                reactor.clone(),
                id,
                stream,
                Some(proto),
                rx,
                queued,
                timeout,
            ));
        }
        None => {
            reactor.registry().invalidate(id);
            reactor.conn_count().fetch_sub(1, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// The connection task
// ---------------------------------------------------------------------------

struct TaskState {
    closing: Option<CloseMode>,
    reads_suspended: bool,
    shutdown_deadline: Option<Instant>,
    last_activity: Instant,
}

type Callback<'f> = Box<dyn FnOnce(&mut dyn Protocol, &mut Conn<'_>) + 'f>;

enum Step<'f> {
    User(Callback<'f>),
    Attach,
    Data,
}

/// Invoke one protocol callback and apply its effects.  A protocol swap
/// chains into the new protocol's `on_attach`, and an attach with leftover
/// buffered input chains into `on_data` so upgrade handoffs see the bytes
/// that arrived with the original request.
#[allow(clippy::too_many_arguments)]
fn run_callback(
    reactor: &Reactor,
    id: ConnId,
    proto: &mut Option<Box<dyn Protocol>>,
    input: &mut BytesMut,
    timeout: &Arc<AtomicU32>,
    state: &mut TaskState,
    f: Step<'_>,
) {
    let mut step = Some(f);
    // Bounded so a protocol that keeps swapping cannot spin forever.
    let mut hops = 8u8;
    while let Some(current) = step.take() {
        let Some(p) = proto.as_mut() else { return };
        let was_attach = matches!(current, Step::Attach);
        let callback: Callback<'_> = match current {
            Step::User(f) => f,
            Step::Attach => Box::new(|p, c| p.on_attach(c)),
            Step::Data => Box::new(|p, c| p.on_data(c)),
        };
        let mut effects = Effects::default();
        {
            let mut conn = Conn {
                id,
                reactor,
                input,
                effects: &mut effects,
                timeout,
            };
            callback(p.as_mut(), &mut conn);
        }
        let swapped = effects.swap.is_some();
        apply_effects(effects, proto, state, id);

        if hops == 0 {
            return;
        }
        hops -= 1;
        if swapped {
            step = Some(Step::Attach);
        } else if was_attach && !input.is_empty() && state.closing.is_none() {
            step = Some(Step::Data);
        }
    }
}

async fn run_connection(
    reactor: Reactor,
    id: ConnId,
    stream: IoStream,
    mut proto: Option<Box<dyn Protocol>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    queued: Arc<AtomicUsize>,
    timeout: Arc<AtomicU32>,
) {
    let (mut rh, mut wh) = tokio::io::split(stream);
    let mut input = BytesMut::with_capacity(8 * 1024);
    let mut outq = WriteQueue::new();
    let mut state = TaskState {
        closing: None,
        reads_suspended: false,
        shutdown_deadline: None,
        last_activity: Instant::now(),
    };
    let soft_limit = reactor.settings().write_backlog_soft;

    if proto.is_some() {
        run_callback(
            &reactor,
            id,
            &mut proto,
            &mut input,
            &timeout,
            &mut state,
            Step::Attach,
        );
    }

    'main: loop {
        if state.closing == Some(CloseMode::Force) {
            break;
        }
        if state.closing == Some(CloseMode::Flush) && outq.is_empty() {
            break;
        }

        let tmo_secs = timeout.load(Ordering::Relaxed);
        let idle_deadline = state.last_activity
            + Duration::from_secs(u64::from(tmo_secs.max(1)))
                .min(Duration::from_secs(24 * 3600));
        let grace_deadline = state.shutdown_deadline;

        let can_read = proto.is_some()
            && !state.reads_suspended
            && state.closing.is_none()
            && queued.load(Ordering::Relaxed) < soft_limit;

        input.reserve(8 * 1024);

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Cmd::Write(chunk) => {
                        // Enqueue-time accounting already happened in send_cmd.
                        outq.push_preaccounted(chunk);
                    }
                    Cmd::Close => {
                        state.closing.get_or_insert(CloseMode::Flush);
                    }
                    Cmd::ForceClose => {
                        state.closing = Some(CloseMode::Force);
                    }
                    Cmd::Touch => {
                        state.last_activity = Instant::now();
                    }
                    Cmd::Task(task) => {
                        run_callback(
                            &reactor,
                            id,
                            &mut proto,
                            &mut input,
                            &timeout,
                            &mut state,
                            Step::User(task),
                        );
                    }
                    Cmd::Attach(new_proto) => {
                        if let Some(mut old) = proto.replace(new_proto) {
                            old.on_close(id);
                        }
                        state.reads_suspended = false;
                        run_callback(
                            &reactor,
                            id,
                            &mut proto,
                            &mut input,
                            &timeout,
                            &mut state,
                            Step::Attach,
                        );
                    }
                    Cmd::Shutdown => {
                        if let Some(p) = proto.as_mut() {
                            let (grace, effects) = {
                                let mut effects = Effects::default();
                                let mut conn = Conn {
                                    id,
                                    reactor: &reactor,
                                    input: &mut input,
                                    effects: &mut effects,
                                    timeout: &timeout,
                                };
                                let grace = p.on_shutdown(&mut conn);
                                (grace, effects)
                            };
                            apply_effects(effects, &mut proto, &mut state, id);
                            // Even a zero grace goes through the deadline arm
                            // so writes the callback just queued still land.
                            state.shutdown_deadline =
                                Some(Instant::now() + Duration::from_secs(u64::from(grace)));
                        } else {
                            state.closing.get_or_insert(CloseMode::Flush);
                        }
                    }
                }
            }

            res = outq.write_step(&mut wh, &queued), if !outq.is_empty() => {
                match res {
                    Ok(true) => {
                        // Fully drained.
                        if state.closing == Some(CloseMode::Flush) {
                            break 'main;
                        }
                        run_callback(
                            &reactor,
                            id,
                            &mut proto,
                            &mut input,
                            &timeout,
                            &mut state,
                            Step::User(Box::new(|p, c| p.on_ready(c))),
                        );
                    }
                    Ok(false) => {}
                    Err(err) => {
                        debug!(conn = %id, %err, "write failed");
                        break 'main;
                    }
                }
            }

            res = rh.read_buf(&mut input), if can_read => {
                match res {
                    Ok(0) => {
                        // Peer finished sending; flush what we owe and close.
                        state.closing.get_or_insert(CloseMode::Flush);
                    }
                    Ok(_) => {
                        state.last_activity = Instant::now();
                        run_callback(
                            &reactor,
                            id,
                            &mut proto,
                            &mut input,
                            &timeout,
                            &mut state,
                            Step::Data,
                        );
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        debug!(conn = %id, %err, "read failed");
                        break 'main;
                    }
                }
            }

            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(idle_deadline)),
                if tmo_secs > 0 && proto.is_some() && state.closing.is_none() =>
            {
                state.last_activity = Instant::now();
                run_callback(
                    &reactor,
                    id,
                    &mut proto,
                    &mut input,
                    &timeout,
                    &mut state,
                    Step::User(Box::new(|p, c| p.ping(c))),
                );
            }

            _ = sleep_until_opt(grace_deadline), if grace_deadline.is_some() => {
                state.closing.get_or_insert(CloseMode::Flush);
            }
        }
    }

    // Invalidate first: once teardown begins, no handle may reach us.
    reactor.registry().invalidate(id);
    drop(cmd_rx);
    if let Some(mut p) = proto.take() {
        p.on_close(id);
    }
    reactor.conn_count().fetch_sub(1, Ordering::Relaxed);
    trace!(conn = %id, "connection task finished");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}

fn apply_effects(
    effects: Effects,
    proto: &mut Option<Box<dyn Protocol>>,
    state: &mut TaskState,
    id: ConnId,
) {
    if effects.touch {
        state.last_activity = Instant::now();
    }
    if let Some(suspended) = effects.reads_suspended {
        state.reads_suspended = suspended;
    }
    if effects.hijack {
        // Ownership moved to the caller; the old protocol is gone without an
        // on_close, and reads stay off until a new protocol is attached.
        proto.take();
        state.reads_suspended = true;
    }
    if let Some(new_proto) = effects.swap {
        if let Some(mut old) = proto.replace(new_proto) {
            old.on_close(id);
        }
        state.reads_suspended = false;
    }
}
