//! Cross-process fan-out over a UNIX-socket mesh.
//!
//! The root process binds `<tmp>/brisk-<pid>.sock`; each worker connects on
//! startup.  Frames use a fixed 16-byte header:
//!
//! ```text
//! payload_len:u32 | filter:i32 | flags:u16 | reserved:u16 | msg_id:u32
//! ```
//!
//! followed by `payload_len` bytes of `channel_len:u16 | channel | message`
//! (little-endian throughout; the link never leaves the host).  Message
//! frames from a worker are delivered locally in the root and fanned out to
//! every other worker; subscription deltas flow worker→root only, keeping
//! the root's interest table authoritative for external engines.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, trace, warn};

use crate::bus::Bus;
use crate::engine::Engine;
use crate::error::PubSubError;
use crate::message::Message;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

pub const FLAG_JSON: u16 = 1;
pub const FLAG_SUBSCRIBE: u16 = 1 << 1;
pub const FLAG_UNSUBSCRIBE: u16 = 1 << 2;
pub const FLAG_PATTERN: u16 = 1 << 3;
pub const FLAG_PING: u16 = 1 << 4;

const HEADER_LEN: usize = 16;
/// Frames above this are a protocol violation (a worker gone wrong), not
/// legitimate traffic.
const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterFrame {
    pub filter: i32,
    pub flags: u16,
    pub msg_id: u32,
    pub channel: Bytes,
    pub payload: Bytes,
}

impl ClusterFrame {
    pub fn message(msg: &Message) -> Self {
        ClusterFrame {
            filter: msg.filter,
            flags: if msg.is_json { FLAG_JSON } else { 0 },
            msg_id: msg.sequence(),
            channel: msg.channel.clone(),
            payload: msg.payload.clone(),
        }
    }

    pub fn subscribe(channel: &Bytes, pattern: bool) -> Self {
        ClusterFrame {
            filter: 0,
            flags: FLAG_SUBSCRIBE | if pattern { FLAG_PATTERN } else { 0 },
            msg_id: 0,
            channel: channel.clone(),
            payload: Bytes::new(),
        }
    }

    pub fn unsubscribe(channel: &Bytes, pattern: bool) -> Self {
        ClusterFrame {
            filter: 0,
            flags: FLAG_UNSUBSCRIBE | if pattern { FLAG_PATTERN } else { 0 },
            msg_id: 0,
            channel: channel.clone(),
            payload: Bytes::new(),
        }
    }

    pub fn ping() -> Self {
        ClusterFrame {
            filter: 0,
            flags: FLAG_PING,
            msg_id: 0,
            channel: Bytes::new(),
            payload: Bytes::new(),
        }
    }
}

pub struct ClusterCodec;

impl Decoder for ClusterCodec {
    type Item = ClusterFrame;
    type Error = PubSubError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClusterFrame>, PubSubError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let payload_len = u32::from_le_bytes(src[0..4].try_into().expect("4 bytes")) as usize;
        if payload_len > MAX_FRAME {
            return Err(PubSubError::FrameTooLarge(payload_len));
        }
        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        header.advance(4);
        let filter = header.get_i32_le();
        let flags = header.get_u16_le();
        let _reserved = header.get_u16_le();
        let msg_id = header.get_u32_le();

        let mut body = src.split_to(payload_len);
        if body.len() < 2 {
            return Err(PubSubError::Truncated("missing channel length"));
        }
        let channel_len = body.get_u16_le() as usize;
        if body.len() < channel_len {
            return Err(PubSubError::Truncated("channel"));
        }
        let channel = body.split_to(channel_len).freeze();
        let payload = body.freeze();
        Ok(Some(ClusterFrame {
            filter,
            flags,
            msg_id,
            channel,
            payload,
        }))
    }
}

impl Encoder<ClusterFrame> for ClusterCodec {
    type Error = PubSubError;

    fn encode(&mut self, frame: ClusterFrame, dst: &mut BytesMut) -> Result<(), PubSubError> {
        let channel_len =
            u16::try_from(frame.channel.len()).map_err(|_| PubSubError::ChannelTooLong)?;
        let payload_len = 2 + frame.channel.len() + frame.payload.len();
        let payload_len32 =
            u32::try_from(payload_len).map_err(|_| PubSubError::FrameTooLarge(payload_len))?;

        dst.reserve(HEADER_LEN + payload_len);
        dst.put_u32_le(payload_len32);
        dst.put_i32_le(frame.filter);
        dst.put_u16_le(frame.flags);
        dst.put_u16_le(0);
        dst.put_u32_le(frame.msg_id);
        dst.put_u16_le(channel_len);
        dst.put_slice(&frame.channel);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// The rendezvous path for a given root pid.
pub fn socket_path(root_pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("brisk-{root_pid}.sock"))
}

// ---------------------------------------------------------------------------
// Root side
// ---------------------------------------------------------------------------

struct LinkState {
    tx: mpsc::UnboundedSender<ClusterFrame>,
    /// Pairs this worker registered, so a dead link releases its interest.
    interest: HashSet<(Bytes, bool)>,
}

struct RootInner {
    bus: Bus,
    links: Mutex<HashMap<u64, LinkState>>,
    next_link: AtomicU64,
    next_msg: AtomicU32,
    path: PathBuf,
}

/// The root end of the mesh.  Also usable as the root process's default
/// engine: a root-originated publish is delivered locally and fanned out to
/// every worker.
#[derive(Clone)]
pub struct ClusterRoot {
    inner: Arc<RootInner>,
}

impl ClusterRoot {
    /// Bind the mesh listener at the per-pid rendezvous path.
    pub fn bind(bus: Bus) -> io::Result<Self> {
        Self::bind_at(bus, socket_path(std::process::id()))
    }

    /// Bind at an explicit path (tests).
    pub fn bind_at(bus: Bus, path: PathBuf) -> io::Result<Self> {
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        let root = ClusterRoot {
            inner: Arc::new(RootInner {
                bus,
                links: Mutex::new(HashMap::new()),
                next_link: AtomicU64::new(1),
                next_msg: AtomicU32::new(1),
                path,
            }),
        };
        let accept_root = root.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => accept_root.spawn_link(stream),
                    Err(err) => {
                        warn!(%err, "cluster accept failed");
                        break;
                    }
                }
            }
        });
        Ok(root)
    }

    pub fn path(&self) -> &PathBuf {
        &self.inner.path
    }

    fn spawn_link(&self, stream: UnixStream) {
        let link_id = self.inner.next_link.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<ClusterFrame>();
        self.inner.links.lock().insert(
            link_id,
            LinkState {
                tx,
                interest: HashSet::new(),
            },
        );
        debug!(link = link_id, "worker link up");

        let root = self.clone();
        tokio::spawn(async move {
            let (mut sink, mut source) = Framed::new(stream, ClusterCodec).split();
            loop {
                tokio::select! {
                    out = rx.recv() => match out {
                        Some(frame) => {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = source.next() => match frame {
                        Some(Ok(frame)) => root.on_frame(link_id, frame),
                        Some(Err(err)) => {
                            warn!(link = link_id, %err, "cluster link error");
                            break;
                        }
                        None => break,
                    },
                }
            }
            root.drop_link(link_id);
        });
    }

    fn on_frame(&self, link_id: u64, frame: ClusterFrame) {
        let pattern = frame.flags & FLAG_PATTERN != 0;
        if frame.flags & FLAG_PING != 0 {
            if let Some(link) = self.inner.links.lock().get(&link_id) {
                let _ = link.tx.send(ClusterFrame::ping());
            }
            return;
        }
        if frame.flags & FLAG_SUBSCRIBE != 0 {
            let fresh = {
                let mut links = self.inner.links.lock();
                links
                    .get_mut(&link_id)
                    .is_some_and(|l| l.interest.insert((frame.channel.clone(), pattern)))
            };
            if fresh {
                self.inner.bus.remote_interest_up(&frame.channel, pattern);
            }
            return;
        }
        if frame.flags & FLAG_UNSUBSCRIBE != 0 {
            let released = {
                let mut links = self.inner.links.lock();
                links
                    .get_mut(&link_id)
                    .is_some_and(|l| l.interest.remove(&(frame.channel.clone(), pattern)))
            };
            if released {
                self.inner.bus.remote_interest_down(&frame.channel, pattern);
            }
            return;
        }

        // Ordinary message: deliver in the root, fan out to the other
        // workers.
        trace!(link = link_id, channel = %String::from_utf8_lossy(&frame.channel), "relaying");
        self.inner.bus.deliver_remote(
            frame.filter,
            frame.channel.clone(),
            frame.payload.clone(),
            frame.flags & FLAG_JSON != 0,
        );
        let links = self.inner.links.lock();
        for (id, link) in links.iter() {
            if *id != link_id {
                let _ = link.tx.send(frame.clone());
            }
        }
    }

    fn drop_link(&self, link_id: u64) {
        let state = self.inner.links.lock().remove(&link_id);
        if let Some(state) = state {
            debug!(link = link_id, "worker link down");
            for (channel, pattern) in state.interest {
                self.inner.bus.remote_interest_down(&channel, pattern);
            }
        }
    }
}

impl Engine for ClusterRoot {
    fn subscribe(&self, _channel: &Bytes, _pattern: bool) {
        // Root interest is already authoritative; workers learn about
        // channels from the frames themselves.
    }

    fn unsubscribe(&self, _channel: &Bytes, _pattern: bool) {}

    fn publish(&self, message: &Message) {
        self.inner.bus.deliver_local(message);
        let frame = ClusterFrame {
            msg_id: self.inner.next_msg.fetch_add(1, Ordering::Relaxed),
            ..ClusterFrame::message(message)
        };
        let links = self.inner.links.lock();
        for link in links.values() {
            let _ = link.tx.send(frame.clone());
        }
    }

    fn name(&self) -> &str {
        "cluster-root"
    }
}

impl Drop for RootInner {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

struct WorkerInner {
    bus: Bus,
    tx: mpsc::UnboundedSender<ClusterFrame>,
    next_msg: AtomicU32,
    /// Recently relayed message ids; duplicates from engine crossover are
    /// dropped.
    seen: Mutex<VecDeque<u32>>,
}

/// A worker's end of the mesh.  The engine of record for worker processes:
/// publishing delivers locally and forwards to the root; subscription deltas
/// keep the root's interest table current.
#[derive(Clone)]
pub struct ClusterLink {
    inner: Arc<WorkerInner>,
}

const SEEN_RING: usize = 128;
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

impl ClusterLink {
    /// Connect to the root at the per-pid rendezvous path, retrying until
    /// the root appears.  Frames sent while disconnected are buffered.
    pub fn connect(bus: Bus, root_pid: u32) -> Self {
        Self::connect_at(bus, socket_path(root_pid))
    }

    pub fn connect_at(bus: Bus, path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ClusterLink {
            inner: Arc::new(WorkerInner {
                bus,
                tx,
                next_msg: AtomicU32::new(1),
                seen: Mutex::new(VecDeque::with_capacity(SEEN_RING)),
            }),
        };
        let worker = link.clone();
        tokio::spawn(worker.run(path, rx));
        link
    }

    async fn run(self, path: PathBuf, mut rx: mpsc::UnboundedReceiver<ClusterFrame>) {
        loop {
            let stream = match UnixStream::connect(&path).await {
                Ok(stream) => stream,
                Err(err) => {
                    trace!(path = %path.display(), %err, "cluster root not reachable yet");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            debug!(path = %path.display(), "cluster link established");
            let (mut sink, mut source) = Framed::new(stream, ClusterCodec).split();
            loop {
                tokio::select! {
                    out = rx.recv() => match out {
                        Some(frame) => {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        // All senders gone: the process is going away.
                        None => return,
                    },
                    frame = source.next() => match frame {
                        Some(Ok(frame)) => self.on_frame(frame),
                        Some(Err(err)) => {
                            warn!(%err, "cluster link read error");
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("cluster link lost; reconnecting");
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    fn on_frame(&self, frame: ClusterFrame) {
        if frame.flags & (FLAG_PING | FLAG_SUBSCRIBE | FLAG_UNSUBSCRIBE) != 0 {
            return;
        }
        if frame.msg_id != 0 {
            let mut seen = self.inner.seen.lock();
            if seen.contains(&frame.msg_id) {
                return;
            }
            if seen.len() == SEEN_RING {
                seen.pop_front();
            }
            seen.push_back(frame.msg_id);
        }
        self.inner.bus.deliver_remote(
            frame.filter,
            frame.channel,
            frame.payload,
            frame.flags & FLAG_JSON != 0,
        );
    }
}

impl Engine for ClusterLink {
    fn subscribe(&self, channel: &Bytes, pattern: bool) {
        let _ = self.inner.tx.send(ClusterFrame::subscribe(channel, pattern));
    }

    fn unsubscribe(&self, channel: &Bytes, pattern: bool) {
        let _ = self
            .inner
            .tx
            .send(ClusterFrame::unsubscribe(channel, pattern));
    }

    fn publish(&self, message: &Message) {
        self.inner.bus.deliver_local(message);
        let frame = ClusterFrame {
            msg_id: self.inner.next_msg.fetch_add(1, Ordering::Relaxed),
            ..ClusterFrame::message(message)
        };
        let _ = self.inner.tx.send(frame);
    }

    fn name(&self) -> &str {
        "cluster-link"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{OnMessage, PublishOptions, SubscribeOptions, Target};
    use std::sync::Mutex as StdMutex;
    use tokio::time::timeout;

    fn codec_roundtrip(frame: ClusterFrame) -> ClusterFrame {
        let mut buf = BytesMut::new();
        ClusterCodec.encode(frame, &mut buf).unwrap();
        ClusterCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn frame_roundtrip_preserves_all_fields() {
        let frame = ClusterFrame {
            filter: -10,
            flags: FLAG_JSON | FLAG_PATTERN,
            msg_id: 77,
            channel: Bytes::from_static(b"chan.*"),
            payload: Bytes::from_static(b"payload bytes"),
        };
        assert_eq!(codec_roundtrip(frame.clone()), frame);
    }

    #[test]
    fn oversized_channel_name_is_rejected_at_encode() {
        let frame = ClusterFrame {
            filter: 0,
            flags: 0,
            msg_id: 1,
            channel: Bytes::from(vec![b'c'; usize::from(u16::MAX) + 1]),
            payload: Bytes::new(),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            ClusterCodec.encode(frame, &mut buf),
            Err(PubSubError::ChannelTooLong)
        ));
    }

    #[test]
    fn decoder_waits_for_full_frame() {
        let frame = ClusterFrame {
            filter: 0,
            flags: 0,
            msg_id: 1,
            channel: Bytes::from_static(b"c"),
            payload: Bytes::from_static(b"hello"),
        };
        let mut full = BytesMut::new();
        ClusterCodec.encode(frame.clone(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..10]);
        assert!(ClusterCodec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[10..]);
        assert_eq!(ClusterCodec.decode(&mut partial).unwrap().unwrap(), frame);
    }

    fn collector(bus: &Bus, channel: &str) -> (crate::bus::Subscription, Arc<StdMutex<Vec<Vec<u8>>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb: OnMessage = Arc::new(move |msg: &Message| {
            seen2.lock().unwrap().push(msg.payload.to_vec());
        });
        (bus.subscribe(SubscribeOptions::channel(channel.to_owned(), cb)), seen)
    }

    #[tokio::test]
    async fn worker_publish_reaches_other_worker_through_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");

        // Three buses simulate three processes sharing one host.
        let root_bus = Bus::new();
        let bus_a = Bus::new();
        let bus_b = Bus::new();

        let root = ClusterRoot::bind_at(root_bus.clone(), path.clone()).unwrap();
        let link_a = ClusterLink::connect_at(bus_a.clone(), path.clone());
        let link_b = ClusterLink::connect_at(bus_b.clone(), path.clone());
        bus_a.attach(Arc::new(link_a.clone()) as Arc<dyn Engine>);
        bus_b.attach(Arc::new(link_b.clone()) as Arc<dyn Engine>);

        let (_sub_a, seen_a) = collector(&bus_a, "c");
        let (_sub_b, seen_b) = collector(&bus_b, "c");
        let (_sub_root, seen_root) = collector(&root_bus, "c");

        // Give the links a beat to connect.
        tokio::time::sleep(Duration::from_millis(100)).await;

        bus_a.publish(
            PublishOptions::new("c", "from-a")
                .target(Target::Engine(Arc::new(link_a.clone()) as Arc<dyn Engine>)),
        );

        timeout(Duration::from_secs(2), async {
            loop {
                if !seen_b.lock().unwrap().is_empty() && !seen_root.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message should fan out");

        // Local delivery in the publisher, remote delivery elsewhere —
        // exactly once each.
        assert_eq!(seen_a.lock().unwrap().as_slice(), &[b"from-a".to_vec()]);
        assert_eq!(seen_b.lock().unwrap().as_slice(), &[b"from-a".to_vec()]);
        assert_eq!(seen_root.lock().unwrap().as_slice(), &[b"from-a".to_vec()]);
        drop(root);
    }

    #[tokio::test]
    async fn root_publish_fans_to_all_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");

        let root_bus = Bus::new();
        let bus_a = Bus::new();

        let root = ClusterRoot::bind_at(root_bus.clone(), path.clone()).unwrap();
        let link_a = ClusterLink::connect_at(bus_a.clone(), path.clone());
        bus_a.attach(Arc::new(link_a) as Arc<dyn Engine>);

        let (_sub_a, seen_a) = collector(&bus_a, "announce");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let engine: Arc<dyn Engine> = Arc::new(root.clone());
        root_bus.publish(
            PublishOptions::new("announce", "hello workers").target(Target::Engine(engine)),
        );

        timeout(Duration::from_secs(2), async {
            loop {
                if !seen_a.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("root publish should reach the worker");
        assert_eq!(
            seen_a.lock().unwrap().as_slice(),
            &[b"hello workers".to_vec()]
        );
    }

    #[tokio::test]
    async fn subscription_deltas_reach_root_interest_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.sock");

        let root_bus = Bus::new();
        let bus_a = Bus::new();

        let _root = ClusterRoot::bind_at(root_bus.clone(), path.clone()).unwrap();
        let link_a = ClusterLink::connect_at(bus_a.clone(), path.clone());
        bus_a.attach(Arc::new(link_a) as Arc<dyn Engine>);

        // An external engine attached in the root sees worker interest.
        struct Log(StdMutex<Vec<(Vec<u8>, bool, bool)>>);
        impl Engine for Log {
            fn subscribe(&self, channel: &Bytes, pattern: bool) {
                self.0.lock().unwrap().push((channel.to_vec(), pattern, true));
            }
            fn unsubscribe(&self, channel: &Bytes, pattern: bool) {
                self.0.lock().unwrap().push((channel.to_vec(), pattern, false));
            }
            fn publish(&self, _message: &Message) {}
        }
        let log = Arc::new(Log(StdMutex::new(Vec::new())));
        root_bus.attach(log.clone() as Arc<dyn Engine>);

        let (sub1, _) = collector(&bus_a, "watched");
        let (sub2, _) = collector(&bus_a, "watched");

        timeout(Duration::from_secs(2), async {
            loop {
                if !log.0.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscribe delta should arrive");

        drop(sub1);
        drop(sub2);
        timeout(Duration::from_secs(2), async {
            loop {
                if log.0.lock().unwrap().len() >= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("unsubscribe delta should arrive");

        let log = log.0.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            &[
                (b"watched".to_vec(), false, true),
                (b"watched".to_vec(), false, false),
            ]
        );
    }
}
