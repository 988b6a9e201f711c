//! The channel table and delivery paths.
//!
//! Two tables keyed by `(filter, channel)`: exact subscriptions and pattern
//! subscriptions (pattern entries carry their match predicate).  A separate
//! refcount per distinct `(channel, pattern)` pair drives engine
//! notifications, so an external back-end sees one subscribe when the first
//! local consumer appears and one unsubscribe when the last leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::engine::Engine;
use crate::glob::glob_match;
use crate::message::{Message, MetadataKind};

// ---------------------------------------------------------------------------
// Subscription handles
// ---------------------------------------------------------------------------

/// Delivery callback.  State travels in the closure's captures.
pub type OnMessage = Arc<dyn Fn(&Message) + Send + Sync>;

/// Pattern predicate: `(pattern, channel) -> matched`.
pub type MatchFn = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

pub struct SubscribeOptions {
    pub filter: i32,
    pub channel: Bytes,
    pub is_pattern: bool,
    /// Pattern predicate; defaults to glob matching.
    pub matcher: Option<MatchFn>,
    pub on_message: OnMessage,
    pub on_unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscribeOptions {
    pub fn channel(channel: impl Into<Bytes>, on_message: OnMessage) -> Self {
        SubscribeOptions {
            filter: 0,
            channel: channel.into(),
            is_pattern: false,
            matcher: None,
            on_message,
            on_unsubscribe: None,
        }
    }

    pub fn pattern(pattern: impl Into<Bytes>, on_message: OnMessage) -> Self {
        SubscribeOptions {
            filter: 0,
            channel: pattern.into(),
            is_pattern: true,
            matcher: None,
            on_message,
            on_unsubscribe: None,
        }
    }

    pub fn filter(mut self, filter: i32) -> Self {
        self.filter = filter;
        self
    }
}

pub(crate) struct SubInner {
    id: u64,
    filter: i32,
    channel: Bytes,
    is_pattern: bool,
    on_message: OnMessage,
    on_unsubscribe: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    active: AtomicBool,
    bus: Weak<BusInner>,
}

/// A live subscription.  Dropping the handle unsubscribes, which is how a
/// closing connection sheds its subscriptions before its `on_close` returns.
pub struct Subscription {
    inner: Arc<SubInner>,
}

impl Subscription {
    /// Cancel delivery.  Idempotent; fires `on_unsubscribe` once.
    pub fn unsubscribe(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.inner.bus.upgrade() {
            Bus::remove_subscription(&bus, &self.inner);
        }
        if let Some(cb) = self.inner.on_unsubscribe.lock().take() {
            cb();
        }
    }

    pub fn channel(&self) -> &Bytes {
        &self.inner.channel
    }

    pub fn is_pattern(&self) -> bool {
        self.inner.is_pattern
    }

    pub fn filter(&self) -> i32 {
        self.inner.filter
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// Publish targets
// ---------------------------------------------------------------------------

/// Where a publish is routed.
#[derive(Clone, Default)]
pub enum Target {
    /// The configured default engine (cluster when attached, local-only
    /// otherwise).
    #[default]
    Default,
    /// Local subscribers only; never leaves the process.
    Local,
    /// A specific engine.
    Engine(Arc<dyn Engine>),
}

pub struct PublishOptions {
    pub filter: i32,
    pub channel: Bytes,
    pub payload: Bytes,
    pub is_json: bool,
    pub target: Target,
}

impl PublishOptions {
    pub fn new(channel: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        PublishOptions {
            filter: 0,
            channel: channel.into(),
            payload: payload.into(),
            is_json: false,
            target: Target::Default,
        }
    }

    pub fn filter(mut self, filter: i32) -> Self {
        self.filter = filter;
        self
    }

    pub fn json(mut self, is_json: bool) -> Self {
        self.is_json = is_json;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }
}

// ---------------------------------------------------------------------------
// The bus
// ---------------------------------------------------------------------------

struct PatternEntry {
    matcher: MatchFn,
    subs: Vec<Arc<SubInner>>,
}

struct MetadataEntry {
    kind: MetadataKind,
    refs: usize,
    producer: Arc<dyn Fn(&Message) -> Bytes + Send + Sync>,
}

pub(crate) struct BusInner {
    exact: RwLock<HashMap<(i32, Bytes), Vec<Arc<SubInner>>>>,
    patterns: RwLock<HashMap<(i32, Bytes), PatternEntry>>,
    engines: RwLock<Vec<Arc<dyn Engine>>>,
    default_engine: RwLock<Option<Arc<dyn Engine>>>,
    /// Local interest per distinct `(channel, pattern)` — filter 0 only,
    /// since engines speak channels, not filters.
    interest: Mutex<HashMap<(Bytes, bool), usize>>,
    /// Interest reported by other processes (populated in the cluster root),
    /// merged into engine replay.
    remote_interest: Mutex<HashMap<(Bytes, bool), usize>>,
    metadata: RwLock<Vec<MetadataEntry>>,
    next_sub_id: AtomicU64,
    next_msg_id: AtomicU32,
}

/// The process-wide pub/sub bus.
///
/// `Bus::global()` is the production instance; `Bus::new()` builds isolated
/// instances for tests.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

static GLOBAL: OnceLock<Bus> = OnceLock::new();

impl Bus {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Bus {
            inner: Arc::new(BusInner {
                exact: RwLock::new(HashMap::new()),
                patterns: RwLock::new(HashMap::new()),
                engines: RwLock::new(Vec::new()),
                default_engine: RwLock::new(None),
                interest: Mutex::new(HashMap::new()),
                remote_interest: Mutex::new(HashMap::new()),
                metadata: RwLock::new(Vec::new()),
                next_sub_id: AtomicU64::new(1),
                next_msg_id: AtomicU32::new(1),
            }),
        }
    }

    pub fn global() -> &'static Bus {
        GLOBAL.get_or_init(Bus::new)
    }

    // -----------------------------------------------------------------------
    // Subscribe / unsubscribe
    // -----------------------------------------------------------------------

    pub fn subscribe(&self, opts: SubscribeOptions) -> Subscription {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(SubInner {
            id,
            filter: opts.filter,
            channel: opts.channel.clone(),
            is_pattern: opts.is_pattern,
            on_message: opts.on_message,
            on_unsubscribe: Mutex::new(opts.on_unsubscribe),
            active: AtomicBool::new(true),
            bus: Arc::downgrade(&self.inner),
        });

        let key = (opts.filter, opts.channel.clone());
        if opts.is_pattern {
            let matcher = opts
                .matcher
                .unwrap_or_else(|| Arc::new(|p: &[u8], c: &[u8]| glob_match(p, c)));
            let mut patterns = self.inner.patterns.write();
            patterns
                .entry(key)
                .or_insert_with(|| PatternEntry {
                    matcher,
                    subs: Vec::new(),
                })
                .subs
                .push(sub.clone());
        } else {
            self.inner
                .exact
                .write()
                .entry(key)
                .or_default()
                .push(sub.clone());
        }

        if opts.filter == 0 {
            self.interest_up(&opts.channel, opts.is_pattern);
        }
        trace!(channel = %String::from_utf8_lossy(&opts.channel), pattern = opts.is_pattern, "subscribed");
        Subscription { inner: sub }
    }

    fn remove_subscription(inner: &Arc<BusInner>, sub: &SubInner) {
        let key = (sub.filter, sub.channel.clone());
        if sub.is_pattern {
            let mut patterns = inner.patterns.write();
            if let Some(entry) = patterns.get_mut(&key) {
                entry.subs.retain(|s| s.id != sub.id);
                if entry.subs.is_empty() {
                    patterns.remove(&key);
                }
            }
        } else {
            let mut exact = inner.exact.write();
            if let Some(subs) = exact.get_mut(&key) {
                subs.retain(|s| s.id != sub.id);
                if subs.is_empty() {
                    exact.remove(&key);
                }
            }
        }
        if sub.filter == 0 {
            Bus { inner: inner.clone() }.interest_down(&sub.channel, sub.is_pattern);
        }
    }

    fn interest_up(&self, channel: &Bytes, pattern: bool) {
        let mut interest = self.inner.interest.lock();
        let count = interest.entry((channel.clone(), pattern)).or_insert(0);
        *count += 1;
        if *count == 1 {
            drop(interest);
            for engine in self.engines_snapshot() {
                engine.subscribe(channel, pattern);
            }
        }
    }

    fn interest_down(&self, channel: &Bytes, pattern: bool) {
        let mut interest = self.inner.interest.lock();
        let Some(count) = interest.get_mut(&(channel.clone(), pattern)) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            interest.remove(&(channel.clone(), pattern));
            drop(interest);
            for engine in self.engines_snapshot() {
                engine.unsubscribe(channel, pattern);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Remote interest (cluster root bookkeeping)
    // -----------------------------------------------------------------------

    /// Record interest reported by a worker process; forwards the 0↔1
    /// transition to attached engines like local interest does.
    pub fn remote_interest_up(&self, channel: &Bytes, pattern: bool) {
        let mut remote = self.inner.remote_interest.lock();
        let count = remote.entry((channel.clone(), pattern)).or_insert(0);
        *count += 1;
        if *count == 1 {
            drop(remote);
            for engine in self.engines_snapshot() {
                engine.subscribe(channel, pattern);
            }
        }
    }

    pub fn remote_interest_down(&self, channel: &Bytes, pattern: bool) {
        let mut remote = self.inner.remote_interest.lock();
        let Some(count) = remote.get_mut(&(channel.clone(), pattern)) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            remote.remove(&(channel.clone(), pattern));
            drop(remote);
            for engine in self.engines_snapshot() {
                engine.unsubscribe(channel, pattern);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Publish / delivery
    // -----------------------------------------------------------------------

    pub fn publish(&self, opts: PublishOptions) {
        let id = self.inner.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let mut message = Message::new(opts.filter, opts.channel, opts.payload, opts.is_json, id);
        self.fill_metadata(&mut message);

        match opts.target {
            Target::Local => self.deliver_local(&message),
            Target::Engine(engine) => engine.publish(&message),
            Target::Default => match self.default_engine() {
                Some(engine) => engine.publish(&message),
                None => self.deliver_local(&message),
            },
        }
    }

    /// Deliver to in-process subscribers: exact matches first, then pattern
    /// entries under the same filter whose predicate accepts the channel.
    pub fn deliver_local(&self, message: &Message) {
        // Snapshot under the locks, invoke outside them: a callback may
        // subscribe or unsubscribe.
        let exact: Vec<Arc<SubInner>> = {
            let table = self.inner.exact.read();
            table
                .get(&(message.filter, message.channel.clone()))
                .map(|subs| subs.clone())
                .unwrap_or_default()
        };
        let pattern: Vec<Arc<SubInner>> = {
            let table = self.inner.patterns.read();
            table
                .iter()
                .filter(|((filter, _), _)| *filter == message.filter)
                .filter(|((_, pat), entry)| (entry.matcher)(pat, &message.channel))
                .flat_map(|(_, entry)| entry.subs.iter().cloned())
                .collect()
        };

        for sub in exact.iter().chain(pattern.iter()) {
            if sub.active.load(Ordering::Acquire) {
                (sub.on_message)(message);
            }
        }
    }

    /// Raw message injection used by engines relaying frames from elsewhere.
    pub fn deliver_remote(&self, filter: i32, channel: Bytes, payload: Bytes, is_json: bool) {
        let id = self.inner.next_msg_id.fetch_add(1, Ordering::Relaxed);
        let mut message = Message::new(filter, channel, payload, is_json, id);
        self.fill_metadata(&mut message);
        self.deliver_local(&message);
    }

    fn fill_metadata(&self, message: &mut Message) {
        let producers = self.inner.metadata.read();
        for entry in producers.iter() {
            if entry.refs > 0 {
                let bytes = (entry.producer)(message);
                message.metadata.push((entry.kind, bytes));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Engines
    // -----------------------------------------------------------------------

    /// Attach an engine and replay every currently-held distinct
    /// `(channel, pattern)` pair into it.
    pub fn attach(&self, engine: Arc<dyn Engine>) {
        self.replay(engine.as_ref());
        self.inner.engines.write().push(engine.clone());
        debug!(engine = engine.name(), "engine attached");
    }

    /// Detach an engine, mirroring the unsubscribe calls for its state.
    pub fn detach(&self, engine: &Arc<dyn Engine>) {
        self.inner
            .engines
            .write()
            .retain(|e| !Arc::ptr_eq(e, engine));
        for (channel, pattern) in self.held_pairs() {
            engine.unsubscribe(&channel, pattern);
        }
        debug!(engine = engine.name(), "engine detached");
    }

    /// Re-register current state into an engine that reconnected or was
    /// re-created after a worker spawn.  The engine must already be attached.
    pub fn reattach(&self, engine: &Arc<dyn Engine>) {
        self.replay(engine.as_ref());
    }

    fn replay(&self, engine: &dyn Engine) {
        for (channel, pattern) in self.held_pairs() {
            engine.subscribe(&channel, pattern);
        }
    }

    fn held_pairs(&self) -> Vec<(Bytes, bool)> {
        let mut pairs: Vec<(Bytes, bool)> =
            self.inner.interest.lock().keys().cloned().collect();
        for key in self.inner.remote_interest.lock().keys() {
            if !pairs.contains(key) {
                pairs.push(key.clone());
            }
        }
        pairs
    }

    /// Set the engine used by [`Target::Default`].  `None` restores
    /// local-only delivery.
    pub fn set_default_engine(&self, engine: Option<Arc<dyn Engine>>) {
        *self.inner.default_engine.write() = engine;
    }

    pub fn default_engine(&self) -> Option<Arc<dyn Engine>> {
        self.inner.default_engine.read().clone()
    }

    fn engines_snapshot(&self) -> Vec<Arc<dyn Engine>> {
        self.inner.engines.read().clone()
    }

    // -----------------------------------------------------------------------
    // Message metadata
    // -----------------------------------------------------------------------

    /// Enable a metadata producer.  Refcounted: enabling N times requires
    /// N disables before the producer stops running.
    pub fn metadata_enable(
        &self,
        kind: MetadataKind,
        producer: Arc<dyn Fn(&Message) -> Bytes + Send + Sync>,
    ) {
        let mut table = self.inner.metadata.write();
        if let Some(entry) = table.iter_mut().find(|e| e.kind == kind) {
            entry.refs += 1;
        } else {
            table.push(MetadataEntry {
                kind,
                refs: 1,
                producer,
            });
        }
    }

    pub fn metadata_disable(&self, kind: MetadataKind) {
        let mut table = self.inner.metadata.write();
        if let Some(pos) = table.iter().position(|e| e.kind == kind) {
            table[pos].refs -= 1;
            if table[pos].refs == 0 {
                table.remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collect() -> (OnMessage, Arc<StdMutex<Vec<(Vec<u8>, Vec<u8>)>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb: OnMessage = Arc::new(move |msg: &Message| {
            seen2
                .lock()
                .unwrap()
                .push((msg.channel.to_vec(), msg.payload.to_vec()));
        });
        (cb, seen)
    }

    #[test]
    fn exact_delivery_hits_matching_channel_only() {
        let bus = Bus::new();
        let (cb, seen) = collect();
        let _sub = bus.subscribe(SubscribeOptions::channel("news", cb));

        bus.publish(PublishOptions::new("news", "a").target(Target::Local));
        bus.publish(PublishOptions::new("other", "b").target(Target::Local));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, b"a");
    }

    #[test]
    fn filters_partition_the_channel_space() {
        let bus = Bus::new();
        let (cb, seen) = collect();
        let _sub = bus.subscribe(SubscribeOptions::channel("c", cb).filter(7));

        bus.publish(PublishOptions::new("c", "wrong").target(Target::Local));
        bus.publish(
            PublishOptions::new("c", "right")
                .filter(7)
                .target(Target::Local),
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, b"right");
    }

    #[test]
    fn pattern_subscriptions_use_glob_by_default() {
        let bus = Bus::new();
        let (cb, seen) = collect();
        let _sub = bus.subscribe(SubscribeOptions::pattern("user.*", cb));

        bus.publish(PublishOptions::new("user.42", "x").target(Target::Local));
        bus.publish(PublishOptions::new("admin.42", "y").target(Target::Local));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, b"user.42");
    }

    #[test]
    fn unsubscribe_is_idempotent_and_fires_once() {
        let bus = Bus::new();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = fired.clone();
        let (cb, seen) = collect();
        let sub = bus.subscribe(SubscribeOptions {
            filter: 0,
            channel: Bytes::from_static(b"c"),
            is_pattern: false,
            matcher: None,
            on_message: cb,
            on_unsubscribe: Some(Box::new(move || {
                fired2.fetch_add(1, Ordering::Relaxed);
            })),
        });

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        bus.publish(PublishOptions::new("c", "after").target(Target::Local));
        assert!(seen.lock().unwrap().is_empty());
    }

    struct CountingEngine {
        subs: StdMutex<Vec<(Vec<u8>, bool, bool)>>, // (channel, pattern, subscribe?)
        published: std::sync::atomic::AtomicUsize,
    }

    impl CountingEngine {
        fn new() -> Arc<Self> {
            Arc::new(CountingEngine {
                subs: StdMutex::new(Vec::new()),
                published: std::sync::atomic::AtomicUsize::new(0),
            })
        }
    }

    impl Engine for CountingEngine {
        fn subscribe(&self, channel: &Bytes, pattern: bool) {
            self.subs.lock().unwrap().push((channel.to_vec(), pattern, true));
        }
        fn unsubscribe(&self, channel: &Bytes, pattern: bool) {
            self.subs
                .lock()
                .unwrap()
                .push((channel.to_vec(), pattern, false));
        }
        fn publish(&self, _message: &Message) {
            self.published.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn engine_sees_only_zero_one_transitions() {
        let bus = Bus::new();
        let engine = CountingEngine::new();
        bus.attach(engine.clone() as Arc<dyn Engine>);

        let (cb, _) = collect();
        let a = bus.subscribe(SubscribeOptions::channel("c", cb.clone()));
        let b = bus.subscribe(SubscribeOptions::channel("c", cb.clone()));
        drop(a);
        drop(b);

        let log = engine.subs.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            &[(b"c".to_vec(), false, true), (b"c".to_vec(), false, false)]
        );
    }

    #[test]
    fn attach_replays_existing_subscriptions() {
        let bus = Bus::new();
        let (cb, _) = collect();
        let _a = bus.subscribe(SubscribeOptions::channel("held", cb.clone()));
        let _b = bus.subscribe(SubscribeOptions::pattern("pat.*", cb.clone()));

        let engine = CountingEngine::new();
        bus.attach(engine.clone() as Arc<dyn Engine>);

        let log = engine.subs.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.contains(&(b"held".to_vec(), false, true)));
        assert!(log.contains(&(b"pat.*".to_vec(), true, true)));
    }

    #[test]
    fn default_target_routes_through_default_engine() {
        let bus = Bus::new();
        let engine = CountingEngine::new();
        bus.set_default_engine(Some(engine.clone() as Arc<dyn Engine>));

        bus.publish(PublishOptions::new("c", "x"));
        assert_eq!(engine.published.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn metadata_producers_run_once_per_message() {
        let bus = Bus::new();
        let kind = MetadataKind(9);
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let runs2 = runs.clone();
        bus.metadata_enable(
            kind,
            Arc::new(move |msg: &Message| {
                runs2.fetch_add(1, Ordering::Relaxed);
                let mut wrapped = b"wrapped:".to_vec();
                wrapped.extend_from_slice(&msg.payload);
                Bytes::from(wrapped)
            }),
        );

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let cb: OnMessage = Arc::new(move |msg: &Message| {
            let meta = msg.metadata(MetadataKind(9)).cloned();
            seen2.lock().unwrap().push(meta);
        });
        let _a = bus.subscribe(SubscribeOptions::channel("c", cb.clone()));
        let _b = bus.subscribe(SubscribeOptions::channel("c", cb));

        bus.publish(PublishOptions::new("c", "m").target(Target::Local));

        assert_eq!(runs.load(Ordering::Relaxed), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for meta in seen.iter() {
            assert_eq!(meta.as_deref().map(|b| &b[..]), Some(&b"wrapped:m"[..]));
        }

        bus.metadata_disable(kind);
        bus.publish(PublishOptions::new("c", "m2").target(Target::Local));
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }
}
