//! brisk-pubsub: in-process channel routing with pluggable back-ends.
//!
//! Subscriptions bind a callback to an exact channel or a glob pattern under
//! an integer filter.  Publishing routes to local subscribers and, through
//! attached [`Engine`]s, to other processes (the cluster mesh) or external
//! brokers (the Redis bridge).  Negative filters are reserved for internal
//! plumbing.

mod bus;
mod cluster;
mod engine;
mod error;
mod glob;
mod message;

pub use bus::{
    Bus, MatchFn, OnMessage, PublishOptions, SubscribeOptions, Subscription, Target,
};
pub use error::PubSubError;
pub use cluster::{
    ClusterCodec, ClusterFrame, ClusterLink, ClusterRoot, FLAG_JSON, FLAG_PATTERN, FLAG_PING,
    FLAG_SUBSCRIBE, FLAG_UNSUBSCRIBE, socket_path,
};
pub use engine::Engine;
pub use glob::glob_match;
pub use message::{Message, MetadataKind};

/// Reserved filter: messages relayed from the Redis subscription connection.
pub const FILTER_REDIS_RELAY: i32 = -1;
/// Reserved filter: Redis commands forwarded from workers to the root.
pub const FILTER_REDIS_COMMAND: i32 = -2;
/// Reserved filter base for per-process Redis command replies; the reply
/// channel for a process is `FILTER_REPLY_BASE - pid`.
pub const FILTER_REPLY_BASE: i32 = -10;

/// The per-process reply filter for Redis command responses.
pub fn reply_filter(pid: u32) -> i32 {
    FILTER_REPLY_BASE - i32::try_from(pid & 0x3f_ffff).unwrap_or(0)
}

/// Subscribe on the global bus.
pub fn subscribe(opts: SubscribeOptions) -> Subscription {
    Bus::global().subscribe(opts)
}

/// Publish on the global bus.
pub fn publish(opts: PublishOptions) {
    Bus::global().publish(opts);
}
