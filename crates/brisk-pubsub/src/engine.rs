//! Pub/sub back-end engines.
//!
//! An engine receives the bus's subscription intent (only the 0↔1
//! transitions per distinct `(channel, pattern)` pair) and outgoing
//! publishes.  Implementations own their transport and their retry policy;
//! the bus never retries a failed engine publish.

use bytes::Bytes;

use crate::message::Message;

/// A pub/sub back-end.
///
/// `publish` is called on the publisher's task and must not block: real
/// engines hand the message to their own transport task.
pub trait Engine: Send + Sync {
    /// A channel (or pattern) gained its first local subscriber.
    fn subscribe(&self, channel: &Bytes, pattern: bool);

    /// A channel (or pattern) lost its last local subscriber.
    fn unsubscribe(&self, channel: &Bytes, pattern: bool);

    /// Forward a published message.  Whether this also delivers locally is
    /// the engine's call: the cluster engine does, the Redis engine relies
    /// on the server echoing the message back.
    fn publish(&self, message: &Message);

    /// Engine name for logs.
    fn name(&self) -> &str {
        "engine"
    }
}
