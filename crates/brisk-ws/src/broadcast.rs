//! Broadcast optimizers.
//!
//! Direct-write subscriptions make the bus deliver raw RFC 6455 bytes.
//! Enabling an optimizer registers a per-message metadata producer that
//! wraps the payload once; every direct subscriber in the process then
//! shares those bytes instead of re-framing per recipient.  Enables are
//! refcounted: N enables need N disables.

use brisk_pubsub::{Bus, Message, MetadataKind};
use bytes::Bytes;
use std::sync::Arc;

use crate::conn::sniff_text;
use crate::frame::wrap_message;

/// Framing selection for direct-write delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    /// Sniff UTF-8 validity with a size cutoff.
    Auto,
    Text,
    Binary,
}

pub(crate) fn metadata_kind(mode: BroadcastMode) -> MetadataKind {
    match mode {
        BroadcastMode::Auto => MetadataKind(1),
        BroadcastMode::Text => MetadataKind(2),
        BroadcastMode::Binary => MetadataKind(3),
    }
}

fn producer(mode: BroadcastMode) -> Arc<dyn Fn(&Message) -> Bytes + Send + Sync> {
    Arc::new(move |msg: &Message| {
        let is_text = match mode {
            BroadcastMode::Text => true,
            BroadcastMode::Binary => false,
            BroadcastMode::Auto => sniff_text(&msg.payload),
        };
        // Server-mode wrap: unmasked, shareable across every recipient.
        wrap_message(&msg.payload, is_text, false)
    })
}

/// Enable (or disable) pre-wrapping for one broadcast mode on the global
/// bus.
pub fn optimize_broadcasts(mode: BroadcastMode, enable: bool) {
    optimize_broadcasts_on(Bus::global(), mode, enable);
}

/// Instance-bus variant of [`optimize_broadcasts`].
pub fn optimize_broadcasts_on(bus: &Bus, mode: BroadcastMode, enable: bool) {
    let kind = metadata_kind(mode);
    if enable {
        bus.metadata_enable(kind, producer(mode));
    } else {
        bus.metadata_disable(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameCodec, OpCode};
    use brisk_pubsub::{PublishOptions, Target};
    use tokio_util::codec::Decoder;

    #[test]
    fn enabled_optimizer_prewraps_published_messages() {
        let bus = Bus::new();
        optimize_broadcasts_on(&bus, BroadcastMode::Text, true);

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = bus.subscribe(brisk_pubsub::SubscribeOptions::channel(
            "c",
            Arc::new(move |msg: &Message| {
                seen2
                    .lock()
                    .unwrap()
                    .push(msg.metadata(MetadataKind(2)).cloned());
            }),
        ));
        bus.publish(PublishOptions::new("c", "payload").target(Target::Local));

        let seen = seen.lock().unwrap();
        let wrapped = seen[0].clone().expect("pre-wrapped bytes present");

        // The metadata is a complete, unmasked text frame.
        let mut codec = FrameCodec::client();
        let mut buf = bytes::BytesMut::from(&wrapped[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"payload");

        optimize_broadcasts_on(&bus, BroadcastMode::Text, false);
    }

    #[test]
    fn refcounted_enable_requires_matching_disables() {
        let bus = Bus::new();
        optimize_broadcasts_on(&bus, BroadcastMode::Binary, true);
        optimize_broadcasts_on(&bus, BroadcastMode::Binary, true);
        optimize_broadcasts_on(&bus, BroadcastMode::Binary, false);

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = bus.subscribe(brisk_pubsub::SubscribeOptions::channel(
            "c",
            Arc::new(move |msg: &Message| {
                seen2
                    .lock()
                    .unwrap()
                    .push(msg.metadata(MetadataKind(3)).cloned());
            }),
        ));

        bus.publish(PublishOptions::new("c", "still on").target(Target::Local));
        assert!(seen.lock().unwrap()[0].is_some());

        optimize_broadcasts_on(&bus, BroadcastMode::Binary, false);
        bus.publish(PublishOptions::new("c", "now off").target(Target::Local));
        assert!(seen.lock().unwrap()[1].is_none());
    }
}
