//! Published messages and per-message metadata.

use bytes::Bytes;

/// Identifies a registered metadata producer.  Consumers that pre-compute a
/// wrapped representation of each message (e.g. a WebSocket frame shared by
/// every direct subscriber) pick an id and look their slot up at delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataKind(pub u32);

/// A message traveling through the bus.
///
/// `filter` selects a channel namespace; negative filters are reserved for
/// internal routing (cluster plumbing, the Redis command relay).  Payloads
/// are opaque bytes; `is_json` is a producer-supplied tag carried verbatim.
#[derive(Debug, Clone)]
pub struct Message {
    pub filter: i32,
    pub channel: Bytes,
    pub payload: Bytes,
    pub is_json: bool,
    /// Per-process sequence number; cluster frames carry it for dedup.
    pub(crate) id: u32,
    /// Pre-computed representations, filled once at publish time.
    pub(crate) metadata: Vec<(MetadataKind, Bytes)>,
}

impl Message {
    pub(crate) fn new(filter: i32, channel: Bytes, payload: Bytes, is_json: bool, id: u32) -> Self {
        Message {
            filter,
            channel,
            payload,
            is_json,
            id,
            metadata: Vec::new(),
        }
    }

    /// The pre-wrapped representation registered under `kind`, when one was
    /// computed for this message.
    pub fn metadata(&self, kind: MetadataKind) -> Option<&Bytes> {
        self.metadata
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, b)| b)
    }

    pub(crate) fn sequence(&self) -> u32 {
        self.id
    }
}
