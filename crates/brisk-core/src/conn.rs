//! Connection handles and the live-socket table.
//!
//! A connection is addressed by a [`ConnId`]: a 64-bit value packing a slot
//! index in the low half and a generation counter in the high half.  When a
//! slot is recycled for a new connection the generation is bumped, so a stale
//! handle kept by application code can never reach the new occupant — every
//! operation validates the generation first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::Protocol;
use crate::reactor::Reactor;
use crate::write::OutChunk;

/// Generation-tagged connection handle.
///
/// Copyable and cheap; holding one does not keep the connection alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        ConnId(u64::from(slot) | (u64::from(generation) << 32))
    }

    pub(crate) fn slot(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The raw 64-bit representation (stable for logging / map keys).
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}@{}", self.slot(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// Commands delivered to a connection's task
// ---------------------------------------------------------------------------

/// A deferred task bound to a specific connection.  Runs on the connection's
/// own task, so it observes the protocol single-threaded.
pub type IoTask = Box<dyn FnOnce(&mut dyn Protocol, &mut Conn<'_>) + Send>;

pub(crate) enum Cmd {
    Write(OutChunk),
    /// Flush the queue, then close.
    Close,
    /// Close without flushing.
    ForceClose,
    /// Run a deferred task under the connection's serialization.
    Task(IoTask),
    /// Reset the idle clock.
    Touch,
    /// Install a protocol on a detached (hijacked or fresh) connection.
    Attach(Box<dyn Protocol>),
    /// Graceful-shutdown notice: invoke `on_shutdown`, honor the grace hint.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Slot table
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct SlotEntry {
    pub cmd: mpsc::UnboundedSender<Cmd>,
    /// Bytes currently queued for write (soft backpressure gauge).
    pub queued: Arc<AtomicUsize>,
    /// Idle timeout in seconds; 0 disables.
    pub timeout: Arc<AtomicU32>,
}

struct Slot {
    generation: u32,
    entry: Option<SlotEntry>,
}

/// Process-wide table of live connections, indexed by slot.
pub(crate) struct Registry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Claim a slot for a new connection and return its handle.
    pub fn allocate(&self, entry: SlotEntry) -> ConnId {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.free.pop() {
            let s = &mut inner.slots[slot as usize];
            s.entry = Some(entry);
            ConnId::new(slot, s.generation)
        } else {
            let slot = u32::try_from(inner.slots.len()).expect("slot index overflow");
            inner.slots.push(Slot {
                generation: 1,
                entry: Some(entry),
            });
            ConnId::new(slot, 1)
        }
    }

    /// Look up a live entry; `None` when the handle is stale.
    pub fn get(&self, id: ConnId) -> Option<SlotEntry> {
        let inner = self.inner.lock();
        let s = inner.slots.get(id.slot())?;
        if s.generation != id.generation() {
            return None;
        }
        s.entry.clone()
    }

    pub fn is_valid(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Invalidate the handle: bump the generation and release the slot.
    ///
    /// Returns `false` when the handle was already stale.  The bump happens
    /// before the caller runs `on_close`, so no new operation can reach the
    /// connection once teardown has begun.
    pub fn invalidate(&self, id: ConnId) -> bool {
        let mut inner = self.inner.lock();
        let Some(s) = inner.slots.get_mut(id.slot()) else {
            return false;
        };
        if s.generation != id.generation() {
            return false;
        }
        s.generation = s.generation.wrapping_add(1);
        s.entry = None;
        let slot = u32::try_from(id.slot()).expect("slot fits");
        inner.free.push(slot);
        true
    }

    /// Snapshot all live entries (used by graceful shutdown).
    pub fn live(&self) -> Vec<(ConnId, SlotEntry)> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let entry = s.entry.clone()?;
                let slot = u32::try_from(i).expect("slot fits");
                Some((ConnId::new(slot, s.generation), entry))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Callback context
// ---------------------------------------------------------------------------

/// How a connection should be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseMode {
    Flush,
    Force,
}

/// Side effects collected while a protocol callback runs; the connection task
/// applies them after the callback returns.  Writes and closes do NOT travel
/// here — they go through the connection's command queue so that every byte
/// source (callbacks, other tasks, other threads) shares one ordering.
#[derive(Default)]
pub(crate) struct Effects {
    pub swap: Option<Box<dyn Protocol>>,
    pub hijack: bool,
    pub reads_suspended: Option<bool>,
    pub touch: bool,
}

/// The view of a connection handed to protocol callbacks.
///
/// Input is pull-based: `input()` exposes what has been buffered, `consume()`
/// releases the prefix a parser has digested, and unconsumed bytes are carried
/// to the next `on_data`.
pub struct Conn<'a> {
    pub(crate) id: ConnId,
    pub(crate) reactor: &'a Reactor,
    pub(crate) input: &'a mut BytesMut,
    pub(crate) effects: &'a mut Effects,
    pub(crate) timeout: &'a Arc<AtomicU32>,
}

impl Conn<'_> {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn reactor(&self) -> &Reactor {
        self.reactor
    }

    /// Bytes received but not yet consumed.
    pub fn input(&self) -> &[u8] {
        &self.input[..]
    }

    /// Release `n` bytes from the front of the input buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.input.len());
        let _ = self.input.split_to(n);
    }

    /// Copy-and-consume into `buf`, returning the number of bytes moved.
    /// Returns 0 when nothing is buffered (more data may still arrive).
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.input.len());
        buf[..n].copy_from_slice(&self.input[..n]);
        let _ = self.input.split_to(n);
        n
    }

    /// Take the entire unconsumed input (protocol-upgrade handoff).
    pub fn take_input(&mut self) -> BytesMut {
        std::mem::take(self.input)
    }

    /// Queue bytes for sending.  Order is preserved per caller, and shared
    /// with every other writer to this connection.
    pub fn write(&mut self, data: impl Into<Bytes>) {
        self.reactor.write(self.id, data);
    }

    /// Queue a file range; drained with positioned reads as the socket accepts.
    pub fn write_file(&mut self, file: Arc<std::fs::File>, offset: u64, len: u64) {
        self.reactor.write_chunk(self.id, OutChunk::File { file, offset, len });
    }

    /// Flush the outgoing queue, then close.
    pub fn close(&mut self) {
        self.reactor.close(self.id);
    }

    /// Close immediately, discarding queued output.
    pub fn force_close(&mut self) {
        self.reactor.force_close(self.id);
    }

    /// Swap the connection's protocol after this callback returns.  The old
    /// protocol receives its `on_close` before the new one runs.
    pub fn replace_protocol(&mut self, proto: Box<dyn Protocol>) {
        self.effects.swap = Some(proto);
    }

    /// Detach the protocol entirely, returning any unconsumed input.  The
    /// socket stays open with reads suspended until a protocol is attached
    /// again via [`Reactor::attach_protocol`].
    ///
    /// [`Reactor::attach_protocol`]: crate::Reactor::attach_protocol
    pub fn hijack(&mut self) -> BytesMut {
        self.effects.hijack = true;
        std::mem::take(self.input)
    }

    /// Stop scheduling reads (and therefore `on_data`) for this connection.
    pub fn suspend_reads(&mut self) {
        self.effects.reads_suspended = Some(true);
    }

    pub fn resume_reads(&mut self) {
        self.effects.reads_suspended = Some(false);
    }

    /// Reset the idle clock without any I/O.
    pub fn touch(&mut self) {
        self.effects.touch = true;
    }

    pub fn timeout_set(&mut self, seconds: u32) {
        self.timeout.store(seconds, Ordering::Relaxed);
    }

    pub fn timeout(&self) -> u32 {
        self.timeout.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn dummy_entry() -> SlotEntry {
        let (tx, _rx) = mpsc::unbounded_channel();
        SlotEntry {
            cmd: tx,
            queued: Arc::new(AtomicUsize::new(0)),
            timeout: Arc::new(AtomicU32::new(0)),
        }
    }

    #[test]
    fn conn_id_packs_slot_and_generation() {
        let id = ConnId::new(7, 3);
        assert_eq!(id.slot(), 7);
        assert_eq!(id.generation(), 3);
    }

    #[test]
    fn stale_handles_are_rejected_after_invalidate() {
        let reg = Registry::new();
        let id = reg.allocate(dummy_entry());
        assert!(reg.is_valid(id));

        assert!(reg.invalidate(id));
        assert!(!reg.is_valid(id));
        // Second invalidate is a no-op.
        assert!(!reg.invalidate(id));
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let reg = Registry::new();
        let first = reg.allocate(dummy_entry());
        reg.invalidate(first);

        let second = reg.allocate(dummy_entry());
        assert_eq!(first.slot(), second.slot());
        assert_ne!(first.generation(), second.generation());
        assert!(!reg.is_valid(first));
        assert!(reg.is_valid(second));
    }
}
