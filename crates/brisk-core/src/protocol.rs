//! The per-connection protocol capability.
//!
//! A protocol object is owned by its connection's task: every callback for a
//! given connection runs on that task, so a protocol never observes two of
//! its own callbacks racing.  Distinct connections run concurrently on
//! different runtime workers.

use crate::conn::{Conn, ConnId};

/// Callbacks attached to a live connection.
///
/// Implementations carry their own state (parser buffers, subscriptions,
/// application data); the reactor only ever holds them behind `Box<dyn>`.
pub trait Protocol: Send {
    /// The protocol was just installed on the connection (fresh accept,
    /// connect, or an upgrade handoff).  Runs before any `on_data`.
    fn on_attach(&mut self, _conn: &mut Conn<'_>) {}

    /// Buffered bytes are available in `conn.input()`.  Consume what parses;
    /// the unconsumed tail is carried over and resubmitted with more data.
    fn on_data(&mut self, conn: &mut Conn<'_>);

    /// The outgoing queue was fully drained.
    fn on_ready(&mut self, _conn: &mut Conn<'_>) {}

    /// The reactor is shutting down.  Return the number of grace seconds to
    /// keep the connection alive before the flush-and-close; 0 closes now.
    fn on_shutdown(&mut self, _conn: &mut Conn<'_>) -> u8 {
        0
    }

    /// The socket is gone and the handle already invalidated.  Fires exactly
    /// once per attached protocol, after pending connection tasks drained.
    fn on_close(&mut self, _id: ConnId) {}

    /// The idle timeout expired.  The default gives up on the peer.
    fn ping(&mut self, conn: &mut Conn<'_>) {
        conn.close();
    }
}
