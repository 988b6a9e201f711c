//! Process lifecycle hooks.
//!
//! Subsystems (the pub/sub bus, engines, the HTTP layer's date cache)
//! register callbacks at well-defined points instead of reaching into each
//! other's startup order.

use parking_lot::Mutex;

/// Lifecycle points, in firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    /// Before any listener accepts, in every process.
    PreStart,
    /// In a spawned worker process, after its runtime is up.
    InChild,
    /// Graceful shutdown has begun; connections are still live.
    OnShutdown,
    /// All connections drained.
    OnFinish,
    /// Last call before the process exits.
    AtExit,
}

type Hook = std::sync::Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct Lifecycle {
    hooks: Mutex<Vec<(StateEvent, Hook)>>,
}

impl Lifecycle {
    pub fn register(&self, event: StateEvent, hook: Hook) {
        self.hooks.lock().push((event, hook));
    }

    pub fn fire(&self, event: StateEvent) {
        // Hooks may register further hooks; run against a snapshot so the
        // lock is not held across user code.
        let snapshot: Vec<Hook> = self
            .hooks
            .lock()
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, h)| h.clone())
            .collect();
        for hook in snapshot {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hooks_fire_only_for_their_event() {
        let lc = Lifecycle::default();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        lc.register(
            StateEvent::PreStart,
            Arc::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        let c = count.clone();
        lc.register(
            StateEvent::AtExit,
            Arc::new(move || {
                c.fetch_add(100, Ordering::Relaxed);
            }),
        );

        lc.fire(StateEvent::PreStart);
        lc.fire(StateEvent::PreStart);
        assert_eq!(count.load(Ordering::Relaxed), 2);

        lc.fire(StateEvent::AtExit);
        assert_eq!(count.load(Ordering::Relaxed), 102);
    }
}
