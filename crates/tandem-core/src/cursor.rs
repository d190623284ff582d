//! The consumption cursor: last committed offset per topic.
//!
//! Backed by a [`watch`] channel so writers never block on readers and
//! promotion can await "control cursor reached N" without polling.

use std::sync::Arc;

use tandem_types::CursorPosition;
use tokio::sync::watch;

/// Shared, monotonic record of the last applied events and control offsets.
#[derive(Debug, Clone)]
pub struct ConsumptionCursor {
    tx: Arc<watch::Sender<CursorPosition>>,
}

impl ConsumptionCursor {
    /// A cursor at `(0, 0)`: nothing consumed.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CursorPosition::default());
        Self { tx: Arc::new(tx) }
    }

    /// Current position.
    pub fn position(&self) -> CursorPosition {
        *self.tx.borrow()
    }

    /// Last applied events-topic offset.
    pub fn events(&self) -> u64 {
        self.position().events
    }

    /// Last applied control-log offset.
    pub fn control(&self) -> u64 {
        self.position().control
    }

    /// Overwrite the position (snapshot restore).
    pub fn set(&self, position: CursorPosition) {
        self.tx.send_replace(position);
    }

    /// Record that events offset `events` and control offset `control` were
    /// applied together. Neither component ever moves backwards.
    pub fn commit(&self, events: u64, control: u64) {
        self.tx.send_modify(|position| {
            position.events = position.events.max(events);
            position.control = position.control.max(control);
        });
    }

    /// Record an events-topic offset that produced no control message.
    pub fn commit_events(&self, events: u64) {
        self.tx.send_modify(|position| {
            position.events = position.events.max(events);
        });
    }

    /// Record a control offset that carries nothing to apply.
    pub fn commit_control(&self, control: u64) {
        self.tx.send_modify(|position| {
            position.control = position.control.max(control);
        });
    }

    /// Wait until the control cursor is at least `target`.
    pub async fn wait_for_control(&self, target: u64) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|position| position.control >= target).await;
    }
}

impl Default for ConsumptionCursor {
    fn default() -> Self {
        Self::new()
    }
}
