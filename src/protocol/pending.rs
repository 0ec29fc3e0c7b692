//! Table of outstanding correlated calls.
//!
//! Maps a 12-bit message id to the single-shot slot its caller is waiting
//! on. Every registered slot is eventually either fulfilled by a matching
//! inbound response/pong or cancelled by connection close, never both.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{oneshot, RwLock};

/// Pending-call table. After `cancel_all` the table is poisoned: further
/// registrations fail, so a call racing with close cannot strand a waiter.
pub(crate) struct PendingCalls {
    slots: RwLock<Option<HashMap<u16, oneshot::Sender<Bytes>>>>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Some(HashMap::new())),
        }
    }

    /// Register a waiter for `msg_id`. Returns `None` once the table has
    /// been cancelled. A stale slot under the same id (a reply that never
    /// came, 4096 calls ago) is dropped, waking its waiter with closure.
    pub(crate) async fn register(&self, msg_id: u16) -> Option<oneshot::Receiver<Bytes>> {
        let mut slots = self.slots.write().await;
        let slots = slots.as_mut()?;
        let (tx, rx) = oneshot::channel();
        slots.insert(msg_id, tx);
        Some(rx)
    }

    /// Deliver `payload` to the waiter registered under `msg_id`, if any.
    /// Single-shot: the slot is removed. Returns false for unknown ids
    /// (late replies after cancellation, duplicates).
    pub(crate) async fn fulfill(&self, msg_id: u16, payload: Bytes) -> bool {
        let tx = {
            let mut slots = self.slots.write().await;
            match slots.as_mut() {
                Some(slots) => slots.remove(&msg_id),
                None => None,
            }
        };
        match tx {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Whether a waiter is currently registered under `msg_id`.
    #[allow(dead_code)]
    pub(crate) async fn contains(&self, msg_id: u16) -> bool {
        self.slots
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.contains_key(&msg_id))
    }

    /// Drop every registered slot, waking all waiters with a closed
    /// indication, and poison the table.
    pub(crate) async fn cancel_all(&self) {
        self.slots.write().await.take();
    }
}
