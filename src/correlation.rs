//! Request/reply correlation between the dispatch loop and the callback listener.
//!
//! Every outbound query registers a oneshot sender keyed by request id. The
//! listener resolves an entry by removing it and firing the sender, so the
//! slot can transition away from "unset" at most once; a second reply for the
//! same id finds nothing and is reported back as unmatched. The oneshot
//! channel is also what carries the value across execution contexts: the
//! listener runs on its own task and never shares a call stack with the
//! waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::types::ReplyOutcome;

/// Process-wide map of in-flight queries.
///
/// Cheap to clone; all clones share the same underlying table.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<ReplyOutcome>>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh request id and register its result slot.
    ///
    /// The returned receiver resolves exactly once, when [`resolve`] is
    /// called for this id.
    ///
    /// [`resolve`]: CorrelationTable::resolve
    pub fn register(&self) -> (String, oneshot::Receiver<ReplyOutcome>) {
        let id = format!("req_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(id.clone(), tx);
        (id, rx)
    }

    /// Resolve and remove a pending entry.
    ///
    /// Returns `false` when the id is unknown, already resolved, or the
    /// waiter has gone away; duplicate and stale replies are no-ops, never
    /// errors.
    pub fn resolve(&self, id: &str, outcome: ReplyOutcome) -> bool {
        let tx = self.pending.lock().unwrap().remove(id);
        match tx {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Drop a pending entry without resolving it (dispatch gave up).
    pub fn remove(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn request_ids_are_unique() {
        let table = CorrelationTable::new();
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let (id, _rx) = table.register();
            assert!(id.starts_with("req_"));
            assert!(seen.insert(id), "duplicate request id generated");
        }
    }

    #[tokio::test]
    async fn resolve_delivers_to_waiter() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register();

        assert!(table.resolve(&id, ReplyOutcome::Input("go on".into())));
        assert_eq!(rx.await.unwrap(), ReplyOutcome::Input("go on".into()));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn second_resolution_is_a_noop() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register();

        assert!(table.resolve(&id, ReplyOutcome::Input("first".into())));
        assert!(!table.resolve(&id, ReplyOutcome::Input("second".into())));
        assert_eq!(rx.await.unwrap(), ReplyOutcome::Input("first".into()));
    }

    #[tokio::test]
    async fn resolve_after_remove_reports_unmatched() {
        let table = CorrelationTable::new();
        let (id, _rx) = table.register();

        table.remove(&id);
        assert!(!table.resolve(&id, ReplyOutcome::Cancelled));
    }

    #[tokio::test]
    async fn resolve_with_dropped_waiter_reports_unmatched() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register();
        drop(rx);

        assert!(!table.resolve(&id, ReplyOutcome::Cancelled));
    }

    #[tokio::test]
    async fn entries_are_independent() {
        let table = CorrelationTable::new();
        let (id_a, rx_a) = table.register();
        let (_id_b, _rx_b) = table.register();

        assert!(table.resolve(&id_a, ReplyOutcome::Cancelled));
        assert_eq!(rx_a.await.unwrap(), ReplyOutcome::Cancelled);
        assert_eq!(table.len(), 1);
    }
}
