//! Durable FIFO queue of local mutations awaiting delivery
//!
//! Enqueue never fails: the record always lands in memory, and a failed
//! persistence write is only a warning. Records leave the queue when the
//! sync engine confirms them; exhausted or rejected ones are retained as
//! `FailedPermanent` for inspection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::JsonStore;

const QUEUE_NAMESPACE: &str = "mutations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    Pending,
    InFlight,
    FailedPermanent,
}

/// One pending local write (trade request, order op, wallet op)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: Uuid,
    pub kind: MutationKind,
    /// Logical target, e.g. `trade`, `order:limit`, `wallet:deposit`
    pub entity: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub status: MutationStatus,
}

pub struct MutationQueue {
    /// Enqueue order; later mutations on the same entity may depend on
    /// earlier ones succeeding
    records: Vec<MutationRecord>,
    store: Option<JsonStore>,
}

impl MutationQueue {
    /// In-memory queue with no persistence (tests, ephemeral sessions)
    pub fn in_memory() -> Self {
        Self {
            records: Vec::new(),
            store: None,
        }
    }

    /// Queue backed by the given store, restoring any persisted records
    ///
    /// Records that were `InFlight` when the app died revert to `Pending`:
    /// the delivery outcome is unknown, and the idempotency key makes the
    /// retry safe.
    pub fn open(store: JsonStore) -> Self {
        let mut records: Vec<MutationRecord> =
            store.load(QUEUE_NAMESPACE).unwrap_or_default();
        records.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        for record in &mut records {
            if record.status == MutationStatus::InFlight {
                debug!(id = %record.id, "reverting in-flight record to pending after restart");
                record.status = MutationStatus::Pending;
            }
        }
        Self {
            records,
            store: Some(store),
        }
    }

    /// Append a mutation; returns its id immediately
    pub fn enqueue(
        &mut self,
        kind: MutationKind,
        entity: impl Into<String>,
        payload: serde_json::Value,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.records.push(MutationRecord {
            id,
            kind,
            entity: entity.into(),
            payload,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            status: MutationStatus::Pending,
        });
        self.persist();
        id
    }

    /// Remove a mutation that has not been attempted yet
    ///
    /// Returns false once the record is in flight or resolved; an in-flight
    /// call is never raced against a server commit.
    pub fn cancel(&mut self, id: Uuid) -> bool {
        let Some(index) = self.records.iter().position(|r| r.id == id) else {
            return false;
        };
        if self.records[index].status != MutationStatus::Pending {
            return false;
        }
        self.records.remove(index);
        self.persist();
        true
    }

    /// Pending records in enqueue order
    pub fn pending(&self) -> Vec<MutationRecord> {
        self.records
            .iter()
            .filter(|r| r.status == MutationStatus::Pending)
            .cloned()
            .collect()
    }

    /// Permanently failed records, retained for inspection
    pub fn failed(&self) -> Vec<MutationRecord> {
        self.records
            .iter()
            .filter(|r| r.status == MutationStatus::FailedPermanent)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<&MutationRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move a pending record to `InFlight`
    ///
    /// Returns false when the record is gone or no longer pending, e.g.
    /// cancelled after the caller snapshotted it; such a record must not
    /// be dispatched.
    pub fn mark_in_flight(&mut self, id: Uuid) -> bool {
        match self.records.iter_mut().find(|r| r.id == id) {
            Some(record) if record.status == MutationStatus::Pending => {
                record.status = MutationStatus::InFlight;
                self.persist();
                true
            }
            _ => false,
        }
    }

    /// Delete a confirmed record
    pub fn complete(&mut self, id: Uuid) {
        self.records.retain(|r| r.id != id);
        self.persist();
    }

    /// Record a retryable failure: bump attempts, keep the record pending
    pub fn record_failure(&mut self, id: Uuid, error: &str) {
        if let Some(record) = self.records.iter_mut().find(|r| r.id == id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.status = MutationStatus::Pending;
            self.persist();
        }
    }

    /// Mark a record as permanently failed; it stays queued for inspection
    pub fn mark_failed_permanent(&mut self, id: Uuid, error: &str) {
        if let Some(record) = self.records.iter_mut().find(|r| r.id == id) {
            record.last_error = Some(error.to_string());
            record.status = MutationStatus::FailedPermanent;
            self.persist();
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save(QUEUE_NAMESPACE, &self.records) {
            // The record is still held in memory; losing the file only
            // costs durability across a restart
            warn!(error = %err, "failed to persist mutation queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trade_payload(quantity: u64) -> serde_json::Value {
        json!({"symbol": "PLAYER:p1", "side": "BUY", "quantity": quantity, "price": 100.0})
    }

    #[test]
    fn pending_preserves_enqueue_order() {
        let mut queue = MutationQueue::in_memory();
        let first = queue.enqueue(MutationKind::Create, "trade", trade_payload(1));
        let second = queue.enqueue(MutationKind::Create, "trade", trade_payload(2));
        let third = queue.enqueue(MutationKind::Create, "trade", trade_payload(3));

        let ids: Vec<Uuid> = queue.pending().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first, second, third]);
    }

    #[test]
    fn cancel_only_while_pending() {
        let mut queue = MutationQueue::in_memory();
        let id = queue.enqueue(MutationKind::Create, "trade", trade_payload(1));

        queue.mark_in_flight(id);
        assert!(!queue.cancel(id));

        queue.record_failure(id, "connectivity");
        assert!(queue.cancel(id));
        assert!(queue.is_empty());
    }

    #[test]
    fn failure_bumps_attempts_and_keeps_record() {
        let mut queue = MutationQueue::in_memory();
        let id = queue.enqueue(MutationKind::Create, "trade", trade_payload(1));

        queue.mark_in_flight(id);
        queue.record_failure(id, "socket closed");

        let record = queue.get(id).unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.status, MutationStatus::Pending);
        assert_eq!(record.last_error.as_deref(), Some("socket closed"));
    }

    #[test]
    fn permanent_failure_is_retained_not_pending() {
        let mut queue = MutationQueue::in_memory();
        let id = queue.enqueue(MutationKind::Create, "trade", trade_payload(1));

        queue.mark_failed_permanent(id, "insufficient balance");
        assert!(queue.pending().is_empty());
        assert_eq!(queue.failed().len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn reopen_restores_records_and_reverts_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        let (first, second) = {
            let mut queue = MutationQueue::open(store.clone());
            let first = queue.enqueue(MutationKind::Create, "trade", trade_payload(1));
            let second = queue.enqueue(MutationKind::Create, "trade", trade_payload(2));
            queue.mark_in_flight(first);
            (first, second)
        };

        let queue = MutationQueue::open(store);
        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[1].id, second);
        assert_eq!(pending[0].status, MutationStatus::Pending);
    }

    #[test]
    fn mark_in_flight_refuses_missing_or_cancelled_records() {
        let mut queue = MutationQueue::in_memory();
        let id = queue.enqueue(MutationKind::Create, "trade", trade_payload(1));

        assert!(queue.mark_in_flight(id));
        // already in flight, not pending anymore
        assert!(!queue.mark_in_flight(id));

        queue.record_failure(id, "socket closed");
        assert!(queue.cancel(id));
        assert!(!queue.mark_in_flight(id));
    }

    #[test]
    fn complete_deletes_the_record() {
        let mut queue = MutationQueue::in_memory();
        let id = queue.enqueue(MutationKind::Create, "trade", trade_payload(1));
        queue.mark_in_flight(id);
        queue.complete(id);
        assert!(queue.is_empty());
    }
}
