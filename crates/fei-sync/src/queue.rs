// File: fei-sync/src/queue.rs
// Purpose: Durable queue of local writes waiting to be pushed to the server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::record::{CollectionName, TrackedRecord};
use crate::store::{CacheStore, OUTBOUND_QUEUE_KEY};

/// What the server should do with the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Upsert,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Upsert => write!(f, "upsert"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

/// A local write captured while offline or speculatively
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: Uuid,
    pub collection: CollectionName,
    pub record_key: String,
    pub kind: MutationKind,
    /// Full record as written locally
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

impl QueuedMutation {
    pub fn new<T: TrackedRecord>(record: &T, kind: MutationKind) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            collection: T::COLLECTION,
            record_key: record.key().to_string(),
            kind,
            payload: serde_json::to_value(record)?,
            queued_at: Utc::now(),
        })
    }

    pub fn upsert<T: TrackedRecord>(record: &T) -> Result<Self, serde_json::Error> {
        Self::new(record, MutationKind::Upsert)
    }

    pub fn delete<T: TrackedRecord>(record: &T) -> Result<Self, serde_json::Error> {
        Self::new(record, MutationKind::Delete)
    }

    fn targets_same_record(&self, other: &QueuedMutation) -> bool {
        self.collection == other.collection && self.record_key == other.record_key
    }
}

/// FIFO of pending mutations, persisted in the cache store
#[derive(Clone)]
pub struct OutboundQueue {
    store: CacheStore,
    max_len: usize,
}

impl OutboundQueue {
    pub fn new(store: CacheStore, max_len: usize) -> Self {
        Self {
            store,
            max_len: max_len.max(1),
        }
    }

    /// Add a mutation.
    ///
    /// A pending mutation for the same record is replaced in place (latest
    /// payload, fresh id). When full the oldest entry is dropped.
    pub async fn enqueue(&self, mutation: QueuedMutation) {
        let max_len = self.max_len;

        self.store
            .update::<Vec<QueuedMutation>, _>(OUTBOUND_QUEUE_KEY, |queue| {
                if let Some(existing) = queue.iter_mut().find(|m| m.targets_same_record(&mutation)) {
                    tracing::debug!(
                        collection = %mutation.collection,
                        key = %mutation.record_key,
                        "coalescing queued mutation"
                    );
                    *existing = mutation;
                    return;
                }

                while queue.len() >= max_len {
                    let dropped = queue.remove(0);
                    tracing::warn!(
                        collection = %dropped.collection,
                        key = %dropped.record_key,
                        "outbound queue full, dropping oldest mutation"
                    );
                }
                queue.push(mutation);
            })
            .await;
    }

    /// Snapshot in FIFO order
    pub fn pending(&self) -> Vec<QueuedMutation> {
        self.store.get(OUTBOUND_QUEUE_KEY).unwrap_or_default()
    }

    pub fn front(&self) -> Option<QueuedMutation> {
        self.pending().into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes not yet pushed for `collection`, by record key. Coalescing
    /// keeps at most one per key.
    pub fn pending_writes(&self, collection: CollectionName) -> HashMap<String, QueuedMutation> {
        self.pending()
            .into_iter()
            .filter(|m| m.collection == collection)
            .map(|m| (m.record_key.clone(), m))
            .collect()
    }

    /// Decode a queued payload back into the record it was captured from
    pub fn decode_payload<T: TrackedRecord>(mutation: &QueuedMutation) -> Option<T> {
        if mutation.collection != T::COLLECTION {
            return None;
        }
        serde_json::from_value(mutation.payload.clone()).ok()
    }

    /// Remove an entry once the server accepted it. Returns whether it was
    /// still queued (a coalesced entry has a new id and stays).
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut removed = false;
        self.store
            .update::<Vec<QueuedMutation>, _>(OUTBOUND_QUEUE_KEY, |queue| {
                let before = queue.len();
                queue.retain(|m| m.id != id);
                removed = queue.len() != before;
            })
            .await;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Carcasse, Fei};
    use crate::test_support::{carcasse, deleted, fei};
    use pretty_assertions::assert_eq;

    fn queue(max_len: usize) -> OutboundQueue {
        OutboundQueue::new(CacheStore::in_memory(), max_len)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = queue(10);

        queue.enqueue(QueuedMutation::upsert(&fei("A", "2024-01-01T00:00:00Z")).unwrap()).await;
        queue.enqueue(QueuedMutation::upsert(&fei("B", "2024-01-01T00:00:00Z")).unwrap()).await;

        let keys: Vec<String> = queue.pending().into_iter().map(|m| m.record_key).collect();
        assert_eq!(keys, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(queue.front().unwrap().record_key, "A");
    }

    #[tokio::test]
    async fn test_same_record_is_coalesced_in_place() {
        let queue = queue(10);

        let first = QueuedMutation::upsert(&fei("A", "2024-01-01T00:00:00Z")).unwrap();
        let first_id = first.id;
        queue.enqueue(first).await;
        queue.enqueue(QueuedMutation::upsert(&fei("B", "2024-01-01T00:00:00Z")).unwrap()).await;
        queue.enqueue(QueuedMutation::delete(&fei("A", "2024-01-02T00:00:00Z")).unwrap()).await;

        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].record_key, "A");
        assert_eq!(pending[0].kind, MutationKind::Delete);
        assert_ne!(pending[0].id, first_id);

        // The superseded id is gone, so removing it is a no-op
        assert!(!queue.remove(first_id).await);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_bounded_queue_drops_oldest() {
        let queue = queue(2);

        for numero in ["A", "B", "C"] {
            queue.enqueue(QueuedMutation::upsert(&fei(numero, "2024-01-01T00:00:00Z")).unwrap()).await;
        }

        let keys: Vec<String> = queue.pending().into_iter().map(|m| m.record_key).collect();
        assert_eq!(keys, vec!["B".to_string(), "C".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_writes_per_collection() {
        let queue = queue(10);

        queue.enqueue(QueuedMutation::upsert(&fei("A", "2024-01-01T00:00:00Z")).unwrap()).await;
        queue
            .enqueue(QueuedMutation::upsert(&carcasse("A", "B1", "2024-01-01T00:00:00Z")).unwrap())
            .await;

        let feis = queue.pending_writes(CollectionName::Feis);
        assert_eq!(feis.keys().collect::<Vec<_>>(), vec!["A"]);
        let carcasses = queue.pending_writes(CollectionName::Carcasses);
        assert_eq!(carcasses.keys().collect::<Vec<_>>(), vec!["A/B1"]);
    }

    #[tokio::test]
    async fn test_delete_payload_decodes_to_tombstone() {
        let queue = queue(10);
        let tombstone = deleted(fei("A", "2024-01-02T00:00:00Z"), "2024-01-02T00:00:00Z");
        queue.enqueue(QueuedMutation::delete(&tombstone).unwrap()).await;

        let pending = queue.pending_writes(CollectionName::Feis);
        let decoded: Fei = OutboundQueue::decode_payload(&pending["A"]).unwrap();
        assert!(decoded.is_deleted());
        assert_eq!(decoded.updated_at, tombstone.updated_at);

        // Wrong collection never decodes
        assert!(OutboundQueue::decode_payload::<Carcasse>(&pending["A"]).is_none());
    }

    #[tokio::test]
    async fn test_remove_accepted_entry() {
        let queue = queue(10);
        let mutation = QueuedMutation::upsert(&fei("A", "2024-01-01T00:00:00Z")).unwrap();
        let id = mutation.id;
        queue.enqueue(mutation).await;

        assert!(queue.remove(id).await);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_survives_store_reopen() {
        let storage = std::sync::Arc::new(crate::store::MemoryStorage::new());
        let store = CacheStore::open(storage.clone()).await;
        OutboundQueue::new(store, 10)
            .enqueue(QueuedMutation::upsert(&fei("A", "2024-01-01T00:00:00Z")).unwrap())
            .await;

        let reopened = OutboundQueue::new(CacheStore::open(storage).await, 10);
        assert_eq!(reopened.len(), 1);
    }
}
