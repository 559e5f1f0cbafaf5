//! # Pending Operation Queue
//!
//! Durable, strictly ordered log of mutations accepted locally but not yet
//! confirmed by the backend.
//!
//! ## Log Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Pending Operation Log                                │
//! │                                                                         │
//! │  EntityService (offline)                                               │
//! │       │ enqueue(op)  → seq = next_seq++                                │
//! │       ▼                                                                 │
//! │  ┌──────────────────────────────────────────────────────────────┐      │
//! │  │  #1 create  │  #2 update 7  │  #3 delete 9  │  ...           │      │
//! │  └──────────────────────────────────────────────────────────────┘      │
//! │       │ peek_all()                                                      │
//! │       ▼                                                                 │
//! │  SyncCoordinator: #1 ✓  #2 ✓  #3 ✗ (stop)                              │
//! │       │ acknowledge_through(2, remap)                                  │
//! │       ▼                                                                 │
//! │  ┌──────────────────────────────────────────────────────────────┐      │
//! │  │  #3 delete 9  │  ...                                         │      │
//! │  └──────────────────────────────────────────────────────────────┘      │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • Entries are never reordered or deduplicated                         │
//! │  • Only a confirmed prefix is ever removed                             │
//! │  • Sequence numbers never repeat, even after clear()                   │
//! │  • Confirmed local ids stay resolvable after their entry is gone       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole log is one document in the key-value store, so every mutation
//! of it is a single atomic write.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use tally_core::{EntityKind, IdRemap, NewOperation, PendingOperation, RecordId};

use crate::error::{StoreError, StoreResult};
use crate::kv::KvHandle;

/// Key of the log document inside the queue instance.
const LOG_KEY: &str = "log";

/// Confirmed local ids remembered after their create left the log.
const MAX_REMEMBERED_IDS: usize = 1024;

/// Persisted form of the log.
#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueLog {
    next_seq: u64,
    operations: Vec<PendingOperation>,
    /// Local ids already confirmed by the backend, oldest first. Outlives
    /// the operations that produced it: a caller may still hold a queued
    /// record's local id long after the queue has emptied.
    #[serde(default)]
    remap: Vec<(RecordId, RecordId)>,
}

impl QueueLog {
    fn remap(&self) -> IdRemap {
        self.remap.iter().cloned().collect()
    }

    fn remember(&mut self, confirmed: &IdRemap) {
        for (local, remote) in confirmed {
            match self.remap.iter_mut().find(|(known, _)| known == local) {
                Some(entry) => entry.1 = remote.clone(),
                None => self.remap.push((local.clone(), remote.clone())),
            }
        }

        let excess = self.remap.len().saturating_sub(MAX_REMEMBERED_IDS);
        if excess > 0 {
            self.remap = self.remap.split_off(excess);
        }
    }
}

/// Durable FIFO of pending operations for one entity type.
#[derive(Debug)]
pub struct PendingOperationQueue {
    entity: EntityKind,
    kv: KvHandle,
    write_lock: Mutex<()>,
}

impl PendingOperationQueue {
    /// Creates a queue over the given key-value instance.
    pub fn new(entity: EntityKind, kv: KvHandle) -> Self {
        PendingOperationQueue {
            entity,
            kv,
            write_lock: Mutex::new(()),
        }
    }

    /// Entity type this queue holds operations for.
    pub fn entity(&self) -> EntityKind {
        self.entity
    }

    /// Appends an operation, assigning the next sequence number.
    pub async fn enqueue(&self, op: NewOperation) -> StoreResult<PendingOperation> {
        let _guard = self.write_lock.lock().await;

        let mut log = self.load().await?;
        let seq = log.next_seq.max(1);
        log.next_seq = seq + 1;

        let mut pending = PendingOperation::from_new(op, seq, Utc::now());
        pending.retarget(&log.remap());
        log.operations.push(pending.clone());

        self.save(&log).await?;

        debug!(
            entity = %self.entity,
            seq,
            kind = %pending.kind,
            backlog = log.operations.len(),
            "Operation queued"
        );
        Ok(pending)
    }

    /// Returns every pending operation in enqueue order.
    pub async fn peek_all(&self) -> StoreResult<Vec<PendingOperation>> {
        Ok(self.load().await?.operations)
    }

    /// Number of pending operations.
    pub async fn len(&self) -> StoreResult<usize> {
        Ok(self.load().await?.operations.len())
    }

    /// Returns true if nothing is pending.
    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Backend id a confirmed local id was mapped to, if any.
    pub async fn resolve(&self, id: &RecordId) -> StoreResult<Option<RecordId>> {
        if !id.is_local() {
            return Ok(None);
        }
        let log = self.load().await?;
        Ok(log
            .remap
            .iter()
            .find(|(local, _)| local == id)
            .map(|(_, remote)| remote.clone()))
    }

    /// Empties the log in one write. Sequence numbering continues and
    /// confirmed ids stay resolvable.
    pub async fn clear(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut log = self.load().await?;
        let dropped = log.operations.len();
        log.operations.clear();
        self.save(&log).await?;

        info!(entity = %self.entity, dropped, "Pending operations cleared");
        Ok(())
    }

    /// Removes every entry with sequence number `<= seq` and rewrites the
    /// target ids of the remaining entries through `remap`, in one write.
    ///
    /// Entries enqueued while a drain was in flight carry higher sequence
    /// numbers and are untouched. Returns the number of entries removed.
    pub async fn acknowledge_through(&self, seq: u64, remap: &IdRemap) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().await;

        let mut log = self.load().await?;
        let before = log.operations.len();
        log.operations.retain(|op| op.seq > seq);
        let removed = before - log.operations.len();

        log.remember(remap);
        let known = log.remap();
        for op in &mut log.operations {
            op.retarget(&known);
        }

        self.save(&log).await?;

        debug!(
            entity = %self.entity,
            through = seq,
            removed,
            remaining = log.operations.len(),
            "Acknowledged confirmed prefix"
        );
        Ok(removed)
    }

    async fn load(&self) -> StoreResult<QueueLog> {
        match self.kv.get(LOG_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| StoreError::corrupt(self.kv.instance(), LOG_KEY, e)),
            None => Ok(QueueLog::default()),
        }
    }

    async fn save(&self, log: &QueueLog) -> StoreResult<()> {
        let value = serde_json::to_value(log)
            .map_err(|e| StoreError::corrupt(self.kv.instance(), LOG_KEY, e))?;
        self.kv.set(LOG_KEY, &value).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::pool::{LocalStore, StoreConfig};
    use serde_json::json;
    use std::sync::Arc;
    use tally_core::OperationKind;

    fn queue() -> (PendingOperationQueue, MemoryKvStore) {
        let kv = MemoryKvStore::new("inventory-queue");
        (
            PendingOperationQueue::new(EntityKind::Inventory, Arc::new(kv.clone())),
            kv,
        )
    }

    fn update(id: i64) -> NewOperation {
        NewOperation::update(EntityKind::Inventory, RecordId::from(id), json!({ "qty": id }))
    }

    fn seqs(ops: &[PendingOperation]) -> Vec<u64> {
        ops.iter().map(|op| op.seq).collect()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, _) = queue();

        for id in 1..=3 {
            queue.enqueue(update(id)).await.unwrap();
        }

        let ops = queue.peek_all().await.unwrap();
        assert_eq!(seqs(&ops), vec![1, 2, 3]);
        assert_eq!(ops[2].target_id, Some(RecordId::from(3)));
        assert_eq!(ops[0].kind, OperationKind::Update);
    }

    #[tokio::test]
    async fn test_clear_keeps_numbering() {
        let (queue, _) = queue();
        queue.enqueue(update(1)).await.unwrap();
        queue.enqueue(update(2)).await.unwrap();

        queue.clear().await.unwrap();
        assert!(queue.is_empty().await.unwrap());

        let next = queue.enqueue(update(3)).await.unwrap();
        assert_eq!(next.seq, 3);
    }

    #[tokio::test]
    async fn test_acknowledge_prefix_and_remap() {
        let (queue, _) = queue();
        let local = RecordId::local();

        let create = queue
            .enqueue(NewOperation::create(
                EntityKind::Inventory,
                json!({ "strain_name": "OG" }),
                local.clone(),
            ))
            .await
            .unwrap();
        queue
            .enqueue(NewOperation::update(EntityKind::Inventory, local.clone(), json!({ "qty": 1 })))
            .await
            .unwrap();

        let mut remap = IdRemap::new();
        remap.insert(local.clone(), RecordId::from(41));

        assert_eq!(queue.acknowledge_through(create.seq, &remap).await.unwrap(), 1);

        let ops = queue.peek_all().await.unwrap();
        assert_eq!(seqs(&ops), vec![2]);
        assert_eq!(ops[0].target_id, Some(RecordId::from(41)));

        // A late operation on the old local id lands on the backend record.
        let late = queue
            .enqueue(NewOperation::delete(EntityKind::Inventory, local))
            .await
            .unwrap();
        assert_eq!(late.target_id, Some(RecordId::from(41)));
    }

    #[tokio::test]
    async fn test_confirmed_ids_outlive_empty_log() {
        let (queue, _) = queue();
        let local = RecordId::local();

        let create = queue
            .enqueue(NewOperation::create(
                EntityKind::Inventory,
                json!({ "strain_name": "OG" }),
                local.clone(),
            ))
            .await
            .unwrap();

        let mut remap = IdRemap::new();
        remap.insert(local.clone(), RecordId::from(41));
        queue.acknowledge_through(create.seq, &remap).await.unwrap();
        assert!(queue.is_empty().await.unwrap());

        assert_eq!(queue.resolve(&local).await.unwrap(), Some(RecordId::from(41)));
        assert_eq!(queue.resolve(&RecordId::from(41)).await.unwrap(), None);

        let late = queue
            .enqueue(NewOperation::update(EntityKind::Inventory, local.clone(), json!({ "qty": 2 })))
            .await
            .unwrap();
        assert_eq!(late.target_id, Some(RecordId::from(41)));

        queue.clear().await.unwrap();
        assert_eq!(queue.resolve(&local).await.unwrap(), Some(RecordId::from(41)));
    }

    #[tokio::test]
    async fn test_survives_restart_on_sqlite() {
        let store = LocalStore::open(StoreConfig::in_memory()).await.unwrap();

        let queue = PendingOperationQueue::new(EntityKind::Sale, store.kv("sale-queue"));
        queue.enqueue(update(1)).await.unwrap();
        queue.enqueue(update(2)).await.unwrap();
        drop(queue);

        let reopened = PendingOperationQueue::new(EntityKind::Sale, store.kv("sale-queue"));
        assert_eq!(seqs(&reopened.peek_all().await.unwrap()), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unavailable_backend_errors() {
        let (queue, kv) = queue();
        kv.set_unavailable(true);

        assert!(queue.enqueue(update(1)).await.is_err());
        assert!(queue.peek_all().await.is_err());
    }
}
