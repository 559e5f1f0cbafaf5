//! # Sync Coordinator
//!
//! Replays one entity type's pending queue against the backend.
//!
//! ## Drain Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Drain (one entity)                              │
//! │                                                                         │
//! │   Idle ──try_lock──► Draining                       (held? → Busy)      │
//! │                         │                                               │
//! │                         ▼                                               │
//! │   snapshot = queue.peek_all()            (empty → done, no calls)      │
//! │                         │                                               │
//! │   for op in snapshot (FIFO):                                           │
//! │       retarget local ids confirmed earlier in this pass                │
//! │       dispatch ──► ok:   apply result to cache, remember id remap      │
//! │                └─► err:  stop; later ops are not attempted             │
//! │                         │                                               │
//! │   queue.acknowledge_through(last confirmed seq, remap)                 │
//! │                         │                                               │
//! │   complete? ──► refresh every cached view                              │
//! │                         │                                               │
//! │   ──► Idle, DrainReport                                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only the coordinator removes queue entries, and only as a confirmed
//! prefix: an operation enqueued while a drain runs is never dropped.
//!
//! If the queue cannot be written after the backend confirmed a prefix,
//! the acknowledgement is kept and retried before the next drain sends
//! anything, so a confirmed create is never sent twice by the same process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tally_core::{EntityKind, IdRemap, OperationKind, PendingOperation, Record, RecordId};
use tally_store::{CacheStore, PendingOperationQueue};

use crate::error::{SyncError, SyncResult};
use crate::gateway::{with_timeout, GatewayError, GatewayResult, RemoteGateway};
use crate::observer::SyncObserver;
use crate::refresh::ViewRefresher;

// =============================================================================
// Drain Types
// =============================================================================

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    Idle,
    Draining,
}

/// The operation a drain stopped at.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainFailure {
    pub seq: u64,
    pub kind: OperationKind,
    pub error: String,
    /// True if the backend was unreachable rather than refusing.
    pub connectivity: bool,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub entity: EntityKind,
    /// Operations dispatched, including the failing one.
    pub attempted: usize,
    /// Operations the backend confirmed and the queue released.
    pub confirmed: usize,
    /// Operations still queued afterwards.
    pub remaining: usize,
    pub failure: Option<DrainFailure>,
    /// Views refreshed after a complete pass.
    pub refreshed: usize,
}

impl DrainReport {
    fn empty(entity: EntityKind) -> Self {
        DrainReport {
            entity,
            attempted: 0,
            confirmed: 0,
            remaining: 0,
            failure: None,
            refreshed: 0,
        }
    }

    /// True if no operation failed.
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of asking for a drain.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Drained(DrainReport),
    /// Another drain of the same entity was already running; nothing was
    /// dispatched.
    Busy,
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Drained(report) => Some(report),
            DrainOutcome::Busy => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, DrainOutcome::Busy)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// A confirmed prefix the queue has not released yet.
#[derive(Debug)]
struct UnackedPrefix {
    through: u64,
    remap: IdRemap,
}

/// Drains one entity type's queue. At most one drain runs at a time.
pub struct SyncCoordinator {
    entity: EntityKind,
    cache: Arc<CacheStore>,
    queue: Arc<PendingOperationQueue>,
    gateway: Arc<dyn RemoteGateway>,
    refresher: ViewRefresher,
    observer: Arc<dyn SyncObserver>,
    call_timeout: Duration,
    /// Held for the whole drain; carries an acknowledgement that failed.
    drain_lock: Mutex<Option<UnackedPrefix>>,
    draining: AtomicBool,
}

/// Resets the draining flag however the drain exits.
struct DrainingGuard<'a>(&'a AtomicBool);

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncCoordinator {
    pub fn new(
        cache: Arc<CacheStore>,
        queue: Arc<PendingOperationQueue>,
        gateway: Arc<dyn RemoteGateway>,
        observer: Arc<dyn SyncObserver>,
        call_timeout: Duration,
    ) -> Self {
        let refresher = ViewRefresher::new(
            cache.clone(),
            queue.clone(),
            gateway.clone(),
            observer.clone(),
            call_timeout,
        );

        SyncCoordinator {
            entity: cache.entity(),
            cache,
            queue,
            gateway,
            refresher,
            observer,
            call_timeout,
            drain_lock: Mutex::new(None),
            draining: AtomicBool::new(false),
        }
    }

    pub fn entity(&self) -> EntityKind {
        self.entity
    }

    pub fn state(&self) -> DrainState {
        if self.draining.load(Ordering::SeqCst) {
            DrainState::Draining
        } else {
            DrainState::Idle
        }
    }

    /// Attempts every currently queued operation, in order.
    ///
    /// Returns [`DrainOutcome::Busy`] without touching anything if a drain
    /// is already in progress. Gateway failures end up in the report, not
    /// in the error; only an unreadable or unwritable queue is an error.
    pub async fn drain(&self) -> SyncResult<DrainOutcome> {
        let Ok(mut unacked) = self.drain_lock.try_lock() else {
            debug!(entity = %self.entity, "Drain already running");
            return Ok(DrainOutcome::Busy);
        };

        if let Some(prefix) = unacked.take() {
            if let Err(e) = self.queue.acknowledge_through(prefix.through, &prefix.remap).await {
                *unacked = Some(prefix);
                return Err(SyncError::QueueUnavailable(e));
            }
            info!(entity = %self.entity, through = prefix.through, "Released previously confirmed operations");
        }

        let snapshot = self.queue.peek_all().await.map_err(SyncError::QueueUnavailable)?;
        if snapshot.is_empty() {
            return Ok(DrainOutcome::Drained(DrainReport::empty(self.entity)));
        }

        self.draining.store(true, Ordering::SeqCst);
        let _state = DrainingGuard(&self.draining);

        info!(entity = %self.entity, backlog = snapshot.len(), "Draining pending operations");

        let mut report = DrainReport::empty(self.entity);
        let mut remap = IdRemap::new();
        let mut last_confirmed = None;

        for mut op in snapshot.iter().cloned() {
            if op.retarget(&remap) {
                debug!(entity = %self.entity, seq = op.seq, target = ?op.target_id, "Retargeted to backend id");
            }

            report.attempted += 1;
            match self.dispatch(&op).await {
                Ok(result) => {
                    self.apply_confirmed(&op, result, &mut remap).await;
                    last_confirmed = Some(op.seq);
                    report.confirmed += 1;
                }
                Err(err) => {
                    warn!(
                        entity = %self.entity,
                        seq = op.seq,
                        kind = %op.kind,
                        error = %err,
                        "Pending operation failed, stopping drain"
                    );
                    report.failure = Some(DrainFailure {
                        seq: op.seq,
                        kind: op.kind.clone(),
                        error: err.to_string(),
                        connectivity: err.is_connectivity_failure(),
                    });
                    break;
                }
            }
        }

        if let Some(seq) = last_confirmed {
            if let Err(e) = self.queue.acknowledge_through(seq, &remap).await {
                warn!(
                    entity = %self.entity,
                    through = seq,
                    confirmed = report.confirmed,
                    error = %e,
                    "Could not release confirmed operations, retrying on next drain"
                );
                report.remaining = snapshot.len() - report.confirmed;
                self.observer.drain_finished(&report);
                *unacked = Some(UnackedPrefix { through: seq, remap });
                return Err(SyncError::QueueUnavailable(e));
            }
        }

        report.remaining = match self.queue.len().await {
            Ok(n) => n,
            Err(_) => snapshot.len() - report.confirmed,
        };

        if report.is_complete() {
            report.refreshed = self.refresh_all_views().await;
        }

        self.observer.drain_finished(&report);
        Ok(DrainOutcome::Drained(report))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Sends one operation. `None` means the backend confirmed a delete.
    async fn dispatch(&self, op: &PendingOperation) -> GatewayResult<Option<Record>> {
        with_timeout(self.call_timeout, self.send(op)).await
    }

    async fn send(&self, op: &PendingOperation) -> GatewayResult<Option<Record>> {
        match &op.kind {
            OperationKind::Create => self.gateway.create(&op.payload).await.map(Some),
            OperationKind::Update => self.gateway.update(target(op)?, &op.payload).await.map(Some),
            OperationKind::Delete => self.gateway.delete(target(op)?).await.map(|_| None),
            OperationKind::Custom(name) => self
                .gateway
                .custom(name, target(op)?, &op.payload)
                .await
                .map(Some),
        }
    }

    /// Mirrors a confirmed operation into every cached view.
    async fn apply_confirmed(&self, op: &PendingOperation, result: Option<Record>, remap: &mut IdRemap) {
        let outcome = match (&op.kind, result) {
            (OperationKind::Create, Some(record)) => {
                if let Some(local_id) = &op.local_id {
                    remap.insert(local_id.clone(), record.id.clone());
                }
                match self.cache.supersede_optimistic(op.seq, &record).await {
                    Ok(_) => self.cache.upsert_everywhere(&record).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            (_, Some(record)) => self.cache.upsert_everywhere(&record).await.map(|_| ()),
            (_, None) => match &op.target_id {
                Some(id) => self.cache.remove_everywhere(id).await.map(|_| ()),
                None => Ok(()),
            },
        };

        if let Err(e) = outcome {
            self.observer
                .cache_degraded(self.entity, "apply confirmed operation", &e.to_string());
        }
    }

    /// Re-reads every cached view from the backend. Returns how many were
    /// refreshed.
    async fn refresh_all_views(&self) -> usize {
        let views = match self.cache.views().await {
            Ok(views) => views,
            Err(e) => {
                self.observer
                    .cache_degraded(self.entity, "list cached views", &e.to_string());
                return 0;
            }
        };

        let mut refreshed = 0;
        for view in &views {
            match self.refresher.refresh(view).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(entity = %self.entity, view = %view, error = %e, "Post-drain refresh failed"),
            }
        }
        refreshed
    }
}

fn target(op: &PendingOperation) -> GatewayResult<&RecordId> {
    op.target_id.as_ref().ok_or_else(|| GatewayError::Rejected {
        status: 422,
        message: format!("queued {} #{} has no target id", op.kind, op.seq),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayCall, MemoryGateway};
    use crate::observer::NoOpObserver;
    use serde_json::json;
    use tally_core::{NewOperation, ViewKey};
    use tally_store::MemoryKvStore;

    struct Harness {
        cache: Arc<CacheStore>,
        queue: Arc<PendingOperationQueue>,
        gateway: Arc<MemoryGateway>,
        coordinator: SyncCoordinator,
    }

    fn harness(entity: EntityKind, backend: Vec<serde_json::Value>) -> Harness {
        let kv = MemoryKvStore::new(entity.cache_instance());
        let cache = Arc::new(CacheStore::new(entity, Arc::new(kv.clone())));
        let queue = Arc::new(PendingOperationQueue::new(
            entity,
            Arc::new(kv.scoped(entity.queue_instance())),
        ));
        let gateway = Arc::new(MemoryGateway::with_records(entity, backend));
        let coordinator = SyncCoordinator::new(
            cache.clone(),
            queue.clone(),
            gateway.clone(),
            Arc::new(NoOpObserver),
            Duration::from_secs(1),
        );

        Harness {
            cache,
            queue,
            gateway,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_empty_drain_makes_no_calls() {
        let h = harness(EntityKind::Sale, vec![]);

        let outcome = h.coordinator.drain().await.unwrap();
        let report = outcome.report().unwrap();

        assert!(report.is_complete());
        assert_eq!(report.attempted, 0);
        assert!(h.gateway.calls().is_empty());
        assert_eq!(h.coordinator.state(), DrainState::Idle);
    }

    #[tokio::test]
    async fn test_create_then_update_on_local_id() {
        let h = harness(EntityKind::Joint, vec![]);

        let local = RecordId::local();
        let create = h
            .queue
            .enqueue(NewOperation::create(
                EntityKind::Joint,
                json!({ "inventory_id": 1, "joints_count": 4 }),
                local.clone(),
            ))
            .await
            .unwrap();
        h.cache
            .append_optimistic(
                &ViewKey::all(),
                Record::optimistic(local.clone(), &create.payload, create.pending_marker()).unwrap(),
            )
            .await
            .unwrap();
        h.queue
            .enqueue(NewOperation::custom(
                EntityKind::Joint,
                "assign",
                local.clone(),
                json!({ "assigned_to": 3 }),
            ))
            .await
            .unwrap();

        let report = h.coordinator.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.remaining, 0);

        let calls = h.gateway.mutation_calls();
        assert_eq!(calls[1].target(), Some(&RecordId::from(1)));

        let cached = h.cache.read(&ViewKey::all()).await.unwrap().unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].id, RecordId::from(1));
        assert!(!cached[0].is_pending());
        assert_eq!(cached[0].field("assigned_to"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_rejection_stops_drain() {
        let h = harness(EntityKind::Inventory, vec![json!({ "id": 1 }), json!({ "id": 2 })]);

        for id in [1, 2] {
            h.queue
                .enqueue(NewOperation::update(EntityKind::Inventory, id.into(), json!({ "price_per_gram": 9 })))
                .await
                .unwrap();
        }
        h.gateway.fail_on(|call| match call {
            GatewayCall::Update { id, .. } if id == &RecordId::from(1) => Some(GatewayError::Rejected {
                status: 400,
                message: "price locked".into(),
            }),
            _ => None,
        });

        let report = h.coordinator.drain().await.unwrap().report().cloned().unwrap();
        let failure = report.failure.unwrap();

        assert_eq!(failure.seq, 1);
        assert!(!failure.connectivity);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.remaining, 2);
        assert_eq!(h.gateway.mutation_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_busy() {
        let h = harness(EntityKind::Sale, vec![json!({ "id": 1 })]);
        h.queue
            .enqueue(NewOperation::delete(EntityKind::Sale, 1.into()))
            .await
            .unwrap();
        h.gateway.set_latency(Duration::from_millis(100));

        let (first, second) = tokio::join!(h.coordinator.drain(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.coordinator.drain().await
        });

        assert!(first.unwrap().report().unwrap().is_complete());
        assert!(second.unwrap().is_busy());
        assert_eq!(h.gateway.mutation_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_release_is_retried_without_resending() {
        let queue_kv = MemoryKvStore::new("sale-queue");
        let cache = Arc::new(CacheStore::new(
            EntityKind::Sale,
            Arc::new(MemoryKvStore::new("sale-cache")),
        ));
        let queue = Arc::new(PendingOperationQueue::new(EntityKind::Sale, Arc::new(queue_kv.clone())));
        let gateway = Arc::new(MemoryGateway::new(EntityKind::Sale));
        let coordinator = SyncCoordinator::new(
            cache,
            queue.clone(),
            gateway.clone(),
            Arc::new(NoOpObserver),
            Duration::from_secs(1),
        );

        let local = RecordId::local();
        queue
            .enqueue(NewOperation::create(EntityKind::Sale, json!({ "quantity": 1 }), local.clone()))
            .await
            .unwrap();

        // The queue breaks once the backend has taken the create.
        let broken = queue_kv.clone();
        gateway.fail_on(move |_| {
            broken.set_unavailable(true);
            None
        });

        let err = coordinator.drain().await.unwrap_err();
        assert!(matches!(err, SyncError::QueueUnavailable(_)));
        assert_eq!(gateway.records().len(), 1);

        // Still broken: the release is kept for later.
        assert!(coordinator.drain().await.is_err());

        gateway.clear_failures();
        queue_kv.set_unavailable(false);
        let report = coordinator.drain().await.unwrap().report().cloned().unwrap();

        assert_eq!(report.attempted, 0);
        assert_eq!(gateway.records().len(), 1);
        assert_eq!(gateway.mutation_calls().len(), 1);
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(queue.resolve(&local).await.unwrap(), Some(RecordId::from(1)));
    }

    #[tokio::test]
    async fn test_unreadable_queue_is_error() {
        let kv = MemoryKvStore::new("sale-queue");
        let cache = Arc::new(CacheStore::new(
            EntityKind::Sale,
            Arc::new(MemoryKvStore::new("sale-cache")),
        ));
        let queue = Arc::new(PendingOperationQueue::new(EntityKind::Sale, Arc::new(kv.clone())));
        let coordinator = SyncCoordinator::new(
            cache,
            queue,
            Arc::new(MemoryGateway::new(EntityKind::Sale)),
            Arc::new(NoOpObserver),
            Duration::from_secs(1),
        );

        kv.set_unavailable(true);
        let err = coordinator.drain().await.unwrap_err();
        assert!(matches!(err, SyncError::QueueUnavailable(_)));
    }
}
