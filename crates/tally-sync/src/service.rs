//! # Entity Service
//!
//! Read-through listing and write-behind mutations for one entity type.
//!
//! ## Mutation Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     create / update / delete / custom                   │
//! │                                                                         │
//! │   online and target has a backend id?                                  │
//! │        │ yes                                  │ no                      │
//! │        ▼                                      │                         │
//! │   gateway call ──ok──► cache ──► Confirmed     │                         │
//! │        │                                      │                         │
//! │        ├── rejected (4xx) ──► Err, not queued  │                         │
//! │        │                                      ▼                         │
//! │        └── unreachable ─────────────► validate ──► enqueue ──► cache   │
//! │                                                      │                  │
//! │                                                      ▼                  │
//! │                                                   Queued                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cache failures never fail a call: reads fall back to empty, writes are
//! skipped and reported to the observer.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use tally_core::validation::{validate_create, validate_custom, validate_delete, validate_update};
use tally_core::{
    payload_object, EntityKind, MutationOutcome, NewOperation, PendingOperation, Record, RecordId,
    ViewKey,
};
use tally_store::{CacheStore, KvHandle, PendingOperationQueue};

use crate::connectivity::ConnectivityOracle;
use crate::coordinator::{DrainOutcome, DrainState, SyncCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{with_timeout, GatewayResult, RemoteGateway};
use crate::observer::{SyncObserver, TracingObserver};
use crate::refresh::ViewRefresher;

/// Default bound on a single backend call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Service Context
// =============================================================================

/// Collaborators shared by every entity service.
#[derive(Clone)]
pub struct ServiceContext {
    pub oracle: Arc<dyn ConnectivityOracle>,
    pub observer: Arc<dyn SyncObserver>,
    pub call_timeout: Duration,
}

impl ServiceContext {
    /// Context with the tracing observer and the default call timeout.
    pub fn new(oracle: Arc<dyn ConnectivityOracle>) -> Self {
        ServiceContext {
            oracle,
            observer: Arc::new(TracingObserver),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

// =============================================================================
// Entity Service
// =============================================================================

/// Offline-capable access to one entity type.
pub struct EntityService {
    entity: EntityKind,
    cache: Arc<CacheStore>,
    queue: Arc<PendingOperationQueue>,
    gateway: Arc<dyn RemoteGateway>,
    oracle: Arc<dyn ConnectivityOracle>,
    observer: Arc<dyn SyncObserver>,
    call_timeout: Duration,
    refresher: ViewRefresher,
    coordinator: SyncCoordinator,
    background: Mutex<JoinSet<()>>,
}

impl EntityService {
    /// Builds a service over the given cache and queue instances.
    pub fn new(
        entity: EntityKind,
        cache_kv: KvHandle,
        queue_kv: KvHandle,
        gateway: Arc<dyn RemoteGateway>,
        ctx: &ServiceContext,
    ) -> Self {
        let cache = Arc::new(CacheStore::new(entity, cache_kv));
        let queue = Arc::new(PendingOperationQueue::new(entity, queue_kv));

        let refresher = ViewRefresher::new(
            cache.clone(),
            queue.clone(),
            gateway.clone(),
            ctx.observer.clone(),
            ctx.call_timeout,
        );
        let coordinator = SyncCoordinator::new(
            cache.clone(),
            queue.clone(),
            gateway.clone(),
            ctx.observer.clone(),
            ctx.call_timeout,
        );

        EntityService {
            entity,
            cache,
            queue,
            gateway,
            oracle: ctx.oracle.clone(),
            observer: ctx.observer.clone(),
            call_timeout: ctx.call_timeout,
            refresher,
            coordinator,
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn entity(&self) -> EntityKind {
        self.entity
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &PendingOperationQueue {
        &self.queue
    }

    pub fn drain_state(&self) -> DrainState {
        self.coordinator.state()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Lists the full collection.
    pub async fn list(&self) -> SyncResult<Vec<Record>> {
        self.list_view(&ViewKey::all()).await
    }

    /// Lists one view, read-through.
    ///
    /// A non-empty cached view is returned at once and refreshed in the
    /// background. An empty or missing one is fetched before returning.
    /// Offline, the cache is all there is.
    pub async fn list_view(&self, view: &ViewKey) -> SyncResult<Vec<Record>> {
        let cached = match self.cache.read(view).await {
            Ok(cached) => cached,
            Err(e) => {
                self.observer.cache_degraded(self.entity, "read view", &e.to_string());
                None
            }
        };

        let online = self.oracle.is_online();
        match cached {
            Some(records) if !records.is_empty() => {
                if online {
                    self.spawn_refresh(view.clone());
                }
                Ok(records)
            }
            cached if !online => Ok(cached.unwrap_or_default()),
            cached => match self.refresher.refresh(view).await {
                Ok(records) => Ok(records),
                Err(SyncError::RemoteUnavailable(reason)) => {
                    warn!(entity = %self.entity, view = %view, %reason, "Backend unreachable, serving cache");
                    Ok(cached.unwrap_or_default())
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Fetches `view` from the backend now, replacing the cached copy.
    pub async fn refresh(&self, view: &ViewKey) -> SyncResult<Vec<Record>> {
        self.refresher.refresh(view).await
    }

    /// Waits for every background refresh spawned so far.
    pub async fn wait_for_background(&self) {
        let mut tasks = std::mem::take(&mut *self.background());
        while tasks.join_next().await.is_some() {}
    }

    fn spawn_refresh(&self, view: ViewKey) {
        // A running drain refreshes every cached view once it completes.
        if self.coordinator.state() == DrainState::Draining {
            debug!(entity = %self.entity, view = %view, "Drain running, skipping background refresh");
            return;
        }

        let refresher = self.refresher.clone();
        let observer = self.observer.clone();
        let entity = self.entity;

        let mut tasks = self.background();
        while tasks.try_join_next().is_some() {}

        debug!(entity = %entity, view = %view, "Spawning background refresh");
        tasks.spawn(async move {
            if let Err(e) = refresher.refresh(&view).await {
                observer.background_refresh_failed(entity, &view, &e);
            }
        });
    }

    fn background(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Creates a record.
    pub async fn create(&self, payload: Value) -> SyncResult<MutationOutcome<Record>> {
        if self.oracle.is_online() {
            match self.remote(self.gateway.create(&payload)).await? {
                Some(record) => {
                    self.cache_upsert(&record).await;
                    return Ok(MutationOutcome::Confirmed(record));
                }
                None => debug!(entity = %self.entity, "Create falling back to queue"),
            }
        }

        payload_object(&payload)?;
        validate_create(self.entity, &payload)?;

        let local_id = RecordId::local();
        let op = self
            .enqueue(NewOperation::create(self.entity, payload, local_id.clone()))
            .await?;
        let record = Record::optimistic(local_id, &op.payload, op.pending_marker())?;
        self.cache_add_optimistic(&record).await;

        Ok(MutationOutcome::Queued {
            value: record,
            seq: op.seq,
        })
    }

    /// Applies a partial update to a record.
    pub async fn update(&self, id: &RecordId, payload: Value) -> SyncResult<MutationOutcome<Record>> {
        let id = &self.resolve(id).await;
        if self.can_call_remote(id) {
            if let Some(record) = self.remote(self.gateway.update(id, &payload)).await? {
                self.cache_upsert(&record).await;
                return Ok(MutationOutcome::Confirmed(record));
            }
        }

        payload_object(&payload)?;
        validate_update(self.entity, &payload)?;

        let op = self
            .enqueue(NewOperation::update(self.entity, id.clone(), payload))
            .await?;
        let value = self.cache_merge(id, &op.payload).await;

        Ok(MutationOutcome::Queued { value, seq: op.seq })
    }

    /// Deletes a record.
    pub async fn delete(&self, id: &RecordId) -> SyncResult<MutationOutcome<RecordId>> {
        let id = &self.resolve(id).await;
        if self.can_call_remote(id) {
            if self.remote(self.gateway.delete(id)).await?.is_some() {
                self.cache_remove(id).await;
                return Ok(MutationOutcome::Confirmed(id.clone()));
            }
        }

        validate_delete(self.entity)?;

        let op = self.enqueue(NewOperation::delete(self.entity, id.clone())).await?;
        self.cache_remove(id).await;

        Ok(MutationOutcome::Queued {
            value: id.clone(),
            seq: op.seq,
        })
    }

    /// Runs an entity-specific operation (`assign` for joints, `role` for
    /// users).
    pub async fn custom(
        &self,
        name: &str,
        id: &RecordId,
        payload: Value,
    ) -> SyncResult<MutationOutcome<Record>> {
        let id = &self.resolve(id).await;
        if self.can_call_remote(id) {
            if let Some(record) = self.remote(self.gateway.custom(name, id, &payload)).await? {
                self.cache_upsert(&record).await;
                return Ok(MutationOutcome::Confirmed(record));
            }
        }

        payload_object(&payload)?;
        validate_custom(self.entity, name, &payload)?;

        let op = self
            .enqueue(NewOperation::custom(self.entity, name, id.clone(), payload))
            .await?;
        let value = self.cache_merge(id, &op.payload).await;

        Ok(MutationOutcome::Queued { value, seq: op.seq })
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Number of operations waiting for the backend.
    pub async fn pending_count(&self) -> SyncResult<usize> {
        self.queue.len().await.map_err(SyncError::QueueUnavailable)
    }

    /// Operations waiting for the backend, oldest first.
    pub async fn pending_operations(&self) -> SyncResult<Vec<PendingOperation>> {
        self.queue.peek_all().await.map_err(SyncError::QueueUnavailable)
    }

    /// Replays the pending queue against the backend.
    pub async fn drain(&self) -> SyncResult<DrainOutcome> {
        self.coordinator.drain().await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Maps a local id whose create the backend already confirmed to the
    /// backend id. Anything else comes back unchanged.
    async fn resolve(&self, id: &RecordId) -> RecordId {
        match self.queue.resolve(id).await {
            Ok(Some(remote)) => {
                debug!(entity = %self.entity, local = %id, remote = %remote, "Resolved confirmed local id");
                remote
            }
            Ok(None) => id.clone(),
            Err(e) => {
                warn!(entity = %self.entity, id = %id, error = %e, "Could not resolve local id");
                id.clone()
            }
        }
    }

    /// Operations on a record that only exists locally must follow its
    /// queued create.
    fn can_call_remote(&self, id: &RecordId) -> bool {
        !id.is_local() && self.oracle.is_online()
    }

    /// Runs a gateway call. `Ok(None)` means the backend was unreachable
    /// and the caller should queue instead.
    async fn remote<T>(
        &self,
        call: impl std::future::Future<Output = GatewayResult<T>>,
    ) -> SyncResult<Option<T>> {
        match with_timeout(self.call_timeout, call).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_connectivity_failure() => {
                debug!(entity = %self.entity, error = %e, "Backend unreachable, queueing");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn enqueue(&self, op: NewOperation) -> SyncResult<PendingOperation> {
        let pending = self
            .queue
            .enqueue(op)
            .await
            .map_err(SyncError::QueueUnavailable)?;
        self.observer.operation_queued(&pending);
        Ok(pending)
    }

    async fn cache_upsert(&self, record: &Record) {
        if let Err(e) = self.cache.upsert_everywhere(record).await {
            self.observer.cache_degraded(self.entity, "store confirmed record", &e.to_string());
        }
    }

    async fn cache_remove(&self, id: &RecordId) {
        if let Err(e) = self.cache.remove_everywhere(id).await {
            self.observer.cache_degraded(self.entity, "remove record", &e.to_string());
        }
    }

    /// Adds an optimistic record to the full view and every cached view
    /// that admits it.
    async fn cache_add_optimistic(&self, record: &Record) {
        let mut views = match self.cache.views().await {
            Ok(views) => views,
            Err(e) => {
                self.observer.cache_degraded(self.entity, "list cached views", &e.to_string());
                return;
            }
        };
        if !views.iter().any(ViewKey::is_all) {
            views.push(ViewKey::all());
        }

        for view in views.iter().filter(|v| v.admits(self.entity, record)) {
            if let Err(e) = self.cache.append_optimistic(view, record.clone()).await {
                self.observer.cache_degraded(self.entity, "append optimistic record", &e.to_string());
                return;
            }
        }
    }

    /// Merges a queued payload into the cached record. Returns the merged
    /// record, or one built from the payload if nothing was cached.
    async fn cache_merge(&self, id: &RecordId, payload: &Value) -> Record {
        let patched = self
            .cache
            .patch_everywhere(id, |record| record.merge_payload(payload))
            .await;

        match patched {
            Ok(Some(record)) => record,
            Ok(None) => bare_record(id, payload),
            Err(e) => {
                self.observer.cache_degraded(self.entity, "patch record", &e.to_string());
                bare_record(id, payload)
            }
        }
    }
}

fn bare_record(id: &RecordId, payload: &Value) -> Record {
    let mut record = Record {
        id: id.clone(),
        pending: None,
        fields: Default::default(),
    };
    record.merge_payload(payload);
    record
}
