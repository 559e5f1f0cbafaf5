//! # View Refresh
//!
//! Pulls the authoritative contents of one view and stores it, keeping any
//! still-queued mutations visible on top.
//!
//! ```text
//!   seen = cache.generation()
//!   gateway.list(view) ──► overlay pending ops ──► cache.replace_if_unchanged(view, seen)
//!                                                       │
//!                         written meanwhile? ──► keep the cached view
//! ```
//!
//! A write that lands while the fetch is in flight (an offline create, a
//! drain confirming an operation) is newer than the fetched list, so the
//! list is dropped rather than stored over it.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use tally_core::overlay::apply_pending;
use tally_core::{EntityKind, Record, ViewKey};
use tally_store::{CacheStore, PendingOperationQueue};

use crate::error::SyncResult;
use crate::gateway::{with_timeout, RemoteGateway};
use crate::observer::SyncObserver;

/// Refreshes cached views of one entity type. Cheap to clone, so it can be
/// moved into background tasks.
#[derive(Clone)]
pub struct ViewRefresher {
    entity: EntityKind,
    cache: Arc<CacheStore>,
    queue: Arc<PendingOperationQueue>,
    gateway: Arc<dyn RemoteGateway>,
    observer: Arc<dyn SyncObserver>,
    call_timeout: Duration,
}

impl ViewRefresher {
    pub fn new(
        cache: Arc<CacheStore>,
        queue: Arc<PendingOperationQueue>,
        gateway: Arc<dyn RemoteGateway>,
        observer: Arc<dyn SyncObserver>,
        call_timeout: Duration,
    ) -> Self {
        ViewRefresher {
            entity: cache.entity(),
            cache,
            queue,
            gateway,
            observer,
            call_timeout,
        }
    }

    /// Fetches `view`, overlays pending operations and replaces the cached
    /// copy. Returns what the cache now holds for the view.
    ///
    /// Gateway failures are returned; cache and queue failures only degrade
    /// (the fetched data is still returned).
    pub async fn refresh(&self, view: &ViewKey) -> SyncResult<Vec<Record>> {
        let seen = self.cache.generation();
        let mut records = with_timeout(self.call_timeout, self.gateway.list(view)).await?;
        let fetched = records.len();

        match self.queue.peek_all().await {
            Ok(pending) => apply_pending(self.entity, view, &mut records, &pending),
            Err(e) => self
                .observer
                .cache_degraded(self.entity, "read pending queue", &e.to_string()),
        }

        match self.cache.replace_if_unchanged(view, &records, seen).await {
            Ok(true) => {}
            Ok(false) => match self.cache.read(view).await {
                Ok(Some(cached)) => {
                    debug!(entity = %self.entity, view = %view, "Fetched view superseded by a local write");
                    return Ok(cached);
                }
                Ok(None) => {}
                Err(e) => self
                    .observer
                    .cache_degraded(self.entity, "read view", &e.to_string()),
            },
            Err(e) => self
                .observer
                .cache_degraded(self.entity, "store refreshed view", &e.to_string()),
        }

        debug!(
            entity = %self.entity,
            view = %view,
            fetched,
            stored = records.len(),
            "View refreshed"
        );
        Ok(records)
    }
}
