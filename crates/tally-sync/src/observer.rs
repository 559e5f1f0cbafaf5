//! # Sync Observer
//!
//! Hooks for things that happen away from the caller: operations queued
//! offline, drains finishing, background refreshes failing and cache
//! writes being dropped. The host (a dashboard shell, the drain binary)
//! decides how to surface them.
//!
//! ```text
//!   EntityService ──► operation_queued, cache_degraded
//!   ViewRefresher ──► background_refresh_failed, cache_degraded
//!   Coordinator   ──► drain_finished
//! ```

use tracing::{info, warn};

use tally_core::{EntityKind, PendingOperation, ViewKey};

use crate::coordinator::DrainReport;
use crate::error::SyncError;

/// Receiver for sync events.
pub trait SyncObserver: Send + Sync {
    /// A mutation was recorded in the pending queue instead of reaching the
    /// backend.
    fn operation_queued(&self, op: &PendingOperation);

    /// A drain pass finished (completely or not).
    fn drain_finished(&self, report: &DrainReport);

    /// A read-through refresh spawned by `list` failed. The caller already
    /// received cached data.
    fn background_refresh_failed(&self, entity: EntityKind, view: &ViewKey, error: &SyncError);

    /// A cache read or write failed and was skipped.
    fn cache_degraded(&self, entity: EntityKind, action: &str, error: &str);
}

/// Default observer: writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn operation_queued(&self, op: &PendingOperation) {
        info!(entity = %op.entity, seq = op.seq, kind = %op.kind, "Operation queued for sync");
    }

    fn drain_finished(&self, report: &DrainReport) {
        match &report.failure {
            None => info!(
                entity = %report.entity,
                confirmed = report.confirmed,
                "Drain complete"
            ),
            Some(failure) => warn!(
                entity = %report.entity,
                confirmed = report.confirmed,
                remaining = report.remaining,
                seq = failure.seq,
                error = %failure.error,
                "Drain stopped"
            ),
        }
    }

    fn background_refresh_failed(&self, entity: EntityKind, view: &ViewKey, error: &SyncError) {
        warn!(entity = %entity, view = %view, error = %error, "Background refresh failed");
    }

    fn cache_degraded(&self, entity: EntityKind, action: &str, error: &str) {
        warn!(entity = %entity, action, error, "Cache unavailable, continuing without it");
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl SyncObserver for NoOpObserver {
    fn operation_queued(&self, _op: &PendingOperation) {}
    fn drain_finished(&self, _report: &DrainReport) {}
    fn background_refresh_failed(&self, _entity: EntityKind, _view: &ViewKey, _error: &SyncError) {}
    fn cache_degraded(&self, _entity: EntityKind, _action: &str, _error: &str) {}
}
