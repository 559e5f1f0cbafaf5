//! # Sync Agent
//!
//! Background task that watches connectivity and drains every pending
//! queue when the backend becomes reachable again.
//!
//! ## Agent Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncAgent::run                                 │
//! │                                                                         │
//! │   tokio::select! {                                                     │
//! │     interval tick  ──► sample oracle                                   │
//! │                        offline → online (or online at first tick       │
//! │                        with a backlog) ──► drain_all                   │
//! │     drain request  ──► drain_all (if online)                           │
//! │     shutdown       ──► exit                                            │
//! │   }                                                                    │
//! │                                                                         │
//! │   drain_all: inventory → joints → sales → users, stop at the first    │
//! │   entity type whose drain does not complete.                           │
//! │                                                                         │
//! │  STATUS (SyncAgentHandle::status):                                     │
//! │  { is_online, pending_count, last_drain, last_error, draining }       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SyncSettings;
use crate::connectivity::ConnectivityOracle;
use crate::error::{SyncError, SyncResult};
use crate::services::SyncServices;

// =============================================================================
// Sync Status
// =============================================================================

/// Current sync status for external queries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    /// Last sampled connectivity.
    pub is_online: bool,

    /// Operations waiting across every entity type.
    pub pending_count: usize,

    /// When the last drain pass finished.
    pub last_drain: Option<DateTime<Utc>>,

    /// Why the last drain pass stopped early (if it did).
    pub last_error: Option<String>,

    /// A drain pass is running.
    pub draining: bool,
}

// =============================================================================
// Agent Handle
// =============================================================================

/// Handle for controlling a running [`SyncAgent`].
#[derive(Clone)]
pub struct SyncAgentHandle {
    shutdown_tx: mpsc::Sender<()>,
    drain_tx: mpsc::Sender<()>,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncAgentHandle {
    /// Returns the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Asks the agent to drain now instead of waiting for a reconnect.
    pub async fn request_drain(&self) -> SyncResult<()> {
        self.drain_tx
            .send(())
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Stops the agent.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|e| SyncError::ChannelError(e.to_string()))
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Reconnect watcher over a set of entity services.
pub struct SyncAgent {
    services: Arc<SyncServices>,
    oracle: Arc<dyn ConnectivityOracle>,
    poll_interval: Duration,
    auto_drain: bool,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncAgent {
    /// Creates an agent using the `[sync]` settings.
    pub fn new(
        services: Arc<SyncServices>,
        oracle: Arc<dyn ConnectivityOracle>,
        settings: &SyncSettings,
    ) -> Self {
        SyncAgent {
            services,
            oracle,
            poll_interval: Duration::from_secs(settings.poll_interval_secs.max(1)),
            auto_drain: settings.auto_drain_on_reconnect,
            status: Arc::new(RwLock::new(SyncStatus::default())),
        }
    }

    /// Overrides the connectivity sampling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawns the agent loop. The loop also stops once every handle is
    /// dropped.
    pub fn spawn(self) -> (SyncAgentHandle, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (drain_tx, drain_rx) = mpsc::channel(8);

        let handle = SyncAgentHandle {
            shutdown_tx,
            drain_tx,
            status: self.status.clone(),
        };
        let task = tokio::spawn(self.run(shutdown_rx, drain_rx));

        (handle, task)
    }

    /// Main loop.
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>, mut drain_rx: mpsc::Receiver<()>) {
        info!(
            poll_interval = ?self.poll_interval,
            auto_drain = self.auto_drain,
            "Sync agent started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_online: Option<bool> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let online = self.oracle.is_online();
                    let reconnected = match was_online {
                        Some(previous) => !previous && online,
                        None => online,
                    };
                    if was_online != Some(online) {
                        debug!(online, "Connectivity changed");
                    }
                    was_online = Some(online);

                    let pending = self.sample(online).await;
                    if reconnected && self.auto_drain && pending > 0 {
                        info!(pending, "Backend reachable, draining pending operations");
                        self.drain().await;
                    }
                }

                Some(()) = drain_rx.recv() => {
                    if self.oracle.is_online() {
                        self.drain().await;
                    } else {
                        debug!("Drain requested while offline, deferring to reconnect");
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Sync agent shutting down");
                    break;
                }
            }
        }
    }

    /// Records connectivity and the current backlog. Returns the backlog.
    async fn sample(&self, online: bool) -> usize {
        let pending = match self.services.pending_count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Could not read pending queues");
                0
            }
        };

        let mut status = self.status.write().await;
        status.is_online = online;
        status.pending_count = pending;
        pending
    }

    async fn drain(&self) {
        self.status.write().await.draining = true;

        let last_error = match self.services.drain_all().await {
            Ok(summary) => {
                info!(
                    confirmed = summary.confirmed(),
                    remaining = summary.remaining(),
                    complete = summary.is_complete(),
                    "Drain pass finished"
                );
                summary
                    .reports
                    .iter()
                    .find_map(|r| r.failure.as_ref())
                    .map(|f| format!("#{} {}: {}", f.seq, f.kind, f.error))
            }
            Err(e) => {
                error!(error = %e, "Drain pass failed");
                Some(e.to_string())
            }
        };

        let pending = self.services.pending_count().await.unwrap_or(0);

        let mut status = self.status.write().await;
        status.draining = false;
        status.last_drain = Some(Utc::now());
        status.last_error = last_error;
        status.pending_count = pending;
    }
}
