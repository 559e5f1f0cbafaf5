//! # tally-sync: Write-Behind Sync Engine for the Tally Dashboard
//!
//! Keeps the inventory and sales dashboard usable while the backend is
//! unreachable: reads come from a durable cache, mutations made offline are
//! queued and applied optimistically, and queues are replayed in order once
//! the backend answers again.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Layer Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SyncServices (built once at start-up)            │  │
//! │  │                                                                  │  │
//! │  │  InventoryService  JointService  SaleService  UserService        │  │
//! │  │          └──────────────┴─────┬───────┴────────────┘             │  │
//! │  │                               ▼                                  │  │
//! │  │                        EntityService                             │  │
//! │  │   list: cache first, refresh in background                       │  │
//! │  │   mutate: backend when online, queue + optimistic when not       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ SyncCoordinator│  │ RemoteGateway  │  │ CacheStore / Pending   │    │
//! │  │                │  │                │  │ OperationQueue         │    │
//! │  │ FIFO drain,    │  │ HttpGateway    │  │ (tally-store)          │    │
//! │  │ stop at first  │  │ MemoryGateway  │  │                        │    │
//! │  │ failure        │  │                │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  SyncAgent: samples connectivity, drains every queue on reconnect     │
//! │  SyncObserver: queued ops, drain reports, background refresh errors   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - Reconnect watcher
//! - [`config`] - TOML + environment configuration
//! - [`connectivity`] - Online/offline oracle
//! - [`coordinator`] - Queue drain state machine
//! - [`entities`] - Typed services per entity type
//! - [`error`] - Sync error types
//! - [`gateway`] - Backend seam (REST and in-memory)
//! - [`observer`] - Event hooks
//! - [`refresh`] - View refresh with pending overlay
//! - [`service`] - Generic entity service
//! - [`services`] - Start-up wiring
//! - [`telemetry`] - Tracing setup
//!
//! ## Usage
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{ConnectivityFlag, SyncConfig, SyncServices, TracingObserver};
//!
//! let config = SyncConfig::load_or_default(None);
//! let online = ConnectivityFlag::new(true);
//! let services = SyncServices::open(&config, Arc::new(online.clone()), Arc::new(TracingObserver)).await?;
//!
//! let lots = services.inventory.list().await?;
//! let outcome = services.sales.create(serde_json::json!({ ... })).await?;
//! if outcome.is_queued() {
//!     // flag as "waiting for sync" in the dashboard
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod entities;
pub mod error;
pub mod gateway;
pub mod observer;
pub mod refresh;
pub mod service;
pub mod services;
pub mod telemetry;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{SyncAgent, SyncAgentHandle, SyncStatus};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityFlag, ConnectivityOracle};
pub use coordinator::{DrainFailure, DrainOutcome, DrainReport, DrainState, SyncCoordinator};
pub use entities::{InventoryService, JointService, SaleService, UserService};
pub use error::{SyncError, SyncResult};
pub use gateway::{GatewayError, GatewayResult, HttpGateway, MemoryGateway, RemoteGateway};
pub use observer::{NoOpObserver, SyncObserver, TracingObserver};
pub use service::{EntityService, ServiceContext};
pub use services::{DrainSummary, SyncServices, SyncServicesBuilder};
pub use telemetry::init_tracing;

pub use tally_core::{EntityKind, MutationOutcome, MutationStatus, Record, RecordId, ViewKey};
