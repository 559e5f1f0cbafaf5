//! # tally-store: Durable Local State
//!
//! Everything the sync layer keeps on the device: cached views of each
//! entity type and the log of mutations still waiting for the backend.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Data Flow                                  │
//! │                                                                         │
//! │  EntityService / SyncCoordinator (tally-sync)                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  tally-store (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  CacheStore   │    │ PendingOp     │    │  LocalStore  │  │   │
//! │  │   │  (cache.rs)   │    │ Queue         │    │  (pool.rs)   │  │   │
//! │  │   │               │    │ (queue.rs)    │    │              │  │   │
//! │  │   │ views, patch, │    │ FIFO log,     │    │ SqlitePool   │  │   │
//! │  │   │ supersede     │    │ ack prefix    │    │ migrations   │  │   │
//! │  │   └───────┬───────┘    └───────┬───────┘    └──────┬───────┘  │   │
//! │  │           └──────────┬─────────┘                   │          │   │
//! │  │                      ▼                             │          │   │
//! │  │              KeyValueStore (kv.rs) ◄────────────────┘          │   │
//! │  │              SqliteKvStore | MemoryKvStore                     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_core::{EntityKind, ViewKey};
//! use tally_store::{CacheStore, LocalStore, StoreConfig};
//!
//! let store = LocalStore::open(StoreConfig::new("tally.db")).await?;
//! let cache = CacheStore::new(EntityKind::Inventory, store.kv("inventory-cache"));
//!
//! let lots = cache.read(&ViewKey::all()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod error;
pub mod kv;
pub mod migrations;
pub mod pool;
pub mod queue;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::CacheStore;
pub use error::{StoreError, StoreResult};
pub use kv::{KeyValueStore, KvHandle, MemoryKvStore, SqliteKvStore};
pub use pool::{LocalStore, StoreConfig};
pub use queue::PendingOperationQueue;
