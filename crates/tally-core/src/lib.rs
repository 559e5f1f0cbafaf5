//! # tally-core: Pure Types for the Tally Sync Layer
//!
//! Everything the sync engine reasons about, with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Sync Architecture                          │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Dashboard (views, forms)                     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              tally-sync (entity services, coordinator)          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  Record   │  │  ViewKey  │  │ Pending   │  │ validation│  │   │
//! │  │   │ RecordId  │  │ Namespace │  │ Operation │  │   rules   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                tally-store (durable local state)                │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entity kinds, records, views and pending operations
//! - [`error`] - Domain error types
//! - [`validation`] - Required-field rules applied before a mutation is queued
//! - [`overlay`] - Re-applies queued mutations on top of a fetched view
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::json;
//! use tally_core::{EntityKind, Record, ViewKey};
//!
//! let record = Record::from_value(json!({ "id": 7, "assigned_to": 42 })).unwrap();
//! let view = ViewKey::employee(42);
//!
//! assert!(view.admits(EntityKind::Joint, &record));
//! assert!(!record.id.is_local());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod overlay;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Prefix of every locally assigned record id.
///
/// Backend ids are integers (or opaque strings), so a prefixed UUID can
/// never collide with one.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Field used to tag optimistic records inside a cached snapshot.
pub const PENDING_FIELD: &str = "_pending";
