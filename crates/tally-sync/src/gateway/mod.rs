//! # Remote Gateway
//!
//! The seam between the sync layer and the authoritative backend.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          RemoteGateway                                  │
//! │                                                                         │
//! │   EntityService ──┐                                                    │
//! │                   ├──► list / create / update / delete / custom        │
//! │   Coordinator ────┘            │                                        │
//! │                                ▼                                        │
//! │          ┌──────────────────────┬──────────────────────────┐           │
//! │          │ HttpGateway (http.rs)│ MemoryGateway (memory.rs)│           │
//! │          │ REST over reqwest    │ in-process fake backend  │           │
//! │          └──────────────────────┴──────────────────────────┘           │
//! │                                                                         │
//! │  FAILURE CLASSES:                                                      │
//! │  • Unavailable / Timeout  → connectivity; the caller queues            │
//! │  • Rejected               → the backend refused; never queued          │
//! │  • InvalidResponse        → the backend answered garbage               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use tally_core::{EntityKind, Record, RecordId, ViewKey};

pub use http::HttpGateway;
pub use memory::{GatewayCall, MemoryGateway};

/// Result type alias for gateway calls.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failure of a single backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The backend could not be reached (network down, 5xx, refused).
    #[error("backend unreachable: {0}")]
    Unavailable(String),

    /// The call did not complete in time.
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend answered and refused the request.
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend answered with a body we can't interpret.
    #[error("unexpected backend response: {0}")]
    InvalidResponse(String),

    /// The backend offers no route for this operation.
    #[error("{operation} is not supported for {entity}")]
    Unsupported { entity: String, operation: String },
}

impl GatewayError {
    /// True for failures that say nothing about the request itself: a later
    /// attempt with the same payload may succeed.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Timeout(_))
    }

    pub(crate) fn unsupported(entity: EntityKind, operation: impl Into<String>) -> Self {
        GatewayError::Unsupported {
            entity: entity.to_string(),
            operation: operation.into(),
        }
    }
}

/// Remote operations for one entity type.
///
/// Implementations perform no caching or queueing of their own.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Entity type served by this gateway.
    fn entity(&self) -> EntityKind;

    /// Fetches the authoritative contents of `view`.
    async fn list(&self, view: &ViewKey) -> GatewayResult<Vec<Record>>;

    /// Creates a record; returns it with its backend id.
    async fn create(&self, payload: &Value) -> GatewayResult<Record>;

    /// Applies a partial update; returns the updated record.
    async fn update(&self, id: &RecordId, payload: &Value) -> GatewayResult<Record>;

    /// Deletes a record.
    async fn delete(&self, id: &RecordId) -> GatewayResult<()>;

    /// Runs an entity-specific operation (`assign`, `role`).
    async fn custom(&self, name: &str, id: &RecordId, payload: &Value) -> GatewayResult<Record>;
}

/// Bounds a gateway call by `limit`, mapping expiry to [`GatewayError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(limit)),
    }
}
