//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Malformed records, unknown entity names        │
//! │  └── ValidationError  - Payloads the backend would reject              │
//! │                                                                         │
//! │  tally-store errors (separate crate)                                   │
//! │  └── StoreError       - Durable key-value store failures               │
//! │                                                                         │
//! │  tally-sync errors (separate crate)                                    │
//! │  ├── GatewayError     - Remote call failures                           │
//! │  └── SyncError        - What entity service callers see                │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → Dashboard             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while interpreting records and operation payloads.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A record arrived without an `id` field.
    ///
    /// ## When This Occurs
    /// - The backend answered a create with an envelope missing the record
    /// - A cached snapshot was written by an incompatible version
    #[error("Record is missing an id")]
    MissingId,

    /// A record or payload was not a JSON object.
    #[error("Expected a JSON object, got {0}")]
    NotAnObject(String),

    /// A record could not be decoded.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// An entity name did not match any managed entity type.
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidRecord(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Payload validation errors.
///
/// Raised before a mutation is queued offline: a payload the backend is
/// certain to reject would otherwise sit at the head of the FIFO queue and
/// halt every later drain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing, null or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },

    /// Value must be a positive number.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g. a number sent as free text).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// The operation is not offered for this entity type.
    #[error("{operation} is not supported for {entity}")]
    Unsupported { entity: String, operation: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
