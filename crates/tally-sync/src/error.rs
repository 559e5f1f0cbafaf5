//! # Sync Error Types
//!
//! Error types for the sync engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Remote      │  │     Local state         │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  RemoteRejected │  │  QueueUnavailable       │ │
//! │  │  InvalidUrl     │  │  RemoteUnavail. │  │  Store                  │ │
//! │  │  ConfigLoad/Save│  │  InvalidResponse│  │  InvalidRecord          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  What a mutation caller can see:                                       │
//! │  • RemoteRejected   - backend said no (4xx); nothing was queued        │
//! │  • Validation       - offline payload the backend would reject         │
//! │  • QueueUnavailable - offline and the operation could not be recorded  │
//! │                                                                         │
//! │  Connectivity failures never reach a mutation caller: they become      │
//! │  MutationOutcome::Queued.                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use tally_core::{CoreError, ValidationError};
use tally_store::StoreError;

use crate::gateway::GatewayError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering every failure an entity service caller can see.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid backend URL.
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The backend rejected the request (4xx). Never queued.
    #[error("Rejected by backend ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// The backend could not be reached.
    ///
    /// Mutations convert this into a queued success; it only surfaces from
    /// explicit refreshes and drains.
    #[error("Backend unavailable: {0}")]
    RemoteUnavailable(String),

    /// The backend answered with something that isn't a record.
    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    /// The operation is not offered for this entity type.
    #[error("{operation} is not supported for {entity}")]
    Unsupported { entity: String, operation: String },

    // =========================================================================
    // Local Errors
    // =========================================================================
    /// Offline payload failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The pending-operation queue could not be read or written.
    #[error("Pending queue unavailable: {0}")]
    QueueUnavailable(#[source] StoreError),

    /// The local store failed outside the queue path (e.g. on open).
    #[error("Local store error: {0}")]
    Store(String),

    /// A record or payload was malformed.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Internal sync engine error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<GatewayError> for SyncError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Rejected { status, message } => {
                SyncError::RemoteRejected { status, message }
            }
            GatewayError::Unsupported { entity, operation } => {
                SyncError::Unsupported { entity, operation }
            }
            GatewayError::InvalidResponse(message) => SyncError::InvalidResponse(message),
            other @ (GatewayError::Unavailable(_) | GatewayError::Timeout(_)) => {
                SyncError::RemoteUnavailable(other.to_string())
            }
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(v) => SyncError::Validation(v),
            other => SyncError::InvalidRecord(other.to_string()),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Store(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if a later drain or refresh may succeed without any
    /// change on the caller's side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable(_)
                | SyncError::QueueUnavailable(_)
                | SyncError::ChannelError(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
