//! # Validation Module
//!
//! Payload checks applied before a mutation is queued offline.
//!
//! ## Why Only Offline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Online:   EntityService ──► Backend (validates, 4xx on failure)       │
//! │                                                                         │
//! │  Offline:  EntityService ──► THIS MODULE ──► PendingOperationQueue     │
//! │                                                                         │
//! │  The queue is strictly FIFO and a drain stops at the first failure,    │
//! │  so a payload the backend always rejects would block every entry       │
//! │  queued behind it.                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use serde_json::json;
//! use tally_core::validation::validate_create;
//! use tally_core::EntityKind;
//!
//! let lot = json!({ "strain_name": "OG", "price_per_gram": 10, "buying_price": 6 });
//! assert!(validate_create(EntityKind::Inventory, &lot).is_ok());
//! assert!(validate_create(EntityKind::Inventory, &json!({})).is_err());
//! ```

use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::types::EntityKind;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Roles a user can be switched to.
pub const USER_ROLES: [&str; 2] = ["employee", "superadmin"];

/// Units a sale can be recorded in.
pub const SALE_TYPES: [&str; 2] = ["grams", "joints"];

// =============================================================================
// Operation Validators
// =============================================================================

/// Validates a create payload.
///
/// ## Rules
/// - inventory: `strain_name`, `price_per_gram`, `buying_price`
/// - joint: `inventory_id`, `grams_used`, `joints_count`, `price_per_joint`
/// - sale: `inventory_id`, `quantity`, `sale_type` (grams|joints), `total_price`
/// - user: `username`, `email`, `password`
pub fn validate_create(kind: EntityKind, payload: &Value) -> ValidationResult<()> {
    let fields = as_object(payload)?;

    match kind {
        EntityKind::Inventory => {
            require_text(fields, "strain_name")?;
            require_amount(fields, "price_per_gram")?;
            require_amount(fields, "buying_price")?;
        }
        EntityKind::Joint => {
            require_present(fields, "inventory_id")?;
            require_positive(fields, "grams_used")?;
            require_positive(fields, "joints_count")?;
            require_amount(fields, "price_per_joint")?;
        }
        EntityKind::Sale => {
            require_present(fields, "inventory_id")?;
            require_positive(fields, "quantity")?;
            require_one_of(fields, "sale_type", &SALE_TYPES)?;
            require_amount(fields, "total_price")?;
        }
        EntityKind::User => {
            require_text(fields, "username")?;
            require_text(fields, "email")?;
            require_text(fields, "password")?;
        }
    }

    Ok(())
}

/// Validates an update payload.
///
/// Users have no generic update; their role goes through the `role`
/// custom operation.
pub fn validate_update(kind: EntityKind, payload: &Value) -> ValidationResult<()> {
    if kind == EntityKind::User {
        return Err(unsupported(kind, "update"));
    }
    as_object(payload)?;
    Ok(())
}

/// Validates a delete.
pub fn validate_delete(kind: EntityKind) -> ValidationResult<()> {
    if kind == EntityKind::User {
        return Err(unsupported(kind, "delete"));
    }
    Ok(())
}

/// Validates an entity-specific operation.
///
/// ## Rules
/// - joint `assign`: `assigned_to`
/// - user `role`: `role` ∈ {employee, superadmin}
pub fn validate_custom(kind: EntityKind, name: &str, payload: &Value) -> ValidationResult<()> {
    let fields = as_object(payload)?;

    match (kind, name) {
        (EntityKind::Joint, "assign") => require_present(fields, "assigned_to").map(|_| ()),
        (EntityKind::User, "role") => require_one_of(fields, "role", &USER_ROLES),
        _ => Err(unsupported(kind, name)),
    }
}

// =============================================================================
// Field Helpers
// =============================================================================

fn as_object(payload: &Value) -> ValidationResult<&Map<String, Value>> {
    payload
        .as_object()
        .ok_or_else(|| ValidationError::InvalidFormat {
            field: "payload".to_string(),
            reason: "must be a JSON object".to_string(),
        })
}

fn unsupported(kind: EntityKind, operation: &str) -> ValidationError {
    ValidationError::Unsupported {
        entity: kind.to_string(),
        operation: operation.to_string(),
    }
}

fn required(field: &str) -> ValidationError {
    ValidationError::Required {
        field: field.to_string(),
    }
}

fn require_present<'a>(fields: &'a Map<String, Value>, field: &str) -> ValidationResult<&'a Value> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(required(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(required(field)),
        Some(value) => Ok(value),
    }
}

fn require_text(fields: &Map<String, Value>, field: &str) -> ValidationResult<()> {
    match require_present(fields, field)? {
        Value::String(_) => Ok(()),
        _ => Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must be text".to_string(),
        }),
    }
}

/// Reads a numeric field. Form inputs often send numbers as strings, and
/// the backend coerces those, so numeric strings are accepted.
fn require_number(fields: &Map<String, Value>, field: &str) -> ValidationResult<f64> {
    let value = require_present(fields, field)?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    number
        .filter(|n| n.is_finite())
        .ok_or_else(|| ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must be a number".to_string(),
        })
}

/// A price or cost: zero is allowed, negatives are not.
fn require_amount(fields: &Map<String, Value>, field: &str) -> ValidationResult<()> {
    if require_number(fields, field)? < 0.0 {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must not be negative".to_string(),
        });
    }
    Ok(())
}

fn require_positive(fields: &Map<String, Value>, field: &str) -> ValidationResult<()> {
    if require_number(fields, field)? <= 0.0 {
        return Err(ValidationError::MustBePositive {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn require_one_of(fields: &Map<String, Value>, field: &str, allowed: &[&str]) -> ValidationResult<()> {
    match require_present(fields, field)? {
        Value::String(s) if allowed.contains(&s.as_str()) => Ok(()),
        _ => Err(ValidationError::NotAllowed {
            field: field.to_string(),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        }),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
