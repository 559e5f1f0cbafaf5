//! # Domain Types
//!
//! Core types shared by the cache store, the pending-operation queue and the
//! entity services.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   EntityKind    │   │     Record      │   │ PendingOperation│       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Inventory      │   │  id (RecordId)  │   │  seq (FIFO)     │       │
//! │  │  Joint          │   │  _pending?      │   │  kind           │       │
//! │  │  Sale           │   │  fields (JSON)  │   │  target_id?     │       │
//! │  │  User           │   └─────────────────┘   │  payload        │       │
//! │  └─────────────────┘                         └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    ViewKey      │   │   Namespace     │   │ MutationOutcome │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  "all"          │   │  (entity, view) │   │  Confirmed(T)   │       │
//! │  │  "employee:42"  │   └─────────────────┘   │  Queued { .. }  │       │
//! │  └─────────────────┘                         └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! The backend assigns record ids. Records created while offline carry a
//! local id (`local-<uuid>`) and a `_pending` marker holding the sequence
//! number of the queued create, which is how the optimistic copy is found
//! and superseded once the create is confirmed.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::{LOCAL_ID_PREFIX, PENDING_FIELD};

// =============================================================================
// Entity Kind
// =============================================================================

/// The record kinds managed by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// An inventory lot (strain, grams available, price per gram).
    Inventory,
    /// A production unit: a batch of joints rolled from an inventory lot.
    Joint,
    /// A recorded sale.
    Sale,
    /// A dashboard user (employee or superadmin).
    User,
}

impl EntityKind {
    /// Every managed entity, in the order the reconnect agent drains them.
    ///
    /// Inventory goes first because joints and sales reference lots.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Inventory,
        EntityKind::Joint,
        EntityKind::Sale,
        EntityKind::User,
    ];

    /// Stable lowercase name used in storage keys and logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Inventory => "inventory",
            EntityKind::Joint => "joint",
            EntityKind::Sale => "sale",
            EntityKind::User => "user",
        }
    }

    /// Name of the durable store instance holding this entity's cache.
    pub fn cache_instance(&self) -> String {
        format!("{}-cache", self.as_str())
    }

    /// Name of the durable store instance holding this entity's queue.
    pub fn queue_instance(&self) -> String {
        format!("{}-queue", self.as_str())
    }

    /// Maps a view selector to the record field it filters on.
    ///
    /// `employee:42` on joints filters `assigned_to`; any other selector is
    /// taken as a field name.
    pub fn view_field<'a>(&self, selector: &'a str) -> &'a str {
        match (self, selector) {
            (EntityKind::Joint, "employee") => "assigned_to",
            (EntityKind::Sale, "seller") => "sold_by",
            (_, other) => other,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "inventory" | "inventories" => Ok(EntityKind::Inventory),
            "joint" | "joints" | "production_unit" => Ok(EntityKind::Joint),
            "sale" | "sales" => Ok(EntityKind::Sale),
            "user" | "users" => Ok(EntityKind::User),
            other => Err(CoreError::UnknownEntity(other.to_string())),
        }
    }
}

// =============================================================================
// Record Id
// =============================================================================

/// Identifier of a record.
///
/// Backend ids are kept in their decimal string form and serialized back as
/// JSON numbers, so a cached record is byte-for-byte what the backend sent.
/// Local ids are always strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps a backend-assigned id.
    pub fn new(raw: impl Into<String>) -> Self {
        RecordId(raw.into())
    }

    /// Generates a fresh local id for an optimistic record.
    pub fn local() -> Self {
        RecordId(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()))
    }

    /// Returns true if this id was assigned locally.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    /// Returns the id as a string slice (used in URLs and storage keys).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads an id out of a JSON value (number or string).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(RecordId(n.to_string())),
            Value::String(s) if !s.is_empty() => Some(RecordId(s.clone())),
            _ => None,
        }
    }

    fn as_integer(&self) -> Option<i64> {
        self.0
            .parse::<i64>()
            .ok()
            .filter(|n| n.to_string() == self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        RecordId(id.to_string())
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        RecordId(id)
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_integer() {
            Some(n) => serializer.serialize_i64(n),
            None => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Signed(i64),
            Unsigned(u64),
            Text(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Signed(n) => RecordId(n.to_string()),
            RawId::Unsigned(n) => RecordId(n.to_string()),
            RawId::Text(s) => RecordId(s),
        })
    }
}

/// Local id → backend id assignments learned while draining creates.
pub type IdRemap = HashMap<RecordId, RecordId>;

// =============================================================================
// Record
// =============================================================================

/// Marker carried by an optimistic record until its create is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMarker {
    /// Sequence number of the queued create that produced this record.
    pub seq: u64,
    /// When the create was queued.
    pub queued_at: DateTime<Utc>,
}

/// A cached entity: an id plus whatever fields the backend returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Backend id, or a local id for optimistic records.
    pub id: RecordId,

    /// Present only on optimistic records.
    #[serde(rename = "_pending", default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingMarker>,

    /// Every other field, passed through opaquely.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Decodes a record from a JSON object returned by the backend.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let object = match value {
            Value::Object(map) => map,
            other => return Err(CoreError::NotAnObject(json_type(&other).to_string())),
        };

        if !object.get("id").map(|v| !v.is_null()).unwrap_or(false) {
            return Err(CoreError::MissingId);
        }

        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// Synthesizes the optimistic stand-in for a queued create.
    pub fn optimistic(id: RecordId, payload: &Value, marker: PendingMarker) -> CoreResult<Self> {
        let mut fields = payload_object(payload)?.clone();
        fields.remove("id");
        fields.remove(PENDING_FIELD);

        Ok(Record {
            id,
            pending: Some(marker),
            fields,
        })
    }

    /// Encodes the record as a JSON object.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns true if this record stands in for an unconfirmed create.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Sequence number of the create this record stands in for.
    pub fn pending_seq(&self) -> Option<u64> {
        self.pending.as_ref().map(|m| m.seq)
    }

    /// Applies an update payload: present fields overwrite, absent fields
    /// are left unchanged. The id and pending marker are never touched.
    pub fn merge_payload(&mut self, payload: &Value) {
        if let Value::Object(map) = payload {
            for (key, value) in map {
                if key == "id" || key == PENDING_FIELD {
                    continue;
                }
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Borrows a payload as a JSON object.
pub fn payload_object(payload: &Value) -> CoreResult<&Map<String, Value>> {
    payload
        .as_object()
        .ok_or_else(|| CoreError::NotAnObject(json_type(payload).to_string()))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Views and Namespaces
// =============================================================================

/// Name of a cached view of one entity type.
///
/// `all` holds the full collection; `selector:value` holds the records
/// whose mapped field equals `value` (see [`EntityKind::view_field`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewKey(String);

impl ViewKey {
    /// Key of the full-collection view.
    pub const ALL: &'static str = "all";

    /// The full-collection view.
    pub fn all() -> Self {
        ViewKey(Self::ALL.to_string())
    }

    /// A filtered view, e.g. `ViewKey::by("role", "employee")`.
    pub fn by(selector: &str, value: impl fmt::Display) -> Self {
        ViewKey(format!("{}:{}", selector, value))
    }

    /// Production units assigned to one employee.
    pub fn employee(employee_id: impl fmt::Display) -> Self {
        Self::by("employee", employee_id)
    }

    /// Parses a stored view key.
    pub fn parse(raw: &str) -> Self {
        ViewKey(raw.to_string())
    }

    /// Returns true for the full-collection view.
    pub fn is_all(&self) -> bool {
        self.0 == Self::ALL
    }

    /// Splits a filtered view into `(selector, value)`.
    pub fn selector(&self) -> Option<(&str, &str)> {
        if self.is_all() {
            return None;
        }
        self.0.split_once(':')
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if `record` belongs in this view.
    pub fn admits(&self, kind: EntityKind, record: &Record) -> bool {
        match self.selector() {
            None => self.is_all(),
            Some((selector, expected)) => record
                .field(kind.view_field(selector))
                .map(|value| json_matches(value, expected))
                .unwrap_or(false),
        }
    }
}

impl Default for ViewKey {
    fn default() -> Self {
        ViewKey::all()
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn json_matches(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Number(n) => {
            n.to_string() == expected
                || match (n.as_f64(), expected.parse::<f64>()) {
                    (Some(a), Ok(b)) => a == b,
                    _ => false,
                }
        }
        Value::Bool(b) => b.to_string() == expected,
        _ => false,
    }
}

/// A cache namespace: one view of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub entity: EntityKind,
    pub view: ViewKey,
}

impl Namespace {
    pub fn new(entity: EntityKind, view: ViewKey) -> Self {
        Namespace { entity, view }
    }

    /// Key of this namespace inside its entity's cache instance.
    pub fn storage_key(&self) -> String {
        format!("view:{}", self.view)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.view)
    }
}

// =============================================================================
// Pending Operations
// =============================================================================

/// What a queued mutation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// An entity-specific endpoint, e.g. `assign` or `role`.
    Custom(String),
}

impl OperationKind {
    pub fn custom(name: impl Into<String>) -> Self {
        OperationKind::Custom(name.into())
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => f.write_str("create"),
            OperationKind::Update => f.write_str("update"),
            OperationKind::Delete => f.write_str("delete"),
            OperationKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

/// A mutation about to be queued (no sequence number yet).
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub entity: EntityKind,
    pub kind: OperationKind,
    pub target_id: Option<RecordId>,
    pub local_id: Option<RecordId>,
    pub payload: Value,
}

impl NewOperation {
    /// A create; `local_id` is the id given to the optimistic record.
    pub fn create(entity: EntityKind, payload: Value, local_id: RecordId) -> Self {
        NewOperation {
            entity,
            kind: OperationKind::Create,
            target_id: None,
            local_id: Some(local_id),
            payload,
        }
    }

    pub fn update(entity: EntityKind, id: RecordId, payload: Value) -> Self {
        NewOperation {
            entity,
            kind: OperationKind::Update,
            target_id: Some(id),
            local_id: None,
            payload,
        }
    }

    pub fn delete(entity: EntityKind, id: RecordId) -> Self {
        NewOperation {
            entity,
            kind: OperationKind::Delete,
            target_id: Some(id),
            local_id: None,
            payload: Value::Null,
        }
    }

    pub fn custom(entity: EntityKind, name: &str, id: RecordId, payload: Value) -> Self {
        NewOperation {
            entity,
            kind: OperationKind::custom(name),
            target_id: Some(id),
            local_id: None,
            payload,
        }
    }
}

/// A mutation accepted locally but not yet confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Monotonic enqueue sequence number; defines FIFO order.
    pub seq: u64,
    pub entity: EntityKind,
    pub kind: OperationKind,
    /// Record the operation applies to (absent for creates).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<RecordId>,
    /// Id of the optimistic record (creates only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<RecordId>,
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    /// Stamps a new operation with its sequence number.
    pub fn from_new(op: NewOperation, seq: u64, enqueued_at: DateTime<Utc>) -> Self {
        PendingOperation {
            seq,
            entity: op.entity,
            kind: op.kind,
            target_id: op.target_id,
            local_id: op.local_id,
            payload: op.payload,
            enqueued_at,
        }
    }

    /// The marker carried by this operation's optimistic record.
    pub fn pending_marker(&self) -> PendingMarker {
        PendingMarker {
            seq: self.seq,
            queued_at: self.enqueued_at,
        }
    }

    /// Rewrites a local target id that has since been assigned a backend id.
    ///
    /// Returns true if the target changed.
    pub fn retarget(&mut self, remap: &IdRemap) -> bool {
        match self.target_id.as_ref().and_then(|id| remap.get(id)) {
            Some(remote) => {
                self.target_id = Some(remote.clone());
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Mutation Outcome
// =============================================================================

/// Whether a mutation reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// The backend accepted the mutation; the value is authoritative.
    Confirmed,
    /// The mutation was queued offline; the value is provisional.
    Queued,
}

/// Result of an entity service mutation.
///
/// Callers must be able to tell a provisional, queued result from an
/// authoritative one so the dashboard can flag it.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome<T> {
    Confirmed(T),
    Queued { value: T, seq: u64 },
}

impl<T> MutationOutcome<T> {
    pub fn status(&self) -> MutationStatus {
        match self {
            MutationOutcome::Confirmed(_) => MutationStatus::Confirmed,
            MutationOutcome::Queued { .. } => MutationStatus::Queued,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, MutationOutcome::Queued { .. })
    }

    pub fn value(&self) -> &T {
        match self {
            MutationOutcome::Confirmed(value) => value,
            MutationOutcome::Queued { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            MutationOutcome::Confirmed(value) => value,
            MutationOutcome::Queued { value, .. } => value,
        }
    }

    /// Sequence number of the queued operation, if queued.
    pub fn queued_seq(&self) -> Option<u64> {
        match self {
            MutationOutcome::Confirmed(_) => None,
            MutationOutcome::Queued { seq, .. } => Some(*seq),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
