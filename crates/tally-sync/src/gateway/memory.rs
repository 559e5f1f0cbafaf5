//! # Memory Gateway
//!
//! In-process stand-in for the backend: holds records, assigns numeric ids,
//! records every call it receives and can be scripted to go offline or to
//! fail specific calls. Used by the test suites and for demo sessions
//! without a server.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

use tally_core::{EntityKind, Record, RecordId, ViewKey};

use super::{GatewayError, GatewayResult, RemoteGateway};

/// One call received by a [`MemoryGateway`].
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    List { view: ViewKey },
    Create { payload: Value },
    Update { id: RecordId, payload: Value },
    Delete { id: RecordId },
    Custom { name: String, id: RecordId, payload: Value },
}

impl GatewayCall {
    /// True for every call except `List`.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, GatewayCall::List { .. })
    }

    /// Target record of an update, delete or custom call.
    pub fn target(&self) -> Option<&RecordId> {
        match self {
            GatewayCall::Update { id, .. }
            | GatewayCall::Delete { id }
            | GatewayCall::Custom { id, .. } => Some(id),
            _ => None,
        }
    }
}

type FailureRule = Box<dyn Fn(&GatewayCall) -> Option<GatewayError> + Send + Sync>;

#[derive(Debug, Default)]
struct BackendState {
    records: Vec<Record>,
    next_id: i64,
    calls: Vec<GatewayCall>,
}

/// Fake backend for one entity type.
pub struct MemoryGateway {
    entity: EntityKind,
    state: Mutex<BackendState>,
    available: AtomicBool,
    latency: Mutex<Duration>,
    failure: Mutex<Option<FailureRule>>,
}

impl std::fmt::Debug for MemoryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGateway")
            .field("entity", &self.entity)
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemoryGateway {
    /// Creates an empty, reachable backend.
    pub fn new(entity: EntityKind) -> Self {
        MemoryGateway {
            entity,
            state: Mutex::new(BackendState {
                next_id: 1,
                ..Default::default()
            }),
            available: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            failure: Mutex::new(None),
        }
    }

    /// Creates a backend pre-populated with `records` (JSON objects with ids).
    /// Records without a usable id are skipped.
    pub fn with_records(entity: EntityKind, records: Vec<Value>) -> Self {
        let gateway = Self::new(entity);
        {
            let mut state = gateway.state();
            for value in records {
                if let Ok(record) = Record::from_value(value) {
                    if let Ok(n) = record.id.as_str().parse::<i64>() {
                        state.next_id = state.next_id.max(n + 1);
                    }
                    state.records.push(record);
                }
            }
        }
        gateway
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Takes the backend on or off the network. While unavailable every
    /// call fails with [`GatewayError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fails every call for which `rule` returns an error.
    pub fn fail_on<F>(&self, rule: F)
    where
        F: Fn(&GatewayCall) -> Option<GatewayError> + Send + Sync + 'static,
    {
        *lock(&self.failure) = Some(Box::new(rule));
    }

    /// Removes any failure rule.
    pub fn clear_failures(&self) {
        *lock(&self.failure) = None;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every call received, in order.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    /// Every non-list call received, in order.
    pub fn mutation_calls(&self) -> Vec<GatewayCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Current backend contents.
    pub fn records(&self) -> Vec<Record> {
        self.state().records.clone()
    }

    /// One backend record.
    pub fn record(&self, id: &RecordId) -> Option<Record> {
        self.state().records.iter().find(|r| &r.id == id).cloned()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn state(&self) -> MutexGuard<'_, BackendState> {
        lock(&self.state)
    }

    /// Records the call, then applies availability, failure rule and latency.
    async fn admit(&self, call: GatewayCall) -> GatewayResult<()> {
        trace!(entity = %self.entity, ?call, "Memory gateway call");

        let scripted = lock(&self.failure).as_ref().and_then(|rule| rule(&call));
        self.state().calls.push(call);

        if !self.available.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("memory backend offline".into()));
        }

        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match scripted {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn not_found(id: &RecordId) -> GatewayError {
        GatewayError::Rejected {
            status: 404,
            message: format!("record {} not found", id),
        }
    }

    fn merge_into(&self, id: &RecordId, payload: &Value) -> GatewayResult<Record> {
        let mut state = self.state();
        let record = state
            .records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| Self::not_found(id))?;
        record.merge_payload(payload);
        Ok(record.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    fn entity(&self) -> EntityKind {
        self.entity
    }

    async fn list(&self, view: &ViewKey) -> GatewayResult<Vec<Record>> {
        self.admit(GatewayCall::List { view: view.clone() }).await?;

        Ok(self
            .state()
            .records
            .iter()
            .filter(|r| view.admits(self.entity, r))
            .cloned()
            .collect())
    }

    async fn create(&self, payload: &Value) -> GatewayResult<Record> {
        self.admit(GatewayCall::Create {
            payload: payload.clone(),
        })
        .await?;

        let Value::Object(fields) = payload else {
            return Err(GatewayError::Rejected {
                status: 400,
                message: "body must be an object".into(),
            });
        };

        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;

        let mut fields: Map<String, Value> = fields.clone();
        fields.remove("id");
        fields.remove(tally_core::PENDING_FIELD);

        let record = Record {
            id: RecordId::from(id),
            pending: None,
            fields,
        };
        state.records.push(record.clone());
        Ok(record)
    }

    async fn update(&self, id: &RecordId, payload: &Value) -> GatewayResult<Record> {
        self.admit(GatewayCall::Update {
            id: id.clone(),
            payload: payload.clone(),
        })
        .await?;
        self.merge_into(id, payload)
    }

    async fn delete(&self, id: &RecordId) -> GatewayResult<()> {
        self.admit(GatewayCall::Delete { id: id.clone() }).await?;

        let mut state = self.state();
        let before = state.records.len();
        state.records.retain(|r| &r.id != id);
        if state.records.len() == before {
            return Err(Self::not_found(id));
        }
        Ok(())
    }

    async fn custom(&self, name: &str, id: &RecordId, payload: &Value) -> GatewayResult<Record> {
        self.admit(GatewayCall::Custom {
            name: name.to_string(),
            id: id.clone(),
            payload: payload.clone(),
        })
        .await?;
        self.merge_into(id, payload)
    }
}
