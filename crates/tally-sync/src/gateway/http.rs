//! # HTTP Gateway
//!
//! [`RemoteGateway`] over the dashboard's REST API.
//!
//! ## Routes
//! ```text
//! ┌───────────┬──────────────────────────┬──────────────────┬──────────────────────┐
//! │ entity    │ list                     │ create           │ update / delete      │
//! ├───────────┼──────────────────────────┼──────────────────┼──────────────────────┤
//! │ inventory │ GET  inventory/          │ POST inventory/  │ PUT|DELETE inv…/{id} │
//! │ joint     │ GET  joints/             │ POST joints/     │ PUT|DELETE joints/id │
//! │           │ GET  joints/employee/{e} │                  │ assign: PUT joints/id│
//! │ sale      │ GET  sales/              │ POST sales/      │ PUT|DELETE sales/{id}│
//! │ user      │ GET  users/all           │ POST users/signup│ role: PUT users/id/… │
//! └───────────┴──────────────────────────┴──────────────────┴──────────────────────┘
//! ```
//!
//! Bodies come back either wrapped (`{"joints": [...]}`) or bare; both are
//! accepted.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use tally_core::{EntityKind, Record, RecordId, ViewKey};

use super::{GatewayError, GatewayResult, RemoteGateway};

/// REST gateway for one entity type.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    /// `{api_base}/api/`, always with a trailing slash.
    base: Url,
    entity: EntityKind,
    timeout: Duration,
}

impl HttpGateway {
    /// Creates a gateway rooted at `api_base` (the `/api` prefix is added).
    pub fn new(
        client: Client,
        api_base: &Url,
        entity: EntityKind,
        timeout: Duration,
    ) -> GatewayResult<Self> {
        let mut raw = api_base.as_str().trim_end_matches('/').to_string();
        if !raw.ends_with("/api") {
            raw.push_str("/api");
        }
        raw.push('/');

        let base = Url::parse(&raw).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        Ok(HttpGateway {
            client,
            base,
            entity,
            timeout,
        })
    }

    /// Builds one gateway per entity type sharing a single client.
    pub fn for_all(api_base: &Url, timeout: Duration) -> GatewayResult<Vec<HttpGateway>> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        EntityKind::ALL
            .iter()
            .map(|kind| HttpGateway::new(client.clone(), api_base, *kind, timeout))
            .collect()
    }

    // =========================================================================
    // Routing
    // =========================================================================

    fn collection(&self) -> &'static str {
        match self.entity {
            EntityKind::Inventory => "inventory",
            EntityKind::Joint => "joints",
            EntityKind::Sale => "sales",
            EntityKind::User => "users",
        }
    }

    /// Envelope keys for a list and a single record.
    fn envelope(&self) -> (&'static str, &'static str) {
        match self.entity {
            EntityKind::Inventory => ("inventories", "inventory"),
            EntityKind::Joint => ("joints", "joint"),
            EntityKind::Sale => ("sales", "sale"),
            EntityKind::User => ("users", "user"),
        }
    }

    fn url(&self, path: &str) -> GatewayResult<Url> {
        self.base
            .join(path)
            .map_err(|e| GatewayError::InvalidResponse(format!("bad route {}: {}", path, e)))
    }

    fn list_path(&self, view: &ViewKey) -> String {
        match (self.entity, view.selector()) {
            (EntityKind::Joint, Some(("employee", id))) => format!("joints/employee/{}", id),
            (EntityKind::User, _) => "users/all".to_string(),
            _ => format!("{}/", self.collection()),
        }
    }

    /// True when the backend route already returns exactly `view`.
    fn served_remotely(&self, view: &ViewKey) -> bool {
        view.is_all() || matches!((self.entity, view.selector()), (EntityKind::Joint, Some(("employee", _))))
    }

    // =========================================================================
    // Transport
    // =========================================================================

    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> GatewayResult<Value> {
        trace!(entity = %self.entity, %method, %url, "Gateway request");

        let mut request = self.client.request(method.clone(), url.clone()).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        debug!(entity = %self.entity, %method, %url, status = status.as_u16(), "Gateway response");

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| GatewayError::InvalidResponse(format!("body is not JSON: {}", e)));
        }

        Err(status_error(status, &text))
    }

    fn transport_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }

    fn decode_one(&self, body: Value) -> GatewayResult<Record> {
        let (_, single) = self.envelope();
        let value = match body {
            Value::Object(mut map) if map.contains_key(single) && !map.contains_key("id") => {
                map.remove(single).unwrap_or(Value::Null)
            }
            other => other,
        };
        Record::from_value(value).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }

    fn decode_many(&self, body: Value) -> GatewayResult<Vec<Record>> {
        let (plural, _) = self.envelope();
        let items = match body {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove(plural) {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(GatewayError::InvalidResponse(format!(
                        "expected \"{}\" array",
                        plural
                    )))
                }
            },
            _ => return Err(GatewayError::InvalidResponse("expected a list".into())),
        };

        items
            .into_iter()
            .map(|item| Record::from_value(item).map_err(|e| GatewayError::InvalidResponse(e.to_string())))
            .collect()
    }
}

/// Maps a non-2xx status to a gateway error.
fn status_error(status: StatusCode, body: &str) -> GatewayError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        });

    if status.is_client_error() {
        GatewayError::Rejected {
            status: status.as_u16(),
            message,
        }
    } else {
        GatewayError::Unavailable(format!("{}: {}", status.as_u16(), message))
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    fn entity(&self) -> EntityKind {
        self.entity
    }

    async fn list(&self, view: &ViewKey) -> GatewayResult<Vec<Record>> {
        let url = self.url(&self.list_path(view))?;
        let body = self.send(Method::GET, url, None).await?;
        let mut records = self.decode_many(body)?;

        if !self.served_remotely(view) {
            records.retain(|r| view.admits(self.entity, r));
        }
        Ok(records)
    }

    async fn create(&self, payload: &Value) -> GatewayResult<Record> {
        let path = match self.entity {
            EntityKind::User => "users/signup".to_string(),
            _ => format!("{}/", self.collection()),
        };
        let body = self.send(Method::POST, self.url(&path)?, Some(payload)).await?;
        self.decode_one(body)
    }

    async fn update(&self, id: &RecordId, payload: &Value) -> GatewayResult<Record> {
        if self.entity == EntityKind::User {
            return Err(GatewayError::unsupported(self.entity, "update"));
        }
        let url = self.url(&format!("{}/{}", self.collection(), id))?;
        let body = self.send(Method::PUT, url, Some(payload)).await?;
        self.decode_one(body)
    }

    async fn delete(&self, id: &RecordId) -> GatewayResult<()> {
        if self.entity == EntityKind::User {
            return Err(GatewayError::unsupported(self.entity, "delete"));
        }
        let url = self.url(&format!("{}/{}", self.collection(), id))?;
        self.send(Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn custom(&self, name: &str, id: &RecordId, payload: &Value) -> GatewayResult<Record> {
        match (self.entity, name) {
            (EntityKind::Joint, "assign") => {
                let assigned_to = payload.get("assigned_to").cloned().unwrap_or(Value::Null);
                let url = self.url(&format!("joints/{}", id))?;
                let body = self
                    .send(Method::PUT, url, Some(&json!({ "assigned_to": assigned_to })))
                    .await?;
                self.decode_one(body)
            }
            (EntityKind::User, "role") => {
                let url = self.url(&format!("users/{}/role", id))?;
                let body = self.send(Method::PUT, url, Some(payload)).await?;
                self.decode_one(body)
            }
            _ => Err(GatewayError::unsupported(self.entity, format!("custom:{}", name))),
        }
    }
}
