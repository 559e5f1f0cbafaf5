//! # Service Registry
//!
//! Builds the four entity services once at start-up and hands them out by
//! `Arc`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SyncServices                                  │
//! │                                                                         │
//! │   inventory ── joints ── sales ── users      (drain order)             │
//! │       │          │         │        │                                   │
//! │       └──────────┴────┬────┴────────┘                                   │
//! │                       ▼                                                 │
//! │   LocalStore ("{entity}-cache", "{entity}-queue")   HttpGateway x4     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tally_core::EntityKind;
use tally_store::{KvHandle, LocalStore, StoreConfig};

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityOracle;
use crate::coordinator::{DrainOutcome, DrainReport};
use crate::entities::{InventoryService, JointService, SaleService, UserService};
use crate::error::SyncResult;
use crate::gateway::{HttpGateway, RemoteGateway};
use crate::observer::{SyncObserver, TracingObserver};
use crate::service::{EntityService, ServiceContext, DEFAULT_CALL_TIMEOUT};

/// Every entity service of one session.
pub struct SyncServices {
    pub inventory: InventoryService,
    pub joints: JointService,
    pub sales: SaleService,
    pub users: UserService,
    store: Option<LocalStore>,
}

/// Result of draining every entity type.
#[derive(Debug, Clone, Default)]
pub struct DrainSummary {
    /// One report per entity actually drained, in drain order.
    pub reports: Vec<DrainReport>,
    /// Entity types skipped because another drain was already running.
    pub busy: Vec<EntityKind>,
}

impl DrainSummary {
    /// True if every entity type drained without failure.
    pub fn is_complete(&self) -> bool {
        self.busy.is_empty() && self.reports.iter().all(DrainReport::is_complete)
    }

    pub fn confirmed(&self) -> usize {
        self.reports.iter().map(|r| r.confirmed).sum()
    }

    pub fn remaining(&self) -> usize {
        self.reports.iter().map(|r| r.remaining).sum()
    }
}

impl SyncServices {
    /// Opens the SQLite store and wires REST gateways from `config`.
    pub async fn open(
        config: &SyncConfig,
        oracle: Arc<dyn ConnectivityOracle>,
        observer: Arc<dyn SyncObserver>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let path = config.store_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = LocalStore::open(StoreConfig::new(path.clone())).await?;

        let api_base = config.api_base()?;
        let mut gateways: HashMap<EntityKind, Arc<dyn RemoteGateway>> = HashMap::new();
        for gateway in HttpGateway::for_all(&api_base, config.request_timeout())? {
            gateways.insert(gateway.entity(), Arc::new(gateway));
        }

        info!(path = %path.display(), api_base = %api_base, "Opening sync services");

        let mut services = SyncServicesBuilder::new(oracle)
            .observer(observer)
            .call_timeout(config.request_timeout())
            .build(
                |instance| store.kv(instance),
                |kind| gateways[&kind].clone(),
            );
        services.store = Some(store);
        Ok(services)
    }

    /// Returns the generic service for `kind`.
    pub fn service(&self, kind: EntityKind) -> &EntityService {
        match kind {
            EntityKind::Inventory => &self.inventory,
            EntityKind::Joint => &self.joints,
            EntityKind::Sale => &self.sales,
            EntityKind::User => &self.users,
        }
    }

    /// Drains every entity type in dependency order (inventory, joints,
    /// sales, users), stopping at the first one that does not complete.
    pub async fn drain_all(&self) -> SyncResult<DrainSummary> {
        self.drain_kinds(&EntityKind::ALL).await
    }

    /// Drains the given entity types in the order given, stopping at the
    /// first one that does not complete.
    pub async fn drain_kinds(&self, kinds: &[EntityKind]) -> SyncResult<DrainSummary> {
        let mut summary = DrainSummary::default();

        for kind in kinds {
            match self.service(*kind).drain().await? {
                DrainOutcome::Busy => {
                    summary.busy.push(*kind);
                    break;
                }
                DrainOutcome::Drained(report) => {
                    let complete = report.is_complete();
                    summary.reports.push(report);
                    if !complete {
                        warn!(entity = %kind, "Drain incomplete, later entity types deferred");
                        break;
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Total operations waiting across every entity type.
    pub async fn pending_count(&self) -> SyncResult<usize> {
        let mut total = 0;
        for kind in EntityKind::ALL {
            total += self.service(kind).pending_count().await?;
        }
        Ok(total)
    }

    /// Waits for background refreshes, then closes the store.
    pub async fn close(&self) {
        for kind in EntityKind::ALL {
            self.service(kind).wait_for_background().await;
        }
        if let Some(store) = &self.store {
            store.close().await;
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncServices`] over any storage and gateways.
pub struct SyncServicesBuilder {
    oracle: Arc<dyn ConnectivityOracle>,
    observer: Arc<dyn SyncObserver>,
    call_timeout: Duration,
}

impl SyncServicesBuilder {
    pub fn new(oracle: Arc<dyn ConnectivityOracle>) -> Self {
        SyncServicesBuilder {
            oracle,
            observer: Arc::new(TracingObserver),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Builds the services. `kv_for` opens a key-value instance by name
    /// (`"{entity}-cache"`, `"{entity}-queue"`); `gateway_for` supplies the
    /// backend for each entity type.
    pub fn build<K, G>(self, kv_for: K, gateway_for: G) -> SyncServices
    where
        K: Fn(&str) -> KvHandle,
        G: Fn(EntityKind) -> Arc<dyn RemoteGateway>,
    {
        let ctx = ServiceContext {
            oracle: self.oracle,
            observer: self.observer,
            call_timeout: self.call_timeout,
        };

        let make = |kind: EntityKind| {
            EntityService::new(
                kind,
                kv_for(&kind.cache_instance()),
                kv_for(&kind.queue_instance()),
                gateway_for(kind),
                &ctx,
            )
        };

        SyncServices {
            inventory: InventoryService::new(make(EntityKind::Inventory)),
            joints: JointService::new(make(EntityKind::Joint)),
            sales: SaleService::new(make(EntityKind::Sale)),
            users: UserService::new(make(EntityKind::User)),
            store: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityFlag;
    use crate::gateway::{GatewayCall, GatewayError, MemoryGateway};
    use crate::observer::NoOpObserver;
    use serde_json::json;
    use tally_store::MemoryKvStore;

    fn build(flag: &ConnectivityFlag) -> (SyncServices, HashMap<EntityKind, Arc<MemoryGateway>>) {
        let gateways: HashMap<EntityKind, Arc<MemoryGateway>> = EntityKind::ALL
            .iter()
            .map(|k| (*k, Arc::new(MemoryGateway::new(*k))))
            .collect();
        let table = MemoryKvStore::new("root");

        let services = SyncServicesBuilder::new(Arc::new(flag.clone()))
            .observer(Arc::new(NoOpObserver))
            .build(
                |instance| Arc::new(table.scoped(instance)) as KvHandle,
                |kind| gateways[&kind].clone() as Arc<dyn RemoteGateway>,
            );
        (services, gateways)
    }

    #[tokio::test]
    async fn test_drain_all_stops_at_first_incomplete_entity() {
        let flag = ConnectivityFlag::new(false);
        let (services, gateways) = build(&flag);

        services
            .inventory
            .create(json!({ "strain_name": "OG", "price_per_gram": 10, "buying_price": 5 }))
            .await
            .unwrap();
        services
            .joints
            .create(json!({
                "inventory_id": 1, "grams_used": 2, "joints_count": 4, "price_per_joint": 5
            }))
            .await
            .unwrap();
        services
            .sales
            .create(json!({ "inventory_id": 1, "quantity": 1, "sale_type": "grams", "total_price": 10 }))
            .await
            .unwrap();
        assert_eq!(services.pending_count().await.unwrap(), 3);

        gateways[&EntityKind::Joint].fail_on(|call| match call {
            GatewayCall::Create { .. } => Some(GatewayError::Unavailable("flaky".into())),
            _ => None,
        });
        flag.set_online(true);

        let summary = services.drain_all().await.unwrap();
        assert!(!summary.is_complete());
        assert_eq!(summary.reports.len(), 2);
        assert_eq!(summary.confirmed(), 1);
        assert!(gateways[&EntityKind::Sale].calls().is_empty());
        assert_eq!(services.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_service_lookup() {
        let flag = ConnectivityFlag::default();
        let (services, _) = build(&flag);

        for kind in EntityKind::ALL {
            assert_eq!(services.service(kind).entity(), kind);
        }
        assert!(services.service(EntityKind::User).list().await.unwrap().is_empty());
        assert_eq!(services.service(EntityKind::Sale).pending_count().await.unwrap(), 0);
    }
}
