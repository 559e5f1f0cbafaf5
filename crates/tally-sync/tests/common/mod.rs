//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tally_core::{EntityKind, PendingOperation, Record, ViewKey};
use tally_store::{KvHandle, MemoryKvStore};
use tally_sync::coordinator::DrainReport;
use tally_sync::{
    ConnectivityFlag, MemoryGateway, RemoteGateway, SyncError, SyncObserver, SyncServices,
    SyncServicesBuilder,
};

/// Observer that counts what it sees.
#[derive(Default)]
pub struct RecordingObserver {
    pub queued: AtomicUsize,
    pub refresh_failures: AtomicUsize,
    pub degraded: AtomicUsize,
    pub reports: Mutex<Vec<DrainReport>>,
}

impl RecordingObserver {
    pub fn reports(&self) -> Vec<DrainReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl SyncObserver for RecordingObserver {
    fn operation_queued(&self, _op: &PendingOperation) {
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    fn drain_finished(&self, report: &DrainReport) {
        self.reports.lock().unwrap().push(report.clone());
    }

    fn background_refresh_failed(&self, _entity: EntityKind, _view: &ViewKey, _error: &SyncError) {
        self.refresh_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn cache_degraded(&self, _entity: EntityKind, _action: &str, _error: &str) {
        self.degraded.fetch_add(1, Ordering::SeqCst);
    }
}

/// A full set of services over memory storage and fake backends.
pub struct Session {
    pub services: SyncServices,
    pub gateways: HashMap<EntityKind, Arc<MemoryGateway>>,
    pub flag: ConnectivityFlag,
    pub table: MemoryKvStore,
    pub observer: Arc<RecordingObserver>,
}

impl Session {
    pub fn gateway(&self, kind: EntityKind) -> &MemoryGateway {
        &self.gateways[&kind]
    }
}

/// Builds a session. `backend` seeds each entity's fake backend.
pub fn session(online: bool, backend: Vec<(EntityKind, Vec<Value>)>) -> Session {
    let mut seeds: HashMap<EntityKind, Vec<Value>> = backend.into_iter().collect();
    let gateways: HashMap<EntityKind, Arc<MemoryGateway>> = EntityKind::ALL
        .iter()
        .map(|k| {
            let records = seeds.remove(k).unwrap_or_default();
            (*k, Arc::new(MemoryGateway::with_records(*k, records)))
        })
        .collect();

    let flag = ConnectivityFlag::new(online);
    let table = MemoryKvStore::new("session");
    let observer = Arc::new(RecordingObserver::default());

    let services = build(&flag, &table, &gateways, observer.clone());

    Session {
        services,
        gateways,
        flag,
        table,
        observer,
    }
}

/// Builds services over existing storage and backends, as after a restart.
pub fn build(
    flag: &ConnectivityFlag,
    table: &MemoryKvStore,
    gateways: &HashMap<EntityKind, Arc<MemoryGateway>>,
    observer: Arc<RecordingObserver>,
) -> SyncServices {
    SyncServicesBuilder::new(Arc::new(flag.clone()))
        .observer(observer)
        .call_timeout(Duration::from_secs(2))
        .build(
            |instance| Arc::new(table.scoped(instance)) as KvHandle,
            |kind| gateways[&kind].clone() as Arc<dyn RemoteGateway>,
        )
}

/// Records sorted by id, for order-insensitive comparison.
pub fn sorted(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}
