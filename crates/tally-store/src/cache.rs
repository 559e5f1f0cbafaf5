//! # Cache Store
//!
//! Durable, per-entity snapshots of the last known-good collection and of
//! every named view derived from it.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  CacheStore (one per entity type)                       │
//! │                                                                         │
//! │  KV instance "joint-cache"                                             │
//! │  ├── index:views        ["all", "employee:42"]                         │
//! │  ├── view:all           [ {id: 7, ...}, {id: "local-…", _pending} ]    │
//! │  └── view:employee:42   [ {id: 7, assigned_to: 42, ...} ]              │
//! │                                                                         │
//! │  Whole-view replace:   refresh from the backend                        │
//! │  Targeted patch:       one record, in EVERY view that holds it         │
//! │  Optimistic records:   located by pending seq, never by id             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every read-modify-write runs under one async mutex, so a background
//! refresh and a targeted patch on the same entity never interleave.
//! Every write also bumps a generation counter: a refresh that fetched
//! before some other write landed can see that and drop its stale list
//! (see [`CacheStore::replace_if_unchanged`]).
//! Errors are returned as-is; the entity services decide how to degrade.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use tally_core::{EntityKind, Namespace, Record, RecordId, ViewKey};

use crate::error::{StoreError, StoreResult};
use crate::kv::KvHandle;

/// Key listing every view ever written for this entity.
const VIEW_INDEX_KEY: &str = "index:views";

/// Durable cache for one entity type.
#[derive(Debug)]
pub struct CacheStore {
    entity: EntityKind,
    kv: KvHandle,
    write_lock: Mutex<()>,
    generation: AtomicU64,
}

impl CacheStore {
    /// Creates a cache over the given key-value instance.
    pub fn new(entity: EntityKind, kv: KvHandle) -> Self {
        CacheStore {
            entity,
            kv,
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Write generation. Any write to any view of this entity moves it.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Entity type this cache holds.
    pub fn entity(&self) -> EntityKind {
        self.entity
    }

    // =========================================================================
    // Whole-View Operations
    // =========================================================================

    /// Reads a view. `None` if the view was never written.
    ///
    /// Never touches the network.
    pub async fn read(&self, view: &ViewKey) -> StoreResult<Option<Vec<Record>>> {
        let key = self.namespace(view).storage_key();
        match self.kv.get(&key).await? {
            Some(value) => Ok(Some(self.decode(&key, value)?)),
            None => Ok(None),
        }
    }

    /// Overwrites a view wholesale.
    pub async fn replace(&self, view: &ViewKey, records: &[Record]) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        debug!(
            namespace = %self.namespace(view),
            count = records.len(),
            "Replacing cached view"
        );

        self.write_view(view, records).await?;
        self.register_view(view).await
    }

    /// Overwrites a view with a list fetched after [`generation`] returned
    /// `seen`, unless the cache was written since.
    ///
    /// Returns false (and writes nothing) when the fetched list may be older
    /// than what the cache now holds.
    ///
    /// [`generation`]: CacheStore::generation
    pub async fn replace_if_unchanged(
        &self,
        view: &ViewKey,
        records: &[Record],
        seen: u64,
    ) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;

        if self.generation() != seen {
            debug!(
                namespace = %self.namespace(view),
                seen,
                current = self.generation(),
                "Cache written during fetch, keeping cached view"
            );
            return Ok(false);
        }

        self.write_view(view, records).await?;
        self.register_view(view).await?;
        Ok(true)
    }

    /// Lists every view ever written for this entity.
    pub async fn views(&self) -> StoreResult<Vec<ViewKey>> {
        match self.kv.get(VIEW_INDEX_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| StoreError::corrupt(self.kv.instance(), VIEW_INDEX_KEY, e)),
            None => Ok(Vec::new()),
        }
    }

    // =========================================================================
    // Single-View Patches
    // =========================================================================

    /// Replaces exactly one record matching `id` in `view`.
    ///
    /// Returns false (and writes nothing) if no record matches.
    pub async fn patch_one<F>(&self, view: &ViewKey, id: &RecordId, updater: F) -> StoreResult<bool>
    where
        F: FnOnce(&mut Record) + Send,
    {
        let _guard = self.write_lock.lock().await;

        let Some(mut records) = self.read(view).await? else {
            return Ok(false);
        };
        let Some(record) = records.iter_mut().find(|r| &r.id == id) else {
            return Ok(false);
        };

        updater(record);
        self.write_view(view, &records).await?;
        Ok(true)
    }

    /// Removes exactly one record matching `id` from `view`.
    pub async fn remove_one(&self, view: &ViewKey, id: &RecordId) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;

        let Some(mut records) = self.read(view).await? else {
            return Ok(false);
        };
        let Some(position) = records.iter().position(|r| &r.id == id) else {
            return Ok(false);
        };

        records.remove(position);
        self.write_view(view, &records).await?;
        Ok(true)
    }

    /// Appends a locally synthesized record to `view`, creating the view if
    /// it was never written. A copy already there (a refresh may have
    /// replayed the queued create first) is replaced in place.
    pub async fn append_optimistic(&self, view: &ViewKey, record: Record) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.read(view).await?.unwrap_or_default();
        trace!(namespace = %self.namespace(view), id = %record.id, "Appending optimistic record");
        match records.iter().position(|r| r.id == record.id) {
            Some(i) => records[i] = record,
            None => records.push(record),
        }

        self.write_view(view, &records).await?;
        self.register_view(view).await
    }

    // =========================================================================
    // Every-View Operations
    // =========================================================================

    /// Files an authoritative record into every known view: views that
    /// admit it gain or replace it, views that don't drop any stale copy.
    ///
    /// Returns the views that now hold the record.
    pub async fn upsert_everywhere(&self, record: &Record) -> StoreResult<Vec<ViewKey>> {
        let _guard = self.write_lock.lock().await;

        let mut holding = Vec::new();
        for view in self.views().await? {
            let mut records = self.read(&view).await?.unwrap_or_default();
            let position = records.iter().position(|r| r.id == record.id);

            if view.admits(self.entity, record) {
                match position {
                    Some(i) => records[i] = record.clone(),
                    None => records.push(record.clone()),
                }
                holding.push(view.clone());
            } else if let Some(i) = position {
                records.remove(i);
            } else {
                continue;
            }
            self.write_view(&view, &records).await?;
        }

        Ok(holding)
    }

    /// Applies `updater` to the record with `id` in every view that holds
    /// it, then re-files the result: views that no longer admit it drop it,
    /// filtered views that now admit it gain it.
    ///
    /// Returns the patched record, or `None` if no view held it.
    pub async fn patch_everywhere<F>(&self, id: &RecordId, updater: F) -> StoreResult<Option<Record>>
    where
        F: Fn(&mut Record) + Send + Sync,
    {
        let _guard = self.write_lock.lock().await;

        let views = self.views().await?;
        let mut patched: Option<Record> = None;

        for view in &views {
            let Some(mut records) = self.read(view).await? else {
                continue;
            };
            let Some(position) = records.iter().position(|r| &r.id == id) else {
                continue;
            };

            updater(&mut records[position]);
            if patched.is_none() {
                patched = Some(records[position].clone());
            }
            if !view.admits(self.entity, &records[position]) {
                records.remove(position);
            }
            self.write_view(view, &records).await?;
        }

        if let Some(record) = &patched {
            for view in &views {
                if view.is_all() || !view.admits(self.entity, record) {
                    continue;
                }
                let mut records = self.read(view).await?.unwrap_or_default();
                if records.iter().all(|r| &r.id != id) {
                    records.push(record.clone());
                    self.write_view(view, &records).await?;
                }
            }
        }

        Ok(patched)
    }

    /// Removes the record with `id` from every view.
    ///
    /// Returns the number of views it was removed from.
    pub async fn remove_everywhere(&self, id: &RecordId) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().await;

        let mut removed = 0;
        for view in self.views().await? {
            let Some(mut records) = self.read(&view).await? else {
                continue;
            };
            let before = records.len();
            records.retain(|r| &r.id != id);
            if records.len() != before {
                self.write_view(&view, &records).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Replaces, in every view, the optimistic record tagged with `seq` by
    /// the authoritative `record`.
    ///
    /// Views that do not admit the authoritative record drop the optimistic
    /// copy instead. Returns the number of views where a copy was found.
    pub async fn supersede_optimistic(&self, seq: u64, record: &Record) -> StoreResult<usize> {
        let _guard = self.write_lock.lock().await;

        let mut superseded = 0;
        for view in self.views().await? {
            let Some(mut records) = self.read(&view).await? else {
                continue;
            };
            let Some(position) = records.iter().position(|r| r.pending_seq() == Some(seq)) else {
                continue;
            };

            if view.admits(self.entity, record) {
                records[position] = record.clone();
            } else {
                records.remove(position);
            }
            self.write_view(&view, &records).await?;
            superseded += 1;
        }

        debug!(entity = %self.entity, seq, id = %record.id, views = superseded, "Superseded optimistic record");
        Ok(superseded)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn namespace(&self, view: &ViewKey) -> Namespace {
        Namespace::new(self.entity, view.clone())
    }

    fn decode(&self, key: &str, value: Value) -> StoreResult<Vec<Record>> {
        serde_json::from_value(value).map_err(|e| StoreError::corrupt(self.kv.instance(), key, e))
    }

    async fn write_view(&self, view: &ViewKey, records: &[Record]) -> StoreResult<()> {
        let key = self.namespace(view).storage_key();
        let value = Value::Array(records.iter().map(Record::to_value).collect());
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.kv.set(&key, &value).await
    }

    async fn register_view(&self, view: &ViewKey) -> StoreResult<()> {
        let mut views = self.views().await?;
        if views.contains(view) {
            return Ok(());
        }
        views.push(view.clone());

        let value = serde_json::to_value(&views)
            .map_err(|e| StoreError::corrupt(self.kv.instance(), VIEW_INDEX_KEY, e))?;
        self.kv.set(VIEW_INDEX_KEY, &value).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use tally_core::PendingMarker;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn joint_cache() -> (CacheStore, MemoryKvStore) {
        let kv = MemoryKvStore::new("joint-cache");
        (CacheStore::new(EntityKind::Joint, Arc::new(kv.clone())), kv)
    }

    fn ids(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r.id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_read_absent_then_replace() {
        let (cache, _) = joint_cache();
        let all = ViewKey::all();

        assert!(cache.read(&all).await.unwrap().is_none());

        cache
            .replace(&all, &[record(json!({ "id": 1 })), record(json!({ "id": 2 }))])
            .await
            .unwrap();

        assert_eq!(ids(&cache.read(&all).await.unwrap().unwrap()), vec!["1", "2"]);
        assert_eq!(cache.views().await.unwrap(), vec![all]);
    }

    #[tokio::test]
    async fn test_survives_restart() {
        let (cache, kv) = joint_cache();
        cache
            .replace(&ViewKey::all(), &[record(json!({ "id": 5 }))])
            .await
            .unwrap();
        drop(cache);

        let reopened = CacheStore::new(EntityKind::Joint, Arc::new(kv));
        let records = reopened.read(&ViewKey::all()).await.unwrap().unwrap();
        assert_eq!(ids(&records), vec!["5"]);
    }

    #[tokio::test]
    async fn test_patch_and_remove_one() {
        let (cache, _) = joint_cache();
        let all = ViewKey::all();
        cache
            .replace(&all, &[record(json!({ "id": 1, "qty": 1 })), record(json!({ "id": 2 }))])
            .await
            .unwrap();

        let patched = cache
            .patch_one(&all, &RecordId::from(1), |r| r.merge_payload(&json!({ "qty": 3 })))
            .await
            .unwrap();
        assert!(patched);
        assert!(!cache
            .patch_one(&all, &RecordId::from(99), |_| {})
            .await
            .unwrap());

        assert!(cache.remove_one(&all, &RecordId::from(2)).await.unwrap());
        let records = cache.read(&all).await.unwrap().unwrap();
        assert_eq!(ids(&records), vec!["1"]);
        assert_eq!(records[0].field("qty"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_patch_everywhere_refiles_views() {
        let (cache, _) = joint_cache();
        let all = ViewKey::all();
        let emp1 = ViewKey::employee(1);
        let emp2 = ViewKey::employee(2);

        let unit = record(json!({ "id": 7, "assigned_to": 1 }));
        cache.replace(&all, &[unit.clone()]).await.unwrap();
        cache.replace(&emp1, &[unit]).await.unwrap();
        cache.replace(&emp2, &[]).await.unwrap();

        let patched = cache
            .patch_everywhere(&RecordId::from(7), |r| {
                r.merge_payload(&json!({ "assigned_to": 2 }))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(patched.field("assigned_to"), Some(&json!(2)));

        assert_eq!(ids(&cache.read(&all).await.unwrap().unwrap()), vec!["7"]);
        assert!(cache.read(&emp1).await.unwrap().unwrap().is_empty());
        assert_eq!(ids(&cache.read(&emp2).await.unwrap().unwrap()), vec!["7"]);
    }

    #[tokio::test]
    async fn test_supersede_optimistic_by_seq() {
        let (cache, _) = joint_cache();
        let all = ViewKey::all();
        let emp = ViewKey::employee(4);
        cache.replace(&emp, &[]).await.unwrap();

        let optimistic = Record::optimistic(
            RecordId::local(),
            &json!({ "assigned_to": 4, "joints_count": 5 }),
            PendingMarker {
                seq: 11,
                queued_at: Utc::now(),
            },
        )
        .unwrap();
        cache.append_optimistic(&all, optimistic.clone()).await.unwrap();
        cache.upsert_everywhere(&optimistic).await.unwrap();

        let confirmed = record(json!({ "id": 30, "assigned_to": 4, "joints_count": 5 }));
        assert_eq!(cache.supersede_optimistic(11, &confirmed).await.unwrap(), 2);

        for view in [&all, &emp] {
            let records = cache.read(view).await.unwrap().unwrap();
            assert_eq!(ids(&records), vec!["30"]);
            assert!(!records[0].is_pending());
        }
    }

    #[tokio::test]
    async fn test_remove_everywhere() {
        let (cache, _) = joint_cache();
        let unit = record(json!({ "id": 9, "assigned_to": 3 }));
        cache.replace(&ViewKey::all(), &[unit.clone()]).await.unwrap();
        cache.replace(&ViewKey::employee(3), &[unit]).await.unwrap();

        assert_eq!(cache.remove_everywhere(&RecordId::from(9)).await.unwrap(), 2);
        assert_eq!(cache.remove_everywhere(&RecordId::from(9)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_fetch_does_not_overwrite() {
        let (cache, _) = joint_cache();
        let all = ViewKey::all();
        cache.replace(&all, &[record(json!({ "id": 1 }))]).await.unwrap();

        let seen = cache.generation();
        cache
            .upsert_everywhere(&record(json!({ "id": 2 })))
            .await
            .unwrap();

        let stale = [record(json!({ "id": 1 }))];
        assert!(!cache.replace_if_unchanged(&all, &stale, seen).await.unwrap());
        assert_eq!(ids(&cache.read(&all).await.unwrap().unwrap()), vec!["1", "2"]);

        let seen = cache.generation();
        let fresh = [record(json!({ "id": 1 })), record(json!({ "id": 2 })), record(json!({ "id": 3 }))];
        assert!(cache.replace_if_unchanged(&all, &fresh, seen).await.unwrap());
        assert_eq!(ids(&cache.read(&all).await.unwrap().unwrap()), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_append_optimistic_replaces_same_id() {
        let (cache, _) = joint_cache();
        let all = ViewKey::all();
        let marker = PendingMarker {
            seq: 3,
            queued_at: Utc::now(),
        };
        let local = RecordId::local();

        let first = Record::optimistic(local.clone(), &json!({ "joints_count": 2 }), marker.clone()).unwrap();
        let second = Record::optimistic(local, &json!({ "joints_count": 4 }), marker).unwrap();
        cache.append_optimistic(&all, first).await.unwrap();
        cache.append_optimistic(&all, second).await.unwrap();

        let records = cache.read(&all).await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].field("joints_count"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_unavailable_backend_errors() {
        let (cache, kv) = joint_cache();
        kv.set_unavailable(true);

        assert!(cache.read(&ViewKey::all()).await.is_err());
        assert!(cache.replace(&ViewKey::all(), &[]).await.is_err());
    }
}
