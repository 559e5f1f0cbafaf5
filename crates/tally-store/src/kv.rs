//! # Key-Value Store
//!
//! The durable persistence primitive underneath the cache store and the
//! pending-operation queue.
//!
//! ## Instances
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      kv_entries (SQLite)                                │
//! │                                                                         │
//! │  instance          key              value (JSON)                       │
//! │  ───────────────   ──────────────   ───────────────────────────────    │
//! │  inventory-cache   view:all         [{ "id": 1, ... }, ...]            │
//! │  inventory-cache   index:views      ["all"]                            │
//! │  inventory-queue   log              { "next_seq": 4, "operations": [] }│
//! │  joint-cache       view:employee:42 [{ "id": 7, ... }]                 │
//! │                                                                         │
//! │  Each handle is scoped to one instance and never sees another's keys.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Values are whole JSON documents; a `set` replaces the document in one
//! statement, which is what makes cache replacement and queue
//! acknowledgement atomic.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::trace;

use crate::error::{StoreError, StoreResult};

// =============================================================================
// KeyValueStore Trait
// =============================================================================

/// A named, durable key-value instance.
#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    /// Name of the instance this handle is scoped to.
    fn instance(&self) -> &str;

    /// Reads a document. `None` if the key was never written.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Writes a document, replacing any previous value.
    async fn set(&self, key: &str, value: &Value) -> StoreResult<()>;

    /// Removes a document. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Lists the keys of this instance in lexical order.
    async fn keys(&self) -> StoreResult<Vec<String>>;
}

/// Shared handle to a key-value instance.
pub type KvHandle = Arc<dyn KeyValueStore>;

// =============================================================================
// SQLite Implementation
// =============================================================================

/// Key-value instance backed by the `kv_entries` table.
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
    instance: String,
}

impl SqliteKvStore {
    /// Creates a handle for `instance` on an already-migrated pool.
    pub fn new(pool: SqlitePool, instance: impl Into<String>) -> Self {
        SqliteKvStore {
            pool,
            instance: instance.into(),
        }
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    fn instance(&self) -> &str {
        &self.instance
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_entries WHERE instance = ?1 AND key = ?2")
                .bind(&self.instance)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match raw {
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StoreError::corrupt(&self.instance, key, e)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let text =
            serde_json::to_string(value).map_err(|e| StoreError::corrupt(&self.instance, key, e))?;

        trace!(instance = %self.instance, key = %key, bytes = text.len(), "kv set");

        sqlx::query(
            r#"
            INSERT INTO kv_entries (instance, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (instance, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.instance)
        .bind(key)
        .bind(text)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE instance = ?1 AND key = ?2")
            .bind(&self.instance)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT key FROM kv_entries WHERE instance = ?1 ORDER BY key")
                .bind(&self.instance)
                .fetch_all(&self.pool)
                .await?;

        Ok(keys)
    }
}

// =============================================================================
// In-Memory Implementation
// =============================================================================

type MemoryTable = HashMap<String, BTreeMap<String, Value>>;

/// In-memory key-value instance for tests and throwaway sessions.
///
/// Clones share the same table, so a clone survives as the "restarted"
/// view of the same data. [`MemoryKvStore::scoped`] opens another instance
/// on the same table.
#[derive(Debug, Clone)]
pub struct MemoryKvStore {
    instance: String,
    table: Arc<Mutex<MemoryTable>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryKvStore {
    /// Creates an empty table with one instance.
    pub fn new(instance: impl Into<String>) -> Self {
        MemoryKvStore {
            instance: instance.into(),
            table: Arc::new(Mutex::new(HashMap::new())),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens another instance on the same table.
    ///
    /// The new handle has its own availability switch.
    pub fn scoped(&self, instance: impl Into<String>) -> Self {
        MemoryKvStore {
            instance: instance.into(),
            table: Arc::clone(&self.table),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes every operation on this handle (and its clones) fail with
    /// [`StoreError::Unavailable`], simulating a broken storage backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!(
                "{} is unavailable",
                self.instance
            )));
        }
        Ok(())
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut MemoryTable) -> T) -> StoreResult<T> {
        self.check()?;
        let mut table = self
            .table
            .lock()
            .map_err(|_| StoreError::Internal("memory table lock poisoned".to_string()))?;
        Ok(f(&mut table))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    fn instance(&self) -> &str {
        &self.instance
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.with_table(|table| {
            table
                .get(&self.instance)
                .and_then(|entries| entries.get(key))
                .cloned()
        })
    }

    async fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        self.with_table(|table| {
            table
                .entry(self.instance.clone())
                .or_default()
                .insert(key.to_string(), value.clone());
        })
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.with_table(|table| {
            if let Some(entries) = table.get_mut(&self.instance) {
                entries.remove(key);
            }
        })
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        self.with_table(|table| {
            table
                .get(&self.instance)
                .map(|entries| entries.keys().cloned().collect())
                .unwrap_or_default()
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{LocalStore, StoreConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_kv_roundtrip() {
        let store = LocalStore::open(StoreConfig::in_memory()).await.unwrap();
        let kv = store.kv("inventory-cache");

        assert_eq!(kv.get("view:all").await.unwrap(), None);

        kv.set("view:all", &json!([{ "id": 1 }])).await.unwrap();
        kv.set("view:all", &json!([{ "id": 2 }])).await.unwrap();
        assert_eq!(kv.get("view:all").await.unwrap(), Some(json!([{ "id": 2 }])));

        kv.remove("view:all").await.unwrap();
        assert_eq!(kv.get("view:all").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_instances_are_isolated() {
        let store = LocalStore::open(StoreConfig::in_memory()).await.unwrap();
        let cache = store.kv("sale-cache");
        let queue = store.kv("sale-queue");

        cache.set("a", &json!(1)).await.unwrap();
        queue.set("b", &json!(2)).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(queue.keys().await.unwrap(), vec!["b".to_string()]);
        assert_eq!(queue.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_clones_share_state() {
        let kv = MemoryKvStore::new("joint-cache");
        let restarted = kv.clone();

        kv.set("view:all", &json!([])).await.unwrap();
        assert_eq!(restarted.get("view:all").await.unwrap(), Some(json!([])));

        let other = kv.scoped("joint-queue");
        assert!(other.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_unavailable() {
        let kv = MemoryKvStore::new("user-cache");
        kv.set_unavailable(true);

        assert!(matches!(
            kv.get("view:all").await,
            Err(StoreError::Unavailable(_))
        ));

        kv.set_unavailable(false);
        assert!(kv.get("view:all").await.unwrap().is_none());
    }
}
