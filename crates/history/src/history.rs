//! Per-entity bounded history.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use hassdash_protocol::ChangeEvent;

use crate::buffer::RingBuffer;
use crate::error::{StorageError, StorageResult};
use crate::kv::KvStore;

/// Points kept per entity.
pub const HISTORY_CAPACITY: usize = 1000;

/// Store key prefix for entity sequences: `entity:<entity_id>`.
pub const ENTITY_KEY_PREFIX: &str = "entity:";

/// One observed state. Serialised as `{"ts": <epoch ms>, "state": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub state: Value,
}

pub(crate) fn entity_key(entity_id: &str) -> String {
    format!("{ENTITY_KEY_PREFIX}{entity_id}")
}

type KeyLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Exclusive hold on one store key. The key's lock entry is dropped from the
/// map once nobody holds or waits on it.
pub(crate) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// Bounded append log per entity plus the settings record, over any
/// [`KvStore`].
///
/// Appends for the same key are serialised with a per-key lock so that
/// concurrent calls never lose points; different keys proceed in parallel.
pub struct HistoryStore<S> {
    store: S,
    capacity: usize,
    locks: KeyLocks,
}

impl<S: KvStore> HistoryStore<S> {
    pub fn new(store: S) -> Self {
        Self::with_capacity(store, HISTORY_CAPACITY)
    }

    pub fn with_capacity(store: S, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn backend(&self) -> &S {
        &self.store
    }

    /// Waits for exclusive read-modify-write access to one store key.
    pub(crate) async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.to_owned()).or_default().clone()
        };
        KeyGuard {
            locks: &self.locks,
            key: key.to_owned(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Appends `state` stamped with the current time.
    pub async fn record_point(&self, entity_id: &str, state: Value) -> StorageResult<()> {
        self.record_point_at(entity_id, state, Utc::now()).await
    }

    /// Records a change event at its arrival time.
    pub async fn record_event(&self, event: &ChangeEvent) -> StorageResult<()> {
        self.record_point_at(&event.entity_id, event.new_state.clone(), event.timestamp)
            .await
    }

    /// Appends a point and trims the sequence to capacity. Returns once the
    /// write is durable in the backing store.
    pub async fn record_point_at(
        &self,
        entity_id: &str,
        state: Value,
        timestamp: DateTime<Utc>,
    ) -> StorageResult<()> {
        let key = entity_key(entity_id);
        let _guard = self.lock_key(&key).await;

        let mut points = RingBuffer::from_vec(self.capacity, self.load(&key).await?);
        points.push(HistoryPoint { timestamp, state });
        let len = points.len();

        self.store
            .set(&key, serde_json::to_value(points.into_vec())?)
            .await?;
        trace!(entity_id, len, "recorded point");
        Ok(())
    }

    /// Full sequence for one entity, oldest first. Empty when nothing was
    /// recorded.
    pub async fn history(&self, entity_id: &str) -> StorageResult<Vec<HistoryPoint>> {
        self.load(&entity_key(entity_id)).await
    }

    /// Every entity with at least one recorded point.
    pub async fn list_keys(&self) -> StorageResult<Vec<String>> {
        let keys = self.store.keys().await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(ENTITY_KEY_PREFIX).map(str::to_owned))
            .collect())
    }

    /// Snapshot of every stored record, settings included, keyed by store
    /// key.
    pub async fn export_all(&self) -> StorageResult<BTreeMap<String, Value>> {
        let mut out = BTreeMap::new();
        for key in self.store.keys().await? {
            if let Some(value) = self.store.get(&key).await? {
                out.insert(key, value);
            }
        }
        debug!(records = out.len(), "exported store");
        Ok(out)
    }

    async fn load(&self, key: &str) -> StorageResult<Vec<HistoryPoint>> {
        match self.store.get(key).await? {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value).map_err(|source| StorageError::Corrupt {
                key: key.to_owned(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::kv::MemoryStore;
    use crate::settings::Settings;

    /// Store whose writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("quota exceeded".into()));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key).await
        }

        async fn keys(&self) -> StorageResult<Vec<String>> {
            self.inner.keys().await
        }
    }

    fn states(points: &[HistoryPoint]) -> Vec<Value> {
        points.iter().map(|p| p.state.clone()).collect()
    }

    #[tokio::test]
    async fn points_come_back_in_call_order() {
        let history = HistoryStore::new(MemoryStore::new());
        for v in ["a", "b", "c"] {
            history.record_point("sensor.x", json!(v)).await.unwrap();
        }

        let points = history.history("sensor.x").await.unwrap();
        assert_eq!(states(&points), vec![json!("a"), json!("b"), json!("c")]);
        assert!(points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn unknown_entity_has_empty_history() {
        let history = HistoryStore::new(MemoryStore::new());
        assert!(history.history("sensor.nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_keeps_latest_thousand() {
        let history = HistoryStore::new(MemoryStore::new());
        for n in 0..1001 {
            history.record_point("sensor.x", json!(n)).await.unwrap();
        }

        let points = history.history("sensor.x").await.unwrap();
        assert_eq!(points.len(), 1000);
        assert_eq!(points[0].state, json!(1));
        assert_eq!(points[999].state, json!(1000));
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_key_are_not_lost() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let tasks: Vec<_> = (0..50)
            .map(|n| {
                let history = history.clone();
                tokio::spawn(async move { history.record_point("sensor.x", json!(n)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seen: Vec<i64> = history
            .history("sensor.x")
            .await
            .unwrap()
            .iter()
            .filter_map(|p| p.state.as_i64())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn idle_key_locks_are_dropped() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let tasks: Vec<_> = (0..20)
            .map(|n| {
                let history = history.clone();
                tokio::spawn(async move {
                    history.record_point(&format!("sensor.{}", n % 4), json!(n)).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        history.save_settings(&Settings::default()).await.unwrap();

        assert!(history.locks.lock().unwrap().is_empty());
        assert_eq!(history.list_keys().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn held_key_lock_survives_other_releases() {
        let history = HistoryStore::new(MemoryStore::new());
        let held = history.lock_key("entity:sensor.a").await;
        history.record_point("sensor.b", json!(1)).await.unwrap();

        assert_eq!(history.locks.lock().unwrap().len(), 1);
        drop(held);
        assert!(history.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_keys_only_reports_entities() {
        let history = HistoryStore::new(MemoryStore::new());
        history.record_point("light.kitchen", json!("on")).await.unwrap();
        history.record_point("sensor.x", json!(1)).await.unwrap();
        history
            .backend()
            .set("settings", json!({"wsUrl": "ws://a"}))
            .await
            .unwrap();

        let mut keys = history.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["light.kitchen", "sensor.x"]);
    }

    #[tokio::test]
    async fn export_includes_settings_and_uses_ms_timestamps() {
        let history = HistoryStore::new(MemoryStore::new());
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        history
            .record_point_at("sensor.x", json!({"state": "21.5"}), at)
            .await
            .unwrap();
        history
            .backend()
            .set("settings", json!({"token": "abc"}))
            .await
            .unwrap();

        let export = history.export_all().await.unwrap();
        assert_eq!(
            export.get("entity:sensor.x"),
            Some(&json!([{"ts": 1_700_000_000_123i64, "state": {"state": "21.5"}}]))
        );
        assert_eq!(export.get("settings"), Some(&json!({"token": "abc"})));
    }

    #[tokio::test]
    async fn record_event_uses_arrival_time() {
        let history = HistoryStore::new(MemoryStore::new());
        let at = Utc.timestamp_millis_opt(1_000).unwrap();
        let event = ChangeEvent {
            entity_id: "light.kitchen".into(),
            new_state: json!({"state": "on"}),
            timestamp: at,
        };
        history.record_event(&event).await.unwrap();

        let points = history.history("light.kitchen").await.unwrap();
        assert_eq!(points, vec![HistoryPoint { timestamp: at, state: json!({"state": "on"}) }]);
    }

    #[tokio::test]
    async fn write_failures_propagate_and_keep_old_data() {
        let history = HistoryStore::new(FlakyStore::default());
        history.record_point("sensor.x", json!(1)).await.unwrap();

        history.backend().fail_writes.store(true, Ordering::SeqCst);
        let err = history.record_point("sensor.x", json!(2)).await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));

        assert_eq!(states(&history.history("sensor.x").await.unwrap()), vec![json!(1)]);
    }

    #[tokio::test]
    async fn corrupt_sequence_is_reported() {
        let history = HistoryStore::new(MemoryStore::new());
        history
            .backend()
            .set("entity:sensor.x", json!("not a list"))
            .await
            .unwrap();

        let err = history.history("sensor.x").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { ref key, .. } if key == "entity:sensor.x"));
    }
}
