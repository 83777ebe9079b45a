//! Ephemeral key slot: a single named value, cached in memory and persisted.
//!
//! The slot is process-wide and last-writer-wins. There is no ownership
//! arbitration: two sessions writing it concurrently will overwrite each
//! other, and a slot whose cache is warm will not see writes made by another
//! process until it is recreated.

mod sqlite;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

pub use sqlite::SqliteSlotStore;

/// Storage key used for the ephemeral key.
pub const EPHEMERAL_KEY_SLOT: &str = "ephemeral_key";

/// Persistence backend for named slots.
#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<String>>;
    async fn save(&self, name: &str, value: &str) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
enum Cached {
    /// Not read from the store yet.
    Cold,
    Empty,
    Held(Value),
}

/// The single ephemeral-key slot.
pub struct EphemeralKeySlot {
    store: Arc<dyn SlotStore>,
    cache: RwLock<Cached>,
}

impl EphemeralKeySlot {
    pub fn new(store: Arc<dyn SlotStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(Cached::Cold),
        }
    }

    /// Persist and cache a value, replacing whatever was there.
    pub async fn set(&self, value: Value) -> Result<()> {
        let encoded = serde_json::to_string(&value).context("Failed to encode ephemeral key")?;
        self.store.save(EPHEMERAL_KEY_SLOT, &encoded).await?;
        *self.cache.write().await = Cached::Held(value);
        Ok(())
    }

    /// Cached value if known, otherwise the persisted one.
    pub async fn get(&self) -> Result<Option<Value>> {
        match &*self.cache.read().await {
            Cached::Held(value) => return Ok(Some(value.clone())),
            Cached::Empty => return Ok(None),
            Cached::Cold => {}
        }

        debug!("Ephemeral key cache cold, reading store");
        let loaded = match self.store.load(EPHEMERAL_KEY_SLOT).await? {
            Some(raw) => Some(
                serde_json::from_str::<Value>(&raw).context("Persisted ephemeral key is not JSON")?,
            ),
            None => None,
        };

        *self.cache.write().await = match &loaded {
            Some(value) => Cached::Held(value.clone()),
            None => Cached::Empty,
        };
        Ok(loaded)
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.delete(EPHEMERAL_KEY_SLOT).await?;
        *self.cache.write().await = Cached::Empty;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use serde_json::json;

    /// Volatile backend. Clones share the same map, which makes it usable to
    /// simulate a restart: drop the slot, keep the store.
    #[derive(Debug, Clone, Default)]
    struct MemorySlotStore {
        slots: Arc<RwLock<HashMap<String, String>>>,
    }

    impl MemorySlotStore {
        fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SlotStore for MemorySlotStore {
        async fn load(&self, name: &str) -> Result<Option<String>> {
            Ok(self.slots.read().await.get(name).cloned())
        }

        async fn save(&self, name: &str, value: &str) -> Result<()> {
            self.slots
                .write()
                .await
                .insert(name.to_string(), value.to_string());
            Ok(())
        }

        async fn delete(&self, name: &str) -> Result<()> {
            self.slots.write().await.remove(name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_set_get_survives_restart() {
        let store = MemorySlotStore::new();

        let slot = EphemeralKeySlot::new(Arc::new(store.clone()));
        slot.set(json!({"k": 1})).await.unwrap();
        assert_eq!(slot.get().await.unwrap(), Some(json!({"k": 1})));
        drop(slot);

        // fresh cache, same persisted store
        let restarted = EphemeralKeySlot::new(Arc::new(store.clone()));
        assert_eq!(restarted.get().await.unwrap(), Some(json!({"k": 1})));

        restarted.clear().await.unwrap();
        assert_eq!(restarted.get().await.unwrap(), None);

        let again = EphemeralKeySlot::new(Arc::new(store));
        assert_eq!(again.get().await.unwrap(), None);
    }

    #[test]
    fn test_last_writer_wins() {
        tokio_test::block_on(async {
            let store = MemorySlotStore::new();
            let first = EphemeralKeySlot::new(Arc::new(store.clone()));
            let second = EphemeralKeySlot::new(Arc::new(store.clone()));

            first.set(json!("alpha")).await.unwrap();
            second.set(json!("beta")).await.unwrap();

            // the first slot's warm cache does not see the overwrite
            assert_eq!(first.get().await.unwrap(), Some(json!("alpha")));
            let fresh = EphemeralKeySlot::new(Arc::new(store));
            assert_eq!(fresh.get().await.unwrap(), Some(json!("beta")));
        });
    }

    #[tokio::test]
    async fn test_cache_checked_before_store() {
        let store = MemorySlotStore::new();
        let slot = EphemeralKeySlot::new(Arc::new(store.clone()));
        slot.set(json!(42)).await.unwrap();

        store.delete(EPHEMERAL_KEY_SLOT).await.unwrap();
        assert_eq!(slot.get().await.unwrap(), Some(json!(42)));
    }

    #[tokio::test]
    async fn test_corrupt_persisted_value_is_an_error() {
        let store = MemorySlotStore::new();
        store.save(EPHEMERAL_KEY_SLOT, "{not json").await.unwrap();

        let slot = EphemeralKeySlot::new(Arc::new(store));
        assert!(slot.get().await.is_err());
    }
}
