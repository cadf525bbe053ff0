//! Key-value storage shared by the originator, republish, and cache stores.
//!
//! All three logical stores share this one implementation; they differ only
//! in which TTL policy the DHT control loop applies and in whether entries
//! are persisted to disk.

use crate::contact::{now, Timestamp};
use crate::error::{Error, Result};
use crate::id::Id;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub value: Vec<u8>,
    pub republish_timestamp: Timestamp,
    pub expiration_ttl_secs: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        now().saturating_sub(self.republish_timestamp) >= self.expiration_ttl_secs
    }
}

/// A store's contract. One trait object per logical store (originator,
/// republish, cache) so the DHT control loop is agnostic to the backing
/// implementation.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn contains(&self, key: &Id) -> bool;
    async fn try_get(&self, key: &Id) -> Option<Vec<u8>>;
    async fn get(&self, key: &Id) -> Result<Vec<u8>>;
    async fn set(&self, key: Id, value: Vec<u8>, ttl_secs: u64) -> Result<()>;
    async fn touch(&self, key: &Id) -> Result<()>;
    async fn remove(&self, key: &Id) -> Result<()>;
    async fn keys(&self) -> Vec<Id>;
    async fn timestamp(&self, key: &Id) -> Result<Timestamp>;
    async fn ttl(&self, key: &Id) -> Result<u64>;
    /// Remove every entry whose TTL has elapsed since its last republish.
    async fn remove_expired(&self) -> Vec<Id>;
}

/// In-memory store, used for the cache store and in tests. Never persisted.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<Id, Entry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn contains(&self, key: &Id) -> bool {
        self.entries.lock().contains_key(key)
    }

    async fn try_get(&self, key: &Id) -> Option<Vec<u8>> {
        self.entries.lock().get(key).map(|e| e.value.clone())
    }

    async fn get(&self, key: &Id) -> Result<Vec<u8>> {
        self.try_get(key)
            .await
            .ok_or(Error::ValueUnexpectedlyAbsent)
    }

    async fn set(&self, key: Id, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        self.entries.lock().insert(
            key,
            Entry {
                value,
                republish_timestamp: now(),
                expiration_ttl_secs: ttl_secs,
            },
        );
        Ok(())
    }

    async fn touch(&self, key: &Id) -> Result<()> {
        let mut guard = self.entries.lock();
        let entry = guard.get_mut(key).ok_or(Error::NotPresent)?;
        entry.republish_timestamp = now();
        Ok(())
    }

    async fn remove(&self, key: &Id) -> Result<()> {
        self.entries
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or(Error::NotPresent)
    }

    async fn keys(&self) -> Vec<Id> {
        self.entries.lock().keys().copied().collect()
    }

    async fn timestamp(&self, key: &Id) -> Result<Timestamp> {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.republish_timestamp)
            .ok_or(Error::NotPresent)
    }

    async fn ttl(&self, key: &Id) -> Result<u64> {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.expiration_ttl_secs)
            .ok_or(Error::NotPresent)
    }

    async fn remove_expired(&self) -> Vec<Id> {
        let mut guard = self.entries.lock();
        let expired: Vec<Id> = guard
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            guard.remove(key);
        }
        expired
    }
}

/// Durable store backed by one JSON snapshot file, written atomically
/// (temp file + rename) so a crash mid-write never corrupts the prior
/// state. Used for the originator and republish stores.
pub struct DurableStorage {
    path: PathBuf,
    inner: MemoryStorage,
}

impl DurableStorage {
    pub async fn open(path: PathBuf) -> Result<Arc<Self>> {
        let entries = if path.exists() {
            let bytes = tokio::fs::read(&path).await?;
            serde_json::from_slice(&bytes)?
        } else {
            HashMap::new()
        };
        let storage = DurableStorage {
            path,
            inner: MemoryStorage {
                entries: Mutex::new(entries),
            },
        };
        Ok(Arc::new(storage))
    }

    async fn flush(&self) -> Result<()> {
        let snapshot: HashMap<Id, Entry> = self.inner.entries.lock().clone();
        let bytes = serde_json::to_vec(&snapshot)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Storage for DurableStorage {
    async fn contains(&self, key: &Id) -> bool {
        self.inner.contains(key).await
    }

    async fn try_get(&self, key: &Id) -> Option<Vec<u8>> {
        self.inner.try_get(key).await
    }

    async fn get(&self, key: &Id) -> Result<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: Id, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        self.inner.set(key, value, ttl_secs).await?;
        self.flush().await
    }

    async fn touch(&self, key: &Id) -> Result<()> {
        self.inner.touch(key).await?;
        self.flush().await
    }

    async fn remove(&self, key: &Id) -> Result<()> {
        self.inner.remove(key).await?;
        self.flush().await
    }

    async fn keys(&self) -> Vec<Id> {
        self.inner.keys().await
    }

    async fn timestamp(&self, key: &Id) -> Result<Timestamp> {
        self.inner.timestamp(key).await
    }

    async fn ttl(&self, key: &Id) -> Result<u64> {
        self.inner.ttl(key).await
    }

    async fn remove_expired(&self) -> Vec<Id> {
        let expired = self.inner.remove_expired().await;
        if !expired.is_empty() {
            let _ = self.flush().await;
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStorage::new();
        let key = Id::random();
        store.set(key, b"hello".to_vec(), 3600).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn missing_key_is_absent() {
        let store = MemoryStorage::new();
        assert!(store.try_get(&Id::random()).await.is_none());
    }

    #[tokio::test]
    async fn remove_expired_drops_stale_entries() {
        let store = MemoryStorage::new();
        let key = Id::random();
        store.set(key, b"x".to_vec(), 0).await.unwrap();
        {
            let mut guard = store.entries.lock();
            let e = guard.get_mut(&key).unwrap();
            e.republish_timestamp = 0;
        }
        let expired = store.remove_expired().await;
        assert_eq!(expired, vec![key]);
        assert!(!store.contains(&key).await);
    }

    #[tokio::test]
    async fn durable_storage_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let key = Id::random();
        {
            let store = DurableStorage::open(path.clone()).await.unwrap();
            store.set(key, b"persisted".to_vec(), 3600).await.unwrap();
        }
        let reopened = DurableStorage::open(path).await.unwrap();
        assert_eq!(reopened.get(&key).await.unwrap(), b"persisted");
    }
}
