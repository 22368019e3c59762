//! In-memory bucket storage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use shellcache_net::Request;
use tokio::sync::RwLock;

use super::{Cache, CacheEntry, CacheKey, CacheStorage};
use crate::CacheError;

/// A bucket held in memory.
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    created: u64,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// Set once the bucket is deleted; handles still held go read-empty and
    /// reject writes.
    deleted: AtomicBool,
}

impl MemoryCache {
    fn new(name: &str, created: u64) -> Self {
        Self {
            name: name.to_string(),
            created,
            entries: RwLock::new(HashMap::new()),
            deleted: AtomicBool::new(false),
        }
    }

    fn check_live(&self) -> Result<(), CacheError> {
        if self.deleted.load(Ordering::Acquire) {
            return Err(CacheError::BucketDeleted(self.name.clone()));
        }
        Ok(())
    }

    async fn close(&self) {
        let mut entries = self.entries.write().await;
        self.deleted.store(true, Ordering::Release);
        entries.clear();
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<CacheEntry>, CacheError> {
        let key = CacheKey::from(request);
        Ok(self.entries.read().await.get(&key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut map = self.entries.write().await;
        self.check_live()?;
        map.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn put_all(&self, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        let mut map = self.entries.write().await;
        self.check_live()?;
        for entry in entries {
            map.insert(entry.key.clone(), entry);
        }
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        let mut keys: Vec<CacheKey> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Bucket storage that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
    next_created: AtomicU64,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        if name.is_empty() {
            return Err(CacheError::EmptyName);
        }

        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| {
                let created = self.next_created.fetch_add(1, Ordering::Relaxed);
                Arc::new(MemoryCache::new(name, created))
            })
            .clone();
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let removed = self.caches.write().await.remove(name);
        match removed {
            Some(cache) => {
                cache.close().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let caches = self.caches.read().await;
        let mut named: Vec<(u64, String)> = caches
            .values()
            .map(|c| (c.created, c.name.clone()))
            .collect();
        named.sort();
        Ok(named.into_iter().map(|(_, name)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use shellcache_net::{Response, ResponseType};
    use url::Url;

    fn entry(url: &str, body: &'static [u8]) -> CacheEntry {
        let request = Request::parse_get(url).unwrap();
        let response = Response::new(
            request.url.clone(),
            200,
            HeaderMap::new(),
            Bytes::from_static(body),
            ResponseType::Basic,
        );
        CacheEntry::from_response(&request, response).unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_once() {
        let storage = MemoryCacheStorage::new();
        assert!(!storage.has("v1").await.unwrap());

        let first = storage.open("v1").await.unwrap();
        first.put(entry("https://app.example/", b"a")).await.unwrap();

        let second = storage.open("v1").await.unwrap();
        assert_eq!(second.keys().await.unwrap().len(), 1);
        assert!(storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let storage = MemoryCacheStorage::new();
        assert!(matches!(storage.open("").await, Err(CacheError::EmptyName)));
    }

    #[tokio::test]
    async fn test_keys_in_creation_order() {
        let storage = MemoryCacheStorage::new();
        storage.open("b").await.unwrap();
        storage.open("a").await.unwrap();
        storage.open("c").await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_put_last_write_wins() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        cache.put(entry("https://app.example/", b"old")).await.unwrap();
        cache.put(entry("https://app.example/", b"new")).await.unwrap();

        let request = Request::parse_get("https://app.example/").unwrap();
        let found = cache.match_request(&request).await.unwrap().unwrap();
        assert_eq!(found.body, b"new");
        assert_eq!(cache.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_bucket_drops_entries() {
        let storage = MemoryCacheStorage::new();
        storage
            .open("old")
            .await
            .unwrap()
            .put(entry("https://app.example/", b"x"))
            .await
            .unwrap();

        assert!(storage.delete("old").await.unwrap());
        assert!(!storage.delete("old").await.unwrap());

        let reopened = storage.open("old").await.unwrap();
        assert!(reopened.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_handle_after_delete() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("gone").await.unwrap();
        cache.put(entry("https://app.example/", b"x")).await.unwrap();
        storage.delete("gone").await.unwrap();

        assert!(cache.keys().await.unwrap().is_empty());
        assert!(matches!(
            cache.put(entry("https://app.example/", b"y")).await,
            Err(CacheError::BucketDeleted(name)) if name == "gone"
        ));
        assert!(matches!(
            cache.put_all(vec![entry("https://app.example/a", b"z")]).await,
            Err(CacheError::BucketDeleted(_))
        ));

        // A fresh bucket under the same name is unaffected.
        let fresh = storage.open("gone").await.unwrap();
        fresh.put(entry("https://app.example/", b"new")).await.unwrap();
        assert_eq!(fresh.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_match_in_does_not_create() {
        let storage = MemoryCacheStorage::new();
        let request = Request::get(Url::parse("https://app.example/").unwrap());
        assert!(storage.match_in("v1", &request).await.unwrap().is_none());
        assert!(!storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        let e = entry("https://app.example/a.js", b"js");
        let key = e.key.clone();
        cache.put(e).await.unwrap();

        assert!(cache.delete(&key).await.unwrap());
        assert!(!cache.delete(&key).await.unwrap());
    }
}
