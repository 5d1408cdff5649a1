//! Named cache partitions and the backends that persist them.
//!
//! ```text
//! CacheStorage
//!     └── Cache (partition, e.g. "pages-v1")
//!             └── "GET <url>" → CacheEntry
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use offline_net::{Request, Response, ResponseSource};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::CacheError;

// ==================== Entry ====================

/// A stored response, keyed by the identity of the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request method.
    pub method: String,

    /// Request URL, without fragment.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in received order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture `response` as the stored answer for `request`.
    pub fn new(request: &Request, response: &Response) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);

        Self {
            method: request.method.to_string(),
            url: url.to_string(),
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Lookup key, identical to [`Request::cache_key`].
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Rebuild the response, marked as served from cache.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let corrupt = |reason: String| CacheError::CorruptEntry {
            key: self.key(),
            reason,
        };

        let url = Url::parse(&self.url).map_err(|e| corrupt(e.to_string()))?;
        let status = StatusCode::from_u16(self.status).map_err(|e| corrupt(e.to_string()))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str()).map_err(|e| corrupt(e.to_string()))?;
            let value = HeaderValue::try_from(value.as_str()).map_err(|e| corrupt(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response {
            url,
            status,
            headers,
            body: Bytes::from(self.body.clone()),
            source: ResponseSource::Cache,
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ==================== Cache ====================

/// One named partition.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Partition name.
    pub name: String,

    /// Cached entries by request key.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_key(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert an entry, replacing any previous one for the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All request keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Every partition the worker can see, in creation order.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,

    /// Partition names in creation order; cross-partition lookups follow it.
    order: Vec<String>,

    /// Maximum number of entries across all partitions.
    #[serde(default)]
    max_entries: Option<usize>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses writes beyond `max_entries` entries in total.
    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::default()
        }
    }

    /// Change the total entry limit. Storage already past a new limit keeps
    /// its entries but refuses further writes.
    pub fn set_quota(&mut self, max_entries: Option<usize>) {
        self.max_entries = max_entries;
    }

    /// Open a partition, creating it if needed.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Partition names in creation order.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Total entries across all partitions.
    pub fn entry_count(&self) -> usize {
        self.caches.values().map(Cache::len).sum()
    }

    /// Match across all partitions, oldest partition first.
    pub fn match_any(&self, key: &str) -> Option<&CacheEntry> {
        self.order
            .iter()
            .filter_map(|name| self.caches.get(name))
            .find_map(|cache| cache.match_key(key))
    }

    /// Store `entries` into `name`, all of them or none.
    pub fn put_all(&mut self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        if let Some(limit) = self.max_entries {
            let existing = self.caches.get(name);
            let added = entries
                .iter()
                .filter(|e| existing.map_or(true, |c| c.match_key(&e.key()).is_none()))
                .count();
            if self.entry_count() + added > limit {
                return Err(CacheError::QuotaExceeded {
                    partition: name.to_string(),
                    limit,
                });
            }
        }

        let cache = self.open(name);
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    /// Serialize every partition to JSON.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Restore partitions from [`CacheStorage::to_snapshot`] output.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ==================== Backend ====================

/// Persistence behind the cache registry.
///
/// Every call is a suspension point. Each `put` is atomic per entry and a
/// concurrent `put` for the same key wins last.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the partition if it does not exist.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Look up `key` in one partition.
    async fn lookup(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Look up `key` in every partition.
    async fn lookup_any(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Store one entry, creating the partition if needed.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), CacheError>;

    /// Store several entries atomically.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError>;

    /// Names of all partitions present.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a partition. `Ok(false)` when it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;
}

/// In-process backend with optional JSON snapshots on disk.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    storage: Arc<RwLock<CacheStorage>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(storage: CacheStorage) -> Self {
        Self {
            storage: Arc::new(RwLock::new(storage)),
        }
    }

    /// Backend that rejects writes past `max_entries` total entries.
    pub fn with_quota(max_entries: usize) -> Self {
        Self::with_storage(CacheStorage::with_quota(max_entries))
    }

    /// Load a snapshot written by [`MemoryBackend::persist`]. A missing file
    /// yields empty storage.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let storage = CacheStorage::from_snapshot(&bytes)?;
                debug!(path = %path.display(), partitions = storage.keys().len(), "Loaded cache snapshot");
                Ok(Self::with_storage(storage))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write every partition to `path`.
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let bytes = self.storage.read().await.to_snapshot()?;
        tokio::fs::write(path.as_ref(), bytes).await?;
        debug!(path = %path.as_ref().display(), "Persisted cache snapshot");
        Ok(())
    }

    /// Shared handle to the underlying storage.
    pub fn storage(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.storage)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.storage.write().await.open(name);
        Ok(())
    }

    async fn lookup(&self, name: &str, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let storage = self.storage.read().await;
        let entry = storage.get(name).and_then(|c| c.match_key(key)).cloned();
        trace!(partition = name, key, hit = entry.is_some(), "Cache lookup");
        Ok(entry)
    }

    async fn lookup_any(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entry = self.storage.read().await.match_any(key).cloned();
        trace!(key, hit = entry.is_some(), "Cache lookup across partitions");
        Ok(entry)
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.storage.write().await.put_all(name, vec![entry])
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        self.storage.write().await.put_all(name, entries)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Ok(self
            .storage
            .read()
            .await
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.storage.write().await.delete(name))
    }
}
