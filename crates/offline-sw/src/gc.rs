//! Activation-time eviction of partitions from other cache versions.

use futures::future::join_all;
use tracing::{info, warn};

use crate::registry::CacheRegistry;
use crate::{Result, ServiceWorkerError};

/// Outcome of one collection pass.
#[derive(Debug, Default)]
pub struct GcReport {
    /// Stale partitions removed.
    pub deleted: Vec<String>,
    /// Stale partitions that could not be removed.
    pub failed: Vec<ServiceWorkerError>,
}

impl GcReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete every partition whose name is not one of the current three.
///
/// Deletions run concurrently and independently; a failed deletion is logged
/// and reported without stopping the others. Only failing to list partitions
/// is an error.
pub async fn collect_stale_partitions(registry: &CacheRegistry) -> Result<GcReport> {
    let stale: Vec<String> = registry
        .partitions()
        .await?
        .into_iter()
        .filter(|name| !registry.is_current(name))
        .collect();

    let results = join_all(stale.iter().map(|name| registry.delete(name))).await;

    let mut report = GcReport::default();
    for (name, result) in stale.into_iter().zip(results) {
        match result {
            Ok(true) => {
                info!(partition = %name, "Deleted stale partition");
                report.deleted.push(name);
            }
            Ok(false) => {}
            Err(source) => {
                warn!(partition = %name, error = %source, "Failed to delete stale partition");
                report
                    .failed
                    .push(ServiceWorkerError::PartitionDeleteFailure { name, source });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CacheBackend, CacheEntry, MemoryBackend};
    use crate::CacheError;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Backend whose deletes fail for one partition name.
    struct StickyBackend {
        inner: MemoryBackend,
        sticky: &'static str,
    }

    #[async_trait]
    impl CacheBackend for StickyBackend {
        async fn open(&self, name: &str) -> std::result::Result<(), CacheError> {
            self.inner.open(name).await
        }
        async fn lookup(
            &self,
            name: &str,
            key: &str,
        ) -> std::result::Result<Option<CacheEntry>, CacheError> {
            self.inner.lookup(name, key).await
        }
        async fn lookup_any(&self, key: &str) -> std::result::Result<Option<CacheEntry>, CacheError> {
            self.inner.lookup_any(key).await
        }
        async fn put(&self, name: &str, entry: CacheEntry) -> std::result::Result<(), CacheError> {
            self.inner.put(name, entry).await
        }
        async fn put_all(
            &self,
            name: &str,
            entries: Vec<CacheEntry>,
        ) -> std::result::Result<(), CacheError> {
            self.inner.put_all(name, entries).await
        }
        async fn keys(&self) -> std::result::Result<Vec<String>, CacheError> {
            self.inner.keys().await
        }
        async fn delete(&self, name: &str) -> std::result::Result<bool, CacheError> {
            if name == self.sticky {
                return Err(CacheError::Storage("partition in use".to_string()));
            }
            self.inner.delete(name).await
        }
    }

    async fn seed(backend: &dyn CacheBackend, names: &[&str]) {
        for name in names {
            backend.open(name).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_only_current_partitions_survive() {
        let backend = Arc::new(MemoryBackend::new());
        seed(
            &*backend,
            &["shell-v1", "pages-v1", "shell-v2", "pages-v2", "assets-v2", "legacy"],
        )
        .await;

        let registry = CacheRegistry::new("v2", backend);
        let report = collect_stale_partitions(&registry).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.deleted.len(), 3);

        let mut remaining = registry.partitions().await.unwrap();
        remaining.sort();
        let mut expected = registry.current_names().to_vec();
        expected.sort();
        assert_eq!(remaining, expected);
    }

    #[tokio::test]
    async fn test_nothing_stale() {
        let backend = Arc::new(MemoryBackend::new());
        seed(&*backend, &["shell-v1"]).await;

        let registry = CacheRegistry::new("v1", backend);
        let report = collect_stale_partitions(&registry).await.unwrap();
        assert!(report.deleted.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_block_others() {
        let backend = Arc::new(StickyBackend {
            inner: MemoryBackend::new(),
            sticky: "pages-v1",
        });
        seed(&*backend, &["shell-v1", "pages-v1", "assets-v1", "shell-v2"]).await;

        let registry = CacheRegistry::new("v2", backend);
        let report = collect_stale_partitions(&registry).await.unwrap();

        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            &report.failed[0],
            ServiceWorkerError::PartitionDeleteFailure { name, .. } if name == "pages-v1"
        ));

        let remaining = registry.partitions().await.unwrap();
        assert!(remaining.contains(&"pages-v1".to_string()));
        assert!(!remaining.contains(&"shell-v1".to_string()));
    }
}
