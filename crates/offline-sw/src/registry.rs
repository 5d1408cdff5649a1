//! Versioned cache partitions.

use std::fmt;
use std::sync::Arc;

use offline_net::{Request, Response};
use tracing::trace;

use crate::storage::{CacheBackend, CacheEntry};
use crate::CacheError;

/// What a partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionRole {
    /// Precached critical files.
    Shell,
    /// Navigable HTML documents.
    Pages,
    /// Images, styles, fonts and scripts.
    Assets,
}

impl PartitionRole {
    pub const ALL: [PartitionRole; 3] = [
        PartitionRole::Shell,
        PartitionRole::Pages,
        PartitionRole::Assets,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PartitionRole::Shell => "shell",
            PartitionRole::Pages => "pages",
            PartitionRole::Assets => "assets",
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Names and owns the three partitions of one cache version.
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct CacheRegistry {
    version: Arc<str>,
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl CacheRegistry {
    pub fn new(version: &str, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            version: Arc::from(version),
            backend,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `"<role>-<version>"`.
    pub fn partition_name(&self, role: PartitionRole) -> String {
        format!("{}-{}", role, self.version)
    }

    /// Names of the current version's partitions.
    pub fn current_names(&self) -> [String; 3] {
        PartitionRole::ALL.map(|role| self.partition_name(role))
    }

    /// Role of a current-version partition name.
    pub fn role_of(&self, name: &str) -> Option<PartitionRole> {
        PartitionRole::ALL
            .into_iter()
            .find(|role| self.partition_name(*role) == name)
    }

    pub fn is_current(&self, name: &str) -> bool {
        self.role_of(name).is_some()
    }

    /// Open (or create) the partition for `role`.
    pub async fn open(&self, role: PartitionRole) -> Result<String, CacheError> {
        let name = self.partition_name(role);
        self.backend.open(&name).await?;
        Ok(name)
    }

    /// Cached response for `request` in the `role` partition.
    pub async fn lookup(
        &self,
        role: PartitionRole,
        request: &Request,
    ) -> Result<Option<Response>, CacheError> {
        let name = self.partition_name(role);
        let entry = self.backend.lookup(&name, &request.cache_key()).await?;
        entry.as_ref().map(CacheEntry::to_response).transpose()
    }

    /// Cached response for `request` in any partition.
    pub async fn lookup_any(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let entry = self.backend.lookup_any(&request.cache_key()).await?;
        entry.as_ref().map(CacheEntry::to_response).transpose()
    }

    /// Store a copy of `response` for `request`, overwriting any prior entry.
    pub async fn store(
        &self,
        role: PartitionRole,
        request: &Request,
        response: &Response,
    ) -> Result<(), CacheError> {
        let name = self.partition_name(role);
        trace!(partition = %name, url = %request.url, status = %response.status, "Cache put");
        self.backend.put(&name, CacheEntry::new(request, response)).await
    }

    /// Store every pair, or none of them.
    pub async fn store_all(
        &self,
        role: PartitionRole,
        pairs: &[(Request, Response)],
    ) -> Result<(), CacheError> {
        let name = self.partition_name(role);
        let entries = pairs
            .iter()
            .map(|(request, response)| CacheEntry::new(request, response))
            .collect();
        self.backend.put_all(&name, entries).await
    }

    /// Every partition name present in storage, any version.
    pub async fn partitions(&self) -> Result<Vec<String>, CacheError> {
        self.backend.keys().await
    }

    /// Delete a partition by name.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.backend.delete(name).await
    }
}
