//! # Offline Service Worker
//!
//! Offline support for a static site: intercepted requests are answered from
//! versioned cache partitions or the network, depending on what they are.
//!
//! ## Features
//!
//! - **Versioned partitions**: `shell-<version>`, `pages-<version>`, `assets-<version>`
//! - **Precache**: the app shell is fetched all-or-nothing at install
//! - **Garbage collection**: partitions from other versions are dropped at activation
//! - **Routing**: navigations use stale-while-revalidate, static assets use
//!   cache-first, everything else goes network-first with an offline page
//!
//! ## Architecture
//!
//! ```text
//! WorkerHandle ── Install / Activate / Fetch ──→ ServiceWorker (dispatch loop)
//!                                                    │
//!                      ┌─────────────────────────────┼──────────────────┐
//!                      │                             │                  │
//!               precache (install)           gc (activate)        FetchRouter
//!                      │                             │              │      │
//!                      └──────────── CacheRegistry ──┴── Strategies ┘  RequestClassifier
//!                                         │
//!                                   CacheBackend (MemoryBackend)
//! ```

use thiserror::Error;

pub mod classify;
pub mod config;
pub mod gc;
pub mod precache;
pub mod registry;
pub mod storage;
pub mod strategy;
pub mod worker;

pub use classify::{RequestClassifier, Route};
pub use config::{WorkerConfig, CACHE_VERSION, EXCLUDED_SCHEMES, OFFLINE_PAGE, PRECACHE_MANIFEST};
pub use gc::{collect_stale_partitions, GcReport};
pub use precache::precache_shell;
pub use registry::{CacheRegistry, PartitionRole};
pub use storage::{Cache, CacheBackend, CacheEntry, CacheStorage, MemoryBackend};
pub use strategy::{Background, Strategies};
pub use worker::{
    ActivateOutcome, FetchDisposition, FetchRouter, InstallOutcome, ServiceWorker,
    WorkerEvent, WorkerHandle, WorkerId, WorkerState,
};

pub use offline_common::{init_logging, LogConfig, LogFormat};
pub use offline_net::{Destination, Fetcher, Request, RequestMode, Response, ResponseSource};

// ==================== Errors ====================

/// Errors raised by a cache backend.
#[derive(Error, Debug)]
pub enum CacheError {
    /// `limit` counts entries across every partition, not just `partition`.
    #[error("Quota exceeded writing to {partition}: storage holds at most {limit} entries in total")]
    QuotaExceeded { partition: String, limit: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed fetching {url}: {reason}")]
    InstallFetchFailure { url: String, reason: String },

    #[error("Failed to delete partition {name}: {source}")]
    PartitionDeleteFailure {
        name: String,
        #[source]
        source: CacheError,
    },

    #[error("No response or offline page for navigation to {0}")]
    NoFallbackAvailable(String),

    #[error("No response available for {0}")]
    NoResponseAvailable(String),

    #[error("Asset unavailable: {0}")]
    AssetUnavailable(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Worker stopped")]
    WorkerGone,
}

impl ServiceWorkerError {
    /// True when the host should surface its own network-error page.
    pub fn is_failed_fetch(&self) -> bool {
        matches!(
            self,
            ServiceWorkerError::NoFallbackAvailable(_)
                | ServiceWorkerError::NoResponseAvailable(_)
                | ServiceWorkerError::AssetUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_fetch_classification() {
        assert!(ServiceWorkerError::NoFallbackAvailable("/".into()).is_failed_fetch());
        assert!(ServiceWorkerError::AssetUnavailable("/a.png".into()).is_failed_fetch());
        assert!(!ServiceWorkerError::WorkerGone.is_failed_fetch());
        assert!(!ServiceWorkerError::Cache(CacheError::Storage("x".into())).is_failed_fetch());
    }

    #[test]
    fn test_delete_failure_keeps_source() {
        use std::error::Error as _;

        let err = ServiceWorkerError::PartitionDeleteFailure {
            name: "pages-v0".into(),
            source: CacheError::Storage("locked".into()),
        };
        assert!(err.to_string().contains("pages-v0"));
        assert!(err.source().is_some());
    }
}
