//! Per-request routing decision, made before any I/O.

use http::Method;
use offline_net::Request;
use tracing::debug;

use crate::config::WorkerConfig;
use crate::registry::PartitionRole;

/// Strategy selected for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Do not intervene; the host uses its normal network path.
    Passthrough,
    /// Top-level navigation: serve cached page, refresh in background.
    StaleWhileRevalidate,
    /// Static asset: cache first, network on miss.
    CacheFirst,
    /// Everything else: network first, caches and offline page on failure.
    NetworkFirst,
}

impl Route {
    /// Partition the strategy reads and writes; `None` for cross-partition
    /// lookups or no caching at all.
    pub fn partition(self) -> Option<PartitionRole> {
        match self {
            Route::StaleWhileRevalidate => Some(PartitionRole::Pages),
            Route::CacheFirst => Some(PartitionRole::Assets),
            Route::Passthrough | Route::NetworkFirst => None,
        }
    }
}

/// Routes requests by method, scheme, navigation mode and destination.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    excluded_schemes: Vec<String>,
}

impl RequestClassifier {
    pub fn new(excluded_schemes: Vec<String>) -> Self {
        Self { excluded_schemes }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.excluded_schemes.clone())
    }

    /// Select a route. Rules apply in strict priority order, so a navigation
    /// is never treated as an asset whatever its destination says.
    pub fn classify(&self, request: &Request) -> Route {
        let route = if request.method != Method::GET || self.is_excluded(request) {
            Route::Passthrough
        } else if request.is_navigation() {
            Route::StaleWhileRevalidate
        } else if request.destination.is_static_asset() {
            Route::CacheFirst
        } else {
            Route::NetworkFirst
        };

        debug!(
            url = %request.url,
            method = %request.method,
            destination = %request.destination,
            route = ?route,
            "Classified request"
        );
        route
    }

    /// Extension internals, devtools, and anything the cache cannot key.
    fn is_excluded(&self, request: &Request) -> bool {
        let scheme = request.url.scheme();
        if self.excluded_schemes.iter().any(|s| s == scheme) {
            return true;
        }
        !matches!(scheme, "http" | "https")
    }
}
