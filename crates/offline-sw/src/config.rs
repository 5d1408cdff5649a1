//! Compiled-in deployment constants and the immutable worker configuration.
//!
//! A new deployment builds a new worker with a new [`WorkerConfig`]; a running
//! worker never changes its version.

use url::Url;

use crate::{Result, ServiceWorkerError};

/// Deployment generation of cached content. Bump to invalidate every partition.
pub const CACHE_VERSION: &str = "v1";

/// Document served when neither the network nor a cache can answer.
pub const OFFLINE_PAGE: &str = "/offline.html";

/// App shell fetched at install. Must contain [`OFFLINE_PAGE`].
pub const PRECACHE_MANIFEST: &[&str] = &[
    "/",
    "/index.html",
    "/neet.html",
    "/jee.html",
    "/g.html",
    "/settings.html",
    "/tips.html",
    "/table.html",
    "/calculator.html",
    "/bio-data-pop-up.html",
    "/registration.html",
    "/manifest.json",
    OFFLINE_PAGE,
];

/// URL schemes the worker never intercepts: extension internals and devtools.
pub const EXCLUDED_SCHEMES: &[&str] = &[
    "chrome-extension",
    "moz-extension",
    "safari-extension",
    "safari-web-extension",
    "ms-browser-extension",
    "devtools",
    "chrome-devtools",
];

/// Configuration injected at worker construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Cache version suffix for every partition name.
    pub version: String,
    /// Site origin that manifest paths resolve against.
    pub origin: Url,
    /// Absolute paths precached into the shell partition, in order.
    pub precache: Vec<String>,
    /// Path of the offline fallback document.
    pub offline_page: String,
    /// Schemes passed through untouched.
    pub excluded_schemes: Vec<String>,
}

impl WorkerConfig {
    /// Configuration for `origin` with the compiled-in constants.
    pub fn new(origin: Url) -> Self {
        Self {
            version: CACHE_VERSION.to_string(),
            origin,
            precache: PRECACHE_MANIFEST.iter().map(|p| p.to_string()).collect(),
            offline_page: OFFLINE_PAGE.to_string(),
            excluded_schemes: EXCLUDED_SCHEMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Parse `origin` and build the default configuration for it.
    pub fn for_origin(origin: &str) -> Result<Self> {
        let origin = Url::parse(origin)
            .map_err(|e| ServiceWorkerError::Config(format!("invalid origin {origin}: {e}")))?;
        Ok(Self::new(origin))
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_offline_page(mut self, path: impl Into<String>) -> Self {
        self.offline_page = path.into();
        self
    }

    pub fn with_excluded_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve a manifest path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::Config(format!("cannot resolve {path}: {e}")))
    }

    /// Absolute URL of the offline fallback document.
    pub fn offline_url(&self) -> Result<Url> {
        self.resolve(&self.offline_page)
    }

    /// Check the deployment invariants a worker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::Config("cache version is empty".to_string()));
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::Config(format!(
                "origin must be http(s): {}",
                self.origin
            )));
        }
        for path in &self.precache {
            self.resolve(path)?;
        }
        if !self.precache.iter().any(|p| p == &self.offline_page) {
            return Err(ServiceWorkerError::Config(format!(
                "offline page {} is not precached",
                self.offline_page
            )));
        }
        Ok(())
    }
}
