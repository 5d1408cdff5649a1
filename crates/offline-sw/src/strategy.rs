//! Cache-first, stale-while-revalidate and network-first executors.
//!
//! Cache writes are side effects: they run on background tasks, never delay
//! the response already in hand, and their failures are logged and dropped.

use std::future::Future;
use std::sync::Arc;

use http::StatusCode;
use offline_net::{Fetcher, Request, Response};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::registry::{CacheRegistry, PartitionRole};
use crate::{Result, ServiceWorkerError};

// ==================== Background ====================

/// Tracks fire-and-forget work so it can be awaited later.
///
/// Tasks are detached: they run to completion even if nobody waits for them
/// or a waiter gives up early.
#[derive(Debug, Clone)]
pub struct Background {
    active: Arc<watch::Sender<usize>>,
}

impl Default for Background {
    fn default() -> Self {
        let (active, _) = watch::channel(0);
        Self {
            active: Arc::new(active),
        }
    }
}

impl Background {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` on the current runtime.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.active.send_modify(|n| *n += 1);
        let guard = ActiveGuard(Arc::clone(&self.active));
        tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    /// Number of tasks still running.
    pub fn pending(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until every spawned task, including ones spawned meanwhile, ends.
    ///
    /// Dropping the returned future stops the wait, never the tasks.
    pub async fn settle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Decrements the running count when a task ends, including by panic.
struct ActiveGuard(Arc<watch::Sender<usize>>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("Background task did not complete");
        }
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// ==================== Strategies ====================

/// The three request strategies over one registry and network.
#[derive(Clone)]
pub struct Strategies {
    registry: CacheRegistry,
    fetcher: Arc<dyn Fetcher>,
    offline_page: Request,
    background: Background,
}

impl Strategies {
    pub fn new(registry: CacheRegistry, fetcher: Arc<dyn Fetcher>, offline_page: Request) -> Self {
        Self {
            registry,
            fetcher,
            offline_page,
            background: Background::new(),
        }
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    /// Navigations: answer from the pages partition when possible and refresh
    /// it from the network either way.
    ///
    /// With a cached page the network is not awaited. Without one the network
    /// decides: its response (any status) or, when it fails, the offline page.
    pub async fn stale_while_revalidate(&self, request: &Request) -> Result<Response> {
        if let Some(cached) = self.registry.lookup(PartitionRole::Pages, request).await? {
            trace!(url = %request.url, "Serving stale page, revalidating");
            let registry = self.registry.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let request = request.clone();
            self.background.spawn(async move {
                match fetcher.fetch(&request).await {
                    Ok(fresh) if fresh.ok() => {
                        if let Err(e) = registry.store(PartitionRole::Pages, &request, &fresh).await {
                            warn!(url = %request.url, error = %e, "Failed to cache revalidated page");
                        }
                    }
                    Ok(fresh) => {
                        debug!(url = %request.url, status = %fresh.status, "Revalidation not cached")
                    }
                    Err(e) => debug!(url = %request.url, error = %e, "Revalidation failed"),
                }
            });
            return Ok(cached);
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.store_in_background(PartitionRole::Pages, request, &response);
                }
                Ok(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation failed, trying offline page");
                self.offline_fallback()
                    .await?
                    .ok_or_else(|| ServiceWorkerError::NoFallbackAvailable(request.url.to_string()))
            }
        }
    }

    /// Static assets: a cache hit never touches the network. A miss fetches,
    /// caching exactly-200 responses.
    ///
    /// `Ok(None)` means neither cache nor network produced a response.
    pub async fn cache_first(&self, request: &Request) -> Result<Option<Response>> {
        if let Some(cached) = self.registry.lookup(PartitionRole::Assets, request).await? {
            trace!(url = %request.url, "Asset cache hit");
            return Ok(Some(cached));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK {
                    self.store_in_background(PartitionRole::Assets, request, &response);
                }
                Ok(Some(response))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Asset unavailable");
                Ok(None)
            }
        }
    }

    /// Everything else: the network answer is returned as-is, whatever its
    /// status, and never cached. Caches and the offline page are consulted
    /// only when the network fails outright.
    pub async fn network_first(&self, request: &Request) -> Result<Response> {
        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying caches");
                if let Some(cached) = self.registry.lookup_any(request).await? {
                    return Ok(cached);
                }
                self.offline_fallback()
                    .await?
                    .ok_or_else(|| ServiceWorkerError::NoResponseAvailable(request.url.to_string()))
            }
        }
    }

    async fn offline_fallback(&self) -> Result<Option<Response>> {
        Ok(self.registry.lookup_any(&self.offline_page).await?)
    }

    fn store_in_background(&self, role: PartitionRole, request: &Request, response: &Response) {
        let registry = self.registry.clone();
        let request = request.clone();
        let response = response.clone();
        self.background.spawn(async move {
            if let Err(e) = registry.store(role, &request, &response).await {
                warn!(url = %request.url, partition = %role, error = %e, "Cache write failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use offline_net::{Destination, MockFetcher, Url};
    use std::time::Duration;

    const OFFLINE: &str = "https://site.test/offline.html";

    struct Fixture {
        strategies: Strategies,
        fetcher: Arc<MockFetcher>,
    }

    fn fixture_with(backend: MemoryBackend) -> Fixture {
        let fetcher = Arc::new(MockFetcher::new());
        let registry = CacheRegistry::new("v1", Arc::new(backend));
        let offline = Request::get(Url::parse(OFFLINE).unwrap());
        let strategies = Strategies::new(registry, fetcher.clone(), offline);
        Fixture { strategies, fetcher }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryBackend::new())
    }

    fn navigate(url: &str) -> Request {
        Request::navigate(Url::parse(url).unwrap())
    }

    fn asset(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap()).destination(Destination::Image)
    }

    async fn seed(f: &Fixture, role: PartitionRole, request: &Request, body: &str) {
        let response = Response::new(request.url.clone(), StatusCode::OK, body.to_string());
        f.strategies
            .registry()
            .store(role, request, &response)
            .await
            .unwrap();
    }

    async fn seed_offline_page(f: &Fixture) {
        let request = Request::get(Url::parse(OFFLINE).unwrap());
        seed(f, PartitionRole::Shell, &request, "you are offline").await;
    }

    // ----- stale-while-revalidate -----

    #[tokio::test]
    async fn test_swr_returns_cached_then_refreshes() {
        let f = fixture();
        let request = navigate("https://site.test/jee.html");
        seed(&f, PartitionRole::Pages, &request, "R").await;
        f.fetcher.respond("https://site.test/jee.html", 200, "R2");

        let response = f.strategies.stale_while_revalidate(&request).await.unwrap();
        assert_eq!(response.text(), "R");
        assert!(response.is_cached());

        f.strategies.background().settle().await;
        let refreshed = f
            .strategies
            .registry()
            .lookup(PartitionRole::Pages, &request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.text(), "R2");
    }

    #[tokio::test]
    async fn test_swr_does_not_wait_for_network_when_cached() {
        let f = fixture();
        let request = navigate("https://site.test/tips.html");
        seed(&f, PartitionRole::Pages, &request, "cached").await;
        f.fetcher.hang("https://site.test/tips.html");

        let response = tokio::time::timeout(
            Duration::from_secs(1),
            f.strategies.stale_while_revalidate(&request),
        )
        .await
        .expect("cached navigation must not wait on the network")
        .unwrap();
        assert_eq!(response.text(), "cached");
    }

    #[tokio::test]
    async fn test_swr_miss_uses_network_and_caches() {
        let f = fixture();
        let request = navigate("https://site.test/g.html");
        f.fetcher.respond("https://site.test/g.html", 200, "games");

        let response = f.strategies.stale_while_revalidate(&request).await.unwrap();
        assert_eq!(response.text(), "games");
        assert!(!response.is_cached());

        f.strategies.background().settle().await;
        assert!(f
            .strategies
            .registry()
            .lookup(PartitionRole::Pages, &request)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_swr_miss_does_not_cache_error_pages() {
        let f = fixture();
        let request = navigate("https://site.test/missing.html");
        f.fetcher.respond("https://site.test/missing.html", 404, "not found");

        let response = f.strategies.stale_while_revalidate(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        f.strategies.background().settle().await;
        assert!(f
            .strategies
            .registry()
            .lookup(PartitionRole::Pages, &request)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_swr_offline_serves_offline_page() {
        let f = fixture();
        seed_offline_page(&f).await;

        let response = f
            .strategies
            .stale_while_revalidate(&navigate("https://site.test/neet.html"))
            .await
            .unwrap();
        assert_eq!(response.text(), "you are offline");
    }

    #[tokio::test]
    async fn test_swr_no_fallback() {
        let f = fixture();
        let result = f
            .strategies
            .stale_while_revalidate(&navigate("https://site.test/neet.html"))
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::NoFallbackAvailable(_))));
    }

    #[tokio::test]
    async fn test_swr_failed_revalidation_keeps_cached_copy() {
        let f = fixture();
        let request = navigate("https://site.test/table.html");
        seed(&f, PartitionRole::Pages, &request, "old").await;

        let response = f.strategies.stale_while_revalidate(&request).await.unwrap();
        assert_eq!(response.text(), "old");

        f.strategies.background().settle().await;
        let still = f
            .strategies
            .registry()
            .lookup(PartitionRole::Pages, &request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still.text(), "old");
    }

    #[tokio::test]
    async fn test_swr_error_revalidation_keeps_cached_copy() {
        for status in [404, 500] {
            let f = fixture();
            let request = navigate("https://site.test/settings.html");
            seed(&f, PartitionRole::Pages, &request, "good").await;
            f.fetcher.respond("https://site.test/settings.html", status, "bad");

            let response = f.strategies.stale_while_revalidate(&request).await.unwrap();
            assert_eq!(response.text(), "good");

            f.strategies.background().settle().await;
            assert_eq!(f.fetcher.calls("https://site.test/settings.html"), 1);
            let kept = f
                .strategies
                .registry()
                .lookup(PartitionRole::Pages, &request)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(kept.text(), "good", "status {status}");
        }
    }

    #[tokio::test]
    async fn test_swr_full_storage_still_serves_stale_copy() {
        let backend = MemoryBackend::new();
        let storage = backend.storage();
        let f = fixture_with(backend);
        let request = navigate("https://site.test/registration.html");
        seed(&f, PartitionRole::Pages, &request, "old").await;
        storage.write().await.set_quota(Some(0));
        f.fetcher.respond("https://site.test/registration.html", 200, "new");

        let response = f.strategies.stale_while_revalidate(&request).await.unwrap();
        assert_eq!(response.text(), "old");
        assert!(response.is_cached());

        f.strategies.background().settle().await;
        assert_eq!(f.fetcher.calls("https://site.test/registration.html"), 1);
        let kept = f
            .strategies
            .registry()
            .lookup(PartitionRole::Pages, &request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.text(), "old");
    }

    #[tokio::test]
    async fn test_swr_miss_with_full_storage_returns_network_page() {
        let f = fixture_with(MemoryBackend::with_quota(0));
        let request = navigate("https://site.test/bio-data-pop-up.html");
        f.fetcher.respond("https://site.test/bio-data-pop-up.html", 200, "bio");

        let response = f.strategies.stale_while_revalidate(&request).await.unwrap();
        assert_eq!(response.text(), "bio");

        f.strategies.background().settle().await;
        assert!(f
            .strategies
            .registry()
            .lookup(PartitionRole::Pages, &request)
            .await
            .unwrap()
            .is_none());
    }

    // ----- cache-first -----

    #[tokio::test]
    async fn test_cache_first_fetches_once() {
        let f = fixture();
        let url = "https://site.test/logo.png";
        f.fetcher.respond(url, 200, "B");

        let first = f.strategies.cache_first(&asset(url)).await.unwrap().unwrap();
        assert_eq!(first.text(), "B");
        f.strategies.background().settle().await;

        let second = f.strategies.cache_first(&asset(url)).await.unwrap().unwrap();
        assert_eq!(second.text(), "B");
        assert!(second.is_cached());
        assert_eq!(f.fetcher.calls(url), 1);
    }

    #[tokio::test]
    async fn test_cache_first_only_caches_200() {
        let f = fixture();
        let url = "https://site.test/partial.png";
        f.fetcher.respond(url, 203, "non-authoritative");

        let response = f.strategies.cache_first(&asset(url)).await.unwrap().unwrap();
        assert_eq!(response.status.as_u16(), 203);
        f.strategies.background().settle().await;

        assert!(f
            .strategies
            .registry()
            .lookup(PartitionRole::Assets, &asset(url))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cache_first_double_miss_is_none() {
        let f = fixture();
        seed_offline_page(&f).await;

        let result = f
            .strategies
            .cache_first(&asset("https://site.test/gone.png"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_cache_first_empty_body_is_a_response() {
        let f = fixture();
        let url = "https://site.test/empty.css";
        f.fetcher.respond(url, 200, "");

        let response = f.strategies.cache_first(&asset(url)).await.unwrap();
        assert!(response.is_some_and(|r| r.body.is_empty()));
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_returns_response() {
        let f = fixture_with(MemoryBackend::with_quota(0));
        let url = "https://site.test/big.png";
        f.fetcher.respond(url, 200, "pixels");

        let response = f.strategies.cache_first(&asset(url)).await.unwrap().unwrap();
        assert_eq!(response.text(), "pixels");

        f.strategies.background().settle().await;
        assert!(f
            .strategies
            .registry()
            .lookup(PartitionRole::Assets, &asset(url))
            .await
            .unwrap()
            .is_none());
    }

    // ----- network-first -----

    #[tokio::test]
    async fn test_network_first_passes_error_status_through() {
        let f = fixture();
        let url = "https://site.test/api/get_coins";
        let request = Request::get(Url::parse(url).unwrap());
        seed(&f, PartitionRole::Shell, &request, "stale coins").await;
        f.fetcher.respond(url, 500, "boom");

        let response = f.strategies.network_first(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text(), "boom");
    }

    #[tokio::test]
    async fn test_network_first_never_caches() {
        let f = fixture();
        let url = "https://site.test/api/get_timer";
        let request = Request::get(Url::parse(url).unwrap());
        f.fetcher.respond(url, 200, "42");

        f.strategies.network_first(&request).await.unwrap();
        f.strategies.background().settle().await;

        assert!(f.strategies.registry().lookup_any(&request).await.unwrap().is_none());
        assert_eq!(f.strategies.background().pending(), 0);
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_any_partition() {
        let f = fixture();
        let request = Request::get(Url::parse("https://site.test/manifest.json").unwrap());
        seed(&f, PartitionRole::Shell, &request, "{}").await;

        let response = f.strategies.network_first(&request).await.unwrap();
        assert_eq!(response.text(), "{}");
        assert!(response.is_cached());
    }

    #[tokio::test]
    async fn test_network_first_offline_page_then_error() {
        let f = fixture();
        let request = Request::get(Url::parse("https://site.test/api/get_coins").unwrap());

        let result = f.strategies.network_first(&request).await;
        assert!(matches!(result, Err(ServiceWorkerError::NoResponseAvailable(_))));

        seed_offline_page(&f).await;
        let response = f.strategies.network_first(&request).await.unwrap();
        assert_eq!(response.text(), "you are offline");
    }

    #[tokio::test]
    async fn test_background_settle_waits_for_tasks() {
        let background = Background::new();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&done);
        background.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        background.settle().await;
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(background.pending(), 0);
    }

    #[tokio::test]
    async fn test_background_settle_with_nothing_pending() {
        let background = Background::new();
        tokio::time::timeout(Duration::from_secs(1), background.settle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_settle_does_not_cancel_revalidation() {
        let f = fixture();
        let request = navigate("https://site.test/jee.html");
        seed(&f, PartitionRole::Pages, &request, "R").await;
        f.fetcher
            .respond_after("https://site.test/jee.html", Duration::from_millis(50), "R2");

        let response = f.strategies.stale_while_revalidate(&request).await.unwrap();
        assert_eq!(response.text(), "R");

        let waited =
            tokio::time::timeout(Duration::from_millis(5), f.strategies.background().settle()).await;
        assert!(waited.is_err());
        assert_eq!(f.strategies.background().pending(), 1);

        f.strategies.background().settle().await;
        let refreshed = f
            .strategies
            .registry()
            .lookup(PartitionRole::Pages, &request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.text(), "R2");
    }
}
