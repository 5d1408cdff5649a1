//! Scripted fetcher for tests and offline hosts.
//!
//! Routes are keyed by absolute URL. Unrouted URLs fail like a dropped
//! connection, which is what a worker sees when the device is offline.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response, ResponseSource};

/// How the mock answers a URL.
#[derive(Debug, Clone)]
pub enum MockRoute {
    /// Answer with this status and body, optionally after a delay.
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        delay: Option<Duration>,
    },
    /// Fail as a transport error.
    Fail(String),
    /// Never resolve.
    Hang,
}

/// A [`Fetcher`] answering from scripted routes and counting calls per URL.
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, MockRoute>>,
    calls: Mutex<HashMap<String, usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the route for a URL, replacing any previous one.
    pub fn route(&self, url: &str, route: MockRoute) -> &Self {
        lock(&self.routes).insert(normalize(url), route);
        self
    }

    /// Answer `url` with `status` and `body`.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        self.route(
            url,
            MockRoute::Respond {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                headers: HeaderMap::new(),
                body: body.into(),
                delay: None,
            },
        )
    }

    /// Answer `url` with a 200 after `delay`.
    pub fn respond_after(&self, url: &str, delay: Duration, body: impl Into<Bytes>) -> &Self {
        self.route(
            url,
            MockRoute::Respond {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: body.into(),
                delay: Some(delay),
            },
        )
    }

    /// Fail `url` with a transport error.
    pub fn fail(&self, url: &str) -> &Self {
        self.route(url, MockRoute::Fail("connection refused".to_string()))
    }

    /// Leave requests for `url` pending forever.
    pub fn hang(&self, url: &str) -> &Self {
        self.route(url, MockRoute::Hang)
    }

    /// Drop every route; all URLs fail from now on.
    pub fn go_offline(&self) {
        lock(&self.routes).clear();
    }

    /// Number of fetches issued for `url`.
    pub fn calls(&self, url: &str) -> usize {
        lock(&self.calls).get(&normalize(url)).copied().unwrap_or(0)
    }

    /// Number of fetches issued overall.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        *lock(&self.calls).entry(key.clone()).or_insert(0) += 1;

        let route = lock(&self.routes).get(&key).cloned();
        trace!(url = %key, route = ?route, "Mock fetch");

        match route {
            Some(MockRoute::Respond {
                status,
                headers,
                body,
                delay,
            }) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(Response {
                    url: request.url.clone(),
                    status,
                    headers,
                    body,
                    source: ResponseSource::Network,
                })
            }
            Some(MockRoute::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            Some(MockRoute::Hang) => std::future::pending::<Result<Response, NetError>>().await,
            None => Err(NetError::RequestFailed(format!("offline: {key}"))),
        }
    }
}
