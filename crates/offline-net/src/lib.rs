//! # Offline Net
//!
//! Request model and network access for the offline service worker.
//!
//! ## Design Goals
//!
//! 1. **Host-shaped requests**: method, URL, navigation mode and destination,
//!    exactly what a fetch event reports
//! 2. **Fetch semantics**: HTTP error statuses are responses, only transport
//!    failures are errors
//! 3. **Pluggable network**: strategies talk to a [`Fetcher`], so the real
//!    HTTP client and scripted mocks are interchangeable

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
pub use url::Url;

pub mod http_fetcher;
pub mod mock;

pub use http_fetcher::{HttpFetcher, LoaderConfig};
pub use mock::{MockFetcher, MockRoute};

/// Errors that can occur while fetching from the network.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    SameOrigin,
    #[default]
    NoCors,
    Cors,
}

/// What the requested resource will be used as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    Document,
    Image,
    Style,
    Font,
    Script,
    #[default]
    Other,
}

impl Destination {
    /// Static subresources that never change within a deployment.
    pub fn is_static_asset(self) -> bool {
        matches!(
            self,
            Destination::Image | Destination::Style | Destination::Font | Destination::Script
        )
    }

    /// Infer a destination from the URL path extension.
    ///
    /// For hosts that cannot report one. Paths without an extension, including
    /// directory paths, are treated as documents.
    pub fn guess_from_url(url: &Url) -> Self {
        let path = url.path();
        if path.ends_with('/') {
            return Destination::Document;
        }

        let Some(mime) = mime_guess::from_path(path).first() else {
            let last = path.rsplit('/').next().unwrap_or_default();
            return if last.contains('.') {
                Destination::Other
            } else {
                Destination::Document
            };
        };

        Self::from_mime(&mime)
    }

    fn from_mime(mime: &Mime) -> Self {
        let subtype = mime.subtype().as_str();
        match mime.type_().as_str() {
            "image" => Destination::Image,
            "font" => Destination::Font,
            "text" if subtype == "css" => Destination::Style,
            "text" if subtype == "html" => Destination::Document,
            _ if subtype == "javascript" || subtype == "ecmascript" => Destination::Script,
            _ if subtype.starts_with("font-") || subtype.contains("woff") => Destination::Font,
            _ => Destination::Other,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Destination::Document => "document",
            Destination::Image => "image",
            Destination::Style => "style",
            Destination::Font => "font",
            Destination::Script => "script",
            Destination::Other => "other",
        };
        f.write_str(name)
    }
}

/// An intercepted request. Never mutated once the host hands it over.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub destination: Destination,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET subresource request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            mode: RequestMode::default(),
            destination: Destination::default(),
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            destination: Destination::Document,
            ..Self::get(url)
        }
    }

    /// Parse `url` and create a GET request for it.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::get(url))
    }

    /// Set the method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Identity used to key cached responses: method plus URL without fragment.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        format!("{} {}", self.method, url)
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSource {
    #[default]
    Network,
    Cache,
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl Response {
    /// Create a network response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Network,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Mark as served from a cache partition.
    pub fn from_cache(mut self) -> Self {
        self.source = ResponseSource::Cache;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_cached(&self) -> bool {
        self.source == ResponseSource::Cache
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Network access used by the strategies.
///
/// Implementations resolve with a [`Response`] for any HTTP status and fail
/// only when no response could be obtained at all.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
