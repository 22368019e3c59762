//! # shellcache net
//!
//! Request and response model plus network access for the offline agent.
//!
//! ## Design Goals
//!
//! 1. **Single-read bodies**: a response body can be consumed exactly once;
//!    duplicating it is an explicit step that must happen first
//! 2. **Response tainting**: every network response is classified as
//!    basic, cors, opaque or error relative to the application origin
//! 3. **Pluggable network**: the agent only sees the [`Network`] trait

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use shellcache_common::ShellCacheError;
use thiserror::Error;
use url::Url;

pub mod loader;
pub mod pattern;

pub use loader::{HttpNetwork, LoaderConfig};
pub use pattern::{first_match, PatternType, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Too many redirects fetching {0}")]
    TooManyRedirects(String),

    #[error("Response body already used")]
    BodyUsed,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<NetError> for ShellCacheError {
    fn from(err: NetError) -> Self {
        ShellCacheError::network_with_source("fetch failed", err)
    }
}

/// Unique identifier for a request.
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

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse `url` and create a GET request.
    pub fn parse_get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// How a response relates to the application origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response; everything is visible.
    Basic,
    /// Cross-origin response admitted by `Access-Control-Allow-Origin`.
    Cors,
    /// Cross-origin response with status, headers and body hidden.
    Opaque,
    /// Network error.
    Error,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }
}

impl std::str::FromStr for ResponseType {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(ResponseType::Basic),
            "cors" => Ok(ResponseType::Cors),
            "opaque" => Ok(ResponseType::Opaque),
            "error" => Ok(ResponseType::Error),
            other => Err(NetError::RequestFailed(format!(
                "unknown response type: {}",
                other
            ))),
        }
    }
}

/// Classify a response on behalf of `origin`.
///
/// `chain` is every URL the request visited, starting with the request URL
/// and ending with the final URL. The response is basic only if the whole
/// chain stayed on `origin`; otherwise the final response headers decide
/// between cors and opaque.
pub fn classify_response(origin: &Url, chain: &[Url], headers: &HeaderMap) -> ResponseType {
    let app = origin.origin();
    if chain.iter().all(|url| url.origin() == app) {
        return ResponseType::Basic;
    }

    let serialized = app.ascii_serialization();
    let allowed = headers
        .get("access-control-allow-origin")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "*" || v.trim() == serialized)
        .unwrap_or(false);

    if allowed {
        ResponseType::Cors
    } else {
        ResponseType::Opaque
    }
}

/// A response whose body can be read once.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    /// Whether the request was redirected on the way to `url`.
    pub redirected: bool,
    body: Option<Bytes>,
}

impl Response {
    /// Create a response with a readable body.
    pub fn new(
        url: Url,
        status: u16,
        headers: HeaderMap,
        body: Bytes,
        response_type: ResponseType,
    ) -> Self {
        let status_text = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string();
        Self {
            url,
            status,
            status_text,
            headers,
            response_type,
            redirected: false,
            body: Some(body),
        }
    }

    /// Create an opaque response; status and body are hidden.
    pub fn opaque(url: Url) -> Self {
        Self {
            url,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Opaque,
            redirected: false,
            body: Some(Bytes::new()),
        }
    }

    /// Create a network error response.
    pub fn error(url: Url) -> Self {
        Self {
            url,
            status: 0,
            status_text: String::new(),
            headers: HeaderMap::new(),
            response_type: ResponseType::Error,
            redirected: false,
            body: Some(Bytes::new()),
        }
    }

    /// Check if the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the body has been read.
    pub fn body_used(&self) -> bool {
        self.body.is_none()
    }

    /// Duplicate this response. Must be called before the body is read.
    pub fn try_clone(&self) -> Result<Response, NetError> {
        let body = self.body.clone().ok_or(NetError::BodyUsed)?;
        Ok(Response {
            url: self.url.clone(),
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            response_type: self.response_type,
            redirected: self.redirected,
            body: Some(body),
        })
    }

    /// Read the body, leaving the response marked as used.
    pub fn take_body(&mut self) -> Result<Bytes, NetError> {
        self.body.take().ok_or(NetError::BodyUsed)
    }

    /// Get the body as bytes.
    pub fn bytes(mut self) -> Result<Bytes, NetError> {
        self.take_body()
    }

    /// Get the body as text.
    pub fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Anything that can perform a request.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform `request`. Transport failures are errors; HTTP error
    /// statuses are ordinary responses.
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
