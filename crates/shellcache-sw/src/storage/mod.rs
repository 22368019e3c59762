//! Named buckets of request → response pairs.
//!
//! [`CacheStorage`] is the set of buckets; [`Cache`] is one bucket. Entries are
//! keyed by request method and URL, inserted with last-write-wins, and live
//! until their bucket is deleted.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use shellcache_net::{Network, Request, Response, ResponseType};
use tracing::debug;
use url::Url;

use crate::CacheError;

mod memory;
mod sqlite;

pub use memory::MemoryCacheStorage;
pub use sqlite::SqliteCacheStorage;

/// Request identity used as the entry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
        }
    }

    pub fn get(url: &Url) -> Self {
        Self::new("GET", without_fragment(url))
    }
}

/// Fragments never reach the server, so `/a#x` and `/a` share an entry.
fn without_fragment(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

impl From<&Request> for CacheKey {
    fn from(request: &Request) -> Self {
        Self::new(request.method.as_str(), without_fragment(&request.url))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request identity.
    pub key: CacheKey,

    /// Final response URL.
    pub url: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Response type at the time it was stored.
    pub response_type: ResponseType,

    /// Stored at (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot `response` under the identity of `request`. Reads the body.
    pub fn from_response(request: &Request, mut response: Response) -> Result<Self, CacheError> {
        let body = response.take_body()?;
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Ok(Self {
            key: CacheKey::from(request),
            url: response.url.to_string(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers,
            body: body.to_vec(),
            response_type: response.response_type,
            cached_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Rebuild a readable response from this entry.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::Corrupt(format!("{}: {}", self.key, e)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }

        let mut response = Response::new(
            url,
            self.status,
            headers,
            Bytes::from(self.body.clone()),
            self.response_type,
        );
        response.status_text = self.status_text.clone();
        Ok(response)
    }
}

/// One named bucket.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Bucket name.
    fn name(&self) -> &str;

    /// Look up the entry stored for `request`.
    async fn match_request(&self, request: &Request) -> Result<Option<CacheEntry>, CacheError>;

    /// Store one entry, replacing any entry with the same key.
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Store a batch of entries; either all are stored or none.
    async fn put_all(&self, entries: Vec<CacheEntry>) -> Result<(), CacheError>;

    /// Remove one entry.
    async fn delete(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// All keys in the bucket.
    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError>;
}

/// The set of buckets.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError>;

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Delete a bucket and every entry in it.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;

    /// All bucket names, oldest first.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Look up `request` in bucket `name` without creating the bucket.
    async fn match_in(
        &self,
        name: &str,
        request: &Request,
    ) -> Result<Option<CacheEntry>, CacheError> {
        if !self.has(name).await? {
            return Ok(None);
        }
        self.open(name).await?.match_request(request).await
    }
}

/// Fetch every path from the network and store all of them, or none.
///
/// Paths resolve against `base`. Any transport failure or non-2xx status
/// fails the whole batch before anything is written.
pub async fn add_all(
    cache: &dyn Cache,
    network: &dyn Network,
    base: &Url,
    paths: &[String],
) -> Result<usize, CacheError> {
    let requests = paths
        .iter()
        .map(|path| {
            base.join(path)
                .map(Request::get)
                .map_err(|e| CacheError::InvalidUrl(format!("{}: {}", path, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let entries = try_join_all(requests.iter().map(|request| async move {
        let response = network.fetch(request).await?;
        if !response.ok() {
            return Err(CacheError::BadStatus {
                url: request.url.to_string(),
                status: response.status,
            });
        }
        CacheEntry::from_response(request, response)
    }))
    .await?;

    let count = entries.len();
    cache.put_all(entries).await?;
    debug!(cache = cache.name(), count, "Stored batch");
    Ok(count)
}
