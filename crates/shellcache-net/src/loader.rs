//! reqwest-backed [`Network`] implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::LOCATION;
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};
use url::Url;

use crate::{classify_response, NetError, Network, Request, Response, ResponseType};

/// Loader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Timeout for each hop in seconds.
    pub timeout_secs: u64,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("shellcache/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            max_redirects: 10,
        }
    }
}

impl LoaderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Performs requests over HTTP on behalf of an application origin.
///
/// Redirects are followed here rather than inside reqwest so that every hop
/// is visible when the response is classified.
pub struct HttpNetwork {
    client: reqwest::Client,
    config: LoaderConfig,
    origin: Url,
}

impl HttpNetwork {
    /// Create a network whose responses are tainted relative to `origin`.
    pub fn new(config: LoaderConfig, origin: Url) -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %origin, "HttpNetwork initialized");

        Ok(Self {
            client,
            config,
            origin,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response, NetError> {
        let mut builder = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers.clone());

        if let Some(body) = body {
            builder = builder.body(body);
        }

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(self.config.timeout())
            } else {
                NetError::HttpError(e)
            }
        })
    }
}

/// Where a redirect response points, resolved against the URL that produced it.
fn redirect_target(response: &reqwest::Response, current: &Url) -> Option<Url> {
    if !matches!(response.status().as_u16(), 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    let location = response.headers().get(LOCATION)?.to_str().ok()?;
    current.join(location).ok()
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut method = request.method.clone();
        let mut body = request.body.clone();
        let mut chain = vec![request.url.clone()];
        let mut current = request.url.clone();

        let response = loop {
            let response = self.send(&method, &current, &request.headers, body.clone()).await?;
            let Some(next) = redirect_target(&response, &current) else {
                break response;
            };

            if chain.len() > self.config.max_redirects {
                return Err(NetError::TooManyRedirects(request.url.to_string()));
            }

            // 303, and 301/302 after a POST, continue as a bodiless GET.
            let status = response.status().as_u16();
            if (status == 303 && method != Method::HEAD)
                || (matches!(status, 301 | 302) && method == Method::POST)
            {
                method = Method::GET;
                body = None;
            }

            trace!(from = %current, to = %next, status, "Following redirect");
            chain.push(next.clone());
            current = next;
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let redirected = chain.len() > 1;
        let response_type = classify_response(&self.origin, &chain, &headers);

        if response_type == ResponseType::Opaque {
            trace!(url = %current, redirected, "Opaque response");
            let mut opaque = Response::opaque(current);
            opaque.redirected = redirected;
            return Ok(opaque);
        }

        let body = response.bytes().await?;

        trace!(
            url = %current,
            status,
            response_type = response_type.as_str(),
            body_len = body.len(),
            "Response received"
        );

        let mut result = Response::new(current, status, headers, body, response_type);
        result.redirected = redirected;
        Ok(result)
    }
}
