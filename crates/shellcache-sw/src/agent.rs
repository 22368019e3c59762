//! The cache-first offline agent.
//!
//! ```text
//! install   open bucket ── add_all(precache) ── errors logged, install completes
//! activate  keys ── delete stale buckets (concurrently) ── claim clients
//! fetch     non-GET ─────────────────────────────────────▶ passthrough
//!           GET ── bucket hit ───────────────────────────▶ cached response
//!               └─ miss ── network ── excluded ──────────▶ response, not stored
//!                             │    └─ 200 basic ── clone ▶ store (background) + response
//!                             │    └─ otherwise ─────────▶ response, not stored
//!                             └─ error ──────────────────▶ failed fetch
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use http::Method;
use shellcache_net::{first_match, NetError, Network, Request, Response, ResponseType};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::clients::Clients;
use crate::config::AgentConfig;
use crate::storage::{add_all, CacheEntry, CacheStorage};
use crate::{ServiceWorkerError, ServiceWorkerId};

// ==================== Events ====================

/// Install lifecycle event.
#[derive(Debug, Clone, Copy)]
pub struct InstallEvent {
    pub worker: ServiceWorkerId,
}

/// Activate lifecycle event.
#[derive(Debug, Clone, Copy)]
pub struct ActivateEvent {
    pub worker: ServiceWorkerId,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The outgoing request.
    pub request: Request,

    /// Client that issued the request.
    pub client_id: Option<String>,

    /// Is navigation request.
    pub is_navigation: bool,
}

impl FetchEvent {
    /// A subresource request from `client_id`.
    pub fn new(request: Request, client_id: Option<String>) -> Self {
        Self {
            request,
            client_id,
            is_navigation: false,
        }
    }

    /// A navigation request (page load).
    pub fn navigation(request: Request) -> Self {
        Self {
            request,
            client_id: None,
            is_navigation: true,
        }
    }
}

/// Where a response handed back by the agent came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// The configured offline fallback, served after a network failure.
    Fallback,
}

/// Result of handling a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The agent did not respond; the host performs the request itself.
    Passthrough,
    /// The agent responded.
    Respond {
        response: Response,
        source: ResponseSource,
    },
    /// The agent took the request but could not produce a response.
    Failed(NetError),
}

impl FetchOutcome {
    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchOutcome::Respond { source, .. } => Some(*source),
            _ => None,
        }
    }
}

/// Lifecycle callbacks invoked by the host.
#[async_trait]
pub trait ServiceWorkerHandler: Send + Sync {
    /// Runs once before the worker can be activated. The host waits for it.
    async fn on_install(&self, event: InstallEvent) -> Result<(), ServiceWorkerError>;

    /// Runs once when the worker takes over. The host waits for it.
    async fn on_activate(&self, event: ActivateEvent) -> Result<(), ServiceWorkerError>;

    /// Runs for every request from a controlled client.
    async fn on_fetch(&self, event: FetchEvent) -> FetchOutcome;
}

// ==================== Agent ====================

/// Cache-first agent with network fallback and opportunistic population.
pub struct OfflineCacheAgent {
    config: Arc<AgentConfig>,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clients: Arc<Clients>,
    pending: Mutex<JoinSet<()>>,
}

impl OfflineCacheAgent {
    /// Create an agent; `config` should already be validated.
    pub fn new(
        config: AgentConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
        clients: Arc<Clients>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            network,
            clients,
            pending: Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Wait for every background store started so far. Returns how many
    /// were awaited.
    pub async fn wait_for_pending_writes(&self) -> usize {
        let mut set = std::mem::take(&mut *self.pending.lock().await);
        let mut settled = 0;
        while let Some(result) = set.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background store task failed");
            }
            settled += 1;
        }
        settled
    }

    /// Store `response` for `request` without delaying the caller.
    async fn store_in_background(&self, request: Request, response: Response) {
        let storage = Arc::clone(&self.storage);
        let cache_name = self.config.cache_name.clone();

        let mut pending = self.pending.lock().await;
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            let result = async {
                let entry = CacheEntry::from_response(&request, response)?;
                let cache = storage.open(&cache_name).await?;
                cache.put(entry).await
            }
            .await;

            match result {
                Ok(()) => trace!(url = %request.url, "Stored response"),
                Err(e) => warn!(url = %request.url, error = %e, "Could not cache response"),
            }
        });
    }

    async fn lookup(&self, request: &Request) -> Option<Response> {
        let entry = match self.storage.match_in(&self.config.cache_name, request).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed");
                return None;
            }
        };

        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %request.url, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    async fn offline_fallback(&self) -> Option<Response> {
        let path = self.config.offline_fallback.as_deref()?;
        let url = self.config.resolve(path).ok()?;
        self.lookup(&Request::get(url)).await
    }
}

/// Only complete same-origin responses are worth keeping.
fn is_storable(response: &Response) -> bool {
    response.status == 200 && response.response_type == ResponseType::Basic
}

#[async_trait]
impl ServiceWorkerHandler for OfflineCacheAgent {
    async fn on_install(&self, event: InstallEvent) -> Result<(), ServiceWorkerError> {
        let cache_name = &self.config.cache_name;
        info!(worker = %event.worker, cache = %cache_name, "Installing");

        let result = async {
            let cache = self.storage.open(cache_name).await?;
            debug!(cache = %cache_name, "Cache opened");
            add_all(
                cache.as_ref(),
                self.network.as_ref(),
                &self.config.origin,
                &self.config.precache,
            )
            .await
        }
        .await;

        match result {
            Ok(count) => info!(cache = %cache_name, count, "App shell cached"),
            Err(e) => error!(cache = %cache_name, error = %e, "Failed to cache app shell"),
        }
        Ok(())
    }

    async fn on_activate(&self, event: ActivateEvent) -> Result<(), ServiceWorkerError> {
        let current = &self.config.cache_name;
        info!(worker = %event.worker, cache = %current, "Activating");

        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != current)
            .collect();

        let deletions = join_all(stale.iter().map(|name| self.storage.delete(name))).await;

        let claimed = self.clients.claim(event.worker, &self.config.scope()).await;
        info!(worker = %event.worker, claimed = claimed.len(), "Clients claimed");

        for (name, result) in stale.iter().zip(deletions) {
            result?;
            info!(cache = %name, "Deleted stale cache");
        }
        Ok(())
    }

    async fn on_fetch(&self, event: FetchEvent) -> FetchOutcome {
        let request = event.request;
        if request.method != Method::GET {
            trace!(method = %request.method, url = %request.url, "Not intercepting");
            return FetchOutcome::Passthrough;
        }

        if let Some(response) = self.lookup(&request).await {
            debug!(url = %request.url, "Cache hit");
            return FetchOutcome::Respond {
                response,
                source: ResponseSource::Cache,
            };
        }

        debug!(url = %request.url, "Cache miss");
        let response = match self.network.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!(url = %request.url, error = %e, "Fetch failed");
                if let Some(response) = self.offline_fallback().await {
                    return FetchOutcome::Respond {
                        response,
                        source: ResponseSource::Fallback,
                    };
                }
                return FetchOutcome::Failed(e);
            }
        };

        if let Some(pattern) = first_match(&self.config.exclusions, &request.url) {
            debug!(url = %request.url, pattern = %pattern.pattern, "Excluded from cache");
        } else if is_storable(&response) {
            match response.try_clone() {
                Ok(copy) => self.store_in_background(request, copy).await,
                Err(e) => warn!(url = %request.url, error = %e, "Could not clone response"),
            }
        } else {
            trace!(
                url = %request.url,
                status = response.status,
                response_type = response.response_type.as_str(),
                "Not storing response"
            );
        }

        FetchOutcome::Respond {
            response,
            source: ResponseSource::Network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCacheStorage;
    use bytes::Bytes;
    use hashbrown::HashMap;
    use http::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Serves canned responses; unknown URLs fail like an offline network.
    #[derive(Default)]
    struct CannedNetwork {
        routes: std::sync::Mutex<HashMap<String, (u16, ResponseType, &'static str)>>,
        calls: AtomicUsize,
    }

    impl CannedNetwork {
        fn route(self, url: &str, status: u16, ty: ResponseType, body: &'static str) -> Self {
            self.routes
                .lock()
                .unwrap()
                .insert(url.to_string(), (status, ty, body));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Network for CannedNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let route = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
            match route {
                Some((_, ResponseType::Opaque, _)) => Ok(Response::opaque(request.url.clone())),
                Some((status, ty, body)) => Ok(Response::new(
                    request.url.clone(),
                    status,
                    HeaderMap::new(),
                    Bytes::from_static(body.as_bytes()),
                    ty,
                )),
                None => Err(NetError::RequestFailed("offline".into())),
            }
        }
    }

    fn agent(network: CannedNetwork) -> (OfflineCacheAgent, Arc<CannedNetwork>) {
        let network = Arc::new(network);
        let config = AgentConfig::new(Url::parse("https://app.example/").unwrap());
        let agent = OfflineCacheAgent::new(
            config,
            Arc::new(MemoryCacheStorage::new()),
            network.clone(),
            Arc::new(Clients::new()),
        );
        (agent, network)
    }

    fn get(url: &str) -> FetchEvent {
        FetchEvent::new(Request::parse_get(url).unwrap(), None)
    }

    #[tokio::test]
    async fn test_non_get_passes_through() {
        let (agent, network) = agent(CannedNetwork::default());
        let request = Request::new(Method::POST, Url::parse("https://app.example/api").unwrap());

        let outcome = agent.on_fetch(FetchEvent::new(request, None)).await;
        assert!(matches!(outcome, FetchOutcome::Passthrough));
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (agent, network) = agent(CannedNetwork::default().route(
            "https://app.example/app.js",
            200,
            ResponseType::Basic,
            "js",
        ));

        let first = agent.on_fetch(get("https://app.example/app.js")).await;
        assert_eq!(first.source(), Some(ResponseSource::Network));
        assert_eq!(agent.wait_for_pending_writes().await, 1);

        let second = agent.on_fetch(get("https://app.example/app.js")).await;
        assert_eq!(second.source(), Some(ResponseSource::Cache));
        assert_eq!(network.calls(), 1);

        match second {
            FetchOutcome::Respond { response, .. } => assert_eq!(response.text().unwrap(), "js"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_returned_network_body_still_readable() {
        let (agent, _network) = agent(CannedNetwork::default().route(
            "https://app.example/",
            200,
            ResponseType::Basic,
            "<html>",
        ));

        match agent.on_fetch(get("https://app.example/")).await {
            FetchOutcome::Respond { response, source } => {
                assert_eq!(source, ResponseSource::Network);
                assert!(!response.body_used());
                assert_eq!(response.text().unwrap(), "<html>");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_200_not_stored() {
        let (agent, _network) = agent(
            CannedNetwork::default()
                .route("https://app.example/missing", 404, ResponseType::Basic, "")
                .route("https://app.example/partial", 206, ResponseType::Basic, "x"),
        );

        agent.on_fetch(get("https://app.example/missing")).await;
        agent.on_fetch(get("https://app.example/partial")).await;
        assert_eq!(agent.wait_for_pending_writes().await, 0);

        let cache = agent.storage().open(&agent.config().cache_name).await.unwrap();
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_opaque_and_cors_not_stored() {
        let (agent, _network) = agent(
            CannedNetwork::default()
                .route("https://cdn.example/a.css", 200, ResponseType::Opaque, "")
                .route("https://api.example/b.json", 200, ResponseType::Cors, "{}"),
        );

        agent.on_fetch(get("https://cdn.example/a.css")).await;
        agent.on_fetch(get("https://api.example/b.json")).await;
        assert_eq!(agent.wait_for_pending_writes().await, 0);
    }

    #[tokio::test]
    async fn test_excluded_never_stored() {
        let url = "https://app.example/vendor/tailwindcss.css";
        let (agent, network) =
            agent(CannedNetwork::default().route(url, 200, ResponseType::Basic, "css"));

        for _ in 0..3 {
            let outcome = agent.on_fetch(get(url)).await;
            assert_eq!(outcome.source(), Some(ResponseSource::Network));
        }
        assert_eq!(agent.wait_for_pending_writes().await, 0);
        assert_eq!(network.calls(), 3);
    }

    #[tokio::test]
    async fn test_network_failure_fails_fetch() {
        let (agent, _network) = agent(CannedNetwork::default());

        let outcome = agent.on_fetch(get("https://app.example/offline")).await;
        assert!(matches!(outcome, FetchOutcome::Failed(_)));
        assert!(!agent
            .storage()
            .has(&agent.config().cache_name)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_install_seeds_bucket() {
        let (agent, _network) = agent(
            CannedNetwork::default()
                .route("https://app.example/", 200, ResponseType::Basic, "root")
                .route("https://app.example/index.html", 200, ResponseType::Basic, "index"),
        );

        agent
            .on_install(InstallEvent {
                worker: ServiceWorkerId::new(),
            })
            .await
            .unwrap();

        let cache = agent.storage().open(&agent.config().cache_name).await.unwrap();
        let keys = cache.keys().await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_install_failure_is_swallowed() {
        let (agent, _network) = agent(CannedNetwork::default().route(
            "https://app.example/",
            200,
            ResponseType::Basic,
            "root",
        ));

        // "/index.html" is unreachable, so nothing is stored.
        let result = agent
            .on_install(InstallEvent {
                worker: ServiceWorkerId::new(),
            })
            .await;
        assert!(result.is_ok());

        let cache = agent.storage().open(&agent.config().cache_name).await.unwrap();
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_buckets() {
        let (agent, _network) = agent(CannedNetwork::default());
        agent.storage().open("old-cache-v0").await.unwrap();
        agent.storage().open(&agent.config().cache_name).await.unwrap();

        agent
            .on_activate(ActivateEvent {
                worker: ServiceWorkerId::new(),
            })
            .await
            .unwrap();

        assert_eq!(
            agent.storage().keys().await.unwrap(),
            vec![agent.config().cache_name.clone()]
        );
    }

    #[tokio::test]
    async fn test_offline_fallback_served() {
        let network = Arc::new(CannedNetwork::default());
        let storage = Arc::new(MemoryCacheStorage::new());
        let config = AgentConfig::new(Url::parse("https://app.example/").unwrap())
            .with_offline_fallback("/offline.html");

        let fallback = Request::parse_get("https://app.example/offline.html").unwrap();
        let page = Response::new(
            fallback.url.clone(),
            200,
            HeaderMap::new(),
            Bytes::from_static(b"offline"),
            ResponseType::Basic,
        );
        storage
            .open(&config.cache_name)
            .await
            .unwrap()
            .put(CacheEntry::from_response(&fallback, page).unwrap())
            .await
            .unwrap();

        let agent = OfflineCacheAgent::new(config, storage, network, Arc::new(Clients::new()));
        let outcome = agent.on_fetch(get("https://app.example/news")).await;
        assert_eq!(outcome.source(), Some(ResponseSource::Fallback));
    }
}
