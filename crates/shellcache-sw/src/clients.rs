//! Open page contexts and the worker that controls them.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::{ServiceWorkerError, ServiceWorkerId};

/// A client (open page context).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Registry of open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<String, Client>>,
}

impl Clients {
    /// Create new clients registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, uncontrolled window client.
    pub async fn open_window(&self, url: &str) -> Result<Client, ServiceWorkerError> {
        let url = Url::parse(url).map_err(|e| ServiceWorkerError::InvalidUrl(e.to_string()))?;

        let client = Client {
            id: format!("client-{}", next_client_suffix()),
            url,
            client_type: ClientType::Window,
            controller: None,
        };

        self.add(client.clone()).await;
        Ok(client)
    }

    /// Add a client.
    pub async fn add(&self, client: Client) {
        self.clients.write().await.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub async fn remove(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// Worker controlling client `id`.
    pub async fn controller_of(&self, id: &str) -> Option<ServiceWorkerId> {
        self.clients.read().await.get(id).and_then(|c| c.controller)
    }

    /// Set the controller of one client.
    pub async fn set_controller(&self, id: &str, worker: ServiceWorkerId) -> bool {
        match self.clients.write().await.get_mut(id) {
            Some(client) => {
                client.controller = Some(worker);
                true
            }
            None => false,
        }
    }

    /// Match clients.
    pub async fn match_all(&self, options: &ClientMatchOptions) -> Vec<Client> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| options.include_uncontrolled || c.controller.is_some())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .cloned()
            .collect()
    }

    /// Make `worker` the controller of every client under `scope`.
    ///
    /// Returns the IDs of the clients whose controller changed.
    pub async fn claim(&self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        let mut claimed = Vec::new();
        let mut clients = self.clients.write().await;
        for client in clients.values_mut() {
            if !client.url.as_str().starts_with(scope.as_str()) {
                continue;
            }
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed.push(client.id.clone());
            }
        }
        debug!(%worker, scope = %scope, claimed = claimed.len(), "Claimed clients");
        claimed
    }
}

/// Unique suffix for client IDs.
fn next_client_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    format!("{:016x}-{:04x}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_window() {
        let clients = Clients::new();
        let client = clients.open_window("https://app.example/").await.unwrap();

        assert_eq!(client.client_type, ClientType::Window);
        assert!(client.controller.is_none());
        assert!(clients.get(&client.id).await.is_some());
    }

    #[tokio::test]
    async fn test_open_window_bad_url() {
        let clients = Clients::new();
        assert!(matches!(
            clients.open_window("not a url").await,
            Err(ServiceWorkerError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_respects_scope() {
        let clients = Clients::new();
        let inside = clients.open_window("https://app.example/app/page").await.unwrap();
        let outside = clients.open_window("https://app.example/other").await.unwrap();
        let worker = ServiceWorkerId::new();
        let scope = Url::parse("https://app.example/app/").unwrap();

        let claimed = clients.claim(worker, &scope).await;
        assert_eq!(claimed, vec![inside.id.clone()]);
        assert_eq!(clients.controller_of(&inside.id).await, Some(worker));
        assert_eq!(clients.controller_of(&outside.id).await, None);

        // Already controlled clients are not reported again.
        assert!(clients.claim(worker, &scope).await.is_empty());
    }

    #[tokio::test]
    async fn test_match_all_filters_uncontrolled() {
        let clients = Clients::new();
        let a = clients.open_window("https://app.example/").await.unwrap();
        clients.open_window("https://app.example/b").await.unwrap();
        clients.set_controller(&a.id, ServiceWorkerId::new()).await;

        let controlled = clients.match_all(&ClientMatchOptions::default()).await;
        assert_eq!(controlled.len(), 1);

        let everyone = clients
            .match_all(&ClientMatchOptions {
                include_uncontrolled: true,
                client_type: ClientType::All,
            })
            .await;
        assert_eq!(everyone.len(), 2);
    }

    #[tokio::test]
    async fn test_remove() {
        let clients = Clients::new();
        let client = clients.open_window("https://app.example/").await.unwrap();
        assert!(clients.remove(&client.id).await.is_some());
        assert!(clients.get(&client.id).await.is_none());
    }
}
