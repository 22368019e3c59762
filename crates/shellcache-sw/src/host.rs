//! Drives a registration through install → activate and routes fetches.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use shellcache_net::{NetError, Network, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::agent::{ActivateEvent, FetchEvent, FetchOutcome, InstallEvent, ServiceWorkerHandler};
use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::{ServiceWorkerError, ServiceWorkerId};

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Registered, not yet installing.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    handler: Arc<dyn ServiceWorkerHandler>,
}

impl ServiceWorker {
    pub fn new(handler: Arc<dyn ServiceWorkerHandler>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            handler,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn handler(&self) -> &Arc<dyn ServiceWorkerHandler> {
        &self.handler
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Does `url` fall under this registration.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    fn find(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }
}

/// Host notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Controller changed.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Host ====================

/// Owns one registration and the clients it may control.
pub struct ServiceWorkerHost {
    registration: RwLock<ServiceWorkerRegistration>,
    clients: Arc<Clients>,
    network: Arc<dyn Network>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerHost {
    /// Create a host for `scope`.
    pub fn new(
        scope: Url,
        clients: Arc<Clients>,
        network: Arc<dyn Network>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
                clients,
                network,
                event_tx,
            },
            event_rx,
        )
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    pub async fn scope(&self) -> Url {
        self.registration.read().await.scope.clone()
    }

    /// Register a new worker; it becomes the installing worker.
    pub async fn register(
        &self,
        handler: Arc<dyn ServiceWorkerHandler>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let mut registration = self.registration.write().await;
        if registration.installing.is_some() {
            return Err(ServiceWorkerError::StateError(
                "a worker is already installing".to_string(),
            ));
        }

        let worker = ServiceWorker::new(handler);
        let id = worker.id;
        registration.installing = Some(worker);
        debug!(worker = %id, scope = %registration.scope, "Registered");
        Ok(id)
    }

    /// Run the install handler of the installing worker.
    ///
    /// On success the worker waits for activation, replacing any worker that
    /// was already waiting. On failure it becomes redundant.
    pub async fn install(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let (id, handler) = {
            let mut registration = self.registration.write().await;
            let worker = registration.installing.as_mut().ok_or_else(|| {
                ServiceWorkerError::StateError("no installing worker".to_string())
            })?;
            worker.set_state(ServiceWorkerState::Installing);
            (worker.id, Arc::clone(&worker.handler))
        };
        self.emit_state(id, ServiceWorkerState::Installing);

        let result = handler.on_install(InstallEvent { worker: id }).await;

        let mut registration = self.registration.write().await;
        let mut worker = registration
            .installing
            .take()
            .filter(|w| w.id == id)
            .ok_or_else(|| ServiceWorkerError::StateError(format!("{} vanished", id)))?;

        if let Err(e) = result {
            error!(worker = %id, error = %e, "Install failed");
            worker.set_state(ServiceWorkerState::Redundant);
            self.emit_state(id, ServiceWorkerState::Redundant);
            return Err(e);
        }

        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut replaced) = registration.waiting.replace(worker) {
            replaced.set_state(ServiceWorkerState::Redundant);
            self.emit_state(replaced.id, ServiceWorkerState::Redundant);
        }
        self.emit_state(id, ServiceWorkerState::Installed);
        info!(worker = %id, "Installed");
        Ok(id)
    }

    /// Promote the waiting worker and run its activate handler.
    ///
    /// The previous active worker becomes redundant. An error from the handler
    /// is returned, but the worker stays active.
    pub async fn activate(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let (id, handler) = {
            let mut registration = self.registration.write().await;
            let mut worker = registration.waiting.take().ok_or_else(|| {
                ServiceWorkerError::StateError("no waiting worker".to_string())
            })?;
            worker.set_state(ServiceWorkerState::Activating);
            let id = worker.id;
            let handler = Arc::clone(&worker.handler);

            if let Some(mut old) = registration.active.replace(worker) {
                old.set_state(ServiceWorkerState::Redundant);
                self.emit_state(old.id, ServiceWorkerState::Redundant);
            }
            (id, handler)
        };
        self.emit_state(id, ServiceWorkerState::Activating);

        let before = self.controllers().await;
        let result = handler.on_activate(ActivateEvent { worker: id }).await;

        {
            let mut registration = self.registration.write().await;
            if let Some(worker) = registration.active.as_mut().filter(|w| w.id == id) {
                worker.set_state(ServiceWorkerState::Activated);
            }
        }
        self.emit_state(id, ServiceWorkerState::Activated);

        for (client_id, controller) in self.controllers().await {
            let Some(worker_id) = controller else { continue };
            if before.get(&client_id) != Some(&controller) {
                let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    worker_id,
                });
            }
        }

        match result {
            Ok(()) => {
                info!(worker = %id, "Activated");
                Ok(id)
            }
            Err(e) => {
                warn!(worker = %id, error = %e, "Activated with errors");
                Err(e)
            }
        }
    }

    /// Register, install and activate `handler`.
    pub async fn start(
        &self,
        handler: Arc<dyn ServiceWorkerHandler>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        self.register(handler).await?;
        self.install().await?;
        self.activate().await
    }

    /// Route a request.
    ///
    /// Requests from clients controlled by the active worker, and navigations
    /// within scope, go to its fetch handler. Everything else, and anything
    /// the handler passes through, goes straight to the network.
    pub async fn dispatch_fetch(&self, event: FetchEvent) -> Result<Response, NetError> {
        let Some(handler) = self.route(&event).await else {
            return self.network.fetch(&event.request).await;
        };

        let request = event.request.clone();
        match handler.on_fetch(event).await {
            FetchOutcome::Respond { response, .. } => Ok(response),
            FetchOutcome::Failed(e) => Err(e),
            FetchOutcome::Passthrough => self.network.fetch(&request).await,
        }
    }

    async fn route(&self, event: &FetchEvent) -> Option<Arc<dyn ServiceWorkerHandler>> {
        let (active_id, handler, in_scope) = {
            let registration = self.registration.read().await;
            let active = registration.active.as_ref()?;
            (
                active.id,
                Arc::clone(&active.handler),
                registration.in_scope(&event.request.url),
            )
        };

        if event.is_navigation {
            return in_scope.then_some(handler);
        }

        let client_id = event.client_id.as_deref()?;
        (self.clients.controller_of(client_id).await == Some(active_id)).then_some(handler)
    }

    /// Current state of worker `id`, if it is still registered.
    pub async fn state(&self, id: ServiceWorkerId) -> Option<ServiceWorkerState> {
        self.registration.read().await.find(id).map(|w| w.state)
    }

    pub async fn active_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.active.as_ref().map(|w| w.id)
    }

    pub async fn waiting_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    async fn controllers(&self) -> HashMap<String, Option<ServiceWorkerId>> {
        self.clients
            .match_all(&ClientMatchOptions {
                include_uncontrolled: true,
                client_type: ClientType::All,
            })
            .await
            .into_iter()
            .map(|c| (c.id, c.controller))
            .collect()
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state,
        });
    }
}
