//! # shellcache service worker
//!
//! A cache-first offline agent for a single web application.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, fetch handlers behind [`ServiceWorkerHandler`]
//! - **Cache storage**: named buckets of request → response pairs, in memory or SQLite
//! - **Clients**: open page contexts and their controller, `claim()` on activation
//! - **Host**: drives install → activate and routes fetches to the active worker
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       └── scope
//!     │
//!     └── OfflineCacheAgent (ServiceWorkerHandler)
//!             ├── CacheStorage ── Cache ── CacheKey → CacheEntry
//!             ├── Network
//!             └── Clients
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use shellcache_common::ShellCacheError;
use shellcache_net::NetError;
use thiserror::Error;

pub mod agent;
pub mod clients;
pub mod config;
pub mod host;
pub mod storage;

pub use agent::{
    ActivateEvent, FetchEvent, FetchOutcome, InstallEvent, OfflineCacheAgent, ResponseSource,
    ServiceWorkerHandler,
};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::AgentConfig;
pub use host::{
    ServiceWorker, ServiceWorkerEvent, ServiceWorkerHost, ServiceWorkerRegistration,
    ServiceWorkerState,
};
pub use storage::{
    add_all, Cache, CacheEntry, CacheKey, CacheStorage, MemoryCacheStorage, SqliteCacheStorage,
};

// ==================== Errors ====================

/// Errors raised by bucket storage.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache name cannot be empty")]
    EmptyName,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("Cache {0} was deleted")]
    BucketDeleted(String),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("Storage lock poisoned")]
    Poisoned,

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the worker lifecycle.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<CacheError> for ShellCacheError {
    fn from(err: CacheError) -> Self {
        ShellCacheError::storage_with_source("cache storage failed", err)
    }
}

impl From<ServiceWorkerError> for ShellCacheError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => e.into(),
            other => ShellCacheError::lifecycle_with_source("service worker failed", other),
        }
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ServiceWorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}
