//! Agent configuration

use serde::{Deserialize, Serialize};
use shellcache_common::{Result, ShellCacheError};
use shellcache_net::UrlPattern;
use std::path::Path;
use url::Url;

/// Bucket name used when none is configured.
pub const DEFAULT_CACHE_NAME: &str = "ms-appx-web-handler-cache-v1";

/// Configuration for one [`OfflineCacheAgent`](crate::OfflineCacheAgent).
///
/// Each agent gets its own value, so several agents can share one storage
/// backend under distinct bucket names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name of the current cache generation
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// Application origin; seed paths resolve against it and responses
    /// are classified relative to it
    pub origin: Url,

    /// Clients under this URL are claimed on activation
    #[serde(default)]
    pub scope: Option<Url>,

    /// App shell paths stored at install time
    #[serde(default = "default_precache")]
    pub precache: Vec<String>,

    /// Requests whose URL matches any of these are never stored
    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<UrlPattern>,

    /// Cached path served when the network fails on a miss
    #[serde(default)]
    pub offline_fallback: Option<String>,
}

fn default_cache_name() -> String {
    DEFAULT_CACHE_NAME.to_string()
}

fn default_precache() -> Vec<String> {
    vec!["/".to_string(), "/index.html".to_string()]
}

fn default_exclusions() -> Vec<UrlPattern> {
    vec![UrlPattern::contains("tailwindcss")]
}

impl AgentConfig {
    /// Defaults for an application served from `origin`.
    pub fn new(origin: Url) -> Self {
        Self {
            cache_name: default_cache_name(),
            origin,
            scope: None,
            precache: default_precache(),
            exclusions: default_exclusions(),
            offline_fallback: None,
        }
    }

    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclusions(mut self, exclusions: Vec<UrlPattern>) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_offline_fallback(mut self, path: impl Into<String>) -> Self {
        self.offline_fallback = Some(path.into());
        self
    }

    /// Claim scope; the origin root when unset.
    pub fn scope(&self) -> Url {
        match self.scope {
            Some(ref scope) => scope.clone(),
            None => {
                let mut root = self.origin.clone();
                root.set_path("/");
                root.set_query(None);
                root.set_fragment(None);
                root
            }
        }
    }

    /// Resolve a configured path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| ShellCacheError::config_with_source(format!("bad path {}", path), e))
    }

    /// Check the configuration for values the agent cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(ShellCacheError::config("cache_name cannot be empty"));
        }

        if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host().is_none() {
            return Err(ShellCacheError::config(format!(
                "origin must be an http(s) URL with a host: {}",
                self.origin
            )));
        }

        if let Some(ref scope) = self.scope {
            if scope.origin() != self.origin.origin() {
                return Err(ShellCacheError::config(format!(
                    "scope {} is not on origin {}",
                    scope, self.origin
                )));
            }
        }

        for path in &self.precache {
            self.resolve(path)?;
        }
        if let Some(ref fallback) = self.offline_fallback {
            self.resolve(fallback)?;
        }

        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ShellCacheError::config_with_source("invalid agent config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn origin() -> Url {
        Url::parse("https://app.example/").unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::new(origin());
        assert_eq!(config.cache_name, DEFAULT_CACHE_NAME);
        assert_eq!(config.precache, vec!["/", "/index.html"]);
        assert_eq!(config.exclusions, vec![UrlPattern::contains("tailwindcss")]);
        assert!(config.offline_fallback.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scope_defaults_to_origin_root() {
        let config = AgentConfig::new(Url::parse("https://app.example/app/index.html?x=1").unwrap());
        assert_eq!(config.scope().as_str(), "https://app.example/");
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config = AgentConfig::from_json(r#"{ "origin": "https://app.example/" }"#).unwrap();
        assert_eq!(config.cache_name, DEFAULT_CACHE_NAME);
        assert_eq!(config.precache.len(), 2);
    }

    #[test]
    fn test_full_json() {
        let json = r#"{
            "cache_name": "shell-v2",
            "origin": "https://app.example/",
            "scope": "https://app.example/app/",
            "precache": ["/app/", "/app/main.js"],
            "exclusions": [{ "type": "prefix", "pattern": "https://fonts." }],
            "offline_fallback": "/offline.html"
        }"#;
        let config = AgentConfig::from_json(json).unwrap();
        assert_eq!(config.cache_name, "shell-v2");
        assert_eq!(config.scope().as_str(), "https://app.example/app/");
        assert_eq!(config.exclusions[0], UrlPattern::prefix("https://fonts."));
        assert_eq!(config.offline_fallback.as_deref(), Some("/offline.html"));
    }

    #[test]
    fn test_rejects_empty_cache_name() {
        let err = AgentConfig::new(origin()).with_cache_name(" ").validate().unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_rejects_non_http_origin() {
        let config = AgentConfig::new(Url::parse("file:///tmp/app/").unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_foreign_scope() {
        let mut config = AgentConfig::new(origin());
        config.scope = Some(Url::parse("https://other.example/").unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "origin": "https://app.example/", "cache_name": "v9" }}"#).unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.cache_name, "v9");
    }

    #[test]
    fn test_load_missing_file() {
        let err = AgentConfig::load("/nonexistent/shellcache.json").unwrap_err();
        assert_eq!(err.category(), "io");
    }
}
