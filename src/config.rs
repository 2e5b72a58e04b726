//! Configuration
//!
//! Sources, highest precedence first:
//! 1. CLI flags (applied by the binary)
//! 2. Environment variables (`TASK_NODE_*`)
//! 3. Configuration file (TOML)
//! 4. Default values
//!
//! ```toml
//! [dispatcher]
//! health_cache_ttl_secs = 30
//! poll_interval_ms = 500
//!
//! [server]
//! bind = "127.0.0.1:7000"
//! max_workers = 4
//!
//! [[nodes]]
//! id = "node-a"
//! address = "10.0.0.5:7000"
//! ```

use crate::error::ConfigError;
use crate::node::registry::NodeRegistryConfig;
use crate::node::types::{Node, NodeAddress};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "TASK_NODE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dispatcher: DispatcherSettings,
    pub server: ServerSettings,
    pub nodes: Vec<NodeSettings>,
}

/// Caller-side settings: health caching, polling, local fallback pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub health_cache_ttl_secs: u64,
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub default_task_timeout_secs: u64,
    pub max_local_workers: usize,
    /// Consecutive failed probes before a node is dropped. 0 keeps nodes forever.
    pub max_probe_failures: u32,
    /// Background health refresh period. 0 refreshes on demand only.
    pub refresh_interval_secs: u64,
    /// How long finished executions stay queryable on the dispatcher.
    pub execution_retention_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            health_cache_ttl_secs: 30,
            probe_timeout_ms: 2_000,
            poll_interval_ms: 500,
            request_timeout_ms: 5_000,
            default_task_timeout_secs: 60,
            max_local_workers: num_cpus::get(),
            max_probe_failures: 0,
            refresh_interval_secs: 0,
            execution_retention_secs: 600,
        }
    }
}

/// Node-side settings for `task-node serve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub max_workers: usize,
    pub finished_retention_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7000".to_string(),
            max_workers: 4,
            finished_retention_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,
    /// `host:port` of the node's HTTP endpoint.
    pub address: String,
}

impl AppConfig {
    /// Loads the file at `path` (if any), applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        tracing::debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Applies `TASK_NODE_*` overrides, reading variables through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let key = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = get("BIND") {
            self.server.bind = value;
        }
        if let Some((key, value)) = get("MAX_WORKERS") {
            self.server.max_workers = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("HEALTH_CACHE_TTL_SECS") {
            self.dispatcher.health_cache_ttl_secs = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("POLL_INTERVAL_MS") {
            self.dispatcher.poll_interval_ms = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_LOCAL_WORKERS") {
            self.dispatcher.max_local_workers = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("MAX_PROBE_FAILURES") {
            self.dispatcher.max_probe_failures = parse_env(&key, &value)?;
        }
        if let Some((key, value)) = get("NODES") {
            self.nodes = parse_node_list(&key, &value)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.health_cache_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.health_cache_ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.dispatcher.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.dispatcher.max_local_workers == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.max_local_workers must be greater than 0".to_string(),
            ));
        }
        if self.server.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "server.max_workers must be greater than 0".to_string(),
            ));
        }

        self.server.bind.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("server.bind '{}': {}", self.server.bind, e))
        })?;

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id '{}'", node.id)));
            }
            node.address
                .parse::<NodeAddress>()
                .map_err(|e| ConfigError::Invalid(format!("node '{}': {}", node.id, e)))?;
        }

        Ok(())
    }

    pub fn registry_config(&self) -> NodeRegistryConfig {
        NodeRegistryConfig {
            health_cache_ttl: Duration::from_secs(self.dispatcher.health_cache_ttl_secs),
            probe_timeout: Duration::from_millis(self.dispatcher.probe_timeout_ms),
            max_probe_failures: match self.dispatcher.max_probe_failures {
                0 => None,
                n => Some(n),
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher.request_timeout_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatcher.default_task_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.dispatcher.refresh_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn execution_retention(&self) -> Duration {
        Duration::from_secs(self.dispatcher.execution_retention_secs)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_secs(self.server.finished_retention_secs)
    }

    /// The configured nodes, ready for `NodeRegistry::register_node`.
    pub fn node_list(&self) -> Result<Vec<Node>, ConfigError> {
        self.nodes
            .iter()
            .map(|node| {
                let address = node
                    .address
                    .parse::<NodeAddress>()
                    .map_err(|e| ConfigError::Invalid(format!("node '{}': {}", node.id, e)))?;
                Ok(Node::new(node.id.clone(), address))
            })
            .collect()
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Env {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Parses `id=host:port,id=host:port`.
fn parse_node_list(key: &str, value: &str) -> Result<Vec<NodeSettings>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (id, address) = item.split_once('=').ok_or_else(|| ConfigError::Env {
                key: key.to_string(),
                reason: format!("expected id=host:port, got '{}'", item),
            })?;
            Ok(NodeSettings {
                id: id.trim().to_string(),
                address: address.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.registry_config().health_cache_ttl, Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert!(config.registry_config().max_probe_failures.is_none());
        assert!(config.refresh_interval().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[dispatcher]
health_cache_ttl_secs = 10
max_probe_failures = 3

[server]
bind = "0.0.0.0:7100"
max_workers = 8

[[nodes]]
id = "node-a"
address = "10.0.0.1:7000"

[[nodes]]
id = "node-b"
address = "10.0.0.2:7000"
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.health_cache_ttl_secs, 10);
        // Unspecified keys keep their defaults
        assert_eq!(config.dispatcher.poll_interval_ms, 500);
        assert_eq!(config.registry_config().max_probe_failures, Some(3));
        assert_eq!(config.server.max_workers, 8);

        let nodes = config.node_list().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].address, NodeAddress::new("10.0.0.2", 7000));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = AppConfig::from_file(Path::new("/nonexistent/task-node.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();

        config
            .apply_overrides(env(&[
                ("TASK_NODE_MAX_WORKERS", "16"),
                ("TASK_NODE_NODES", "a=127.0.0.1:7001, b=127.0.0.1:7002"),
            ]))
            .unwrap();

        assert_eq!(config.server.max_workers, 16);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].id, "a");
        assert_eq!(config.nodes[1].address, "127.0.0.1:7002");
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = AppConfig::default();

        let result = config.apply_overrides(env(&[("TASK_NODE_MAX_WORKERS", "many")]));

        assert!(matches!(result, Err(ConfigError::Env { key, .. }) if key == "TASK_NODE_MAX_WORKERS"));
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zeroes() {
        let mut config = AppConfig::default();
        config.nodes = vec![
            NodeSettings {
                id: "a".to_string(),
                address: "127.0.0.1:7001".to_string(),
            },
            NodeSettings {
                id: "a".to_string(),
                address: "127.0.0.1:7002".to_string(),
            },
        ];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.nodes = vec![NodeSettings {
            id: "a".to_string(),
            address: "no-port".to_string(),
        }];
        assert!(config.validate().is_err());
    }
}
