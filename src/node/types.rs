use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Network location of a worker's HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("http://").unwrap_or(s).trim_end_matches('/');
        if let Some((scheme, _)) = s.split_once("://") {
            return Err(format!("unsupported scheme '{}' in '{}', only http is served", scheme, s));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("address '{}' is missing a port", s))?;

        if host.is_empty() {
            return Err(format!("address '{}' is missing a host", s));
        }

        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{}': {}", s, e))?;

        Ok(Self::new(host, port))
    }
}

/// A remote worker process.
///
/// Nodes are never discovered; they come from configuration or an operator
/// and live in the `NodeRegistry` until explicitly removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub address: NodeAddress,
    pub registered_at: SystemTime,
}

impl Node {
    pub fn new(id: impl Into<String>, address: NodeAddress) -> Self {
        Self {
            id: NodeId::new(id),
            address,
            registered_at: SystemTime::now(),
        }
    }
}

/// A point-in-time observation of a node's reachability and load.
///
/// Snapshots are values: the registry replaces them wholesale on every probe.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub reachable: bool,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_task_count: u32,
    pub observed_at: Instant,
}

impl HealthSnapshot {
    pub fn reachable(cpu_percent: f64, memory_percent: f64, active_task_count: u32) -> Self {
        Self {
            reachable: true,
            cpu_percent,
            memory_percent,
            active_task_count,
            observed_at: Instant::now(),
        }
    }

    /// A failed observation: metrics are zeroed.
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            active_task_count: 0,
            observed_at: Instant::now(),
        }
    }

    pub fn observed_at(mut self, observed_at: Instant) -> Self {
        self.observed_at = observed_at;
        self
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.observed_at)
    }

    /// Due for a re-probe once older than the cache TTL.
    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        self.age(now) > ttl
    }

    /// Reachability as placement must see it: anything older than twice the
    /// TTL counts as unreachable regardless of what was recorded.
    pub fn is_usable(&self, now: Instant, ttl: Duration) -> bool {
        self.reachable && self.age(now) <= ttl.saturating_mul(2)
    }
}
