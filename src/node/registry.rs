//! Node Registry
//!
//! In-memory table of known worker nodes and their last observed health.
//!
//! ## Caching
//! Each node holds at most one `HealthSnapshot`, replaced wholesale on every probe.
//! A snapshot older than `health_cache_ttl` is re-probed on the next read; one older
//! than twice the TTL is never handed to placement as reachable.
//!
//! ## Concurrency
//! Entries live in a `DashMap`, so placement reads and probe writes only contend per shard.
//! No map guard is ever held across a probe: probes run on a cloned node list and the
//! results are written back afterwards.

use super::probe::HealthProbe;
use super::types::{HealthSnapshot, Node, NodeId};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct NodeRegistryConfig {
    /// Age after which a snapshot is re-probed.
    pub health_cache_ttl: Duration,
    /// Per-probe timeout, clamped by the probe itself.
    pub probe_timeout: Duration,
    /// Remove a node after this many consecutive unreachable probes. `None` keeps nodes forever.
    pub max_probe_failures: Option<u32>,
}

impl Default for NodeRegistryConfig {
    fn default() -> Self {
        Self {
            health_cache_ttl: DEFAULT_HEALTH_CACHE_TTL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            max_probe_failures: None,
        }
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    node: Node,
    snapshot: Option<HealthSnapshot>,
    consecutive_failures: u32,
    /// Set after a connection failure so the next read probes regardless of age.
    force_reprobe: bool,
}

impl NodeEntry {
    fn needs_probe(&self, now: Instant, ttl: Duration) -> bool {
        self.force_reprobe
            || self
                .snapshot
                .as_ref()
                .map(|snapshot| snapshot.is_stale(now, ttl))
                .unwrap_or(true)
    }
}

pub struct NodeRegistry {
    entries: DashMap<NodeId, NodeEntry>,
    probe: Arc<dyn HealthProbe>,
    config: NodeRegistryConfig,
}

impl NodeRegistry {
    pub fn new(probe: Arc<dyn HealthProbe>, config: NodeRegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            probe,
            config,
        })
    }

    pub fn config(&self) -> &NodeRegistryConfig {
        &self.config
    }

    /// Adds a node. Re-registering an id with the same address is a no-op;
    /// with a new address the address is overwritten and cached health discarded.
    pub fn register_node(&self, node: Node) {
        match self.entries.entry(node.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if existing.node.address != node.address {
                    tracing::info!(
                        "Node {} moved from {} to {}",
                        node.id,
                        existing.node.address,
                        node.address
                    );
                    existing.node.address = node.address;
                    existing.snapshot = None;
                    existing.consecutive_failures = 0;
                    existing.force_reprobe = false;
                } else {
                    tracing::debug!("Node {} already registered at {}", node.id, node.address);
                }
            }
            Entry::Vacant(vacant) => {
                tracing::info!("Registered node {} at {}", node.id, node.address);
                vacant.insert(NodeEntry {
                    node,
                    snapshot: None,
                    consecutive_failures: 0,
                    force_reprobe: false,
                });
            }
        }
    }

    /// Removes a node and its cached snapshot. Returns the removed node, if any.
    pub fn remove_node(&self, id: &NodeId) -> Option<Node> {
        let removed = self.entries.remove(id).map(|(_, entry)| entry.node);
        if removed.is_some() {
            tracing::info!("Removed node {}", id);
        }
        removed
    }

    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.entries.get(id).map(|entry| entry.node.clone())
    }

    /// All registered nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .entries
            .iter()
            .map(|entry| entry.value().node.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards the freshness of a node's snapshot, e.g. after a refused connection,
    /// so the next read probes it again instead of trusting the cache.
    pub fn mark_for_reprobe(&self, id: &NodeId) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            tracing::debug!("Node {} marked for re-probe", id);
            entry.force_reprobe = true;
        }
    }

    /// Returns the node's snapshot, probing first if the cached one is stale.
    pub async fn get_snapshot(&self, id: &NodeId) -> Option<HealthSnapshot> {
        let (node, needs_probe) = {
            let entry = self.entries.get(id)?;
            let needs_probe = entry.needs_probe(Instant::now(), self.config.health_cache_ttl);
            (entry.node.clone(), needs_probe)
        };

        if needs_probe {
            let snapshot = self.probe.probe(&node, self.config.probe_timeout).await;
            self.record_probe(&node, snapshot.clone());
            return Some(snapshot);
        }

        self.entries.get(id).and_then(|entry| entry.snapshot.clone())
    }

    /// Snapshots as currently cached, without probing.
    pub fn cached_snapshots(&self) -> HashMap<NodeId, HealthSnapshot> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .snapshot
                    .clone()
                    .map(|snapshot| (entry.key().clone(), snapshot))
            })
            .collect()
    }

    /// Nodes whose snapshot, refreshed if stale, shows them reachable.
    pub async fn list_healthy(&self) -> Vec<Node> {
        self.list_healthy_with_snapshots().await.0
    }

    /// Like `list_healthy`, plus the snapshot each decision was based on,
    /// so placement sees exactly the observations that made a node eligible.
    pub async fn list_healthy_with_snapshots(&self) -> (Vec<Node>, HashMap<NodeId, HealthSnapshot>) {
        let ttl = self.config.health_cache_ttl;
        let stale: Vec<Node> = {
            let now = Instant::now();
            self.entries
                .iter()
                .filter(|entry| entry.value().needs_probe(now, ttl))
                .map(|entry| entry.value().node.clone())
                .collect()
        };

        if !stale.is_empty() {
            tracing::debug!("Re-probing {} node(s) with stale health", stale.len());
            self.probe_all(&stale).await;
        }

        let now = Instant::now();
        let mut nodes = Vec::new();
        let mut snapshots = HashMap::new();

        for entry in self.entries.iter() {
            let entry = entry.value();
            if let Some(snapshot) = &entry.snapshot
                && snapshot.is_usable(now, ttl)
            {
                nodes.push(entry.node.clone());
                snapshots.insert(entry.node.id.clone(), snapshot.clone());
            }
        }

        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        (nodes, snapshots)
    }

    /// Probes every registered node regardless of cache age.
    pub async fn refresh_all(&self) {
        let nodes = self.nodes();
        self.probe_all(&nodes).await;
    }

    /// Periodically refreshes every node in the background. On-demand refresh
    /// in `list_healthy` still applies between ticks.
    pub fn spawn_refresh_loop(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.refresh_all().await;
                tracing::debug!("Health refresh complete for {} node(s)", self.len());
            }
        })
    }

    async fn probe_all(&self, nodes: &[Node]) {
        let timeout = self.config.probe_timeout;
        let probes = nodes.iter().map(|node| async move {
            let snapshot = self.probe.probe(node, timeout).await;
            (node, snapshot)
        });

        for (node, snapshot) in futures::future::join_all(probes).await {
            self.record_probe(node, snapshot);
        }
    }

    /// Stores a probe result, unless the node was removed or moved while the probe ran.
    fn record_probe(&self, probed: &Node, snapshot: HealthSnapshot) {
        let evict = {
            let Some(mut entry) = self.entries.get_mut(&probed.id) else {
                return;
            };

            if entry.node.address != probed.address {
                return;
            }

            if snapshot.reachable {
                if entry.consecutive_failures > 0 {
                    tracing::info!(
                        "Node {} reachable again after {} failed probe(s)",
                        probed.id,
                        entry.consecutive_failures
                    );
                }
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures += 1;
                tracing::warn!(
                    "Node {} unreachable ({} consecutive failure(s))",
                    probed.id,
                    entry.consecutive_failures
                );
            }

            entry.snapshot = Some(snapshot);
            entry.force_reprobe = false;

            self.config
                .max_probe_failures
                .is_some_and(|limit| limit > 0 && entry.consecutive_failures >= limit)
        };

        if evict {
            tracing::warn!(
                "Node {} exceeded the probe failure limit, removing it",
                probed.id
            );
            self.remove_node(&probed.id);
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_snapshot(&self, id: &NodeId, snapshot: HealthSnapshot) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.snapshot = Some(snapshot);
        }
    }

    #[cfg(test)]
    pub(crate) fn address_of(&self, id: &NodeId) -> Option<super::types::NodeAddress> {
        self.entries.get(id).map(|entry| entry.node.address.clone())
    }
}
