//! Node Health Probe
//!
//! A single round-trip to a node's `/health` endpoint. Probes never fail: every error
//! (refused connection, timeout, bad body) is folded into an unreachable snapshot.

use super::types::{HealthSnapshot, Node};
use crate::remote::protocol::{ENDPOINT_HEALTH, HealthResponse};

use async_trait::async_trait;
use std::time::Duration;

/// Upper bound on any probe timeout, so one slow node cannot stall a registry refresh.
pub const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Observes `node` once. `timeout` is clamped to `MAX_PROBE_TIMEOUT`.
    async fn probe(&self, node: &Node, timeout: Duration) -> HealthSnapshot;
}

/// Probes nodes over HTTP using the `/health` endpoint of the wire protocol.
#[derive(Clone, Default)]
pub struct HttpHealthProbe {
    http_client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, node: &Node, timeout: Duration) -> HealthSnapshot {
        let timeout = timeout.min(MAX_PROBE_TIMEOUT);
        let url = format!("{}{}", node.address.base_url(), ENDPOINT_HEALTH);

        let response = match self.http_client.get(&url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Health probe to {} ({}) failed: {}", node.id, url, e);
                return HealthSnapshot::unreachable();
            }
        };

        if !response.status().is_success() {
            tracing::debug!(
                "Health probe to {} returned status {}",
                node.id,
                response.status()
            );
            return HealthSnapshot::unreachable();
        }

        match response.json::<HealthResponse>().await {
            Ok(health) if health.reachable => {
                tracing::trace!(
                    "Node {} healthy: cpu={:.1}% mem={:.1}% tasks={}",
                    node.id,
                    health.cpu_percent,
                    health.memory_percent,
                    health.active_task_count
                );
                HealthSnapshot::reachable(
                    health.cpu_percent,
                    health.memory_percent,
                    health.active_task_count,
                )
            }
            Ok(_) => HealthSnapshot::unreachable(),
            Err(e) => {
                tracing::debug!("Health probe to {} returned an invalid body: {}", node.id, e);
                HealthSnapshot::unreachable()
            }
        }
    }
}
