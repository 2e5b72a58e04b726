//! Node Placement Policy
//!
//! Pure ranking of candidate nodes from their health snapshots. No I/O, no clock
//! reads: the caller passes `now`, which keeps the policy testable against synthetic
//! snapshot tables.
//!
//! ```text
//! score = 100 - (cpu_percent * 0.5 + memory_percent * 0.3 + active_task_count * 10)
//! ```
//! Highest score wins; ties go to the lowest `active_task_count`, then the lowest node id.

use super::types::{HealthSnapshot, Node, NodeId};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const CPU_WEIGHT: f64 = 0.5;
const MEMORY_WEIGHT: f64 = 0.3;
const TASK_WEIGHT: f64 = 10.0;

pub fn score(snapshot: &HealthSnapshot) -> f64 {
    100.0
        - (snapshot.cpu_percent * CPU_WEIGHT
            + snapshot.memory_percent * MEMORY_WEIGHT
            + snapshot.active_task_count as f64 * TASK_WEIGHT)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedNode {
    pub node: Node,
    pub score: f64,
    pub active_task_count: u32,
}

#[derive(Debug, Clone)]
pub struct PlacementPolicy {
    /// Snapshots older than this are ignored even if they say reachable.
    max_snapshot_age: Duration,
}

impl PlacementPolicy {
    /// Builds a policy matching a registry's cache TTL: snapshots are usable
    /// for up to twice the TTL.
    pub fn for_cache_ttl(health_cache_ttl: Duration) -> Self {
        Self {
            max_snapshot_age: health_cache_ttl.saturating_mul(2),
        }
    }

    pub fn max_snapshot_age(&self) -> Duration {
        self.max_snapshot_age
    }

    /// All eligible candidates, best first.
    pub fn rank(
        &self,
        candidates: &[Node],
        snapshots: &HashMap<NodeId, HealthSnapshot>,
        now: Instant,
    ) -> Vec<RankedNode> {
        let mut ranked: Vec<RankedNode> = candidates
            .iter()
            .filter_map(|node| {
                let snapshot = snapshots.get(&node.id)?;
                if !snapshot.reachable || snapshot.age(now) > self.max_snapshot_age {
                    return None;
                }
                Some(RankedNode {
                    node: node.clone(),
                    score: score(snapshot),
                    active_task_count: snapshot.active_task_count,
                })
            })
            .collect();

        ranked.sort_by(compare_ranked);
        ranked
    }

    /// The best candidate, or `None` when nothing survives filtering.
    pub fn select_node(
        &self,
        candidates: &[Node],
        snapshots: &HashMap<NodeId, HealthSnapshot>,
        now: Instant,
    ) -> Option<Node> {
        self.rank(candidates, snapshots, now)
            .into_iter()
            .next()
            .map(|ranked| ranked.node)
    }
}

fn compare_ranked(a: &RankedNode, b: &RankedNode) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.active_task_count.cmp(&b.active_task_count))
        .then_with(|| a.node.id.cmp(&b.node.id))
}
