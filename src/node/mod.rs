//! Node Module
//!
//! Knowledge about remote worker nodes: who they are, how loaded they are, and which
//! one should take the next task.
//!
//! ## Core Mechanisms
//! - **Probing**: A single `/health` round-trip yields a `HealthSnapshot`; errors become
//!   an unreachable snapshot instead of propagating.
//! - **Caching**: `NodeRegistry` keeps one snapshot per node and re-probes after a TTL.
//!   Snapshots older than twice the TTL are never trusted.
//! - **Placement**: `PlacementPolicy` scores reachable nodes by CPU, memory and queue depth.

pub mod placement;
pub mod probe;
pub mod registry;
pub mod types;
