//! Error Taxonomy
//!
//! Two layers of typed errors:
//! - **`RemoteError`**: how a single remote attempt ended when it did not produce a result.
//!   The dispatcher only needs to know whether the node was at fault or the task was.
//! - **`DispatchError`**: what the submitter ultimately sees on a failed `TaskExecution`.
//!
//! Handler bodies themselves return `anyhow::Result`, so business logic can use `?` freely;
//! their errors are converted to `DispatchError::TaskFailed` at the execution boundary.

use crate::node::types::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a remote attempt that did not complete successfully.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Connection refused, DNS failure, reset mid-request.
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: NodeId, reason: String },

    /// The node explicitly refused the task because its worker pool is full.
    #[error("node {node} is saturated")]
    Saturated { node: NodeId },

    /// The node answered, but not with anything the protocol allows at this point
    /// (bad status code, undecodable body, task id unknown while polling).
    #[error("node {node} returned an unexpected response: {reason}")]
    Protocol { node: NodeId, reason: String },

    /// No terminal state was observed before the task timeout.
    /// The task may still be running on the node.
    #[error("no terminal state from node {node} after {waited:?}")]
    Ambiguous { node: NodeId, waited: Duration },

    /// The handler ran on the node and reported an error.
    #[error("task failed on node {node}: {message}")]
    TaskFailed { node: NodeId, message: String },
}

impl RemoteError {
    /// True when the failure is attributable to the node rather than the task,
    /// i.e. the task deserves one local attempt.
    pub fn is_node_unavailable(&self) -> bool {
        !matches!(self, RemoteError::TaskFailed { .. })
    }

    /// True when the node's cached health should be discarded immediately.
    pub fn needs_reprobe(&self) -> bool {
        matches!(self, RemoteError::Unreachable { .. })
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, RemoteError::Ambiguous { .. })
    }

    pub fn node(&self) -> &NodeId {
        match self {
            RemoteError::Unreachable { node, .. }
            | RemoteError::Saturated { node }
            | RemoteError::Protocol { node, .. }
            | RemoteError::Ambiguous { node, .. }
            | RemoteError::TaskFailed { node, .. } => node,
        }
    }
}

/// Terminal failure reasons surfaced to the submitter.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Malformed task: unknown `task_type` or missing required payload fields.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The handler reported an error.
    #[error("{0}")]
    TaskFailed(String),

    /// The task did not finish within its own timeout.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The local worker pool was shut down or the worker panicked.
    #[error("task rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl DispatchError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, DispatchError::Configuration(_))
    }
}

/// Problems loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    Env { key: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
