//! Task Dispatcher
//!
//! The entry point for submitters. For each task it picks the best healthy node,
//! tries it once, and on a node-side failure runs the task locally once. At most
//! two attempts are ever made for a single submission.
//!
//! ```text
//! PENDING -> ASSIGNED(node) -> RUNNING -> COMPLETED
//!                                      -> FAILED            (task failed on the node)
//!                                      -> fresh PENDING -> ASSIGNED(local) -> ...
//! PENDING -> ASSIGNED(local) -> RUNNING -> COMPLETED | FAILED
//! ```

use crate::error::{DispatchError, RemoteError};
use crate::executor::local::LocalExecutor;
use crate::executor::types::*;
use crate::node::placement::PlacementPolicy;
use crate::node::registry::NodeRegistry;
use crate::node::types::{Node, NodeId};
use crate::remote::client::RemoteExecutor;

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Observable progress of dispatched tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Placed {
        task_id: TaskId,
        target: Target,
    },
    /// A remote attempt failed for node reasons and the task moved to local execution.
    FellBack {
        task_id: TaskId,
        node: NodeId,
        reason: String,
        /// The remote task may still be running.
        ambiguous: bool,
    },
    Finished {
        task_id: TaskId,
        target: Target,
        state: TaskState,
    },
}

impl DispatchEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            DispatchEvent::Placed { task_id, .. }
            | DispatchEvent::FellBack { task_id, .. }
            | DispatchEvent::Finished { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub remote_completed: u64,
    pub local_completed: u64,
    pub fallbacks: u64,
    pub ambiguous_outcomes: u64,
    pub failed: u64,
}

/// A dispatcher-side record, stamped when the execution reaches a terminal state.
struct ExecutionRecord {
    execution: TaskExecution,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct Counters {
    remote_completed: AtomicU64,
    local_completed: AtomicU64,
    fallbacks: AtomicU64,
    ambiguous_outcomes: AtomicU64,
    failed: AtomicU64,
}

pub struct TaskDispatcher {
    nodes: Arc<NodeRegistry>,
    policy: PlacementPolicy,
    remote: Arc<dyn RemoteExecutor>,
    local: Arc<LocalExecutor>,
    executions: DashMap<TaskId, ExecutionRecord>,
    events: broadcast::Sender<DispatchEvent>,
    counters: Counters,
}

impl TaskDispatcher {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        remote: Arc<dyn RemoteExecutor>,
        local: Arc<LocalExecutor>,
    ) -> Arc<Self> {
        let policy = PlacementPolicy::for_cache_ttl(nodes.config().health_cache_ttl);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new(Self {
            nodes,
            policy,
            remote,
            local,
            executions: DashMap::new(),
            events,
            counters: Counters::default(),
        })
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Latest known record for a task submitted through this dispatcher.
    pub fn execution(&self, task_id: &TaskId) -> Option<TaskExecution> {
        self.executions
            .get(task_id)
            .map(|record| record.execution.clone())
    }

    /// Drops records of finished tasks. Returns how many were removed.
    pub fn forget_finished(&self) -> usize {
        let before = self.executions.len();
        self.executions
            .retain(|_, record| !record.execution.state.is_terminal());
        before.saturating_sub(self.executions.len())
    }

    /// Drops records of tasks that finished more than `retention` ago.
    /// Returns how many were removed.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let before = self.executions.len();
        let now = Instant::now();
        self.executions.retain(|_, record| match record.finished_at {
            Some(finished_at) => now.saturating_duration_since(finished_at) <= retention,
            None => true,
        });
        before.saturating_sub(self.executions.len())
    }

    pub fn spawn_sweeper(self: Arc<Self>, retention: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                let pruned = self.prune_finished(retention);
                if pruned > 0 {
                    tracing::debug!("Pruned {} finished execution record(s)", pruned);
                }
            }
        })
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            remote_completed: self.counters.remote_completed.load(Ordering::Relaxed),
            local_completed: self.counters.local_completed.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            ambiguous_outcomes: self.counters.ambiguous_outcomes.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Runs `task` to a terminal state and returns its final execution record.
    pub async fn submit(&self, task: Task) -> TaskExecution {
        let mut execution = TaskExecution::new(task);
        self.record(&execution);

        if let Err(e) = self
            .local
            .registry()
            .validate(&execution.task.task_type, &execution.task.payload)
        {
            tracing::warn!("Rejected task {}: {}", execution.task_id(), e);
            execution.fail(e.to_string());
            return self.finish(execution);
        }

        let (candidates, snapshots) = self.nodes.list_healthy_with_snapshots().await;
        let selected = self
            .policy
            .select_node(&candidates, &snapshots, Instant::now());

        match selected {
            Some(node) => self.run_remote(execution, node).await,
            None => {
                tracing::debug!(
                    "No healthy node for task {} ({} registered), running locally",
                    execution.task_id(),
                    self.nodes.len()
                );
                self.run_local(execution).await
            }
        }
    }

    /// Spawns `submit` in the background. Progress is available through
    /// `execution`, `wait_for` and `subscribe`.
    pub fn submit_detached(self: &Arc<Self>, task: Task) -> TaskId {
        let task_id = task.task_id.clone();
        self.record(&TaskExecution::new(task.clone()));

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.submit(task).await;
        });

        task_id
    }

    /// Waits until `task_id` reaches a terminal state, or `timeout` elapses.
    pub async fn wait_for(&self, task_id: &TaskId, timeout: Duration) -> Option<TaskExecution> {
        let mut events = self.subscribe();

        if let Some(execution) = self.execution(task_id)
            && execution.state.is_terminal()
        {
            return Some(execution);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(DispatchEvent::Finished { task_id: finished, .. }) if &finished == task_id => {
                        return self.execution(task_id);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(execution) = self.execution(task_id)
                            && execution.state.is_terminal()
                        {
                            return Some(execution);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return self.execution(task_id),
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    async fn run_remote(&self, mut execution: TaskExecution, node: Node) -> TaskExecution {
        let target = Target::Node(node.id.clone());
        tracing::info!("Task {} placed on node {}", execution.task_id(), node.id);
        execution.assign(target.clone());
        self.record(&execution);
        self.emit(DispatchEvent::Placed {
            task_id: execution.task_id().clone(),
            target,
        });

        execution.start();
        self.record(&execution);

        match self.remote.execute(&node, &execution.task).await {
            Ok(result) => {
                self.counters.remote_completed.fetch_add(1, Ordering::Relaxed);
                execution.complete(result);
                self.finish(execution)
            }
            Err(RemoteError::TaskFailed { message, .. }) => {
                execution.fail(message);
                self.finish(execution)
            }
            Err(e) => {
                if e.needs_reprobe() {
                    self.nodes.mark_for_reprobe(&node.id);
                }

                if e.is_ambiguous() {
                    self.counters.ambiguous_outcomes.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "Task {} has no confirmed outcome on node {} and may still be running there; falling back to local execution",
                        execution.task_id(),
                        node.id
                    );
                } else {
                    tracing::warn!(
                        "Node {} unavailable for task {} ({}), falling back to local execution",
                        node.id,
                        execution.task_id(),
                        e
                    );
                }

                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                self.emit(DispatchEvent::FellBack {
                    task_id: execution.task_id().clone(),
                    node: node.id.clone(),
                    reason: e.to_string(),
                    ambiguous: e.is_ambiguous(),
                });

                let fresh = execution.retry_fresh(DispatchError::from(e).to_string());
                self.run_local(fresh).await
            }
        }
    }

    async fn run_local(&self, mut execution: TaskExecution) -> TaskExecution {
        execution.assign(Target::Local);
        self.record(&execution);
        self.emit(DispatchEvent::Placed {
            task_id: execution.task_id().clone(),
            target: Target::Local,
        });

        execution.start();
        self.record(&execution);

        match self.local.execute_local(&execution.task).await {
            Ok(result) => {
                self.counters.local_completed.fetch_add(1, Ordering::Relaxed);
                execution.complete(result);
            }
            Err(e) => execution.fail(e.to_string()),
        }

        self.finish(execution)
    }

    fn finish(&self, execution: TaskExecution) -> TaskExecution {
        match execution.state {
            TaskState::Completed => tracing::info!(
                "Task {} completed on {} after {} attempt(s)",
                execution.task_id(),
                execution.target,
                execution.attempt_count()
            ),
            _ => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "Task {} failed on {}: {}",
                    execution.task_id(),
                    execution.target,
                    execution.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        self.record(&execution);
        self.emit(DispatchEvent::Finished {
            task_id: execution.task_id().clone(),
            target: execution.target.clone(),
            state: execution.state,
        });
        execution
    }

    fn record(&self, execution: &TaskExecution) {
        let finished_at = execution.state.is_terminal().then(Instant::now);
        self.executions.insert(
            execution.task_id().clone(),
            ExecutionRecord {
                execution: execution.clone(),
                finished_at,
            },
        );
    }

    fn emit(&self, event: DispatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
