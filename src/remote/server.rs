//! Remote Task Server
//!
//! The node-side half of the wire protocol. Accepted tasks run on spawned tokio tasks,
//! one worker slot (semaphore permit) each; when every slot is taken new submissions are
//! refused as saturated instead of queueing, so the caller can fall back right away.
//!
//! ## Responsibilities
//! - **Submit**: validate, claim a worker slot, record the task as RUNNING, return immediately.
//! - **Status**: report the recorded state, with the result or error once terminal.
//! - **Health**: report host CPU/memory and the number of occupied worker slots.
//! - **Retention**: forget finished tasks after a retention period.

use super::handlers::{handle_get_task_status, handle_health, handle_submit_task};
use super::protocol::*;
use super::system::LoadSampler;
use crate::executor::registry::{HandlerContext, TaskHandlerRegistry};
use crate::executor::types::*;

use anyhow::Result;
use axum::Router;
use axum::extract::Extension;
use axum::routing::{get, post};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// The node's record of a submitted task.
#[derive(Debug, Clone)]
pub struct ServerTaskEntry {
    pub task_type: String,
    pub state: TaskState,
    pub result: Option<Payload>,
    pub error: Option<String>,
    pub submitted_at: Instant,
    pub finished_at: Option<Instant>,
}

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Accepted now, or already known under the same id; carries the current state.
    Accepted(TaskState),
    /// Every worker slot is busy.
    Saturated,
    /// Unknown task type or missing payload fields.
    Invalid(String),
}

pub struct RemoteTaskServer {
    handlers: Arc<TaskHandlerRegistry>,
    tasks: DashMap<TaskId, ServerTaskEntry>,
    permits: Arc<Semaphore>,
    max_workers: usize,
    load: Arc<dyn LoadSampler>,
}

impl RemoteTaskServer {
    pub fn new(
        handlers: Arc<TaskHandlerRegistry>,
        max_workers: usize,
        load: Arc<dyn LoadSampler>,
    ) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        Arc::new(Self {
            handlers,
            tasks: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            load,
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn active_task_count(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    /// Accepts a task for execution on this node.
    pub fn submit(self: &Arc<Self>, request: SubmitTaskRequest) -> SubmitOutcome {
        if let Some(existing) = self.tasks.get(&request.task_id) {
            tracing::debug!(
                "Task {} resubmitted, already {}",
                request.task_id,
                existing.state
            );
            return SubmitOutcome::Accepted(existing.state);
        }

        if let Err(e) = self.handlers.validate(&request.task_type, &request.payload) {
            tracing::warn!("Rejected task {}: {}", request.task_id, e);
            return SubmitOutcome::Invalid(e.to_string());
        }

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    "Rejected task {}: node saturated ({} workers busy)",
                    request.task_id,
                    self.max_workers
                );
                return SubmitOutcome::Saturated;
            }
        };

        match self.tasks.entry(request.task_id.clone()) {
            // Lost a race against a concurrent submission of the same id.
            Entry::Occupied(occupied) => return SubmitOutcome::Accepted(occupied.get().state),
            Entry::Vacant(vacant) => {
                vacant.insert(ServerTaskEntry {
                    task_type: request.task_type.clone(),
                    state: TaskState::Running,
                    result: None,
                    error: None,
                    submitted_at: Instant::now(),
                    finished_at: None,
                });
            }
        }

        tracing::info!(
            "Accepted task {} (type: {}, {} of {} workers busy)",
            request.task_id,
            request.task_type,
            self.active_task_count(),
            self.max_workers
        );

        let server = self.clone();
        tokio::spawn(async move {
            // The handler runs on its own task so a panic still ends in FAILED.
            let runner = server.clone();
            let submitted = request.clone();
            let outcome = match tokio::spawn(async move { runner.run(&submitted).await }).await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(format!("handler panicked: {}", join_error)),
            };
            // Slot is released before the state turns terminal.
            drop(permit);
            server.finish(&request.task_id, outcome);
        });

        SubmitOutcome::Accepted(TaskState::Running)
    }

    async fn run(&self, request: &SubmitTaskRequest) -> Result<Payload, String> {
        let ctx = HandlerContext::new(request.task_id.clone());
        let cancel = ctx.cancel.clone();
        let timeout = Duration::from_millis(request.timeout_ms);

        let execution = self
            .handlers
            .execute(&request.task_type, request.payload.clone(), ctx);

        match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(_) => {
                cancel.cancel();
                Err(format!("task timed out after {:?}", timeout))
            }
        }
    }

    fn finish(&self, task_id: &TaskId, outcome: Result<Payload, String>) {
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            return;
        };

        entry.finished_at = Some(Instant::now());
        match outcome {
            Ok(result) => {
                entry.state = TaskState::Completed;
                entry.result = Some(result);
                tracing::info!("Task {} completed", task_id);
            }
            Err(error) => {
                entry.state = TaskState::Failed;
                tracing::error!("Task {} failed: {}", task_id, error);
                entry.error = Some(error);
            }
        }
    }

    /// Current state of a task, with its result or error when terminal.
    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatusResponse> {
        self.tasks.get(task_id).map(|entry| TaskStatusResponse {
            task_id: task_id.clone(),
            state: entry.state,
            result: entry.result.clone(),
            error: entry.error.clone(),
        })
    }

    pub fn health(&self) -> HealthResponse {
        let load = self.load.sample();
        HealthResponse {
            reachable: true,
            cpu_percent: load.cpu_percent,
            memory_percent: load.memory_percent,
            active_task_count: self.active_task_count() as u32,
        }
    }

    /// Forgets terminal tasks that finished more than `retention` ago.
    /// Returns how many were removed.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let before = self.tasks.len();
        let now = Instant::now();
        self.tasks.retain(|_, entry| match entry.finished_at {
            Some(finished_at) => now.saturating_duration_since(finished_at) <= retention,
            None => true,
        });
        before.saturating_sub(self.tasks.len())
    }

    pub fn spawn_sweeper(self: Arc<Self>, retention: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(retention.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                let pruned = self.prune_finished(retention);
                if pruned > 0 {
                    tracing::debug!("Pruned {} finished task record(s)", pruned);
                }
            }
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(ENDPOINT_TASKS, post(handle_submit_task))
            .route(&format!("{}/:task_id", ENDPOINT_TASKS), get(handle_get_task_status))
            .route(ENDPOINT_HEALTH, get(handle_health))
            .layer(Extension(self))
    }

    /// Serves the wire protocol on `listener` until the process exits.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> Result<()> {
        tracing::info!(
            "Task server listening on {} with {} worker(s)",
            listener.local_addr()?,
            self.max_workers
        );
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}
