//! Remote Execution Client
//!
//! Runs one task on one node: submit, poll until terminal, read the inline result.
//! Every way this can go wrong is classified into a `RemoteError` so the dispatcher
//! can decide between falling back (node at fault) and failing (task at fault).
//!
//! There is exactly one submit per call. Transient errors while *polling* are retried
//! with backoff, since they do not risk running the task twice.

use super::protocol::*;
use crate::error::RemoteError;
use crate::executor::types::{Payload, Task, TaskState};
use crate::node::types::Node;

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_ATTEMPTS: usize = 3;

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Executes `task` on `node` and returns its result.
    async fn execute(&self, node: &Node, task: &Task) -> Result<Payload, RemoteError>;
}

/// HTTP/JSON implementation of the wire protocol.
#[derive(Clone)]
pub struct HttpRemoteClient {
    http_client: reqwest::Client,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl Default for HttpRemoteClient {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT)
    }
}

impl HttpRemoteClient {
    pub fn new(poll_interval: Duration, request_timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            poll_interval,
            request_timeout,
        }
    }

    /// Submits the task. `Ok` means the node accepted (or already had) it.
    async fn submit(&self, node: &Node, task: &Task) -> Result<TaskState, RemoteError> {
        let url = format!("{}{}", node.address.base_url(), ENDPOINT_TASKS);
        let request = SubmitTaskRequest {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            timeout_ms: task.timeout.as_millis() as u64,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .timeout(self.request_timeout.min(task.timeout))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    // The node may have accepted the task before we gave up.
                    RemoteError::Ambiguous {
                        node: node.id.clone(),
                        waited: self.request_timeout.min(task.timeout),
                    }
                } else {
                    RemoteError::Unreachable {
                        node: node.id.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let ack: SubmitTaskResponse =
                response.json().await.map_err(|e| RemoteError::Protocol {
                    node: node.id.clone(),
                    reason: format!("invalid submit acknowledgement: {}", e),
                })?;
            tracing::debug!("Node {} accepted task {} ({})", node.id, task.task_id, ack.state);
            return Ok(ack.state);
        }

        let reason = response
            .json::<RejectResponse>()
            .await
            .map(|reject| reject.reason)
            .unwrap_or_else(|_| status.to_string());

        if status == StatusCode::SERVICE_UNAVAILABLE && reason == REASON_SATURATED {
            return Err(RemoteError::Saturated {
                node: node.id.clone(),
            });
        }

        Err(RemoteError::Protocol {
            node: node.id.clone(),
            reason: format!("submit rejected with {}: {}", status, reason),
        })
    }

    /// Polls the status endpoint until a terminal state or the task's timeout.
    async fn poll(&self, node: &Node, task: &Task, started: Instant) -> Result<Payload, RemoteError> {
        let url = format!(
            "{}{}/{}",
            node.address.base_url(),
            ENDPOINT_TASKS,
            task.task_id
        );
        let deadline = started + task.timeout;
        let mut last_state: Option<TaskState> = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(RemoteError::Ambiguous {
                    node: node.id.clone(),
                    waited: now.saturating_duration_since(started),
                });
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }

            let response = self
                .get_with_retry(&url, self.request_timeout.min(remaining), POLL_ATTEMPTS)
                .await
                .map_err(|e| RemoteError::Unreachable {
                    node: node.id.clone(),
                    reason: e.to_string(),
                })?;

            if response.status() == StatusCode::NOT_FOUND {
                return Err(RemoteError::Protocol {
                    node: node.id.clone(),
                    reason: format!("node lost track of task {}", task.task_id),
                });
            }
            if !response.status().is_success() {
                return Err(RemoteError::Protocol {
                    node: node.id.clone(),
                    reason: format!("status request failed with {}", response.status()),
                });
            }

            let status: TaskStatusResponse =
                response.json().await.map_err(|e| RemoteError::Protocol {
                    node: node.id.clone(),
                    reason: format!("invalid status body: {}", e),
                })?;

            if last_state != Some(status.state) {
                tracing::trace!(
                    "Task {} on node {}: {:?} -> {}",
                    task.task_id,
                    node.id,
                    last_state,
                    status.state
                );
                last_state = Some(status.state);
            }

            match status.state {
                TaskState::Completed => return Ok(status.result.unwrap_or_default()),
                TaskState::Failed => {
                    return Err(RemoteError::TaskFailed {
                        node: node.id.clone(),
                        message: status
                            .error
                            .unwrap_or_else(|| "task failed without an error message".to_string()),
                    });
                }
                TaskState::Pending | TaskState::Assigned | TaskState::Running => continue,
            }
        }
    }

    async fn get_with_retry(
        &self,
        url: &str,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut delay_ms = 150u64;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.http_client.get(url).timeout(timeout).send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::debug!("Status poll to {} failed (attempt {}): {}", url, attempt, e);
                    // Simple jitter to prevent thundering herd
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for HttpRemoteClient {
    async fn execute(&self, node: &Node, task: &Task) -> Result<Payload, RemoteError> {
        let started = Instant::now();

        let state = self.submit(node, task).await?;
        tracing::debug!(
            "Polling node {} for task {} every {:?}",
            node.id,
            task.task_id,
            self.poll_interval
        );

        // A resubmission may already report a terminal state; the poll picks it up.
        if state.is_terminal() {
            tracing::debug!("Task {} was already {} on node {}", task.task_id, state, node.id);
        }

        self.poll(node, task, started).await
    }
}
