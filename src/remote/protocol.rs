//! Network Protocol Definitions
//!
//! Data Transfer Objects exchanged between `HttpRemoteClient` (caller side)
//! and the `RemoteTaskServer` (node side), encoded as JSON over HTTP.
//!
//! - `POST /tasks` submits a task and returns immediately (`202`), or refuses it
//!   with `503 {reason: "saturated"}` / `400 {reason}`.
//! - `GET /tasks/{task_id}` reports the task's current state, with the result or
//!   error inline once terminal.
//! - `GET /health` reports load for placement.

use crate::executor::types::{Payload, TaskId, TaskState};
use serde::{Deserialize, Serialize};

pub const ENDPOINT_TASKS: &str = "/tasks";
pub const ENDPOINT_HEALTH: &str = "/health";

/// Reason string carried by a `503` refusal.
pub const REASON_SATURATED: &str = "saturated";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_id: TaskId,
    pub task_type: String,
    #[serde(default)]
    pub payload: Payload,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
    pub state: TaskState,
}

/// Body of every refusal (`400`, `503`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectResponse {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub reachable: bool,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub active_task_count: u32,
}
