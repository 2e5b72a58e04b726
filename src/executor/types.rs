use crate::node::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Opaque key/value map handed to a handler and returned by it.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Default per-task timeout when the caller does not provide one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Wraps an arbitrary JSON value as a payload. Objects are used as-is,
/// anything else is stored under the `"value"` key.
pub fn into_payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Unique identifier for a task.
///
/// Either supplied by the caller or generated as a UUID v4 string. The same id is
/// used on the wire, so a node and the dispatcher always agree on which task is which.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generates a new random UUID v4-based TaskId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a task execution, shared by the dispatcher and the wire protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Created, no placement decided yet.
    Pending,
    /// Placement decided (a node or local).
    Assigned,
    /// Accepted by an executor.
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Transitions only move forward: PENDING -> ASSIGNED -> RUNNING -> terminal.
    /// FAILED is reachable from any non-terminal state.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Assigned, Running)
                | (Running, Completed)
                | (Pending, Failed)
                | (Assigned, Failed)
                | (Running, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Where an execution attempt runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Target {
    Local,
    Node(NodeId),
}

impl Target {
    pub const LOCAL: &'static str = "local";

    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => f.write_str(Self::LOCAL),
            Target::Node(id) => write!(f, "{}", id),
        }
    }
}

impl From<Target> for String {
    fn from(target: Target) -> Self {
        target.to_string()
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        if s == Target::LOCAL {
            Target::Local
        } else {
            Target::Node(NodeId(s))
        }
    }
}

/// A unit of submitted work. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,
    /// Key into the `TaskHandlerRegistry`.
    pub task_type: String,
    pub payload: Payload,
    /// Higher is more urgent. Only breaks ties, there is no queue.
    pub priority: i32,
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Task {
    pub fn new(task_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            task_id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            priority: 0,
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    pub fn with_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Outcome of one attempt, kept for diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub target: Target,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

/// The dispatcher's record of one attempt to run a `Task`.
///
/// `result` is only present in `COMPLETED`, `error` only in `FAILED`.
/// `attempts` lists earlier attempts that led to this one (at most one remote attempt
/// precedes a local one).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    pub task: Task,
    pub target: Target,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
}

impl TaskExecution {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            target: Target::Local,
            state: TaskState::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            attempts: Vec::new(),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.task_id
    }

    pub fn assign(&mut self, target: Target) {
        if self.advance(TaskState::Assigned) {
            self.target = target;
        }
    }

    pub fn start(&mut self) {
        if self.advance(TaskState::Running) {
            self.started_at = Some(SystemTime::now());
        }
    }

    pub fn complete(&mut self, result: Payload) {
        if self.advance(TaskState::Completed) {
            self.result = Some(result);
            self.finished_at = Some(SystemTime::now());
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if self.advance(TaskState::Failed) {
            self.error = Some(error.into());
            self.finished_at = Some(SystemTime::now());
        }
    }

    /// Closes this attempt and opens a fresh PENDING execution of the same task,
    /// carrying the attempt history forward.
    pub fn retry_fresh(mut self, error: impl Into<String>) -> TaskExecution {
        self.fail(error);

        let mut attempts = std::mem::take(&mut self.attempts);
        attempts.push(AttemptRecord {
            target: self.target,
            state: self.state,
            error: self.error,
            started_at: self.started_at,
            finished_at: self.finished_at,
        });

        let mut fresh = TaskExecution::new(self.task);
        fresh.attempts = attempts;
        fresh
    }

    /// Number of attempts this execution represents, including itself.
    pub fn attempt_count(&self) -> usize {
        self.attempts.len() + 1
    }

    fn advance(&mut self, next: TaskState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            tracing::warn!(
                "Ignoring invalid transition {} -> {} for task {}",
                self.state,
                next,
                self.task.task_id
            );
            false
        }
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
