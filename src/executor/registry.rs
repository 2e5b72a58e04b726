//! Task Handler Registry
//!
//! A registry that maps string task types (e.g., "echo") to executable Rust closures.
//! Both the local fallback path and the node-side server dispatch through the same
//! registry, so a task produces the same result wherever it runs.

use super::types::*;
use crate::error::DispatchError;

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to a handler next to its payload.
///
/// Handlers that can stop early should watch `cancel`; it fires when the task's
/// timeout elapses. Handlers that ignore it simply run to completion.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task_id: TaskId,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            cancel: CancellationToken::new(),
        }
    }
}

/// Type alias for a thread-safe, asynchronous task handler function.
pub type TaskHandlerFn = Arc<
    dyn Fn(Payload, HandlerContext) -> Pin<Box<dyn Future<Output = Result<Payload>> + Send>>
        + Send
        + Sync,
>;

struct RegisteredHandler {
    handler: TaskHandlerFn,
    required_fields: Vec<String>,
}

/// Registry holding the mapping between task types and their implementation.
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, RegisteredHandler>,
}

impl TaskHandlerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a handler under `task_type`, replacing any previous one.
    pub fn register<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(Payload, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        self.register_with_fields(task_type, &[], handler);
    }

    /// Registers a handler whose payload must contain every key in `required_fields`.
    /// Tasks missing one of them are rejected by `validate` before any placement.
    pub fn register_with_fields<F, Fut>(&self, task_type: &str, required_fields: &[&str], handler: F)
    where
        F: Fn(Payload, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload>> + Send + 'static,
    {
        // Box::pin erases the concrete future type so different handlers share one map.
        let handler_fn: TaskHandlerFn = Arc::new(move |payload: Payload, ctx: HandlerContext| {
            Box::pin(handler(payload, ctx)) as Pin<Box<dyn Future<Output = Result<Payload>> + Send>>
        });

        self.handlers.insert(
            task_type.to_string(),
            RegisteredHandler {
                handler: handler_fn,
                required_fields: required_fields.iter().map(|f| f.to_string()).collect(),
            },
        );

        tracing::info!("Registered task handler: {}", task_type);
    }

    /// Checks that the task's type is known and its payload carries the required fields.
    pub fn validate(&self, task_type: &str, payload: &Payload) -> Result<(), DispatchError> {
        let entry = self.handlers.get(task_type).ok_or_else(|| {
            DispatchError::Configuration(format!("Unknown task type: {}", task_type))
        })?;

        let missing: Vec<&str> = entry
            .required_fields
            .iter()
            .filter(|field| !payload.contains_key(field.as_str()))
            .map(|field| field.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(DispatchError::Configuration(format!(
                "Task type '{}' is missing required payload fields: {}",
                task_type,
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// Looks up the handler for `task_type` and runs it with `payload`.
    ///
    /// # Returns
    /// * `Ok(result)` if the handler executed successfully.
    /// * `Err` if the handler failed or if no handler exists for the given type.
    pub async fn execute(
        &self,
        task_type: &str,
        payload: Payload,
        ctx: HandlerContext,
    ) -> Result<Payload> {
        // Clone the Arc out so the map guard is not held across the await.
        let handler_fn = match self.handlers.get(task_type) {
            Some(entry) => entry.handler.clone(),
            None => {
                let error = format!("Unknown task type: {}", task_type);
                tracing::error!("{}", error);
                return Err(anyhow::anyhow!(error));
            }
        };

        tracing::debug!(
            "Executing task {} with handler '{}' ({} payload keys)",
            ctx.task_id,
            task_type,
            payload.len()
        );

        handler_fn(payload, ctx).await
    }

    /// Returns a sorted list of all registered task types.
    pub fn list_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}
