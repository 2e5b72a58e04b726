//! Local Execution Fallback
//!
//! Runs a task in-process through the `TaskHandlerRegistry`. This is the
//! always-available path: it never looks at node state or the network.
//!
//! Handlers run on spawned tokio tasks behind a semaphore, so a burst of fallbacks
//! (many nodes failing at once) cannot run more than `max_workers` handlers at a time.
//! When a task's timeout elapses its cancellation token fires and the caller gets a
//! timeout error immediately; a handler that ignores the token keeps running detached.

use super::registry::{HandlerContext, TaskHandlerRegistry};
use super::types::*;
use crate::error::DispatchError;

use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct LocalExecutor {
    handlers: Arc<TaskHandlerRegistry>,
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl LocalExecutor {
    pub fn new(handlers: Arc<TaskHandlerRegistry>, max_workers: usize) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        Arc::new(Self {
            handlers,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        })
    }

    pub fn registry(&self) -> &Arc<TaskHandlerRegistry> {
        &self.handlers
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Handlers currently holding a worker slot.
    pub fn active_count(&self) -> usize {
        self.max_workers - self.permits.available_permits()
    }

    /// Executes `task` locally and returns whatever the handler returns.
    ///
    /// The timeout covers both waiting for a worker slot and running the handler.
    pub async fn execute_local(&self, task: &Task) -> Result<Payload, DispatchError> {
        self.handlers.validate(&task.task_type, &task.payload)?;

        let ctx = HandlerContext::new(task.task_id.clone());
        let cancel = ctx.cancel.clone();
        let handlers = self.handlers.clone();
        let permits = self.permits.clone();
        let task_type = task.task_type.clone();
        let payload = task.payload.clone();

        let handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| DispatchError::Rejected("local worker pool closed".to_string()))?;

            handlers
                .execute(&task_type, payload, ctx)
                .await
                .map_err(|e| DispatchError::TaskFailed(format!("{:#}", e)))
        });

        match tokio::time::timeout(task.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                tracing::error!("Local worker for task {} panicked: {}", task.task_id, join_error);
                Err(DispatchError::TaskFailed(format!("handler panicked: {}", join_error)))
            }
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    "Task {} exceeded its timeout of {:?} locally",
                    task.task_id,
                    task.timeout
                );
                Err(DispatchError::Timeout(task.timeout))
            }
        }
    }
}
