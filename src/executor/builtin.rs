//! Built-in Task Handlers
//!
//! Small, dependency-free handlers registered on every node and every dispatcher.
//! They double as smoke tests for a deployment: if `echo` round-trips through a node,
//! the wire protocol and the registry agree.

use super::registry::{HandlerContext, TaskHandlerRegistry};
use super::types::Payload;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::time::Duration;

pub const ECHO: &str = "echo";
pub const SLEEP: &str = "sleep";
pub const SUM: &str = "sum";
pub const DIVIDE: &str = "divide";
pub const FAIL: &str = "fail";

/// Registers all built-in handlers on `registry`.
pub fn register_builtin_handlers(registry: &TaskHandlerRegistry) {
    registry.register(ECHO, |payload, _ctx| async move { Ok(payload) });
    registry.register_with_fields(SLEEP, &["duration_ms"], sleep);
    registry.register_with_fields(SUM, &["values"], |payload, _ctx| async move { sum(&payload) });
    registry.register_with_fields(DIVIDE, &["numerator", "denominator"], |payload, _ctx| async move {
        divide(&payload)
    });
    registry.register(FAIL, |payload, _ctx| async move {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("task failed on request");
        Err(anyhow!(message.to_string()))
    });
}

/// Sleeps for `duration_ms`, returning early with an error if the task is cancelled.
async fn sleep(payload: Payload, ctx: HandlerContext) -> Result<Payload> {
    let duration_ms = number_field(&payload, "duration_ms")? as u64;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {
            Ok(to_payload(json!({ "slept_ms": duration_ms })))
        }
        _ = ctx.cancel.cancelled() => {
            Err(anyhow!("sleep cancelled after timeout"))
        }
    }
}

fn sum(payload: &Payload) -> Result<Payload> {
    let values = payload
        .get("values")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("'values' must be an array"))?;

    let mut total = 0.0;
    for value in values {
        total += value
            .as_f64()
            .ok_or_else(|| anyhow!("'values' must contain only numbers, got {}", value))?;
    }

    Ok(to_payload(json!({ "sum": total, "count": values.len() })))
}

fn divide(payload: &Payload) -> Result<Payload> {
    let numerator = number_field(payload, "numerator")?;
    let denominator = number_field(payload, "denominator")?;

    if denominator == 0.0 {
        return Err(anyhow!("division by zero"));
    }

    Ok(to_payload(json!({ "quotient": numerator / denominator })))
}

fn number_field(payload: &Payload, field: &str) -> Result<f64> {
    payload
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("'{}' must be a number", field))
}

fn to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::types::{TaskId, into_payload};

    fn registry() -> std::sync::Arc<TaskHandlerRegistry> {
        let registry = TaskHandlerRegistry::new();
        register_builtin_handlers(&registry);
        registry
    }

    #[tokio::test]
    async fn test_sum_adds_values() {
        let result = registry()
            .execute(
                SUM,
                into_payload(json!({"values": [1, 2, 3.5]})),
                HandlerContext::new(TaskId::new()),
            )
            .await
            .unwrap();

        assert_eq!(result["sum"], json!(6.5));
        assert_eq!(result["count"], json!(3));
    }

    #[tokio::test]
    async fn test_divide_by_zero_fails() {
        let err = registry()
            .execute(
                DIVIDE,
                into_payload(json!({"numerator": 1, "denominator": 0})),
                HandlerContext::new(TaskId::new()),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("division by zero"));
    }

    #[tokio::test]
    async fn test_sleep_stops_on_cancel() {
        let ctx = HandlerContext::new(TaskId::new());
        ctx.cancel.cancel();

        let result = registry()
            .execute(SLEEP, into_payload(json!({"duration_ms": 60_000})), ctx)
            .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_builtin_required_fields() {
        let registry = registry();

        assert!(registry.validate(DIVIDE, &into_payload(json!({"numerator": 1}))).is_err());
        assert!(registry.validate(ECHO, &Payload::new()).is_ok());
        assert_eq!(registry.handler_count(), 5);
    }
}
