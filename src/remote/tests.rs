//! Remote Module Tests
//!
//! ## Test Scopes
//! - **Server**: Submission outcomes, idempotent resubmission, retention.
//! - **Wire Protocol**: Status codes and bodies over a real listener.
//! - **Client**: Error classification against live, saturated, silent and absent nodes.

#[cfg(test)]
mod tests {
    use crate::error::{DispatchError, RemoteError};
    use crate::executor::builtin::register_builtin_handlers;
    use crate::executor::local::LocalExecutor;
    use crate::executor::registry::TaskHandlerRegistry;
    use crate::executor::types::*;
    use crate::node::probe::{HealthProbe, HttpHealthProbe};
    use crate::node::types::{Node, NodeAddress};
    use crate::remote::client::{HttpRemoteClient, RemoteExecutor};
    use crate::remote::protocol::*;
    use crate::remote::server::{RemoteTaskServer, SubmitOutcome};
    use crate::remote::system::{FixedLoad, HostLoad};

    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_client() -> HttpRemoteClient {
        HttpRemoteClient::new(Duration::from_millis(20), Duration::from_secs(2))
    }

    fn builtin_server(max_workers: usize) -> Arc<RemoteTaskServer> {
        let handlers = TaskHandlerRegistry::new();
        register_builtin_handlers(&handlers);
        RemoteTaskServer::new(
            handlers,
            max_workers,
            Arc::new(FixedLoad(HostLoad {
                cpu_percent: 12.5,
                memory_percent: 40.0,
            })),
        )
    }

    /// Serves `server` on an ephemeral port and returns a node pointing at it.
    async fn spawn_node(server: Arc<RemoteTaskServer>) -> Node {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(server.serve(listener));
        Node::new("node-under-test", NodeAddress::new("127.0.0.1", port))
    }

    async fn spawn_router(router: Router) -> Node {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, router).await });
        Node::new("fake-node", NodeAddress::new("127.0.0.1", port))
    }

    fn request(task_type: &str, payload: serde_json::Value) -> SubmitTaskRequest {
        SubmitTaskRequest {
            task_id: TaskId::new(),
            task_type: task_type.to_string(),
            payload: into_payload(payload),
            timeout_ms: 5_000,
        }
    }

    async fn wait_terminal(server: &RemoteTaskServer, task_id: &TaskId) -> TaskStatusResponse {
        for _ in 0..200 {
            if let Some(status) = server.status(task_id)
                && status.state.is_terminal()
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached a terminal state", task_id);
    }

    // ============================================================
    // TEST 1: RemoteTaskServer - Submission
    // ============================================================

    #[tokio::test]
    async fn test_server_runs_accepted_task() {
        let server = builtin_server(2);
        let req = request("sum", json!({"values": [1, 2, 3]}));
        let task_id = req.task_id.clone();

        assert_eq!(server.submit(req), SubmitOutcome::Accepted(TaskState::Running));
        let status = wait_terminal(&server, &task_id).await;

        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(status.result.unwrap()["sum"], json!(6.0));
        assert_eq!(server.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_server_rejects_unknown_type() {
        let server = builtin_server(2);

        let outcome = server.submit(request("transcode", json!({})));

        assert!(matches!(outcome, SubmitOutcome::Invalid(reason) if reason.contains("transcode")));
    }

    #[tokio::test]
    async fn test_server_refuses_when_saturated() {
        // ARRANGE: one worker, occupied by a long sleep
        let server = builtin_server(1);
        let blocker = request("sleep", json!({"duration_ms": 2_000}));
        assert_eq!(server.submit(blocker), SubmitOutcome::Accepted(TaskState::Running));

        // ACT
        let outcome = server.submit(request("echo", json!({"x": 1})));

        // ASSERT
        assert_eq!(outcome, SubmitOutcome::Saturated);
        assert_eq!(server.health().active_task_count, 1);
    }

    #[tokio::test]
    async fn test_resubmission_does_not_run_twice() {
        // ARRANGE: handler counting its invocations
        let handlers = TaskHandlerRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        handlers.register("count", move |payload, _ctx| {
            let runs = runs_clone.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(payload)
            }
        });
        let server = RemoteTaskServer::new(
            handlers,
            4,
            Arc::new(FixedLoad(HostLoad {
                cpu_percent: 0.0,
                memory_percent: 0.0,
            })),
        );
        let req = request("count", json!({}));
        let task_id = req.task_id.clone();

        // ACT: submit, let it finish, submit the same id again
        server.submit(req.clone());
        wait_terminal(&server, &task_id).await;
        let second = server.submit(req);

        // ASSERT
        assert_eq!(second, SubmitOutcome::Accepted(TaskState::Completed));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_side_timeout_fails_task() {
        let server = builtin_server(1);
        let mut req = request("sleep", json!({"duration_ms": 10_000}));
        req.timeout_ms = 50;
        let task_id = req.task_id.clone();

        server.submit(req);
        let status = wait_terminal(&server, &task_id).await;

        assert_eq!(status.state, TaskState::Failed);
        assert!(status.error.unwrap().contains("timed out"));
        assert_eq!(server.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_like_local() {
        // ARRANGE: the same panicking handler behind the server and the local executor
        let handlers = TaskHandlerRegistry::new();
        handlers.register("boom", |payload, _ctx| async move {
            if payload.is_empty() {
                panic!("boom");
            }
            Ok(payload)
        });
        let server = RemoteTaskServer::new(
            handlers.clone(),
            1,
            Arc::new(FixedLoad(HostLoad {
                cpu_percent: 0.0,
                memory_percent: 0.0,
            })),
        );
        let local = LocalExecutor::new(handlers, 1);
        let req = request("boom", json!({}));
        let task_id = req.task_id.clone();

        // ACT
        server.submit(req);
        let status = wait_terminal(&server, &task_id).await;
        let local_outcome = local.execute_local(&Task::new("boom", Payload::new())).await;

        // ASSERT: terminal FAILED on the node, slot freed, record prunable
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.error.unwrap().contains("panicked"));
        assert_eq!(server.active_task_count(), 0);
        assert!(matches!(local_outcome, Err(DispatchError::TaskFailed(ref msg)) if msg.contains("panicked")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.prune_finished(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_client_reports_remote_panic_as_task_failure() {
        let handlers = TaskHandlerRegistry::new();
        handlers.register("boom", |payload, _ctx| async move {
            if payload.is_empty() {
                panic!("boom");
            }
            Ok(payload)
        });
        let server = RemoteTaskServer::new(
            handlers,
            1,
            Arc::new(FixedLoad(HostLoad {
                cpu_percent: 0.0,
                memory_percent: 0.0,
            })),
        );
        let node = spawn_node(server).await;

        let err = fast_client()
            .execute(&node, &Task::new("boom", Payload::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::TaskFailed { ref message, .. } if message.contains("panicked")));
    }

    #[tokio::test]
    async fn test_prune_finished() {
        let server = builtin_server(2);
        let req = request("echo", json!({"x": 1}));
        let task_id = req.task_id.clone();
        server.submit(req);
        wait_terminal(&server, &task_id).await;

        assert_eq!(server.prune_finished(Duration::from_secs(600)), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(server.prune_finished(Duration::ZERO), 1);
        assert!(server.status(&task_id).is_none());
    }

    // ============================================================
    // TEST 2: Wire Protocol - HTTP Surface
    // ============================================================

    #[tokio::test]
    async fn test_http_status_codes() {
        let node = spawn_node(builtin_server(2)).await;
        let http = reqwest::Client::new();
        let base = node.address.base_url();

        // 400 for an unknown task type
        let resp = http
            .post(format!("{}/tasks", base))
            .json(&request("transcode", json!({})))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let reject: RejectResponse = resp.json().await.unwrap();
        assert!(reject.reason.contains("Unknown task type"));

        // 404 for a task the node never saw
        let resp = http
            .get(format!("{}/tasks/{}", base, TaskId::new()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        // 202 on accept
        let resp = http
            .post(format!("{}/tasks", base))
            .json(&request("echo", json!({"x": 1})))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_health_probe_reads_node_load() {
        let node = spawn_node(builtin_server(2)).await;

        let snapshot = HttpHealthProbe::new()
            .probe(&node, Duration::from_secs(2))
            .await;

        assert!(snapshot.reachable);
        assert_eq!(snapshot.cpu_percent, 12.5);
        assert_eq!(snapshot.memory_percent, 40.0);
        assert_eq!(snapshot.active_task_count, 0);
    }

    #[tokio::test]
    async fn test_health_probe_folds_errors_into_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let node = Node::new("gone", NodeAddress::new("127.0.0.1", port));

        let snapshot = HttpHealthProbe::new()
            .probe(&node, Duration::from_millis(500))
            .await;

        assert!(!snapshot.reachable);
        assert_eq!(snapshot.active_task_count, 0);
    }

    // ============================================================
    // TEST 3: HttpRemoteClient - Outcome Classification
    // ============================================================

    #[tokio::test]
    async fn test_client_round_trip() {
        let node = spawn_node(builtin_server(2)).await;
        let task = Task::new("echo", into_payload(json!({"x": 1})));

        let result = fast_client().execute(&node, &task).await.unwrap();

        assert_eq!(serde_json::Value::Object(result), json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_client_reports_task_failure() {
        let node = spawn_node(builtin_server(2)).await;
        let task = Task::new("divide", into_payload(json!({"numerator": 1, "denominator": 0})));

        let err = fast_client().execute(&node, &task).await.unwrap_err();

        assert!(!err.is_node_unavailable());
        assert!(matches!(err, RemoteError::TaskFailed { ref message, .. } if message.contains("division by zero")));
    }

    #[tokio::test]
    async fn test_client_reports_saturation() {
        let server = builtin_server(1);
        server.submit(request("sleep", json!({"duration_ms": 2_000})));
        let node = spawn_node(server).await;

        let err = fast_client()
            .execute(&node, &Task::new("echo", Payload::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::Saturated { .. }));
        assert!(err.is_node_unavailable());
        assert!(!err.needs_reprobe());
    }

    #[tokio::test]
    async fn test_client_reports_rejection_as_protocol_error() {
        let node = spawn_node(builtin_server(1)).await;

        let err = fast_client()
            .execute(&node, &Task::new("transcode", Payload::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_client_reports_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let node = Node::new("gone", NodeAddress::new("127.0.0.1", port));

        let err = fast_client()
            .execute(&node, &Task::new("echo", Payload::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::Unreachable { .. }));
        assert!(err.needs_reprobe());
        assert_eq!(err.node().as_str(), "gone");
    }

    #[tokio::test]
    async fn test_client_reports_ambiguous_when_task_never_finishes() {
        // ARRANGE: a node that accepts everything and never leaves RUNNING
        let router = Router::new()
            .route(
                "/tasks",
                post(|Json(req): Json<SubmitTaskRequest>| async move {
                    (
                        StatusCode::ACCEPTED,
                        Json(SubmitTaskResponse {
                            task_id: req.task_id,
                            state: TaskState::Running,
                        }),
                    )
                }),
            )
            .route(
                "/tasks/:task_id",
                get(|Path(task_id): Path<String>| async move {
                    Json(TaskStatusResponse {
                        task_id: TaskId(task_id),
                        state: TaskState::Running,
                        result: None,
                        error: None,
                    })
                }),
            );
        let node = spawn_router(router).await;
        let task = Task::new("echo", Payload::new()).with_timeout(Duration::from_millis(200));

        // ACT
        let err = fast_client().execute(&node, &task).await.unwrap_err();

        // ASSERT
        assert!(err.is_ambiguous());
        assert!(err.is_node_unavailable());
    }

    #[tokio::test]
    async fn test_client_treats_lost_task_as_protocol_error() {
        // A node that acknowledges but then answers 404 (e.g. it restarted)
        let router = Router::new()
            .route(
                "/tasks",
                post(|Json(req): Json<SubmitTaskRequest>| async move {
                    (
                        StatusCode::ACCEPTED,
                        Json(SubmitTaskResponse {
                            task_id: req.task_id,
                            state: TaskState::Running,
                        }),
                    )
                }),
            )
            .route("/tasks/:task_id", get(|| async { StatusCode::NOT_FOUND }));
        let node = spawn_router(router).await;

        let err = fast_client()
            .execute(&node, &Task::new("echo", Payload::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, RemoteError::Protocol { .. }));
    }
}
