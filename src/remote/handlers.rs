use super::protocol::*;
use super::server::{RemoteTaskServer, SubmitOutcome};
use crate::executor::types::TaskId;

use axum::{Extension, Json, extract::Path, http::StatusCode};
use std::sync::Arc;

pub async fn handle_submit_task(
    Extension(server): Extension<Arc<RemoteTaskServer>>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), (StatusCode, Json<RejectResponse>)> {
    let task_id = req.task_id.clone();

    match server.submit(req) {
        SubmitOutcome::Accepted(state) => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitTaskResponse { task_id, state }),
        )),
        SubmitOutcome::Saturated => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(RejectResponse {
                reason: REASON_SATURATED.to_string(),
            }),
        )),
        SubmitOutcome::Invalid(reason) => {
            Err((StatusCode::BAD_REQUEST, Json(RejectResponse { reason })))
        }
    }
}

pub async fn handle_get_task_status(
    Extension(server): Extension<Arc<RemoteTaskServer>>,
    Path(task_id_str): Path<String>,
) -> Result<Json<TaskStatusResponse>, (StatusCode, Json<RejectResponse>)> {
    let task_id = TaskId(task_id_str);

    match server.status(&task_id) {
        Some(status) => {
            tracing::trace!("Task status query: {} -> {}", task_id, status.state);
            Ok(Json(status))
        }
        None => {
            tracing::debug!("Task not found: {}", task_id);
            Err((
                StatusCode::NOT_FOUND,
                Json(RejectResponse {
                    reason: format!("unknown task {}", task_id),
                }),
            ))
        }
    }
}

pub async fn handle_health(
    Extension(server): Extension<Arc<RemoteTaskServer>>,
) -> Json<HealthResponse> {
    Json(server.health())
}
