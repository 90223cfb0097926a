//! API handler implementations.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::api::types::{
    ExecuteRequest, GatherRequest, GatherResponse, HasPropertiesResponse, OutcomesResponse,
    PendingTaskResponse, PropertiesResponse, PropertyKeysRequest, PullRequest, PushRequest,
    ResultQuery, ResultRequest, ScatterRequest, SetPropertiesRequest, SubmitResponse,
    TargetsRequest,
};
use crate::controller::ControllerHandle;
use crate::error::ControllerError;
use crate::registry::{EngineInfo, RegistryError};
use crate::tasks::{Task, TaskId, TaskQueueError, TaskStatus};

/// API errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Controller-level error.
    #[error(transparent)]
    Controller(#[from] ControllerError),
    /// Validation error.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Controller(err) => match err {
                ControllerError::Registry(RegistryError::UnknownEngine(_))
                | ControllerError::Task(TaskQueueError::UnknownTask(_)) => StatusCode::NOT_FOUND,
                ControllerError::NoEngine
                | ControllerError::Registry(_)
                | ControllerError::Task(_) => StatusCode::CONFLICT,
                ControllerError::Serialization(_) | ControllerError::NotASequence { .. } => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                ControllerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                ControllerError::GatherIncomplete { .. }
                | ControllerError::UnexpectedReply { .. }
                | ControllerError::Transport(_) => StatusCode::BAD_GATEWAY,
                ControllerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
                ControllerError::Correlation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Controller(err) => match err {
                ControllerError::Registry(_) => "registry",
                ControllerError::NoEngine => "no_engine",
                ControllerError::Serialization(_) => "serialization",
                ControllerError::Correlation(_) => "correlation",
                ControllerError::GatherIncomplete { .. } => "gather_incomplete",
                ControllerError::NotASequence { .. } => "not_a_sequence",
                ControllerError::UnexpectedReply { .. } => "unexpected_reply",
                ControllerError::InvalidRequest(_) => "invalid_request",
                ControllerError::Task(_) => "task",
                ControllerError::Transport(_) => "transport",
                ControllerError::Stopped => "stopped",
            },
            Self::ValidationError(_) => "validation",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.to_string(),
            "error_type": self.error_type(),
        });
        if let Self::Controller(ControllerError::GatherIncomplete { failures, .. }) = &self {
            body["failures"] = json!(failures);
        }
        (self.status(), Json(body)).into_response()
    }
}

fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse::<u64>()
        .map(TaskId::new)
        .map_err(|_| ApiError::ValidationError(format!("Invalid task ID: {raw}")))
}

/// GET /api/v1/engines
pub async fn list_engines(
    State(handle): State<ControllerHandle>,
) -> Result<Json<Vec<EngineInfo>>, ApiError> {
    Ok(Json(handle.engines().await?))
}

/// POST /api/v1/execute
pub async fn execute(
    State(handle): State<ControllerHandle>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<OutcomesResponse>, ApiError> {
    let outcomes = handle.execute(req.targets, req.code).await?;
    Ok(Json(outcomes.into()))
}

/// POST /api/v1/push
pub async fn push(
    State(handle): State<ControllerHandle>,
    Json(req): Json<PushRequest>,
) -> Result<Json<OutcomesResponse>, ApiError> {
    let outcomes = handle.push(req.targets, req.bindings).await?;
    Ok(Json(outcomes.into()))
}

/// POST /api/v1/pull
pub async fn pull(
    State(handle): State<ControllerHandle>,
    Json(req): Json<PullRequest>,
) -> Result<Json<OutcomesResponse>, ApiError> {
    let outcomes = handle.pull(req.targets, req.names).await?;
    Ok(Json(outcomes.into()))
}

/// POST /api/v1/reset
pub async fn reset(
    State(handle): State<ControllerHandle>,
    Json(req): Json<TargetsRequest>,
) -> Result<Json<OutcomesResponse>, ApiError> {
    Ok(Json(handle.reset(req.targets).await?.into()))
}

/// POST /api/v1/keys
pub async fn keys(
    State(handle): State<ControllerHandle>,
    Json(req): Json<TargetsRequest>,
) -> Result<Json<OutcomesResponse>, ApiError> {
    Ok(Json(handle.keys(req.targets).await?.into()))
}

/// POST /api/v1/kill
pub async fn kill(
    State(handle): State<ControllerHandle>,
    Json(req): Json<TargetsRequest>,
) -> Result<Json<OutcomesResponse>, ApiError> {
    Ok(Json(handle.kill(req.targets).await?.into()))
}

/// POST /api/v1/result
pub async fn get_result(
    State(handle): State<ControllerHandle>,
    Json(req): Json<ResultRequest>,
) -> Result<Json<OutcomesResponse>, ApiError> {
    Ok(Json(handle.get_result(req.targets, req.index).await?.into()))
}

/// POST /api/v1/properties/get
pub async fn get_properties(
    State(handle): State<ControllerHandle>,
    Json(req): Json<PropertyKeysRequest>,
) -> Result<Json<PropertiesResponse>, ApiError> {
    let properties = handle.get_properties(req.targets, req.keys).await?;
    Ok(Json(PropertiesResponse { properties }))
}

/// POST /api/v1/properties/set
pub async fn set_properties(
    State(handle): State<ControllerHandle>,
    Json(req): Json<SetPropertiesRequest>,
) -> Result<Json<PropertiesResponse>, ApiError> {
    let properties = handle.set_properties(req.targets, req.properties).await?;
    Ok(Json(PropertiesResponse { properties }))
}

/// POST /api/v1/properties/has
pub async fn has_properties(
    State(handle): State<ControllerHandle>,
    Json(req): Json<PropertyKeysRequest>,
) -> Result<Json<HasPropertiesResponse>, ApiError> {
    if req.keys.is_empty() {
        return Err(ApiError::ValidationError("keys must not be empty".into()));
    }
    let present = handle.has_properties(req.targets, req.keys).await?;
    Ok(Json(HasPropertiesResponse { present }))
}

/// POST /api/v1/properties/del
pub async fn del_properties(
    State(handle): State<ControllerHandle>,
    Json(req): Json<PropertyKeysRequest>,
) -> Result<Json<PropertiesResponse>, ApiError> {
    let properties = handle.del_properties(req.targets, req.keys).await?;
    Ok(Json(PropertiesResponse { properties }))
}

/// POST /api/v1/properties/clear
pub async fn clear_properties(
    State(handle): State<ControllerHandle>,
    Json(req): Json<TargetsRequest>,
) -> Result<Json<PropertiesResponse>, ApiError> {
    let properties = handle.clear_properties(req.targets).await?;
    Ok(Json(PropertiesResponse { properties }))
}

/// POST /api/v1/scatter
pub async fn scatter(
    State(handle): State<ControllerHandle>,
    Json(req): Json<ScatterRequest>,
) -> Result<Json<OutcomesResponse>, ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::ValidationError("name must not be empty".into()));
    }
    let outcomes = handle
        .scatter(req.targets, req.name, req.values, req.style)
        .await?;
    Ok(Json(outcomes.into()))
}

/// POST /api/v1/gather
pub async fn gather(
    State(handle): State<ControllerHandle>,
    Json(req): Json<GatherRequest>,
) -> Result<Json<GatherResponse>, ApiError> {
    let values = handle
        .gather(req.targets, req.name.clone(), req.style)
        .await?;
    Ok(Json(GatherResponse {
        name: req.name,
        values,
    }))
}

/// POST /api/v1/tasks
pub async fn submit_task(
    State(handle): State<ControllerHandle>,
    Json(task): Json<Task>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let task_id = handle.submit(task).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { task_id })))
}

/// GET /api/v1/tasks
pub async fn task_status(
    State(handle): State<ControllerHandle>,
) -> Result<Json<TaskStatus>, ApiError> {
    Ok(Json(handle.task_status().await?))
}

/// GET /api/v1/tasks/{id}
///
/// Returns the result of a finished task, or `202` while it is still
/// queued or running. `?block=true` waits for it to finish.
pub async fn get_task(
    State(handle): State<ControllerHandle>,
    Path(id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&id)?;
    let response = match handle.result(task_id, query.block).await? {
        Some(result) => Json(result).into_response(),
        None => (
            StatusCode::ACCEPTED,
            Json(PendingTaskResponse {
                task_id,
                state: "pending",
            }),
        )
            .into_response(),
    };
    Ok(response)
}

/// DELETE /api/v1/tasks/{id}
pub async fn discard_task(
    State(handle): State<ControllerHandle>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    handle.discard(parse_task_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/tasks/{id}/abort
pub async fn abort_task(
    State(handle): State<ControllerHandle>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    handle.abort(parse_task_id(&id)?).await?;
    Ok(StatusCode::ACCEPTED)
}
