//! Route table for the client API.

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::handlers::{
    abort_task, clear_properties, del_properties, discard_task, execute, gather, get_properties,
    get_result, get_task, has_properties, keys, kill, list_engines, pull, push, reset, scatter,
    set_properties, submit_task, task_status,
};
use crate::controller::ControllerHandle;

/// API routes mounted at `/api/v1`.
pub fn routes() -> Router<ControllerHandle> {
    Router::new()
        .route("/api/v1/engines", get(list_engines))
        .route("/api/v1/execute", post(execute))
        .route("/api/v1/push", post(push))
        .route("/api/v1/pull", post(pull))
        .route("/api/v1/reset", post(reset))
        .route("/api/v1/keys", post(keys))
        .route("/api/v1/kill", post(kill))
        .route("/api/v1/result", post(get_result))
        .route("/api/v1/properties/get", post(get_properties))
        .route("/api/v1/properties/set", post(set_properties))
        .route("/api/v1/properties/has", post(has_properties))
        .route("/api/v1/properties/del", post(del_properties))
        .route("/api/v1/properties/clear", post(clear_properties))
        .route("/api/v1/scatter", post(scatter))
        .route("/api/v1/gather", post(gather))
        .route("/api/v1/tasks", post(submit_task).get(task_status))
        .route("/api/v1/tasks/{id}", get(get_task).delete(discard_task))
        .route("/api/v1/tasks/{id}/abort", post(abort_task))
}
