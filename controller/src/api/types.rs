//! Request/Response Types for the client API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ops::ScatterStyle;
use crate::pending::Outcomes;
use crate::protocol::{Bindings, EngineId, EngineReply, FailureKind};
use crate::registry::TargetSelector;
use crate::tasks::TaskId;

/// Body of `/execute`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecuteRequest {
    /// Engines to run on.
    pub targets: TargetSelector,
    /// Code to run.
    pub code: String,
}

/// Body of `/push`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushRequest {
    /// Engines to bind on.
    pub targets: TargetSelector,
    /// Names and values to bind.
    pub bindings: Bindings,
}

/// Body of `/pull`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullRequest {
    /// Engines to read from.
    pub targets: TargetSelector,
    /// Names to read.
    pub names: Vec<String>,
}

/// Body of the target-only operations (`/reset`, `/keys`, `/kill`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetsRequest {
    /// Engines to address.
    pub targets: TargetSelector,
}

/// Body of `/result`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultRequest {
    /// Engines to read from.
    pub targets: TargetSelector,
    /// History position; the latest execution when absent.
    #[serde(default)]
    pub index: Option<usize>,
}

/// Body of `/properties/get`, `/properties/has` and `/properties/del`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropertyKeysRequest {
    /// Engines to address.
    pub targets: TargetSelector,
    /// Property names. `/properties/get` reads every property when empty.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// Body of `/properties/set`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetPropertiesRequest {
    /// Engines to update.
    pub targets: TargetSelector,
    /// Properties to merge in.
    pub properties: Bindings,
}

/// Properties per engine.
#[derive(Debug, Clone, Serialize)]
pub struct PropertiesResponse {
    /// Selected or resulting properties by engine.
    pub properties: BTreeMap<EngineId, Bindings>,
}

/// Answer of `/properties/has`.
#[derive(Debug, Clone, Serialize)]
pub struct HasPropertiesResponse {
    /// Per engine, whether each requested key is set, in request order.
    pub present: BTreeMap<EngineId, Vec<bool>>,
}

/// Body of `/scatter`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScatterRequest {
    /// Engines to spread over.
    pub targets: TargetSelector,
    /// Name to bind each partition to.
    pub name: String,
    /// Values to partition.
    pub values: Vec<Value>,
    /// Partition layout.
    #[serde(default)]
    pub style: ScatterStyle,
}

/// Body of `/gather`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatherRequest {
    /// Engines to collect from.
    pub targets: TargetSelector,
    /// Name to collect.
    pub name: String,
    /// Partition layout used when scattering.
    #[serde(default)]
    pub style: ScatterStyle,
}

/// Concatenated values returned by `/gather`.
#[derive(Debug, Clone, Serialize)]
pub struct GatherResponse {
    /// Gathered name.
    pub name: String,
    /// Values in ascending engine order.
    pub values: Vec<Value>,
}

/// One engine's outcome in a multi-engine response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EngineOutcome {
    /// The call succeeded.
    Ok {
        /// The engine's reply.
        reply: EngineReply,
    },
    /// The call failed.
    Error {
        /// Failure classification.
        kind: FailureKind,
        /// Human-readable detail.
        detail: String,
    },
}

/// Per-engine outcomes of a multi-engine operation.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomesResponse {
    /// Outcome per engine.
    pub outcomes: BTreeMap<EngineId, EngineOutcome>,
}

impl From<Outcomes> for OutcomesResponse {
    fn from(outcomes: Outcomes) -> Self {
        let outcomes = outcomes
            .into_inner()
            .into_iter()
            .map(|(engine_id, outcome)| {
                let outcome = match outcome {
                    Ok(reply) => EngineOutcome::Ok { reply },
                    Err(failure) => EngineOutcome::Error {
                        kind: failure.kind,
                        detail: failure.detail,
                    },
                };
                (engine_id, outcome)
            })
            .collect();
        Self { outcomes }
    }
}

/// Answer to a task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// The new task's ID.
    pub task_id: TaskId,
}

/// Query of `GET /tasks/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultQuery {
    /// Wait for the task to finish.
    #[serde(default)]
    pub block: bool,
}

/// Answer for a task that has not finished yet.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTaskResponse {
    /// Task ID.
    pub task_id: TaskId,
    /// Always `"pending"`.
    pub state: &'static str,
}
