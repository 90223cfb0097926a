use serde_json::Value;

use super::ScatterStyle;
use crate::controller::events::Command;
use crate::controller::ControllerHandle;
use crate::error::ControllerError;
use crate::pending::Outcomes;
use crate::protocol::{Bindings, EngineReply, EngineRequest, OpKind};
use crate::registry::TargetSelector;

impl ControllerHandle {
    async fn run(
        &self,
        targets: impl Into<TargetSelector>,
        request: EngineRequest,
    ) -> Result<Outcomes, ControllerError> {
        self.dispatch(targets, request).await?.wait().await
    }

    /// Runs `code` in each target's namespace. Successful outcomes carry
    /// the captured output streams.
    ///
    /// # Errors
    ///
    /// Returns an error if the selector is stale or empty, or the
    /// controller is gone. Per-engine failures are in the outcomes.
    pub async fn execute(
        &self,
        targets: impl Into<TargetSelector>,
        code: impl Into<String>,
    ) -> Result<Outcomes, ControllerError> {
        self.run(targets, EngineRequest::Execute { code: code.into() })
            .await
    }

    /// Binds every entry of `bindings` on each target.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the bindings cannot cross the wire, plus
    /// the errors of [`execute`](Self::execute).
    pub async fn push(
        &self,
        targets: impl Into<TargetSelector>,
        bindings: Bindings,
    ) -> Result<Outcomes, ControllerError> {
        self.run(targets, EngineRequest::Push { bindings }).await
    }

    /// Reads `names` from each target. An unbound name fails only that
    /// engine's outcome.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn pull<I, S>(
        &self,
        targets: impl Into<TargetSelector>,
        names: I,
    ) -> Result<Outcomes, ControllerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = names.into_iter().map(Into::into).collect();
        self.run(targets, EngineRequest::Pull { names }).await
    }

    /// Clears each target's session bindings.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn reset(&self, targets: impl Into<TargetSelector>) -> Result<Outcomes, ControllerError> {
        self.run(targets, EngineRequest::Reset).await
    }

    /// Lists each target's session bindings.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn keys(&self, targets: impl Into<TargetSelector>) -> Result<Outcomes, ControllerError> {
        self.run(targets, EngineRequest::Keys).await
    }

    /// Reads one entry of each target's execution history, the latest one
    /// when `index` is `None`. A missing entry fails that engine's outcome
    /// with `IndexError`.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn get_result(
        &self,
        targets: impl Into<TargetSelector>,
        index: Option<usize>,
    ) -> Result<Outcomes, ControllerError> {
        self.run(targets, EngineRequest::GetResult { index }).await
    }

    /// Asks each target to shut down. Engines disconnect after replying.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn kill(&self, targets: impl Into<TargetSelector>) -> Result<Outcomes, ControllerError> {
        self.run(targets, EngineRequest::Kill).await
    }

    /// Partitions `values` across the targets in ascending engine order and
    /// binds each partition to `name`.
    ///
    /// # Errors
    ///
    /// See [`push`](Self::push).
    pub async fn scatter(
        &self,
        targets: impl Into<TargetSelector>,
        name: impl Into<String>,
        values: Vec<Value>,
        style: ScatterStyle,
    ) -> Result<Outcomes, ControllerError> {
        let selector = targets.into();
        let name = name.into();
        self.ticket(|reply| Command::Scatter {
            selector,
            name,
            values,
            style,
            reply,
        })
        .await?
        .wait()
        .await
    }

    /// Pulls `name` from each target and concatenates the values in
    /// ascending engine order. Under `ScatterStyle::Flatten` the marker
    /// binding is pulled too, and a value is spliced only if it was not
    /// pushed bare.
    ///
    /// # Errors
    ///
    /// Returns `GatherIncomplete` if any engine failed, including a
    /// flattening gather of a name with no marker. Returns `NotASequence`
    /// if a value is neither a list nor a flattened element, plus the
    /// errors of
    /// [`execute`](Self::execute).
    pub async fn gather(
        &self,
        targets: impl Into<TargetSelector>,
        name: impl Into<String>,
        style: ScatterStyle,
    ) -> Result<Vec<Value>, ControllerError> {
        let name = name.into();
        let names = style.pulled_names(&name);
        let expected = names.len();
        let outcomes = self.pull(targets, names).await?;

        let failures = outcomes.failures();
        if !failures.is_empty() {
            return Err(ControllerError::GatherIncomplete { name, failures });
        }

        let mut gathered = Vec::new();
        for (engine_id, outcome) in outcomes.into_inner() {
            let values = match outcome {
                Ok(EngineReply::Pulled { values }) if values.len() == expected => values,
                _ => {
                    return Err(ControllerError::UnexpectedReply {
                        engine_id,
                        expected: OpKind::Pull,
                    })
                }
            };
            if !style.unwrap_into(values, &mut gathered) {
                return Err(ControllerError::NotASequence { engine_id, name });
            }
        }
        Ok(gathered)
    }
}
