use std::collections::BTreeMap;

use crate::controller::events::Command;
use crate::controller::ControllerHandle;
use crate::error::ControllerError;
use crate::protocol::{Bindings, EngineId};
use crate::registry::{PropertyOp, TargetSelector};

fn names<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter().map(Into::into).collect()
}

impl ControllerHandle {
    async fn properties(
        &self,
        targets: impl Into<TargetSelector>,
        op: PropertyOp,
    ) -> Result<BTreeMap<EngineId, Bindings>, ControllerError> {
        let selector = targets.into();
        self.command(|reply| Command::Properties {
            selector,
            op,
            reply,
        })
        .await
    }

    /// Reads the named properties of each target, or all of them when
    /// `keys` is empty. Unset keys are left out.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEngine` or `NoEngine` if the selector is stale or
    /// empty, and `Stopped` if the controller is gone.
    pub async fn get_properties<I, S>(
        &self,
        targets: impl Into<TargetSelector>,
        keys: I,
    ) -> Result<BTreeMap<EngineId, Bindings>, ControllerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties(targets, PropertyOp::Get(names(keys))).await
    }

    /// Merges `properties` into each target's properties and reruns the
    /// scheduler, since waiting tasks may now have an engine.
    ///
    /// # Errors
    ///
    /// See [`get_properties`](Self::get_properties).
    pub async fn set_properties(
        &self,
        targets: impl Into<TargetSelector>,
        properties: Bindings,
    ) -> Result<BTreeMap<EngineId, Bindings>, ControllerError> {
        self.properties(targets, PropertyOp::Set(properties)).await
    }

    /// Reports, per target and in key order, whether each key is set.
    ///
    /// # Errors
    ///
    /// See [`get_properties`](Self::get_properties).
    pub async fn has_properties<I, S>(
        &self,
        targets: impl Into<TargetSelector>,
        keys: I,
    ) -> Result<BTreeMap<EngineId, Vec<bool>>, ControllerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = names(keys);
        let properties = self.properties(targets, PropertyOp::Get(Vec::new())).await?;
        Ok(properties
            .into_iter()
            .map(|(engine_id, set)| {
                let present = keys.iter().map(|key| set.contains_key(key)).collect();
                (engine_id, present)
            })
            .collect())
    }

    /// Removes the named properties from each target.
    ///
    /// # Errors
    ///
    /// See [`get_properties`](Self::get_properties).
    pub async fn del_properties<I, S>(
        &self,
        targets: impl Into<TargetSelector>,
        keys: I,
    ) -> Result<BTreeMap<EngineId, Bindings>, ControllerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties(targets, PropertyOp::Delete(names(keys)))
            .await
    }

    /// Removes every property from each target.
    ///
    /// # Errors
    ///
    /// See [`get_properties`](Self::get_properties).
    pub async fn clear_properties(
        &self,
        targets: impl Into<TargetSelector>,
    ) -> Result<BTreeMap<EngineId, Bindings>, ControllerError> {
        self.properties(targets, PropertyOp::Clear).await
    }
}
