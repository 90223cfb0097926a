//! Engine registry.
//!
//! Owns every engine record, hands out the lowest free engine ID and
//! resolves target selectors to live engines. A disconnected engine keeps
//! its slot until the controller releases it, which it does only once no
//! pending call references the ID any more.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::protocol::{Bindings, ConnectionId, EngineId};
use crate::transport::EngineConnection;

/// Errors raised by the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The connection already holds an engine slot.
    #[error("connection {0} is already registered")]
    AlreadyRegistered(ConnectionId),
    /// A referenced engine is not registered.
    #[error("engine {0} is not registered")]
    UnknownEngine(EngineId),
    /// Every engine ID is taken.
    #[error("engine ID space exhausted")]
    Exhausted,
}

/// Liveness of an engine slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Slot allocated, registration acknowledgement not yet delivered.
    Connecting,
    /// Live and addressable.
    Registered,
    /// Connection lost; the slot is retained until released.
    Disconnected,
}

/// A reference to one engine, an explicit set, or all live engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSelector", into = "RawSelector")]
pub enum TargetSelector {
    /// A single engine.
    One(EngineId),
    /// An explicit list of engines.
    Many(Vec<EngineId>),
    /// Every live engine.
    All,
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(id) => write!(f, "{id}"),
            Self::Many(ids) => {
                let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", ids.join(","))
            }
            Self::All => f.write_str("all"),
        }
    }
}

impl From<EngineId> for TargetSelector {
    fn from(id: EngineId) -> Self {
        Self::One(id)
    }
}

impl From<Vec<EngineId>> for TargetSelector {
    fn from(ids: Vec<EngineId>) -> Self {
        Self::Many(ids)
    }
}

/// Wire form of a selector: an integer, a list of integers, or `"all"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSelector {
    One(u32),
    Many(Vec<u32>),
    Keyword(String),
}

impl TryFrom<RawSelector> for TargetSelector {
    type Error = String;

    fn try_from(raw: RawSelector) -> Result<Self, Self::Error> {
        match raw {
            RawSelector::One(id) => Ok(Self::One(EngineId::new(id))),
            RawSelector::Many(ids) => Ok(Self::Many(ids.into_iter().map(EngineId::new).collect())),
            RawSelector::Keyword(word) if word == "all" => Ok(Self::All),
            RawSelector::Keyword(word) => Err(format!(
                "targets must be an integer, a list of integers or \"all\", got \"{word}\""
            )),
        }
    }
}

impl From<TargetSelector> for RawSelector {
    fn from(selector: TargetSelector) -> Self {
        match selector {
            TargetSelector::One(id) => Self::One(id.as_u32()),
            TargetSelector::Many(ids) => Self::Many(ids.into_iter().map(EngineId::as_u32).collect()),
            TargetSelector::All => Self::Keyword("all".into()),
        }
    }
}

/// Snapshot of an engine for clients.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    /// Engine ID.
    pub id: EngineId,
    /// Liveness state.
    pub state: EngineState,
    /// Number of calls in flight, counting timed-out or cancelled calls
    /// whose reply is still owed.
    pub busy: usize,
    /// Set after a call timed out; cleared by the next successful reply.
    pub suspect: bool,
    /// Properties announced at registration, as updated since.
    pub properties: Bindings,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
}

/// Scheduling view of an idle engine.
#[derive(Debug, Clone, PartialEq)]
pub struct IdleEngine {
    /// Engine ID.
    pub id: EngineId,
    /// Whether the engine recently timed out.
    pub suspect: bool,
    /// Current properties, matched against task dependencies.
    pub properties: Bindings,
}

/// A query or update of engine properties.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyOp {
    /// Read the named properties, or every property for an empty list.
    Get(Vec<String>),
    /// Merge bindings into the properties.
    Set(Bindings),
    /// Remove the named properties.
    Delete(Vec<String>),
    /// Remove every property.
    Clear,
}

impl PropertyOp {
    /// Returns `true` for operations that change properties.
    #[must_use]
    pub fn is_update(&self) -> bool {
        !matches!(self, Self::Get(_))
    }
}

struct EngineRecord {
    connection: Arc<dyn EngineConnection>,
    state: EngineState,
    busy: usize,
    suspect: bool,
    properties: Bindings,
    registered_at: DateTime<Utc>,
}

/// Registry of engine slots keyed by engine ID.
#[derive(Default)]
pub struct EngineRegistry {
    engines: BTreeMap<EngineId, EngineRecord>,
    by_connection: HashMap<ConnectionId, EngineId>,
}

impl EngineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the lowest unused engine ID for `connection`. The engine
    /// starts out `Connecting` until [`activate`](Self::activate) is called.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AlreadyRegistered` if the connection already
    /// holds a slot.
    pub fn register(
        &mut self,
        connection: Arc<dyn EngineConnection>,
        properties: Bindings,
    ) -> Result<EngineId, RegistryError> {
        let connection_id = connection.connection_id();
        if self.by_connection.contains_key(&connection_id) {
            return Err(RegistryError::AlreadyRegistered(connection_id));
        }

        let id = self.lowest_free_id()?;
        self.engines.insert(
            id,
            EngineRecord {
                connection,
                state: EngineState::Connecting,
                busy: 0,
                suspect: false,
                properties,
                registered_at: Utc::now(),
            },
        );
        self.by_connection.insert(connection_id, id);
        debug!(engine_id = %id, connection_id = %connection_id, "Engine slot allocated");
        Ok(id)
    }

    fn lowest_free_id(&self) -> Result<EngineId, RegistryError> {
        let mut candidate = 0u32;
        for id in self.engines.keys() {
            if id.as_u32() != candidate {
                break;
            }
            candidate = candidate.checked_add(1).ok_or(RegistryError::Exhausted)?;
        }
        Ok(EngineId::new(candidate))
    }

    /// Marks a `Connecting` engine as `Registered`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownEngine` if the slot is not connecting.
    pub fn activate(&mut self, id: EngineId) -> Result<(), RegistryError> {
        match self.engines.get_mut(&id) {
            Some(record) if record.state == EngineState::Connecting => {
                record.state = EngineState::Registered;
                info!(engine_id = %id, "Engine registered");
                Ok(())
            }
            _ => Err(RegistryError::UnknownEngine(id)),
        }
    }

    /// Moves an engine to `Disconnected`. The slot stays allocated until
    /// [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownEngine` if the engine is unknown or
    /// already disconnected.
    pub fn unregister(&mut self, id: EngineId) -> Result<(), RegistryError> {
        match self.engines.get_mut(&id) {
            Some(record) if record.state != EngineState::Disconnected => {
                record.state = EngineState::Disconnected;
                record.busy = 0;
                record.connection.close();
                info!(engine_id = %id, "Engine disconnected");
                Ok(())
            }
            _ => Err(RegistryError::UnknownEngine(id)),
        }
    }

    /// Frees a disconnected engine's slot so its ID can be reused. The
    /// caller guarantees that no pending call references the ID.
    /// Returns `true` if a slot was freed.
    pub fn release(&mut self, id: EngineId) -> bool {
        let disconnected = self
            .engines
            .get(&id)
            .is_some_and(|record| record.state == EngineState::Disconnected);
        if !disconnected {
            return false;
        }
        if let Some(record) = self.engines.remove(&id) {
            self.by_connection.remove(&record.connection.connection_id());
        }
        debug!(engine_id = %id, "Engine slot released");
        true
    }

    /// Live engine IDs in ascending order.
    #[must_use]
    pub fn list(&self) -> Vec<EngineId> {
        self.engines
            .iter()
            .filter(|(_, record)| record.state == EngineState::Registered)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of live engines.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.engines
            .values()
            .filter(|record| record.state == EngineState::Registered)
            .count()
    }

    /// Resolves a selector to live engine IDs, ascending and without
    /// duplicates. An explicit empty list resolves to an empty set.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownEngine` for the first referenced ID
    /// that is not live.
    pub fn resolve(&self, selector: &TargetSelector) -> Result<Vec<EngineId>, RegistryError> {
        match selector {
            TargetSelector::All => Ok(self.list()),
            TargetSelector::One(id) => {
                self.ensure_live(*id)?;
                Ok(vec![*id])
            }
            TargetSelector::Many(ids) => {
                let mut resolved = Vec::with_capacity(ids.len());
                for id in ids {
                    self.ensure_live(*id)?;
                    resolved.push(*id);
                }
                resolved.sort_unstable();
                resolved.dedup();
                Ok(resolved)
            }
        }
    }

    fn ensure_live(&self, id: EngineId) -> Result<(), RegistryError> {
        if self.is_live(id) {
            Ok(())
        } else {
            Err(RegistryError::UnknownEngine(id))
        }
    }

    /// Returns `true` if the engine is `Registered`.
    #[must_use]
    pub fn is_live(&self, id: EngineId) -> bool {
        self.state(id) == Some(EngineState::Registered)
    }

    /// Returns the engine's state, if the slot exists.
    #[must_use]
    pub fn state(&self, id: EngineId) -> Option<EngineState> {
        self.engines.get(&id).map(|record| record.state)
    }

    /// Returns the connection of a live or connecting engine.
    #[must_use]
    pub fn connection(&self, id: EngineId) -> Option<Arc<dyn EngineConnection>> {
        self.engines
            .get(&id)
            .filter(|record| record.state != EngineState::Disconnected)
            .map(|record| Arc::clone(&record.connection))
    }

    /// Returns `true` if `connection_id` currently owns the slot `id`.
    #[must_use]
    pub fn owns(&self, id: EngineId, connection_id: ConnectionId) -> bool {
        self.by_connection.get(&connection_id) == Some(&id)
    }

    /// Records one more in-flight call on the engine.
    pub fn mark_busy(&mut self, id: EngineId) {
        if let Some(record) = self.engines.get_mut(&id) {
            record.busy += 1;
        }
    }

    /// Records one fewer in-flight call on the engine.
    pub fn mark_done(&mut self, id: EngineId) {
        if let Some(record) = self.engines.get_mut(&id) {
            record.busy = record.busy.saturating_sub(1);
        }
    }

    /// Flags or clears the engine as suspect.
    pub fn set_suspect(&mut self, id: EngineId, suspect: bool) {
        if let Some(record) = self.engines.get_mut(&id) {
            if record.suspect != suspect {
                debug!(engine_id = %id, suspect, "Engine suspect flag changed");
            }
            record.suspect = suspect;
        }
    }

    /// Live engines with no call in flight or owed, ascending by ID.
    #[must_use]
    pub fn idle(&self) -> Vec<IdleEngine> {
        self.engines
            .iter()
            .filter(|(_, record)| record.state == EngineState::Registered && record.busy == 0)
            .map(|(id, record)| IdleEngine {
                id: *id,
                suspect: record.suspect,
                properties: record.properties.clone(),
            })
            .collect()
    }

    /// Applies a property operation to a live engine and returns the
    /// properties it selects: the requested keys that are set for `Get`,
    /// every property after an update.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownEngine` if the engine is not live.
    pub fn apply_properties(
        &mut self,
        id: EngineId,
        op: &PropertyOp,
    ) -> Result<Bindings, RegistryError> {
        let record = self
            .engines
            .get_mut(&id)
            .filter(|record| record.state == EngineState::Registered)
            .ok_or(RegistryError::UnknownEngine(id))?;
        match op {
            PropertyOp::Get(keys) if keys.is_empty() => {}
            PropertyOp::Get(keys) => {
                return Ok(keys
                    .iter()
                    .filter_map(|key| {
                        record
                            .properties
                            .get(key)
                            .map(|value| (key.clone(), value.clone()))
                    })
                    .collect());
            }
            PropertyOp::Set(bindings) => {
                for (key, value) in bindings {
                    record.properties.insert(key.clone(), value.clone());
                }
            }
            PropertyOp::Delete(keys) => {
                for key in keys {
                    record.properties.remove(key);
                }
            }
            PropertyOp::Clear => record.properties.clear(),
        }
        if op.is_update() {
            debug!(engine_id = %id, count = record.properties.len(), "Engine properties updated");
        }
        Ok(record.properties.clone())
    }

    /// Snapshot of every slot, including disconnected ones awaiting release.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EngineInfo> {
        self.engines
            .iter()
            .map(|(id, record)| EngineInfo {
                id: *id,
                state: record.state,
                busy: record.busy,
                suspect: record.suspect,
                properties: record.properties.clone(),
                registered_at: record.registered_at,
            })
            .collect()
    }

    /// IDs of every slot that still holds a connection.
    #[must_use]
    pub fn connected(&self) -> Vec<EngineId> {
        self.engines
            .iter()
            .filter(|(_, record)| record.state != EngineState::Disconnected)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::RecordingConnection;

    fn registered(registry: &mut EngineRegistry) -> EngineId {
        let id = registry
            .register(RecordingConnection::arc(), Bindings::new())
            .unwrap();
        registry.activate(id).unwrap();
        id
    }

    #[test]
    fn ids_are_allocated_lowest_first() {
        let mut registry = EngineRegistry::new();
        assert_eq!(registered(&mut registry), EngineId::new(0));
        assert_eq!(registered(&mut registry), EngineId::new(1));
        assert_eq!(registered(&mut registry), EngineId::new(2));
    }

    #[test]
    fn duplicate_connection_is_rejected() {
        let mut registry = EngineRegistry::new();
        let connection = RecordingConnection::arc();
        registry
            .register(Arc::clone(&connection) as Arc<dyn EngineConnection>, Bindings::new())
            .unwrap();
        let err = registry.register(connection, Bindings::new());
        assert!(matches!(err, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn disconnected_id_is_reused_only_after_release() {
        let mut registry = EngineRegistry::new();
        let first = registered(&mut registry);
        let _second = registered(&mut registry);

        registry.unregister(first).unwrap();
        assert_eq!(registry.state(first), Some(EngineState::Disconnected));
        assert_eq!(registered(&mut registry), EngineId::new(2));

        assert!(registry.release(first));
        assert_eq!(registered(&mut registry), first);
    }

    #[test]
    fn release_ignores_live_engines() {
        let mut registry = EngineRegistry::new();
        let id = registered(&mut registry);
        assert!(!registry.release(id));
        assert!(registry.is_live(id));
    }

    #[test]
    fn connecting_engines_are_not_addressable() {
        let mut registry = EngineRegistry::new();
        let id = registry
            .register(RecordingConnection::arc(), Bindings::new())
            .unwrap();
        assert!(registry.list().is_empty());
        assert_eq!(
            registry.resolve(&TargetSelector::One(id)),
            Err(RegistryError::UnknownEngine(id))
        );
    }

    #[test]
    fn resolve_sorts_and_dedups() {
        let mut registry = EngineRegistry::new();
        for _ in 0..3 {
            registered(&mut registry);
        }
        let ids = registry
            .resolve(&TargetSelector::Many(vec![
                EngineId::new(2),
                EngineId::new(0),
                EngineId::new(2),
            ]))
            .unwrap();
        assert_eq!(ids, vec![EngineId::new(0), EngineId::new(2)]);
        assert_eq!(registry.resolve(&TargetSelector::All).unwrap().len(), 3);
    }

    #[test]
    fn resolve_rejects_stale_ids() {
        let mut registry = EngineRegistry::new();
        let id = registered(&mut registry);
        registry.unregister(id).unwrap();
        assert_eq!(
            registry.resolve(&TargetSelector::Many(vec![id])),
            Err(RegistryError::UnknownEngine(id))
        );
    }

    #[test]
    fn idle_excludes_busy_engines() {
        let mut registry = EngineRegistry::new();
        let a = registered(&mut registry);
        let b = registered(&mut registry);
        registry.mark_busy(a);
        registry.set_suspect(b, true);
        assert_eq!(
            registry.idle(),
            vec![IdleEngine {
                id: b,
                suspect: true,
                properties: Bindings::new()
            }]
        );
        registry.mark_done(a);
        assert_eq!(registry.idle().len(), 2);
    }

    #[test]
    fn properties_can_be_read_and_updated() {
        let mut registry = EngineRegistry::new();
        let id = registered(&mut registry);
        let mut update = Bindings::new();
        update.insert("rack".into(), serde_json::json!("a1"));
        update.insert("mem".into(), serde_json::json!(8));

        let all = registry.apply_properties(id, &PropertyOp::Set(update)).unwrap();
        assert_eq!(all.len(), 2);
        let some = registry
            .apply_properties(id, &PropertyOp::Get(vec!["mem".into(), "disk".into()]))
            .unwrap();
        assert_eq!(some.keys().collect::<Vec<_>>(), vec!["mem"]);
        assert_eq!(registry.idle()[0].properties.len(), 2);

        let left = registry
            .apply_properties(id, &PropertyOp::Delete(vec!["rack".into()]))
            .unwrap();
        assert_eq!(left.keys().collect::<Vec<_>>(), vec!["mem"]);
        assert!(registry
            .apply_properties(id, &PropertyOp::Clear)
            .unwrap()
            .is_empty());

        registry.unregister(id).unwrap();
        assert_eq!(
            registry.apply_properties(id, &PropertyOp::Get(Vec::new())),
            Err(RegistryError::UnknownEngine(id))
        );
    }

    #[test]
    fn selector_wire_forms() {
        let one: TargetSelector = serde_json::from_str("3").unwrap();
        assert_eq!(one, TargetSelector::One(EngineId::new(3)));
        let many: TargetSelector = serde_json::from_str("[1, 0]").unwrap();
        assert_eq!(
            many,
            TargetSelector::Many(vec![EngineId::new(1), EngineId::new(0)])
        );
        let all: TargetSelector = serde_json::from_str("\"all\"").unwrap();
        assert_eq!(all, TargetSelector::All);
        assert!(serde_json::from_str::<TargetSelector>("\"some\"").is_err());
        assert_eq!(serde_json::to_string(&TargetSelector::All).unwrap(), "\"all\"");
    }
}
