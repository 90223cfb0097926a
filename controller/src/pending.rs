//! Pending call table.
//!
//! Every request sent to an engine is tracked here until it resolves. Calls
//! are grouped: a multi-target client call or one task attempt owns one
//! group, and the group completes when its last member resolves, whether
//! that member succeeded or failed.
//!
//! Calls resolved locally by timeout or cancellation are remembered as
//! abandoned. The engine still owes their reply: it stays busy until the
//! reply arrives, which is then discarded, or until it disconnects.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{CallFailure, CallId, CallOutcome, EngineId, FailureKind, OpKind};
use crate::tasks::TaskId;

/// Protocol-correlation bugs. These are never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// A reply arrived for a call ID that was never issued to that engine.
    #[error("call {call_id} on engine {engine_id} was never issued")]
    UnknownCall {
        /// Engine the reply came from.
        engine_id: EngineId,
        /// Offending call ID.
        call_id: CallId,
    },
    /// A reply arrived for a call that was already resolved.
    #[error("call {call_id} on engine {engine_id} was already resolved")]
    AlreadyResolved {
        /// Engine the reply came from.
        engine_id: EngineId,
        /// Offending call ID.
        call_id: CallId,
    },
}

/// Identifier of a group of calls awaited together.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub struct GroupId(u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-engine outcomes of a completed multi-target call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Outcomes(BTreeMap<EngineId, CallOutcome>);

impl Outcomes {
    /// Returns the outcome for one engine.
    #[must_use]
    pub fn get(&self, id: EngineId) -> Option<&CallOutcome> {
        self.0.get(&id)
    }

    /// Iterates outcomes in ascending engine order.
    pub fn iter(&self) -> impl Iterator<Item = (&EngineId, &CallOutcome)> {
        self.0.iter()
    }

    /// Number of engines in the mapping.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no engine is in the mapping.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if every engine succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.0.values().all(Result::is_ok)
    }

    /// The failed engines and their failures.
    #[must_use]
    pub fn failures(&self) -> BTreeMap<EngineId, CallFailure> {
        self.0
            .iter()
            .filter_map(|(id, outcome)| outcome.as_ref().err().map(|e| (*id, e.clone())))
            .collect()
    }

    /// Consumes the mapping.
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<EngineId, CallOutcome> {
        self.0
    }
}

impl FromIterator<(EngineId, CallOutcome)> for Outcomes {
    fn from_iter<I: IntoIterator<Item = (EngineId, CallOutcome)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Who is waiting on a group.
#[derive(Debug)]
pub enum Waiter {
    /// A client awaiting a multi-call handle.
    Client(oneshot::Sender<Outcomes>),
    /// An attempt of a scheduled task.
    Task(TaskId),
}

/// One in-flight request to one engine.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Correlation ID.
    pub call_id: CallId,
    /// Target engine.
    pub engine_id: EngineId,
    /// Operation kind.
    pub kind: OpKind,
    /// When the call was registered.
    pub submitted_at: Instant,
    /// When the call times out, if ever.
    pub deadline: Option<Instant>,
    group: GroupId,
}

/// A resolved member of a completed group, in registration order.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    /// Target engine.
    pub engine_id: EngineId,
    /// Correlation ID.
    pub call_id: CallId,
    /// Operation kind.
    pub kind: OpKind,
    /// Final outcome.
    pub outcome: CallOutcome,
}

/// A group whose members have all resolved.
#[derive(Debug)]
pub struct CompletedGroup {
    /// Group identifier.
    pub id: GroupId,
    /// The party waiting on the group.
    pub waiter: Waiter,
    /// Member outcomes in registration order.
    pub calls: Vec<ResolvedCall>,
}

impl CompletedGroup {
    /// Collapses the members into a per-engine outcome mapping.
    #[must_use]
    pub fn outcomes(&self) -> Outcomes {
        self.calls
            .iter()
            .map(|call| (call.engine_id, call.outcome.clone()))
            .collect()
    }
}

/// What a resolution changed.
#[derive(Debug, Default)]
pub struct Settled {
    /// One entry per call whose engine no longer owes a reply. Calls that
    /// time out or are cancelled appear here only once the late reply
    /// arrives.
    pub engines: Vec<EngineId>,
    /// Engines whose calls timed out.
    pub timed_out: Vec<EngineId>,
    /// Groups that completed.
    pub completed: Vec<CompletedGroup>,
}

impl Settled {
    /// Folds another settlement into this one.
    pub fn merge(&mut self, other: Settled) {
        self.engines.extend(other.engines);
        self.timed_out.extend(other.timed_out);
        self.completed.extend(other.completed);
    }

    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty() && self.timed_out.is_empty() && self.completed.is_empty()
    }
}

struct Member {
    engine_id: EngineId,
    call_id: CallId,
    kind: OpKind,
    outcome: Option<CallOutcome>,
}

struct Group {
    waiter: Waiter,
    members: Vec<Member>,
    unresolved: usize,
}

/// Table of in-flight calls keyed by `(engine, call)`.
#[derive(Default)]
pub struct PendingCallTable {
    next_call_id: u64,
    next_group_id: u64,
    calls: HashMap<(EngineId, CallId), PendingCall>,
    groups: HashMap<GroupId, Group>,
    abandoned: HashSet<(EngineId, CallId)>,
    /// Min-heap of deadlines. Entries of calls that already left the table
    /// are skipped when they reach the top.
    deadlines: BinaryHeap<Reverse<(Instant, CallId, EngineId)>>,
}

impl PendingCallTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a group that calls can be registered into.
    pub fn open_group(&mut self, waiter: Waiter) -> GroupId {
        let id = GroupId(self.next_group_id);
        self.next_group_id += 1;
        self.groups.insert(
            id,
            Group {
                waiter,
                members: Vec::new(),
                unresolved: 0,
            },
        );
        id
    }

    /// Reserves the next call ID without registering a call. Reserved IDs
    /// that are never inserted are simply skipped.
    pub fn allocate_call_id(&mut self) -> CallId {
        let id = CallId::new(self.next_call_id);
        self.next_call_id += 1;
        id
    }

    /// Registers a call under a freshly allocated ID.
    pub fn register(
        &mut self,
        group: GroupId,
        engine_id: EngineId,
        kind: OpKind,
        deadline: Option<Instant>,
    ) -> CallId {
        let call_id = self.allocate_call_id();
        self.insert(group, call_id, engine_id, kind, deadline);
        call_id
    }

    /// Registers a call under a previously allocated ID.
    pub fn insert(
        &mut self,
        group: GroupId,
        call_id: CallId,
        engine_id: EngineId,
        kind: OpKind,
        deadline: Option<Instant>,
    ) {
        let Some(entry) = self.groups.get_mut(&group) else {
            warn!(group = %group, "Call registered into a closed group");
            return;
        };
        entry.members.push(Member {
            engine_id,
            call_id,
            kind,
            outcome: None,
        });
        entry.unresolved += 1;
        if let Some(deadline) = deadline {
            self.deadlines.push(Reverse((deadline, call_id, engine_id)));
        }
        self.calls.insert(
            (engine_id, call_id),
            PendingCall {
                call_id,
                engine_id,
                kind,
                submitted_at: Instant::now(),
                deadline,
                group,
            },
        );
    }

    /// Resolves one call with the engine's outcome.
    ///
    /// A reply for a call that was resolved locally by timeout or
    /// cancellation is discarded; the settlement then only reports that
    /// the engine no longer owes it.
    ///
    /// # Errors
    ///
    /// Returns a `CorrelationError` if the call was never issued or was
    /// already resolved by an earlier reply.
    pub fn resolve(
        &mut self,
        engine_id: EngineId,
        call_id: CallId,
        outcome: CallOutcome,
    ) -> Result<Settled, CorrelationError> {
        let key = (engine_id, call_id);
        let Some(call) = self.calls.remove(&key) else {
            if self.abandoned.remove(&key) {
                debug!(engine_id = %engine_id, call_id = %call_id, "Discarding late reply");
                return Ok(Settled {
                    engines: vec![engine_id],
                    ..Settled::default()
                });
            }
            if call_id.as_u64() >= self.next_call_id {
                return Err(CorrelationError::UnknownCall { engine_id, call_id });
            }
            return Err(CorrelationError::AlreadyResolved { engine_id, call_id });
        };

        let mut settled = Settled::default();
        settled.engines.push(engine_id);
        self.settle(call, outcome, &mut settled);
        Ok(settled)
    }

    /// Resolves every pending call on `engine_id` as `EngineLost`.
    pub fn force_fail(&mut self, engine_id: EngineId, reason: &str) -> Settled {
        self.abandoned.retain(|(engine, _)| *engine != engine_id);
        let keys: Vec<(EngineId, CallId)> = self
            .calls
            .keys()
            .filter(|(engine, _)| *engine == engine_id)
            .copied()
            .collect();

        let mut settled = Settled::default();
        for key in Self::in_call_order(keys) {
            if let Some(call) = self.calls.remove(&key) {
                let failure = CallFailure::new(FailureKind::EngineLost, reason);
                settled.engines.push(engine_id);
                self.settle(call, Err(failure), &mut settled);
            }
        }
        if !settled.engines.is_empty() {
            debug!(engine_id = %engine_id, count = settled.engines.len(), "Force-failed pending calls");
        }
        settled
    }

    /// Resolves every call whose deadline is at or before `now` as
    /// `Timeout`, earliest deadline first. The engines are reported in
    /// `Settled::timed_out` and keep owing the reply.
    pub fn expire(&mut self, now: Instant) -> Settled {
        let mut settled = Settled::default();
        while let Some(Reverse((deadline, call_id, engine_id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            let key = (engine_id, call_id);
            let Some(call) = self.calls.remove(&key) else {
                continue;
            };
            let failure = CallFailure::new(
                FailureKind::Timeout,
                format!("{} call {} exceeded its deadline", call.kind, call.call_id),
            );
            warn!(engine_id = %engine_id, call_id = %call_id, "Call timed out");
            self.abandoned.insert(key);
            settled.timed_out.push(engine_id);
            self.settle(call, Err(failure), &mut settled);
        }
        settled
    }

    /// Resolves every unresolved member of `group` as `Cancelled`. The
    /// remote operations are not aborted; their replies are discarded.
    pub fn cancel(&mut self, group: GroupId) -> Settled {
        let keys: Vec<(EngineId, CallId)> = self
            .groups
            .get(&group)
            .map(|entry| {
                entry
                    .members
                    .iter()
                    .filter(|member| member.outcome.is_none())
                    .map(|member| (member.engine_id, member.call_id))
                    .collect()
            })
            .unwrap_or_default();

        let mut settled = Settled::default();
        for key in keys {
            if let Some(call) = self.calls.remove(&key) {
                self.abandoned.insert(key);
                let failure = CallFailure::new(FailureKind::Cancelled, "cancelled by caller");
                self.settle(call, Err(failure), &mut settled);
            }
        }
        settled
    }

    fn in_call_order(mut keys: Vec<(EngineId, CallId)>) -> Vec<(EngineId, CallId)> {
        keys.sort_unstable_by_key(|(_, call_id)| *call_id);
        keys
    }

    fn settle(&mut self, call: PendingCall, outcome: CallOutcome, settled: &mut Settled) {
        let complete = match self.groups.get_mut(&call.group) {
            Some(group) => {
                if let Some(member) = group
                    .members
                    .iter_mut()
                    .find(|member| member.call_id == call.call_id)
                {
                    member.outcome = Some(outcome);
                }
                group.unresolved = group.unresolved.saturating_sub(1);
                group.unresolved == 0
            }
            None => false,
        };

        if complete {
            if let Some(group) = self.groups.remove(&call.group) {
                let calls = group
                    .members
                    .into_iter()
                    .map(|member| ResolvedCall {
                        engine_id: member.engine_id,
                        call_id: member.call_id,
                        kind: member.kind,
                        outcome: member.outcome.unwrap_or_else(|| {
                            Err(CallFailure::new(FailureKind::EngineLost, "call vanished"))
                        }),
                    })
                    .collect();
                settled.completed.push(CompletedGroup {
                    id: call.group,
                    waiter: group.waiter,
                    calls,
                });
            }
        }
    }

    /// Number of unresolved calls referencing `engine_id`.
    #[must_use]
    pub fn outstanding(&self, engine_id: EngineId) -> usize {
        self.calls
            .keys()
            .filter(|(engine, _)| *engine == engine_id)
            .count()
    }

    /// The earliest deadline among unresolved calls.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, call_id, engine_id))) = self.deadlines.peek() {
            if self.calls.contains_key(&(*engine_id, *call_id)) {
                return Some(*deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Number of abandoned calls whose reply `engine_id` still owes.
    #[must_use]
    pub fn owed(&self, engine_id: EngineId) -> usize {
        self.abandoned
            .iter()
            .filter(|(engine, _)| *engine == engine_id)
            .count()
    }

    /// Looks up an unresolved call.
    #[must_use]
    pub fn get(&self, engine_id: EngineId, call_id: CallId) -> Option<&PendingCall> {
        self.calls.get(&(engine_id, call_id))
    }

    /// Number of unresolved calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns `true` if no call is unresolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
