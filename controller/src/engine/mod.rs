//! The engine side of the cluster.
//!
//! An [`Engine`] owns a persistent [`Namespace`] and an [`Executor`] and
//! answers one request at a time. Successful executions are kept in a
//! history that survives namespace resets. [`worker::serve`] drives an engine over
//! a byte stream, either an in-memory pipe or a TCP socket.

pub mod executor;
pub mod namespace;
pub mod worker;

pub use executor::{ExecOutput, Executor, StatementExecutor};
pub use namespace::Namespace;

use serde_json::Value;

use crate::protocol::{CallFailure, CallOutcome, EngineId, EngineReply, EngineRequest, FailureKind};

/// Name of the built-in binding holding the engine's assigned ID.
pub const ENGINE_ID_BINDING: &str = "__engine_id__";

/// A single compute engine.
pub struct Engine {
    namespace: Namespace,
    executor: Box<dyn Executor>,
    history: Vec<(String, ExecOutput)>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::with_executor(StatementExecutor)
    }
}

impl Engine {
    /// Creates an engine running `executor`.
    pub fn with_executor(executor: impl Executor + 'static) -> Self {
        Self {
            namespace: Namespace::new(),
            executor: Box::new(executor),
            history: Vec::new(),
        }
    }

    /// Records the ID the controller assigned, as a built-in binding.
    pub fn set_engine_id(&mut self, engine_id: EngineId) {
        self.namespace
            .set_builtin(ENGINE_ID_BINDING, Value::from(engine_id.as_u32()));
    }

    /// The engine's namespace.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Runs one request against the namespace.
    pub fn handle(&mut self, request: EngineRequest) -> CallOutcome {
        match request {
            EngineRequest::Execute { code } => {
                let output = self.executor.execute(&mut self.namespace, &code)?;
                let reply = EngineReply::Executed {
                    stdout: output.stdout.clone(),
                    stderr: output.stderr.clone(),
                };
                self.history.push((code, output));
                Ok(reply)
            }
            EngineRequest::Push { bindings } => {
                self.namespace.push(bindings);
                Ok(EngineReply::Pushed)
            }
            EngineRequest::Pull { names } => {
                let values = self.namespace.pull(&names)?;
                Ok(EngineReply::Pulled { values })
            }
            EngineRequest::Reset => {
                self.namespace.reset();
                Ok(EngineReply::Reset)
            }
            EngineRequest::Keys => Ok(EngineReply::Keys {
                names: self.namespace.keys(),
            }),
            EngineRequest::GetResult { index } => self.result(index),
            EngineRequest::Kill => Ok(EngineReply::Killed),
        }
    }
}

impl Engine {
    fn result(&self, index: Option<usize>) -> CallOutcome {
        let number = match index {
            Some(number) => number,
            None => self.history.len().checked_sub(1).ok_or_else(|| {
                CallFailure::new(FailureKind::IndexError, "no code has been executed")
            })?,
        };
        let (code, output) = self.history.get(number).ok_or_else(|| {
            CallFailure::new(
                FailureKind::IndexError,
                format!(
                    "no execution result {number}, history holds {}",
                    self.history.len()
                ),
            )
        })?;
        Ok(EngineReply::ExecutionResult {
            number,
            code: code.clone(),
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        })
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("namespace", &self.namespace)
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}
