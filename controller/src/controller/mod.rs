//! The controller actor.
//!
//! One tokio task owns the engine registry, the pending call table and the
//! task queue. Clients, transports and deadline timers all reach it through
//! a single unbounded queue, so no state is shared across threads.

mod actor;
pub(crate) mod events;
mod handle;

pub use actor::Controller;
pub use handle::{ControllerHandle, EventSink, MultiCall};
