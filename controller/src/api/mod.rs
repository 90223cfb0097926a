//! REST API for cluster clients.
//!
//! Thin JSON endpoints over [`ControllerHandle`](crate::ControllerHandle):
//! multi-engine operations, engine listing and the task queue.

pub mod handlers;
pub mod routes;
pub mod types;

pub use handlers::ApiError;
pub use routes::routes;
