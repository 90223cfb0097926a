//! Namespace operations.
//!
//! `execute`, `push`, `pull`, `reset`, `keys`, `get_result` and `kill` fan
//! one request out to the targets and wait for every outcome. `scatter`
//! and `gather` move a sequence across engines using the round-based
//! partition. Engine properties live in the registry and are read and
//! updated without a round trip.

mod namespace;
pub mod partition;
mod properties;

pub use partition::{partition, partition_bounds, partition_sizes};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::Bindings;

/// Name of the binding that records whether `name` was pushed as a bare
/// element by a flattening scatter.
#[must_use]
pub fn flatten_marker(name: &str) -> String {
    format!("__flat_{name}__")
}

/// How scatter wraps each partition and gather unwraps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScatterStyle {
    /// Every engine receives a list.
    #[default]
    Basic,
    /// A one-element partition is pushed as the bare element, next to a
    /// [`flatten_marker`] binding saying so.
    Flatten,
}

impl ScatterStyle {
    /// The bindings pushed for one partition.
    #[must_use]
    pub fn bindings(self, name: &str, mut part: Vec<Value>) -> Bindings {
        let mut bindings = Bindings::new();
        match self {
            Self::Basic => {
                bindings.insert(name.to_string(), Value::Array(part));
            }
            Self::Flatten => {
                let bare = part.len() == 1;
                let value = if bare {
                    part.remove(0)
                } else {
                    Value::Array(part)
                };
                bindings.insert(name.to_string(), value);
                bindings.insert(flatten_marker(name), Value::Bool(bare));
            }
        }
        bindings
    }

    /// The names gather pulls from each engine for `name`.
    #[must_use]
    pub fn pulled_names(self, name: &str) -> Vec<String> {
        match self {
            Self::Basic => vec![name.to_string()],
            Self::Flatten => vec![name.to_string(), flatten_marker(name)],
        }
    }

    /// Appends one engine's pulled values to `out`. Returns `false` if they
    /// do not hold a partition: a bare value is accepted only when its
    /// marker says it was flattened.
    pub fn unwrap_into(self, values: Vec<Value>, out: &mut Vec<Value>) -> bool {
        let mut values = values.into_iter();
        match (self, values.next(), values.next()) {
            (Self::Flatten, Some(value), Some(Value::Bool(true))) => {
                out.push(value);
                true
            }
            (_, Some(Value::Array(items)), _) => {
                out.extend(items);
                true
            }
            _ => false,
        }
    }
}
