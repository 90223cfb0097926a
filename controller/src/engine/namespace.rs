use serde_json::Value;

use crate::protocol::{Bindings, CallFailure, FailureKind};

/// An engine's persistent namespace.
///
/// Built-in bindings are installed by the engine itself and survive
/// [`reset`](Self::reset); user bindings are everything a session binds.
/// A user binding shadows a built-in of the same name.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    builtins: Bindings,
    user: Bindings,
}

impl Namespace {
    /// Creates an empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a built-in binding.
    pub fn set_builtin(&mut self, name: impl Into<String>, value: Value) {
        self.builtins.insert(name.into(), value);
    }

    /// Looks a name up, user bindings first.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.user.get(name).or_else(|| self.builtins.get(name))
    }

    /// Binds a user name.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.user.insert(name.into(), value);
    }

    /// Removes a user binding.
    pub fn unbind(&mut self, name: &str) -> Option<Value> {
        self.user.remove(name)
    }

    /// Binds every entry of `bindings`.
    pub fn push(&mut self, bindings: Bindings) {
        self.user.extend(bindings);
    }

    /// Reads the values bound to `names`, in order.
    ///
    /// # Errors
    ///
    /// Returns a `NameError` failure naming the first unbound name.
    pub fn pull(&self, names: &[String]) -> Result<Vec<Value>, CallFailure> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| unbound(name, FailureKind::NameError))
            })
            .collect()
    }

    /// Drops every user binding.
    pub fn reset(&mut self) {
        self.user.clear();
    }

    /// Sorted user binding names.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.user.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

pub(super) fn unbound(name: &str, kind: FailureKind) -> CallFailure {
    CallFailure::new(kind, format!("NameError: name '{name}' is not defined"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reset_keeps_builtins() {
        let mut ns = Namespace::new();
        ns.set_builtin("__engine_id__", json!(3));
        ns.bind("a", json!(1));
        ns.reset();
        assert!(ns.keys().is_empty());
        assert_eq!(ns.get("__engine_id__"), Some(&json!(3)));
    }

    #[test]
    fn pull_reports_the_unbound_name() {
        let mut ns = Namespace::new();
        ns.bind("a", json!(1));
        let err = ns.pull(&["a".into(), "b".into()]).unwrap_err();
        assert_eq!(err.kind, FailureKind::NameError);
        assert!(err.detail.contains("'b'"));
    }

    #[test]
    fn keys_are_sorted() {
        let mut ns = Namespace::new();
        ns.bind("zeta", json!(0));
        ns.bind("alpha", json!(0));
        assert_eq!(ns.keys(), vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
