//! Code execution against a namespace.
//!
//! `StatementExecutor` runs a small line-oriented language, one statement
//! per line:
//!
//! ```text
//! # comment
//! a = [1, 2, 3]        # JSON literal
//! b = a                # copy another binding
//! n += 1               # add to a number, or append to a string or list
//! print a              # write a binding or literal to stdout
//! eprint "warning"     # write to stderr
//! del b
//! raise something went wrong
//! ```
//!
//! Statements run in order; a failing statement stops the block and leaves
//! the effects of earlier statements in place.

use serde_json::Value;

use super::namespace::{unbound, Namespace};
use crate::protocol::{CallFailure, FailureKind};

/// Captured output of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Runs code in a namespace.
pub trait Executor: Send {
    /// Runs `code`, mutating `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an `ExecutionError` failure if the code fails.
    fn execute(&mut self, namespace: &mut Namespace, code: &str)
        -> Result<ExecOutput, CallFailure>;
}

/// Executor for the line-oriented statement language.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatementExecutor;

impl Executor for StatementExecutor {
    fn execute(
        &mut self,
        namespace: &mut Namespace,
        code: &str,
    ) -> Result<ExecOutput, CallFailure> {
        let mut output = ExecOutput::default();
        for (index, line) in code.lines().enumerate() {
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with('#') {
                continue;
            }
            run_statement(namespace, statement, &mut output)
                .map_err(|message| failure(index + 1, &message))?;
        }
        Ok(output)
    }
}

fn failure(line: usize, message: &str) -> CallFailure {
    CallFailure::new(FailureKind::ExecutionError, format!("line {line}: {message}"))
}

fn run_statement(
    namespace: &mut Namespace,
    statement: &str,
    output: &mut ExecOutput,
) -> Result<(), String> {
    if let Some(rest) = keyword(statement, "raise") {
        return Err(if rest.is_empty() {
            "Exception".to_string()
        } else {
            rest.to_string()
        });
    }
    if let Some(name) = keyword(statement, "del") {
        return namespace
            .unbind(name)
            .map(|_| ())
            .ok_or_else(|| unbound(name, FailureKind::ExecutionError).detail);
    }
    if let Some(expr) = keyword(statement, "print") {
        let value = evaluate(namespace, expr)?;
        output.stdout.push_str(&display(&value));
        output.stdout.push('\n');
        return Ok(());
    }
    if let Some(expr) = keyword(statement, "eprint") {
        let value = evaluate(namespace, expr)?;
        output.stderr.push_str(&display(&value));
        output.stderr.push('\n');
        return Ok(());
    }
    if let Some((target, expr)) = statement.split_once('=') {
        let expr = evaluate(namespace, expr.trim())?;
        let value = match target.strip_suffix('+') {
            Some(target) => {
                let name = identifier(target.trim())?;
                let current = namespace
                    .get(name)
                    .cloned()
                    .ok_or_else(|| unbound(name, FailureKind::ExecutionError).detail)?;
                namespace.bind(name, add(current, expr)?);
                return Ok(());
            }
            None => expr,
        };
        namespace.bind(identifier(target.trim())?, value);
        return Ok(());
    }
    Err(format!("SyntaxError: cannot parse '{statement}'"))
}

fn keyword<'a>(statement: &'a str, word: &str) -> Option<&'a str> {
    let rest = statement.strip_prefix(word)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.starts_with(char::is_whitespace).then_some(rest.trim())
}

fn identifier(name: &str) -> Result<&str, String> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(format!("SyntaxError: invalid name '{name}'"))
    }
}

fn evaluate(namespace: &Namespace, expr: &str) -> Result<Value, String> {
    if let Ok(value) = serde_json::from_str::<Value>(expr) {
        return Ok(value);
    }
    let name = identifier(expr)?;
    namespace
        .get(name)
        .cloned()
        .ok_or_else(|| unbound(name, FailureKind::ExecutionError).detail)
}

fn add(current: Value, addend: Value) -> Result<Value, String> {
    match (current, addend) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return a
                    .checked_add(b)
                    .map(Value::from)
                    .ok_or_else(|| "OverflowError: integer overflow".to_string());
            }
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => Ok(Value::from(a + b)),
                _ => Err("TypeError: unsupported number".to_string()),
            }
        }
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (a, b) => Err(format!(
            "TypeError: cannot add {} and {}",
            type_name(&a),
            type_name(&b)
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
