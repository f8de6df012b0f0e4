use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::info;

use crate::actions::TaskHandler;
use crate::runtime::condition::Expression;
use crate::runtime::context::ActivityExecution;

#[derive(Debug)]
pub struct LogHandler;

impl TaskHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn execute(&self, params: Value, execution: &mut ActivityExecution<'_>) -> Result<Value> {
        let activity = execution.activity_id().unwrap_or_default();
        if let Some(msg) = params.get("msg").and_then(|v| v.as_str()) {
            info!(activity = %activity, "[LOG] {}", msg);
        } else {
            info!(activity = %activity, "[LOG] {:?}", params);
        }
        Ok(Value::Null)
    }
}

/// Writes variables: a literal `assignments` list and/or an `expression`
/// of the form `target = <expr>`.
#[derive(Debug)]
pub struct AssignHandler;

impl TaskHandler for AssignHandler {
    fn name(&self) -> &str {
        "assign"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        if let Some(expr) = params.get("expression").and_then(|v| v.as_str()) {
            let rhs = expr.split_once('=').map(|(_, r)| r).unwrap_or(expr);
            Expression::parse(rhs.trim())?;
        }
        Ok(())
    }

    fn execute(&self, params: Value, execution: &mut ActivityExecution<'_>) -> Result<Value> {
        // 1. Handle "assignments" list
        if let Some(list) = params.get("assignments").and_then(|v| v.as_array()) {
            for item in list {
                let key = item
                    .get("key")
                    .and_then(|s| s.as_str())
                    .ok_or_else(|| anyhow!("assignment without key: {}", item))?;
                let value = item.get("value").cloned().unwrap_or(Value::Null);
                execution.set_variable(key, value)?;
            }
        }

        // 2. Handle "expression"
        if let Some(expr) = params.get("expression").and_then(|v| v.as_str()) {
            let (target, rhs) = match expr.split_once('=') {
                // keep comparisons like `a == b` intact
                Some((left, right)) if !right.starts_with('=') && !left.ends_with(['!', '<', '>']) => {
                    (Some(left.trim()), right.trim())
                }
                _ => (None, expr),
            };
            let result = Expression::parse(rhs)?.evaluate(&execution.get_variables())?;
            match target {
                Some(var) => execution.set_variable(var, result)?,
                None if params.get("value").is_none() => return Ok(result),
                None => {}
            }
        }

        // 3. Handle "value"
        Ok(params.get("value").cloned().unwrap_or(Value::Null))
    }
}
