use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::actions::TaskHandler;
use crate::error::BpmnError;
use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::context::ActivityExecution;

/// 将 TaskHandler 包装为活动行为
#[derive(Debug, Clone)]
pub struct ServiceTask {
    handler: Arc<dyn TaskHandler>,
    params: Value,
    output: Option<String>,
}

impl ServiceTask {
    pub fn new(handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            handler,
            params: Value::Null,
            output: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Stores the handler's result in variable `name`.
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output = Some(name.into());
        self
    }
}

impl ActivityBehavior for ServiceTask {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        // 1. Resolve Variables in Params
        let params = resolve_params(&self.params, execution);

        // 2. Execute Logic
        let result = match self.handler.execute(params, execution) {
            Ok(v) => v,
            Err(e) => {
                return match e.downcast::<BpmnError>() {
                    Ok(business) => execution.throw_error(business),
                    Err(fault) => Err(fault),
                };
            }
        };

        // 3. Write Output
        if let Some(out_key) = &self.output {
            execution.set_variable(out_key, result)?;
        }

        // 4. Leave
        execution.leave()
    }
}

/// Replaces `"${name}"` string values (at any depth) by the variable's value.
fn resolve_params(params: &Value, execution: &ActivityExecution<'_>) -> Value {
    match params {
        Value::String(s) if s.starts_with("${") && s.ends_with('}') => {
            let name = &s[2..s.len() - 1];
            execution.get_variable(name).unwrap_or_else(|| params.clone())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_params(v, execution)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), resolve_params(v, execution)))
                .collect(),
        ),
        other => other.clone(),
    }
}
