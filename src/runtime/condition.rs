use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use evalexpr::{
    ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, Node as EvalNode,
    build_operator_tree,
};
use serde_json::{Value, json};

use crate::runtime::context::ActivityExecution;

/// Guard evaluated against the variables visible from an execution.
///
/// An `Err` is a fault and propagates out of `start`/`signal` like any other.
pub trait Condition: Send + Sync + Debug {
    fn evaluate(&self, execution: &ActivityExecution<'_>) -> Result<bool>;
}

/// A compiled `evalexpr` expression. `${...}` placeholders are accepted and stripped.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    tree: EvalNode,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let clean = source.replace("${", "").replace('}', "");
        let tree: EvalNode = build_operator_tree(&clean)
            .map_err(|e| anyhow!("invalid expression '{}': {}", source, e))?;
        Ok(Self {
            source: source.to_string(),
            tree,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, vars: &HashMap<String, Value>) -> Result<Value> {
        let ctx = eval_context(vars);
        let result = self
            .tree
            .eval_with_context(&ctx)
            .map_err(|e| anyhow!("evaluation of '{}' failed: {}", self.source, e))?;
        Ok(eval_to_json(result))
    }

    pub fn evaluate_bool(&self, vars: &HashMap<String, Value>) -> Result<bool> {
        let ctx = eval_context(vars);
        self.tree
            .eval_boolean_with_context(&ctx)
            .map_err(|e| anyhow!("evaluation of '{}' failed: {}", self.source, e))
    }
}

/// Condition backed by an expression over process variables.
#[derive(Debug, Clone)]
pub struct ExprCondition {
    expression: Expression,
}

impl ExprCondition {
    pub fn parse(source: &str) -> Result<Self> {
        Ok(Self {
            expression: Expression::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        self.expression.source()
    }
}

impl Condition for ExprCondition {
    fn evaluate(&self, execution: &ActivityExecution<'_>) -> Result<bool> {
        self.expression.evaluate_bool(&execution.get_variables())
    }
}

/// Parses `source` into a shareable condition.
pub fn expr(source: &str) -> Result<Arc<dyn Condition>> {
    Ok(Arc::new(ExprCondition::parse(source)?))
}

/// Condition implemented by a closure.
pub struct FnCondition<F> {
    label: &'static str,
    f: F,
}

impl<F> FnCondition<F>
where
    F: Fn(&ActivityExecution<'_>) -> Result<bool> + Send + Sync,
{
    pub fn new(label: &'static str, f: F) -> Self {
        Self { label, f }
    }
}

impl<F> Debug for FnCondition<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCondition").field("label", &self.label).finish()
    }
}

impl<F> Condition for FnCondition<F>
where
    F: Fn(&ActivityExecution<'_>) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, execution: &ActivityExecution<'_>) -> Result<bool> {
        (self.f)(execution)
    }
}

/// Shorthand for `Arc::new(FnCondition::new(label, f))`.
pub fn condition_fn<F>(label: &'static str, f: F) -> Arc<dyn Condition>
where
    F: Fn(&ActivityExecution<'_>) -> Result<bool> + Send + Sync + 'static,
{
    Arc::new(FnCondition::new(label, f))
}

fn eval_context(vars: &HashMap<String, Value>) -> HashMapContext<DefaultNumericTypes> {
    let mut ctx = HashMapContext::<DefaultNumericTypes>::new();
    for (k, v) in vars {
        if let Some(ev) = json_to_eval(v) {
            // only fails for type-locked contexts
            let _ = ctx.set_value(k.clone(), ev);
        }
    }
    ctx
}

pub(crate) fn json_to_eval(v: &Value) -> Option<evalexpr::Value<DefaultNumericTypes>> {
    match v {
        Value::String(s) => Some(evalexpr::Value::String(s.clone())),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(evalexpr::Value::Int(i))
            } else {
                n.as_f64().map(evalexpr::Value::Float)
            }
        }
        Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
        Value::Array(items) => Some(evalexpr::Value::Tuple(
            items.iter().filter_map(json_to_eval).collect(),
        )),
        Value::Null => Some(evalexpr::Value::Empty),
        Value::Object(_) => None,
    }
}

pub(crate) fn eval_to_json(v: evalexpr::Value<DefaultNumericTypes>) -> Value {
    match v {
        evalexpr::Value::String(s) => Value::String(s),
        evalexpr::Value::Int(i) => json!(i),
        evalexpr::Value::Float(f) => json!(f),
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        evalexpr::Value::Tuple(items) => Value::Array(items.into_iter().map(eval_to_json).collect()),
        evalexpr::Value::Empty => Value::Null,
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}
