use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tracing::debug;

use crate::runtime::agenda::Operation;
use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::condition::{Condition, Expression};
use crate::runtime::context::ActivityExecution;
use crate::runtime::definition::ActivityIndex;
use crate::runtime::event::EventSubscription;
use crate::runtime::execution::ExecutionId;

pub const NR_OF_INSTANCES: &str = "nrOfInstances";
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
pub const LOOP_COUNTER: &str = "loopCounter";

/// How many instances to create.
#[derive(Debug, Clone)]
pub enum Cardinality {
    Fixed(usize),
    /// One instance per element of the array variable.
    Collection(String),
    Expression(Expression),
}

/// Runs the wrapped behavior several times, one after the other or side by side.
///
/// The activity's scope execution is the multi-instance root and carries the
/// `nrOf*` counters; every instance sees its own `loopCounter` (and element
/// variable, when iterating a collection).
#[derive(Debug, Clone)]
pub struct MultiInstance {
    inner: Arc<dyn ActivityBehavior>,
    sequential: bool,
    cardinality: Cardinality,
    element_variable: Option<String>,
    completion_condition: Option<Arc<dyn Condition>>,
}

impl MultiInstance {
    pub fn parallel(inner: Arc<dyn ActivityBehavior>, cardinality: Cardinality) -> Self {
        Self {
            inner,
            sequential: false,
            cardinality,
            element_variable: None,
            completion_condition: None,
        }
    }

    pub fn sequential(inner: Arc<dyn ActivityBehavior>, cardinality: Cardinality) -> Self {
        Self {
            sequential: true,
            ..Self::parallel(inner, cardinality)
        }
    }

    pub fn element_variable(mut self, name: impl Into<String>) -> Self {
        self.element_variable = Some(name.into());
        self
    }

    pub fn completion_condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.completion_condition = Some(condition);
        self
    }

    fn resolve_cardinality(&self, execution: &ActivityExecution<'_>) -> Result<(usize, Option<Vec<Value>>)> {
        match &self.cardinality {
            Cardinality::Fixed(n) => Ok((*n, None)),
            Cardinality::Collection(var) => match execution.get_variable(var) {
                Some(Value::Array(items)) => Ok((items.len(), Some(items))),
                Some(other) => Err(anyhow!("multi-instance collection '{}' is not an array: {}", var, other)),
                None => Err(anyhow!("multi-instance collection '{}' is not set", var)),
            },
            Cardinality::Expression(expr) => {
                let value = expr.evaluate(&execution.get_variables())?;
                value
                    .as_u64()
                    .map(|n| (n as usize, None))
                    .ok_or_else(|| anyhow!("cardinality '{}' is not a non-negative integer: {}", expr.source(), value))
            }
        }
    }

    fn set_loop_variables(
        &self,
        execution: &mut ActivityExecution<'_>,
        index: usize,
        items: Option<&[Value]>,
    ) -> Result<()> {
        execution.set_variable_local(LOOP_COUNTER, json!(index))?;
        if let (Some(var), Some(items)) = (&self.element_variable, items) {
            let element = items.get(index).cloned().unwrap_or(Value::Null);
            execution.set_variable_local(var, element)?;
        }
        Ok(())
    }

    /// Multi-instance root of `activity` at or above `id`.
    fn find_root(execution: &ActivityExecution<'_>, id: ExecutionId, activity: ActivityIndex) -> Option<ExecutionId> {
        let instance = execution.instance();
        let mut current = Some(id);
        while let Some(c) = current {
            let e = instance.execution(c)?;
            if e.is_multi_instance_root() && e.scope_activity() == Some(activity) {
                return Some(c);
            }
            current = e.parent();
        }
        None
    }

    fn run_instance(&self, execution: ExecutionId, activity: ActivityIndex) -> Operation {
        Operation::RunInstance {
            execution,
            activity,
            behavior: self.inner.clone(),
        }
    }

    fn completed(&self, execution: &mut ActivityExecution<'_>, total: usize, done: usize) -> Result<bool> {
        if done >= total {
            return Ok(true);
        }
        match &self.completion_condition {
            Some(c) => c.evaluate(execution),
            None => Ok(false),
        }
    }

    fn finish(&self, execution: &mut ActivityExecution<'_>, root: ExecutionId, activity: ActivityIndex) -> Result<()> {
        let remaining = execution.instance().children(root);
        let instance = execution.instance_mut();
        for child in remaining.into_iter().rev() {
            let is_branch = instance.get(child).map(|e| e.is_branch()).unwrap_or(false);
            if is_branch {
                instance.delete_subtree(child, Some("multi-instance completed"))?;
            }
        }
        {
            let r = instance.exec_mut(root)?;
            r.activity = Some(activity);
            r.is_active = true;
            r.is_multi_instance_root = false;
        }
        debug!(activity = %instance.definition().activity(activity).id(), "multi-instance completed");
        execution.at(root).take_outgoing()
    }
}

fn counter(execution: &ActivityExecution<'_>, name: &str) -> usize {
    execution
        .get_variable_local(name)
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize
}

impl ActivityBehavior for MultiInstance {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        let def = execution.definition();
        let activity = def.activity(execution.activity_index()?);
        let (n, items) = self.resolve_cardinality(execution)?;
        let root = execution.id();

        execution.instance_mut().exec_mut(root)?.is_multi_instance_root = true;
        execution.set_variable_local(NR_OF_INSTANCES, json!(n))?;
        execution.set_variable_local(NR_OF_COMPLETED_INSTANCES, json!(0))?;
        debug!(activity = %activity.id(), instances = n, sequential = self.sequential, "multi-instance");

        if n == 0 {
            execution.set_variable_local(NR_OF_ACTIVE_INSTANCES, json!(0))?;
            execution.instance_mut().exec_mut(root)?.is_multi_instance_root = false;
            return execution.take_outgoing();
        }

        if self.sequential {
            execution.set_variable_local(NR_OF_ACTIVE_INSTANCES, json!(1))?;
            self.set_loop_variables(execution, 0, items.as_deref())?;
            return self.inner.execute(execution);
        }

        execution.set_variable_local(NR_OF_ACTIVE_INSTANCES, json!(n))?;
        let needs_scope = !activity.children().is_empty();
        let mut targets = Vec::with_capacity(n);
        for index in 0..n {
            let branch = execution.create_child(true)?;
            {
                let instance = execution.instance_mut();
                let b = instance.exec_mut(branch)?;
                b.activity = Some(activity.index());
                b.is_active = true;
            }
            self.set_loop_variables(&mut execution.at(branch), index, items.as_deref())?;
            let target = if needs_scope {
                let instance = execution.instance_mut();
                let scope = instance.alloc(Some(branch));
                {
                    let s = instance.exec_mut(scope)?;
                    s.is_scope = true;
                    s.scope_activity = Some(activity.index());
                    s.activity = Some(activity.index());
                    s.is_active = true;
                }
                let b = instance.exec_mut(branch)?;
                b.activity = None;
                b.is_active = false;
                scope
            } else {
                branch
            };
            targets.push(target);
        }
        {
            let r = execution.instance_mut().exec_mut(root)?;
            r.activity = None;
            r.is_active = false;
        }

        let runs: Vec<Operation> = targets
            .into_iter()
            .map(|target| self.run_instance(target, activity.index()))
            .collect();
        execution.instance_mut().perform(runs)
    }

    fn signal(
        &self,
        execution: &mut ActivityExecution<'_>,
        signal_name: Option<&str>,
        signal_data: Option<Value>,
    ) -> Result<()> {
        self.inner.signal(execution, signal_name, signal_data)
    }

    /// One instance is done.
    fn leave(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        let activity = execution.activity_index()?;
        let id = execution.id();
        let Some(root) = Self::find_root(execution, id, activity) else {
            return execution.take_outgoing();
        };

        let (total, done, active) = {
            let mut at_root = execution.at(root);
            let total = counter(&at_root, NR_OF_INSTANCES);
            let done = counter(&at_root, NR_OF_COMPLETED_INSTANCES) + 1;
            let active = counter(&at_root, NR_OF_ACTIVE_INSTANCES).saturating_sub(1);
            at_root.set_variable_local(NR_OF_COMPLETED_INSTANCES, json!(done))?;
            if !self.sequential {
                at_root.set_variable_local(NR_OF_ACTIVE_INSTANCES, json!(active))?;
            }
            (total, done, active)
        };
        let complete = self.completed(execution, total, done)?;
        debug!(done, total, active, complete, "multi-instance instance finished");

        if self.sequential {
            if complete {
                return self.finish(execution, root, activity);
            }
            let items = match &self.cardinality {
                Cardinality::Collection(var) => execution.get_variable(var).and_then(|v| v.as_array().cloned()),
                _ => None,
            };
            self.set_loop_variables(execution, done, items.as_deref())?;
            let next = self.run_instance(execution.id(), activity);
            return execution.instance_mut().perform([next]);
        }

        // the instance is the child of the root on the path up from `id`
        let mut instance_id = id;
        while let Some(parent) = execution.instance().execution(instance_id).and_then(|e| e.parent()) {
            if parent == root {
                break;
            }
            instance_id = parent;
        }
        execution.instance_mut().remove_subtree(instance_id);

        if complete {
            self.finish(execution, root, activity)
        } else {
            Ok(())
        }
    }

    fn last_execution_ended(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        self.inner.last_execution_ended(execution)
    }

    fn trigger(
        &self,
        execution: &mut ActivityExecution<'_>,
        subscription: &EventSubscription,
        data: Option<Value>,
    ) -> Result<()> {
        self.inner.trigger(execution, subscription, data)
    }

    fn creates_scope(&self) -> bool {
        true
    }
}
