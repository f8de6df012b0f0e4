use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::error::{BpmnError, PvmError};
use crate::runtime::definition::{Activity, ActivityIndex, ProcessDefinition, TransitionIndex};
use crate::runtime::event::{EventTrigger, SubscriptionId};
use crate::runtime::execution::{Execution, ExecutionId};
use crate::runtime::instance::ProcessInstance;
use crate::runtime::operations::ConcurrentJoin;

/// 活动执行上下文 (Activity Execution)
///
/// The view of one execution handed to behaviors, listeners and conditions.
/// It borrows the whole instance mutably, so a behavior can move its
/// execution through the graph; the handle is re-resolved on every access
/// and keeps working after the execution was merged into its concurrent root.
pub struct ActivityExecution<'a> {
    instance: &'a mut ProcessInstance,
    id: ExecutionId,
}

impl<'a> ActivityExecution<'a> {
    pub(crate) fn new(instance: &'a mut ProcessInstance, id: ExecutionId) -> Self {
        Self { instance, id }
    }

    pub fn id(&self) -> ExecutionId {
        self.instance.resolve(self.id)
    }

    pub fn instance(&self) -> &ProcessInstance {
        &*self.instance
    }

    pub fn instance_mut(&mut self) -> &mut ProcessInstance {
        &mut *self.instance
    }

    pub fn definition(&self) -> Arc<ProcessDefinition> {
        self.instance.definition.clone()
    }

    pub fn execution(&self) -> Result<&Execution, PvmError> {
        self.instance.exec(self.id())
    }

    /// `false` once the execution was removed or the instance has ended.
    pub fn is_alive(&self) -> bool {
        self.instance.is_alive(self.id()) && !self.instance.is_ended()
    }

    pub fn activity(&self) -> Option<&Activity> {
        let index = self.instance.get(self.id())?.activity?;
        Some(self.instance.definition.activity(index))
    }

    pub fn activity_index(&self) -> Result<ActivityIndex> {
        self.instance.current_activity(self.id())
    }

    pub fn activity_id(&self) -> Option<String> {
        self.activity().map(|a| a.id.clone())
    }

    // --- variables ---

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.instance.get_variable_of(self.id, name)
    }

    pub fn set_variable(&mut self, name: &str, value: Value) -> Result<(), PvmError> {
        self.instance.set_variable(self.id, name, value)
    }

    pub fn get_variable_local(&self, name: &str) -> Option<Value> {
        self.instance.get_variable_local(self.id, name)
    }

    pub fn set_variable_local(&mut self, name: &str, value: Value) -> Result<(), PvmError> {
        self.instance.set_variable_local(self.id, name, value)
    }

    pub fn remove_variable_local(&mut self, name: &str) -> Option<Value> {
        self.instance.remove_variable_local(self.id, name)
    }

    pub fn get_variables(&self) -> HashMap<String, Value> {
        self.instance.get_variables_of(self.id)
    }

    /// Writes every field of a JSON object as a variable.
    pub fn set_variables_from(&mut self, data: &Value) -> Result<(), PvmError> {
        if let Value::Object(fields) = data {
            for (k, v) in fields {
                self.set_variable(k, v.clone())?;
            }
        }
        Ok(())
    }

    // --- control flow ---

    /// Leaves the current activity through its behavior's `leave` hook.
    pub fn leave(&mut self) -> Result<()> {
        let activity = self.activity_index()?;
        let behavior = self.instance.definition.activity(activity).behavior.clone();
        behavior.leave(self)
    }

    /// Follows the outgoing transitions whose guards hold; ends the execution
    /// when the activity has none.
    pub fn take_outgoing(&mut self) -> Result<()> {
        let id = self.id();
        self.instance.take_outgoing(id)
    }

    pub fn take(&mut self, transition: TransitionIndex) -> Result<()> {
        let id = self.id();
        self.instance.take_transition(id, transition, true)
    }

    pub fn take_by_id(&mut self, transition_id: &str) -> Result<()> {
        let index = self
            .instance
            .definition
            .find_transition(transition_id)
            .map(|t| t.index)
            .ok_or_else(|| PvmError::TransitionNotFound(transition_id.to_string()))?;
        self.take(index)
    }

    /// Takes `transitions` concurrently, recycling the given executions
    /// (typically the branches gathered at a join).
    pub fn take_all(&mut self, transitions: Vec<TransitionIndex>, recyclable: Vec<ExecutionId>) -> Result<()> {
        let id = self.id();
        self.instance.take_all(id, transitions, recyclable, true)
    }

    /// Outgoing transitions whose guard holds, in declaration order.
    pub fn select_outgoing(&mut self) -> Result<Vec<TransitionIndex>> {
        let id = self.id();
        let activity = self.activity_index()?;
        self.instance.select_outgoing(id, activity)
    }

    pub fn end(&mut self) -> Result<()> {
        let id = self.id();
        self.instance.end(id)
    }

    /// Parks the execution without ending it (used at joins).
    pub fn inactivate(&mut self) -> Result<(), PvmError> {
        let id = self.id();
        self.instance.exec_mut(id)?.is_active = false;
        Ok(())
    }

    pub fn find_inactive_concurrent_executions(&self, activity: ActivityIndex) -> Result<ConcurrentJoin> {
        self.instance.find_inactive_concurrent_executions(self.id(), activity)
    }

    /// Enters `activity` from this execution, e.g. the initial child of a sub-process.
    pub fn execute_activity(&mut self, activity: ActivityIndex) -> Result<()> {
        let id = self.id();
        self.instance.execute_activity(id, activity)
    }

    // --- events ---

    /// Registers interest of the current activity in `trigger`.
    pub fn subscribe(&mut self, trigger: &EventTrigger) -> Result<SubscriptionId> {
        let id = self.id();
        let activity = self.activity_index()?;
        let def = self.definition();
        let (kind, name, duration) = match trigger {
            EventTrigger::Timer { duration_ms } => {
                (trigger.kind(), def.activity(activity).id.clone(), Some(*duration_ms))
            }
            EventTrigger::Message { name } | EventTrigger::Signal { name } => {
                (trigger.kind(), name.clone(), None)
            }
            EventTrigger::Error { .. } => (None, String::new(), None),
        };
        let kind = kind.ok_or_else(|| {
            PvmError::InvalidModel(format!(
                "activity '{}' cannot wait for an error",
                def.activity(activity).id
            ))
        })?;
        Ok(self.instance.add_subscription(kind, name, activity, id, duration))
    }

    /// Broadcasts a signal event inside this process instance.
    pub fn signal_event(&mut self, name: &str, data: Option<Value>) -> Result<usize> {
        self.instance.signal_event_received(name, data)
    }

    /// Raises a business error from this execution.
    pub fn throw_error(&mut self, error: BpmnError) -> Result<()> {
        let id = self.id();
        self.instance.throw_error(id, error)
    }

    pub fn throw_compensation(&mut self, activity_ref: Option<&str>) -> Result<()> {
        let id = self.id();
        self.instance.throw_compensation(id, activity_ref)
    }

    pub fn create_event_scope(&mut self) -> Result<()> {
        let id = self.id();
        self.instance.create_event_scope(id)
    }

    pub fn terminate(&mut self) -> Result<()> {
        let id = self.id();
        self.instance.terminate(id)
    }

    // --- multi-instance plumbing ---

    pub(crate) fn create_child(&mut self, concurrent: bool) -> Result<ExecutionId, PvmError> {
        let id = self.id();
        self.instance.exec(id)?;
        let child = self.instance.alloc(Some(id));
        self.instance.exec_mut(child)?.is_concurrent = concurrent;
        Ok(child)
    }

    pub(crate) fn at(&mut self, id: ExecutionId) -> ActivityExecution<'_> {
        ActivityExecution::new(&mut *self.instance, id)
    }
}
