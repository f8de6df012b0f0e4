use std::fmt::Debug;

use anyhow::Result;
use serde_json::Value;

use crate::error::PvmError;
use crate::runtime::context::ActivityExecution;
use crate::runtime::event::{EventSubscription, EventTrigger};

/// 活动行为 (Activity Behavior)
///
/// Strategy invoked by the interpreter when control reaches an activity
/// (`execute`) or when something external resumes a parked execution
/// (`signal`). Implementations either move the execution on before
/// returning or leave it parked as a wait state.
pub trait ActivityBehavior: Send + Sync + Debug {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()>;

    fn signal(
        &self,
        execution: &mut ActivityExecution<'_>,
        _signal_name: Option<&str>,
        _signal_data: Option<Value>,
    ) -> Result<()> {
        let activity = execution.activity_id().unwrap_or_default();
        Err(PvmError::SignalNotSupported(activity).into())
    }

    /// Hook used whenever the activity is done; multi-instance overrides it
    /// to count instances instead of following transitions.
    fn leave(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.take_outgoing()
    }

    /// Called on a scope execution once nothing is left running inside it.
    fn last_execution_ended(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.leave()
    }

    /// Delivery of a subscription owned by this activity.
    fn trigger(
        &self,
        execution: &mut ActivityExecution<'_>,
        subscription: &EventSubscription,
        data: Option<Value>,
    ) -> Result<()> {
        self.signal(execution, Some(&subscription.event_name), data)
    }

    /// What the activity waits for when it is attached as a boundary event.
    fn boundary_trigger(&self) -> Option<&EventTrigger> {
        None
    }

    fn is_interrupting(&self) -> bool {
        true
    }

    /// Composite behaviors need their own scope execution.
    fn creates_scope(&self) -> bool {
        false
    }
}
