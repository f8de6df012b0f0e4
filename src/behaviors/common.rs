use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::context::ActivityExecution;

/// Pass-through: leaves as soon as it is reached.
#[derive(Debug, Default, Clone, Copy)]
pub struct Automatic;

impl ActivityBehavior for Automatic {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.leave()
    }
}

/// Parks the execution until it is signalled (user task, receive task).
///
/// Signal data that is a JSON object is written into the variables. A signal
/// name equal to the id of an outgoing transition selects that transition;
/// anything else leaves through the regular outgoing transitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitState;

impl ActivityBehavior for WaitState {
    fn execute(&self, _execution: &mut ActivityExecution<'_>) -> Result<()> {
        Ok(())
    }

    fn signal(
        &self,
        execution: &mut ActivityExecution<'_>,
        signal_name: Option<&str>,
        signal_data: Option<Value>,
    ) -> Result<()> {
        if let Some(data) = &signal_data {
            execution.set_variables_from(data)?;
        }
        if let Some(name) = signal_name {
            let def = execution.definition();
            let activity = def.activity(execution.activity_index()?);
            let named = activity
                .outgoing()
                .iter()
                .copied()
                .find(|t| def.transition(*t).id() == name);
            if let Some(t) = named {
                debug!(transition = %name, "signal selects transition");
                return execution.take(t);
            }
        }
        execution.leave()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoneEndEvent;

impl ActivityBehavior for NoneEndEvent {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.end()
    }
}

/// Ends every execution in the enclosing scope, not just its own branch.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminateEndEvent;

impl ActivityBehavior for TerminateEndEvent {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.terminate()
    }
}
