use anyhow::Result;

use crate::error::PvmError;
use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::context::ActivityExecution;

/// Embedded sub-process: a composite activity with its own scope.
///
/// Entering it starts the initial child activity inside the new scope
/// execution. Once nothing is left running inside, pending compensation
/// subscriptions are parked in an event scope and the sub-process leaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubProcess;

impl ActivityBehavior for SubProcess {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        let def = execution.definition();
        let activity = def.activity(execution.activity_index()?);
        let initial = activity
            .initial()
            .ok_or_else(|| PvmError::NoInitialActivity(activity.id().to_string()))?;
        execution.execute_activity(initial)
    }

    fn last_execution_ended(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.create_event_scope()?;
        execution.leave()
    }

    fn creates_scope(&self) -> bool {
        true
    }
}
