use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use crate::error::BpmnError;
use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::context::ActivityExecution;
use crate::runtime::event::EventTrigger;

// --- CATCHING ---

/// Waits for a timer, message or signal, then leaves.
#[derive(Debug, Clone)]
pub struct IntermediateCatchEvent {
    trigger: EventTrigger,
}

impl IntermediateCatchEvent {
    pub fn new(trigger: EventTrigger) -> Self {
        Self { trigger }
    }
}

impl ActivityBehavior for IntermediateCatchEvent {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.subscribe(&self.trigger)?;
        Ok(())
    }

    fn signal(
        &self,
        execution: &mut ActivityExecution<'_>,
        _signal_name: Option<&str>,
        signal_data: Option<Value>,
    ) -> Result<()> {
        if let Some(data) = &signal_data {
            execution.set_variables_from(data)?;
        }
        execution.leave()
    }
}

/// Event attached to the boundary of a scope activity.
///
/// The interpreter subscribes on behalf of the host activity and, when the
/// event fires, either cancels the host (`cancel_activity`) or runs next to it.
#[derive(Debug, Clone)]
pub struct BoundaryEvent {
    trigger: EventTrigger,
    cancel_activity: bool,
}

impl BoundaryEvent {
    pub fn interrupting(trigger: EventTrigger) -> Self {
        Self {
            trigger,
            cancel_activity: true,
        }
    }

    pub fn non_interrupting(trigger: EventTrigger) -> Self {
        Self {
            trigger,
            cancel_activity: false,
        }
    }
}

impl ActivityBehavior for BoundaryEvent {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.leave()
    }

    fn boundary_trigger(&self) -> Option<&EventTrigger> {
        Some(&self.trigger)
    }

    fn is_interrupting(&self) -> bool {
        self.cancel_activity
    }
}

// --- THROWING ---

/// Broadcasts a signal to every subscription of the instance, then leaves.
#[derive(Debug, Clone)]
pub struct SignalThrowEvent {
    signal: String,
}

impl SignalThrowEvent {
    pub fn new(signal: impl Into<String>) -> Self {
        Self {
            signal: signal.into(),
        }
    }
}

impl ActivityBehavior for SignalThrowEvent {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        let me = execution.activity_index()?;
        let delivered = execution.signal_event(&self.signal, None)?;
        debug!(signal = %self.signal, delivered, "signal thrown");
        // a caught signal may have cancelled this very branch
        if execution.is_alive() && execution.activity_index().ok() == Some(me) {
            execution.leave()?;
        }
        Ok(())
    }
}

/// Ends the branch by raising a business error.
#[derive(Debug, Clone)]
pub struct ErrorEndEvent {
    code: String,
}

impl ErrorEndEvent {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

impl ActivityBehavior for ErrorEndEvent {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.throw_error(BpmnError::new(self.code.clone()))
    }
}

/// Triggers compensation of completed activities in the enclosing scope,
/// either all of them or only `activity_ref`.
#[derive(Debug, Clone, Default)]
pub struct CompensationThrowEvent {
    activity_ref: Option<String>,
}

impl CompensationThrowEvent {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn activity(activity_id: impl Into<String>) -> Self {
        Self {
            activity_ref: Some(activity_id.into()),
        }
    }
}

impl ActivityBehavior for CompensationThrowEvent {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.throw_compensation(self.activity_ref.as_deref())
    }
}
