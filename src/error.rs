use thiserror::Error;

use crate::runtime::execution::ExecutionId;

/// Errors raised by the virtual machine itself.
///
/// Faults coming out of behaviors, listeners, conditions or task handlers are
/// never wrapped into this type; they travel through `anyhow::Error` untouched.
#[derive(Debug, Error)]
pub enum PvmError {
    // --- model errors ---
    #[error("activity '{0}' not found")]
    ActivityNotFound(String),

    #[error("transition '{0}' not found")]
    TransitionNotFound(String),

    #[error("duplicate activity id '{0}'")]
    DuplicateActivity(String),

    #[error("duplicate transition id '{0}'")]
    DuplicateTransition(String),

    #[error("scope '{scope}' declares more than one initial activity")]
    DuplicateInitial { scope: String },

    #[error("scope '{0}' has no initial activity")]
    NoInitialActivity(String),

    #[error("transition '{transition}' crosses a scope boundary")]
    CrossScopeTransition { transition: String },

    #[error("invalid process model: {0}")]
    InvalidModel(String),

    // --- protocol misuse ---
    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("execution {0} has already ended")]
    ExecutionEnded(ExecutionId),

    #[error("execution {0} is not parked in a wait state")]
    NotWaitState(ExecutionId),

    #[error("execution {0} is already being signalled")]
    AlreadySignalled(ExecutionId),

    #[error("transition '{transition}' does not leave activity '{activity}'")]
    ForeignTransition { transition: String, activity: String },

    #[error("no outgoing transition of '{0}' could be selected")]
    NoOutgoingTransition(String),

    #[error("process instance has already been started")]
    AlreadyStarted,

    #[error("process instance has not been started")]
    NotStarted,

    #[error("activity '{0}' does not support signals")]
    SignalNotSupported(String),

    #[error("no execution is parked at activity '{0}'")]
    NoExecutionAt(String),

    #[error("event subscription {0} not found")]
    SubscriptionNotFound(u64),
}

/// A business error thrown inside the process (error end event or task handler).
///
/// It is caught by the nearest enclosing error boundary event; when nothing
/// catches it, it leaves the interpreter as an ordinary fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("bpmn error '{code}'")]
pub struct BpmnError {
    pub code: String,
    pub message: Option<String>,
}

impl BpmnError {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
