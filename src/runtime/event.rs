use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::runtime::definition::ActivityIndex;
use crate::runtime::execution::ExecutionId;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Timer,
    Message,
    Signal,
    Compensate,
}

/// What a catching event waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "lowercase")]
pub enum EventTrigger {
    Timer { duration_ms: u64 },
    Message { name: String },
    Signal { name: String },
    /// `None` catches every error code.
    Error { code: Option<String> },
}

impl EventTrigger {
    pub fn timer(duration: Duration) -> Self {
        EventTrigger::Timer {
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn message(name: impl Into<String>) -> Self {
        EventTrigger::Message { name: name.into() }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        EventTrigger::Signal { name: name.into() }
    }

    pub fn error(code: Option<&str>) -> Self {
        EventTrigger::Error {
            code: code.map(str::to_string),
        }
    }

    /// Subscription kind; error triggers are resolved by search, not subscription.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            EventTrigger::Timer { .. } => Some(EventKind::Timer),
            EventTrigger::Message { .. } => Some(EventKind::Message),
            EventTrigger::Signal { .. } => Some(EventKind::Signal),
            EventTrigger::Error { .. } => None,
        }
    }

    pub fn catches_error(&self, code: &str) -> bool {
        match self {
            EventTrigger::Error { code: None } => true,
            EventTrigger::Error { code: Some(c) } => c == code,
            _ => false,
        }
    }
}

/// A pending interest of an execution in an external or internal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub kind: EventKind,
    /// Message/signal name; activity id for timers and compensation.
    pub event_name: String,
    /// Catching activity, or the compensation handler for `Compensate`.
    #[serde(skip)]
    pub activity: ActivityIndex,
    pub activity_id: String,
    pub execution: ExecutionId,
    pub duration_ms: Option<u64>,
}

/// Timer registered during the last call, waiting to be scheduled by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerJob {
    pub subscription_id: SubscriptionId,
    pub activity_id: String,
    pub due_in: Duration,
}
