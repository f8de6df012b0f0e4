use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;

use crate::runtime::context::ActivityExecution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventName {
    Start,
    End,
    Take,
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventName::Start => f.write_str("start"),
            EventName::End => f.write_str("end"),
            EventName::Take => f.write_str("take"),
        }
    }
}

/// The graph element an event is emitted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EventSource {
    Process(String),
    Activity(String),
    Transition(String),
}

impl EventSource {
    pub fn id(&self) -> &str {
        match self {
            EventSource::Process(id) | EventSource::Activity(id) | EventSource::Transition(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionEvent {
    pub name: EventName,
    pub source: EventSource,
    /// Set when the event is emitted while a scope is being cancelled.
    pub delete_reason: Option<String>,
}

impl ExecutionEvent {
    pub fn new(name: EventName, source: EventSource) -> Self {
        Self {
            name,
            source,
            delete_reason: None,
        }
    }
}

/// 执行监听器：在活动开始/结束以及转移被选取时回调
pub trait ExecutionListener: Send + Sync + Debug {
    fn notify(&self, event: &ExecutionEvent, execution: &mut ActivityExecution<'_>) -> Result<()>;
}

/// Ordered listener registrations of one graph element.
#[derive(Clone, Default)]
pub struct Listeners {
    entries: Vec<(EventName, Arc<dyn ExecutionListener>)>,
}

impl Listeners {
    pub fn add(&mut self, event: EventName, listener: Arc<dyn ExecutionListener>) {
        self.entries.push((event, listener));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Listeners registered for `event`, in registration order.
    pub fn for_event(&self, event: EventName) -> Vec<Arc<dyn ExecutionListener>> {
        self.entries
            .iter()
            .filter(|(name, _)| *name == event)
            .map(|(_, l)| l.clone())
            .collect()
    }
}

impl Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Listener that records every event it sees as `"<event>:<element id>"`.
///
/// Handy for asserting dispatch order; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.log.lock() {
            log.clear();
        }
    }
}

impl ExecutionListener for RecordingListener {
    fn notify(&self, event: &ExecutionEvent, _execution: &mut ActivityExecution<'_>) -> Result<()> {
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("{}:{}", event.name, event.source.id()));
        }
        Ok(())
    }
}
