use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::runtime::definition::ActivityIndex;

/// Generation-checked handle into the execution arena of one process instance.
///
/// A handle keeps pointing at "nothing" once its slot is reused, so stale
/// handles held by drivers fail with `ExecutionNotFound` instead of silently
/// addressing a different execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ExecutionId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ExecutionId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// One unit of control of a process instance.
///
/// The same tree encodes scope nesting and concurrency: a child exists either
/// because its parent entered a scope activity (`is_scope`) or because the
/// parent forked (`is_concurrent`).
#[derive(Debug, Clone)]
pub struct Execution {
    pub(crate) id: ExecutionId,
    pub(crate) parent: Option<ExecutionId>,
    pub(crate) children: Vec<ExecutionId>,
    pub(crate) activity: Option<ActivityIndex>,
    /// Activity whose scope this execution represents.
    pub(crate) scope_activity: Option<ActivityIndex>,
    pub(crate) is_scope: bool,
    pub(crate) is_concurrent: bool,
    pub(crate) is_active: bool,
    pub(crate) is_ended: bool,
    pub(crate) is_event_scope: bool,
    pub(crate) is_multi_instance_root: bool,
    /// Set on compensation handler executions: the throwing execution waiting on them.
    pub(crate) compensating_for: Option<ExecutionId>,
    pub(crate) signalling: bool,
    pub(crate) variables: HashMap<String, Value>,
    pub(crate) delete_reason: Option<String>,
}

impl Execution {
    pub(crate) fn new(id: ExecutionId, parent: Option<ExecutionId>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            activity: None,
            scope_activity: None,
            is_scope: false,
            is_concurrent: false,
            is_active: false,
            is_ended: false,
            is_event_scope: false,
            is_multi_instance_root: false,
            compensating_for: None,
            signalling: false,
            variables: HashMap::new(),
            delete_reason: None,
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn parent(&self) -> Option<ExecutionId> {
        self.parent
    }

    pub fn children(&self) -> &[ExecutionId] {
        &self.children
    }

    pub fn activity(&self) -> Option<ActivityIndex> {
        self.activity
    }

    pub fn scope_activity(&self) -> Option<ActivityIndex> {
        self.scope_activity
    }

    pub fn is_scope(&self) -> bool {
        self.is_scope
    }

    pub fn is_concurrent(&self) -> bool {
        self.is_concurrent
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_ended(&self) -> bool {
        self.is_ended
    }

    pub fn is_event_scope(&self) -> bool {
        self.is_event_scope
    }

    pub fn is_multi_instance_root(&self) -> bool {
        self.is_multi_instance_root
    }

    pub fn compensating_for(&self) -> Option<ExecutionId> {
        self.compensating_for
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    pub fn delete_reason(&self) -> Option<&str> {
        self.delete_reason.as_deref()
    }

    /// A child that carries control flow, as opposed to event scopes and
    /// running compensation handlers.
    pub(crate) fn is_branch(&self) -> bool {
        !self.is_event_scope && self.compensating_for.is_none()
    }
}

pub(crate) struct Slot {
    pub(crate) generation: u32,
    pub(crate) execution: Option<Execution>,
    /// Generation of a handle merged away from this slot, and where it went.
    pub(crate) merged_into: Option<(u32, ExecutionId)>,
}
