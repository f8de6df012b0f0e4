use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::PvmError;
use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::condition::Condition;
use crate::runtime::instance::ProcessInstance;
use crate::runtime::listener::Listeners;

pub type ActivityIndex = usize;
pub type TransitionIndex = usize;

/// 编译后的流程定义 (只读图模型)
///
/// Activities and transitions live in flat vectors and refer to each other by
/// index. The scope tree is encoded through `Activity::parent`; `None` means
/// the activity sits directly in the process scope.
pub struct ProcessDefinition {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) activities: Vec<Activity>,
    pub(crate) transitions: Vec<Transition>,
    pub(crate) top_level: Vec<ActivityIndex>,
    pub(crate) initial: Option<ActivityIndex>,
    pub(crate) listeners: Listeners,
    pub(crate) activity_ids: HashMap<String, ActivityIndex>,
    pub(crate) transition_ids: HashMap<String, TransitionIndex>,
}

impl ProcessDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activity(&self, index: ActivityIndex) -> &Activity {
        &self.activities[index]
    }

    pub fn transition(&self, index: TransitionIndex) -> &Transition {
        &self.transitions[index]
    }

    pub fn find_activity(&self, id: &str) -> Option<&Activity> {
        self.activity_ids.get(id).map(|&i| &self.activities[i])
    }

    pub fn find_transition(&self, id: &str) -> Option<&Transition> {
        self.transition_ids.get(id).map(|&i| &self.transitions[i])
    }

    /// Like `find_activity`, but a missing reference is a model error.
    pub fn require_activity(&self, id: &str) -> Result<&Activity, PvmError> {
        self.find_activity(id)
            .ok_or_else(|| PvmError::ActivityNotFound(id.to_string()))
    }

    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.activities.iter()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    /// Activities placed directly in the process scope.
    pub fn top_level(&self) -> impl Iterator<Item = &Activity> {
        self.top_level.iter().map(|&i| &self.activities[i])
    }

    pub fn initial(&self) -> Option<&Activity> {
        self.initial.map(|i| &self.activities[i])
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    /// New, not yet started instance positioned before the initial activity.
    pub fn create_process_instance(self: &Arc<Self>) -> ProcessInstance {
        ProcessInstance::new(self.clone(), None)
    }

    /// New instance that will start at `activity_id` instead of the initial activity.
    pub fn create_process_instance_at(
        self: &Arc<Self>,
        activity_id: &str,
    ) -> Result<ProcessInstance, PvmError> {
        let activity = self.require_activity(activity_id)?;
        Ok(ProcessInstance::new(self.clone(), Some(activity.index)))
    }

    /// Chain of scope ancestors of `index`, outermost first, excluding the activity itself.
    pub(crate) fn ancestors(&self, index: ActivityIndex) -> Vec<ActivityIndex> {
        let mut chain = Vec::new();
        let mut current = self.activities[index].parent;
        while let Some(p) = current {
            chain.push(p);
            current = self.activities[p].parent;
        }
        chain.reverse();
        chain
    }
}

impl fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessDefinition")
            .field("id", &self.id)
            .field("activities", &self.activities.len())
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

/// A node of the process graph.
pub struct Activity {
    pub(crate) index: ActivityIndex,
    pub(crate) id: String,
    pub(crate) name: Option<String>,
    pub(crate) behavior: Arc<dyn ActivityBehavior>,
    pub(crate) parent: Option<ActivityIndex>,
    pub(crate) children: Vec<ActivityIndex>,
    pub(crate) initial: Option<ActivityIndex>,
    pub(crate) outgoing: Vec<TransitionIndex>,
    pub(crate) incoming: Vec<TransitionIndex>,
    pub(crate) is_scope: bool,
    pub(crate) is_async: bool,
    pub(crate) is_exclusive: bool,
    pub(crate) boundary_events: Vec<ActivityIndex>,
    pub(crate) attached_to: Option<ActivityIndex>,
    pub(crate) compensation_handler: Option<ActivityIndex>,
    pub(crate) is_for_compensation: bool,
    pub(crate) listeners: Listeners,
    pub(crate) properties: HashMap<String, Value>,
}

impl Activity {
    pub fn index(&self) -> ActivityIndex {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn behavior(&self) -> &Arc<dyn ActivityBehavior> {
        &self.behavior
    }

    pub fn parent(&self) -> Option<ActivityIndex> {
        self.parent
    }

    pub fn children(&self) -> &[ActivityIndex] {
        &self.children
    }

    /// Initial child activity when this activity is a composite scope.
    pub fn initial(&self) -> Option<ActivityIndex> {
        self.initial
    }

    pub fn outgoing(&self) -> &[TransitionIndex] {
        &self.outgoing
    }

    pub fn incoming(&self) -> &[TransitionIndex] {
        &self.incoming
    }

    pub fn is_scope(&self) -> bool {
        self.is_scope
    }

    /// Hint for a job layer: continue asynchronously before this activity.
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }

    pub fn boundary_events(&self) -> &[ActivityIndex] {
        &self.boundary_events
    }

    pub fn attached_to(&self) -> Option<ActivityIndex> {
        self.attached_to
    }

    pub fn compensation_handler(&self) -> Option<ActivityIndex> {
        self.compensation_handler
    }

    pub fn is_for_compensation(&self) -> bool {
        self.is_for_compensation
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("behavior", &self.behavior)
            .field("is_scope", &self.is_scope)
            .field("outgoing", &self.outgoing)
            .finish()
    }
}

/// A directed edge between two activities of the same scope.
pub struct Transition {
    pub(crate) index: TransitionIndex,
    pub(crate) id: String,
    pub(crate) source: ActivityIndex,
    pub(crate) destination: ActivityIndex,
    pub(crate) condition: Option<Arc<dyn Condition>>,
    pub(crate) skip: Option<Arc<dyn Condition>>,
    pub(crate) listeners: Listeners,
}

impl Transition {
    pub fn index(&self) -> TransitionIndex {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> ActivityIndex {
        self.source
    }

    pub fn destination(&self) -> ActivityIndex {
        self.destination
    }

    pub fn condition(&self) -> Option<&Arc<dyn Condition>> {
        self.condition.as_ref()
    }

    pub fn skip(&self) -> Option<&Arc<dyn Condition>> {
        self.skip.as_ref()
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("guarded", &self.condition.is_some())
            .finish()
    }
}
