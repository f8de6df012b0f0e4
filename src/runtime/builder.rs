use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::behaviors::common::Automatic;
use crate::error::PvmError;
use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::condition::{Condition, ExprCondition};
use crate::runtime::definition::{Activity, ActivityIndex, ProcessDefinition, Transition};
use crate::runtime::listener::{EventName, ExecutionListener, Listeners};

/// Fluent builder for process definitions.
///
/// Activities nest: everything created between `create_activity("sub")` and
/// the matching `end_activity()` becomes a child of `sub`. Transitions are
/// declared on the currently open activity and reference their destination
/// by id, so forward references are fine.
///
/// ```ignore
/// let def = ProcessDefinitionBuilder::new("order")
///     .create_activity("one").initial().behavior(Automatic).transition("two").end_activity()
///     .create_activity("two").behavior(WaitState).transition("three").end_activity()
///     .create_activity("three").behavior(NoneEndEvent).end_activity()
///     .build()?;
/// ```
pub struct ProcessDefinitionBuilder {
    id: String,
    name: String,
    activities: Vec<ActivityDraft>,
    open: Vec<usize>,
    transitions: Vec<TransitionDraft>,
    listeners: Listeners,
    error: Option<PvmError>,
}

struct ActivityDraft {
    id: String,
    name: Option<String>,
    behavior: Option<Arc<dyn ActivityBehavior>>,
    parent: Option<usize>,
    initial: bool,
    is_scope: bool,
    is_async: bool,
    is_exclusive: bool,
    attached_to: Option<String>,
    compensated_by: Option<String>,
    listeners: Listeners,
    properties: HashMap<String, Value>,
}

struct TransitionDraft {
    id: Option<String>,
    source: usize,
    destination: String,
    condition: Option<Arc<dyn Condition>>,
    skip: Option<Arc<dyn Condition>>,
    listeners: Listeners,
}

impl ProcessDefinitionBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            activities: Vec::new(),
            open: Vec::new(),
            transitions: Vec::new(),
            listeners: Listeners::default(),
            error: None,
        }
    }

    /// Names the open activity, or the process when no activity is open.
    pub fn name(mut self, name: &str) -> Self {
        match self.current() {
            Some(activity) => activity.name = Some(name.to_string()),
            None => self.name = name.to_string(),
        }
        self
    }

    pub fn create_activity(mut self, id: &str) -> Self {
        let parent = self.open.last().copied();
        self.activities.push(ActivityDraft {
            id: id.to_string(),
            name: None,
            behavior: None,
            parent,
            initial: false,
            is_scope: false,
            is_async: false,
            is_exclusive: false,
            attached_to: None,
            compensated_by: None,
            listeners: Listeners::default(),
            properties: HashMap::new(),
        });
        self.open.push(self.activities.len() - 1);
        self
    }

    pub fn end_activity(mut self) -> Self {
        if self.open.pop().is_none() {
            self.fail(PvmError::InvalidModel(
                "end_activity() without an open activity".to_string(),
            ));
        }
        self
    }

    pub fn initial(self) -> Self {
        self.with_current("initial()", |a| a.initial = true)
    }

    pub fn behavior<B: ActivityBehavior + 'static>(self, behavior: B) -> Self {
        self.behavior_arc(Arc::new(behavior))
    }

    pub fn behavior_arc(self, behavior: Arc<dyn ActivityBehavior>) -> Self {
        self.with_current("behavior()", |a| a.behavior = Some(behavior))
    }

    pub fn scope(self) -> Self {
        self.with_current("scope()", |a| a.is_scope = true)
    }

    pub fn async_continuation(self) -> Self {
        self.with_current("async_continuation()", |a| a.is_async = true)
    }

    pub fn exclusive(self) -> Self {
        self.with_current("exclusive()", |a| a.is_exclusive = true)
    }

    /// Attaches the open (boundary event) activity to `activity_id`.
    pub fn attached_to(self, activity_id: &str) -> Self {
        let target = activity_id.to_string();
        self.with_current("attached_to()", |a| a.attached_to = Some(target))
    }

    /// Declares `handler_id` as the compensation handler of the open activity.
    pub fn compensated_by(self, handler_id: &str) -> Self {
        let handler = handler_id.to_string();
        self.with_current("compensated_by()", |a| a.compensated_by = Some(handler))
    }

    pub fn property(self, key: &str, value: impl Into<Value>) -> Self {
        let key = key.to_string();
        let value = value.into();
        self.with_current("property()", |a| {
            a.properties.insert(key, value);
        })
    }

    /// Registers a listener on the open activity, or on the process when none is open.
    ///
    /// Process level listeners see every event of the instance.
    pub fn listener(mut self, event: EventName, listener: Arc<dyn ExecutionListener>) -> Self {
        match self.current() {
            Some(activity) => activity.listeners.add(event, listener),
            None => self.listeners.add(event, listener),
        }
        self
    }

    pub fn transition(self, destination: &str) -> Self {
        self.start_transition(destination).end_transition()
    }

    pub fn transition_with_id(self, id: &str, destination: &str) -> Self {
        self.start_transition(destination).id(id).end_transition()
    }

    pub fn start_transition(mut self, destination: &str) -> TransitionBuilder {
        let source = match self.open.last() {
            Some(&s) => s,
            None => {
                self.fail(PvmError::InvalidModel(format!(
                    "transition to '{}' declared outside of an activity",
                    destination
                )));
                usize::MAX
            }
        };
        TransitionBuilder {
            builder: self,
            draft: TransitionDraft {
                id: None,
                source,
                destination: destination.to_string(),
                condition: None,
                skip: None,
                listeners: Listeners::default(),
            },
        }
    }

    pub fn build(self) -> Result<Arc<ProcessDefinition>, PvmError> {
        if let Some(e) = self.error {
            return Err(e);
        }

        // 1. Index activities
        let mut activity_ids = HashMap::new();
        for (idx, draft) in self.activities.iter().enumerate() {
            if activity_ids.insert(draft.id.clone(), idx).is_some() {
                return Err(PvmError::DuplicateActivity(draft.id.clone()));
            }
        }

        let mut activities: Vec<Activity> = Vec::with_capacity(self.activities.len());
        let mut top_level = Vec::new();
        for (idx, draft) in self.activities.iter().enumerate() {
            let behavior = draft
                .behavior
                .clone()
                .unwrap_or_else(|| Arc::new(Automatic));
            let is_scope = draft.is_scope || behavior.creates_scope();
            if draft.parent.is_none() {
                top_level.push(idx);
            }
            activities.push(Activity {
                index: idx,
                id: draft.id.clone(),
                name: draft.name.clone(),
                behavior,
                parent: draft.parent,
                children: Vec::new(),
                initial: None,
                outgoing: Vec::new(),
                incoming: Vec::new(),
                is_scope,
                is_async: draft.is_async,
                is_exclusive: draft.is_exclusive,
                boundary_events: Vec::new(),
                attached_to: None,
                compensation_handler: None,
                is_for_compensation: false,
                listeners: draft.listeners.clone(),
                properties: draft.properties.clone(),
            });
        }

        // 2. Scope tree and initial activities
        let mut process_initial: Option<ActivityIndex> = None;
        for (idx, draft) in self.activities.iter().enumerate() {
            if let Some(p) = draft.parent {
                activities[p].children.push(idx);
            }
            if !draft.initial {
                continue;
            }
            let slot = match draft.parent {
                Some(p) => &mut activities[p].initial,
                None => &mut process_initial,
            };
            if slot.is_some() {
                let scope = match draft.parent {
                    Some(p) => self.activities[p].id.clone(),
                    None => self.id.clone(),
                };
                return Err(PvmError::DuplicateInitial { scope });
            }
            *slot = Some(idx);
        }

        // 3. Boundary events and compensation handlers
        for (idx, draft) in self.activities.iter().enumerate() {
            if let Some(target_id) = &draft.attached_to {
                let target = *activity_ids
                    .get(target_id)
                    .ok_or_else(|| PvmError::ActivityNotFound(target_id.clone()))?;
                if activities[target].parent != draft.parent {
                    return Err(PvmError::InvalidModel(format!(
                        "boundary event '{}' must share the scope of '{}'",
                        draft.id, target_id
                    )));
                }
                if draft.initial {
                    return Err(PvmError::InvalidModel(format!(
                        "boundary event '{}' cannot be an initial activity",
                        draft.id
                    )));
                }
                // the attached activity needs its own execution to hold subscriptions
                activities[target].is_scope = true;
                activities[target].boundary_events.push(idx);
                activities[idx].attached_to = Some(target);
            }
            if let Some(handler_id) = &draft.compensated_by {
                let handler = *activity_ids
                    .get(handler_id)
                    .ok_or_else(|| PvmError::ActivityNotFound(handler_id.clone()))?;
                if activities[handler].parent != draft.parent {
                    return Err(PvmError::InvalidModel(format!(
                        "compensation handler '{}' must share the scope of '{}'",
                        handler_id, draft.id
                    )));
                }
                activities[idx].compensation_handler = Some(handler);
                activities[handler].is_for_compensation = true;
            }
        }

        // 4. Transitions
        let mut transitions: Vec<Transition> = Vec::with_capacity(self.transitions.len());
        let mut transition_ids = HashMap::new();
        for (idx, draft) in self.transitions.into_iter().enumerate() {
            let source = draft.source;
            let destination = *activity_ids
                .get(&draft.destination)
                .ok_or_else(|| PvmError::ActivityNotFound(draft.destination.clone()))?;
            let id = match draft.id {
                Some(id) => id,
                None => {
                    let base = format!("{}->{}", activities[source].id, activities[destination].id);
                    if transition_ids.contains_key(&base) {
                        format!("{}#{}", base, idx)
                    } else {
                        base
                    }
                }
            };
            if transition_ids.insert(id.clone(), idx).is_some() {
                return Err(PvmError::DuplicateTransition(id));
            }
            if activities[source].parent != activities[destination].parent {
                return Err(PvmError::CrossScopeTransition { transition: id });
            }
            activities[source].outgoing.push(idx);
            activities[destination].incoming.push(idx);
            transitions.push(Transition {
                index: idx,
                id,
                source,
                destination,
                condition: draft.condition,
                skip: draft.skip,
                listeners: draft.listeners,
            });
        }

        for activity in &activities {
            if activity.is_for_compensation && !activity.outgoing.is_empty() {
                return Err(PvmError::InvalidModel(format!(
                    "compensation handler '{}' must not have outgoing transitions",
                    activity.id
                )));
            }
        }

        Ok(Arc::new(ProcessDefinition {
            id: self.id,
            name: self.name,
            activities,
            transitions,
            top_level,
            initial: process_initial,
            listeners: self.listeners,
            activity_ids,
            transition_ids,
        }))
    }

    fn current(&mut self) -> Option<&mut ActivityDraft> {
        let idx = *self.open.last()?;
        self.activities.get_mut(idx)
    }

    fn with_current(mut self, what: &str, f: impl FnOnce(&mut ActivityDraft)) -> Self {
        match self.current() {
            Some(activity) => f(activity),
            None => self.fail(PvmError::InvalidModel(format!(
                "{} called without an open activity",
                what
            ))),
        }
        self
    }

    fn fail(&mut self, error: PvmError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// Sub-builder for a single transition, returned by `start_transition`.
pub struct TransitionBuilder {
    builder: ProcessDefinitionBuilder,
    draft: TransitionDraft,
}

impl TransitionBuilder {
    pub fn id(mut self, id: &str) -> Self {
        self.draft.id = Some(id.to_string());
        self
    }

    pub fn condition(mut self, condition: Arc<dyn Condition>) -> Self {
        self.draft.condition = Some(condition);
        self
    }

    /// Guard written as an expression over process variables, e.g. `"amount > 100"`.
    pub fn condition_expr(mut self, source: &str) -> Self {
        match ExprCondition::parse(source) {
            Ok(c) => self.draft.condition = Some(Arc::new(c)),
            Err(e) => self.builder.fail(PvmError::InvalidModel(e.to_string())),
        }
        self
    }

    /// When the predicate holds, the destination is passed through without running its behavior.
    pub fn skip_when(mut self, predicate: Arc<dyn Condition>) -> Self {
        self.draft.skip = Some(predicate);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ExecutionListener>) -> Self {
        self.draft.listeners.add(EventName::Take, listener);
        self
    }

    pub fn end_transition(mut self) -> ProcessDefinitionBuilder {
        if self.draft.source != usize::MAX {
            self.builder.transitions.push(self.draft);
        }
        self.builder
    }
}
