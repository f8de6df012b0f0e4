//! Structural algorithms of the interpreter: entering and leaving scopes,
//! taking transitions, forking, joining and ending executions.
//!
//! Behaviors re-enter these functions through `ActivityExecution`. Work
//! inside one activity runs on the caller's stack; every step along a
//! transition goes through the agenda in `agenda.rs`.

use std::collections::VecDeque;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{BpmnError, PvmError};
use crate::runtime::agenda::Operation;
use crate::runtime::context::ActivityExecution;
use crate::runtime::definition::{ActivityIndex, TransitionIndex};
use crate::runtime::event::{EventKind, EventSubscription, EventTrigger, SubscriptionId, TimerJob};
use crate::runtime::execution::ExecutionId;
use crate::runtime::instance::ProcessInstance;
use crate::runtime::listener::{EventName, EventSource, ExecutionEvent, Listeners};

/// Result of looking for branches gathered at a join activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrentJoin {
    /// Inactive branches parked at the activity, the arriving one included.
    pub joined: Vec<ExecutionId>,
    /// Every branch of the concurrent root has arrived.
    pub complete: bool,
}

impl ProcessInstance {
    // --- listener dispatch ---

    pub(crate) fn fire_process_event(&mut self, name: EventName, reason: Option<&str>) -> Result<()> {
        let event = ExecutionEvent {
            name,
            source: EventSource::Process(self.definition.id.clone()),
            delete_reason: reason.map(str::to_string),
        };
        let root = self.root;
        self.dispatch(root, &event, None)
    }

    pub(crate) fn fire_activity_event(
        &mut self,
        execution: ExecutionId,
        name: EventName,
        activity: ActivityIndex,
        reason: Option<&str>,
    ) -> Result<()> {
        let def = self.definition.clone();
        let a = def.activity(activity);
        let event = ExecutionEvent {
            name,
            source: EventSource::Activity(a.id.clone()),
            delete_reason: reason.map(str::to_string),
        };
        self.dispatch(execution, &event, Some(&a.listeners))
    }

    fn fire_take_event(&mut self, execution: ExecutionId, transition: TransitionIndex) -> Result<()> {
        let def = self.definition.clone();
        let t = def.transition(transition);
        let event = ExecutionEvent::new(EventName::Take, EventSource::Transition(t.id.clone()));
        self.dispatch(execution, &event, Some(&t.listeners))
    }

    /// Each level notifies in registration order. Start and take events reach
    /// the process level before the element; end events reach the element first.
    fn dispatch(
        &mut self,
        execution: ExecutionId,
        event: &ExecutionEvent,
        element: Option<&Listeners>,
    ) -> Result<()> {
        let def = self.definition.clone();
        let outer = def.listeners.for_event(event.name);
        let inner = element.map(|l| l.for_event(event.name)).unwrap_or_default();
        let listeners: Vec<_> = match event.name {
            EventName::End => inner.into_iter().chain(outer).collect(),
            _ => outer.into_iter().chain(inner).collect(),
        };
        for listener in listeners {
            listener.notify(event, &mut ActivityExecution::new(self, execution))?;
        }
        Ok(())
    }

    // --- scopes ---

    /// Creates the scope execution for `activity` below `parent` and announces it.
    ///
    /// Used when an alternate initial activity is nested inside sub-processes.
    pub(crate) fn enter_scope(&mut self, parent: ExecutionId, activity: ActivityIndex) -> Result<ExecutionId> {
        let child = self.create_scope_child(parent, activity)?;
        self.exec_mut(child)?.activity = Some(activity);
        self.exec_mut(child)?.is_active = true;
        self.register_boundary_events(child, activity)?;
        self.fire_activity_event(child, EventName::Start, activity, None)?;
        Ok(child)
    }

    fn create_scope_child(&mut self, parent: ExecutionId, activity: ActivityIndex) -> Result<ExecutionId> {
        self.exec(parent)?;
        let child = self.alloc(Some(parent));
        {
            let p = self.exec_mut(parent)?;
            p.activity = None;
            p.is_active = false;
        }
        let c = self.exec_mut(child)?;
        c.is_scope = true;
        c.scope_activity = Some(activity);
        debug!(
            instance_id = %self.id,
            parent = %parent,
            scope = %child,
            activity = %self.definition.activity(activity).id,
            "enter scope"
        );
        Ok(child)
    }

    /// Moves control into `activity`, creating a scope execution when needed.
    pub(crate) fn execute_activity(&mut self, execution: ExecutionId, activity: ActivityIndex) -> Result<()> {
        let target = if self.definition.activity(activity).is_scope {
            self.create_scope_child(execution, activity)?
        } else {
            execution
        };
        self.run_activity(target, activity)
    }

    /// Positions `execution` at `activity` and runs its behavior without
    /// creating a new scope.
    pub(crate) fn run_activity(&mut self, execution: ExecutionId, activity: ActivityIndex) -> Result<()> {
        {
            let e = self.exec_mut(execution)?;
            e.activity = Some(activity);
            e.is_active = true;
        }
        if self.exec(execution)?.scope_activity == Some(activity) {
            self.register_boundary_events(execution, activity)?;
        }
        self.fire_activity_event(execution, EventName::Start, activity, None)?;

        let def = self.definition.clone();
        let a = def.activity(activity);
        debug!(instance_id = %self.id, execution = %execution, activity = %a.id, "execute");
        a.behavior.execute(&mut ActivityExecution::new(self, execution))
    }

    /// Finishes `activity` on `execution` and returns the execution that carries on.
    ///
    /// When `execution` is the scope execution of the activity, the scope is
    /// destroyed (together with its event scopes) and the parent takes over.
    pub(crate) fn leave_activity(&mut self, execution: ExecutionId, activity: ActivityIndex) -> Result<ExecutionId> {
        self.subscriptions.retain(|_, s| {
            !(s.execution == execution && s.activity == activity && s.kind != EventKind::Compensate)
        });
        self.fire_activity_event(execution, EventName::End, activity, None)?;

        let (scope_activity, parent) = {
            let e = self.exec(execution)?;
            (e.scope_activity, e.parent)
        };
        let continuing = match parent {
            Some(parent) if scope_activity == Some(activity) => {
                self.destroy_scope(execution)?;
                let p = self.exec_mut(parent)?;
                p.activity = Some(activity);
                p.is_active = true;
                parent
            }
            _ => execution,
        };

        let def = self.definition.clone();
        if let Some(handler) = def.activity(activity).compensation_handler {
            let holder = self.scope_execution(continuing);
            self.add_subscription(
                EventKind::Compensate,
                def.activity(activity).id.clone(),
                handler,
                holder,
                None,
            );
        }
        Ok(continuing)
    }

    fn destroy_scope(&mut self, scope: ExecutionId) -> Result<()> {
        debug!(instance_id = %self.id, scope = %scope, "destroy scope");
        let children = self.exec(scope)?.children.clone();
        for child in children.into_iter().rev() {
            self.delete_subtree(child, None)?;
        }
        self.remove(scope);
        Ok(())
    }

    /// Removes `id` and everything below it, children first.
    ///
    /// End events fire for every activity that was still running; event
    /// scopes vanish silently.
    pub(crate) fn delete_subtree(&mut self, id: ExecutionId, reason: Option<&str>) -> Result<()> {
        let Some(children) = self.get(id).map(|e| e.children.clone()) else {
            return Ok(());
        };
        for child in children.into_iter().rev() {
            self.delete_subtree(child, reason)?;
        }
        let (activity, scope_activity, is_event_scope) = {
            let e = self.exec_mut(id)?;
            e.delete_reason = reason.map(str::to_string);
            (e.activity, e.scope_activity, e.is_event_scope)
        };
        if !is_event_scope {
            if let Some(a) = activity {
                self.fire_activity_event(id, EventName::End, a, reason)?;
            }
            if let Some(sa) = scope_activity.filter(|sa| Some(*sa) != activity) {
                self.fire_activity_event(id, EventName::End, sa, reason)?;
            }
        }
        self.remove(id);
        Ok(())
    }

    // --- transitions ---

    /// Queues the take of `transition` on the agenda.
    ///
    /// A transition that does not start at the execution's activity is
    /// rejected here, before anything is queued.
    pub(crate) fn take_transition(
        &mut self,
        execution: ExecutionId,
        transition: TransitionIndex,
        leave_source: bool,
    ) -> Result<()> {
        self.check_source(execution, transition)?;
        self.perform([Operation::Take {
            execution,
            transition,
            leave_source,
        }])
    }

    fn check_source(&self, execution: ExecutionId, transition: TransitionIndex) -> Result<()> {
        let t = self.definition.transition(transition);
        let current = self.exec(execution)?.activity;
        if current != Some(t.source) {
            return Err(PvmError::ForeignTransition {
                transition: t.id.clone(),
                activity: current
                    .map(|a| self.definition.activity(a).id.clone())
                    .unwrap_or_default(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn perform_take(
        &mut self,
        execution: ExecutionId,
        transition: TransitionIndex,
        leave_source: bool,
    ) -> Result<()> {
        self.check_source(execution, transition)?;
        let def = self.definition.clone();
        let t = def.transition(transition);

        let execution = if leave_source {
            self.leave_activity(execution, t.source)?
        } else {
            execution
        };
        debug!(instance_id = %self.id, execution = %execution, transition = %t.id, "take");
        self.fire_take_event(execution, transition)?;

        if let Some(skip) = &t.skip {
            {
                let e = self.exec_mut(execution)?;
                e.activity = Some(t.destination);
                e.is_active = true;
            }
            let skipped = skip.evaluate(&ActivityExecution::new(self, execution))?;
            if skipped {
                debug!(instance_id = %self.id, activity = %def.activity(t.destination).id, "skip");
                return self.pass_through(execution, t.destination);
            }
        }
        self.execute_activity(execution, t.destination)
    }

    /// Outgoing transitions whose guard holds, in declaration order.
    pub(crate) fn select_outgoing(
        &mut self,
        execution: ExecutionId,
        activity: ActivityIndex,
    ) -> Result<Vec<TransitionIndex>> {
        let def = self.definition.clone();
        let mut selected = Vec::new();
        for &t in &def.activity(activity).outgoing {
            let passes = match &def.transition(t).condition {
                Some(c) => c.evaluate(&ActivityExecution::new(self, execution))?,
                None => true,
            };
            if passes {
                selected.push(t);
            }
        }
        Ok(selected)
    }

    /// Default way of leaving an activity: follow every outgoing transition
    /// whose guard holds, or end the execution when there are none.
    pub(crate) fn take_outgoing(&mut self, execution: ExecutionId) -> Result<()> {
        let activity = self.current_activity(execution)?;
        if self.definition.activity(activity).outgoing.is_empty() {
            return self.end(execution);
        }
        let selected = self.select_outgoing(execution, activity)?;
        match selected.as_slice() {
            [] => Err(PvmError::NoOutgoingTransition(self.definition.activity(activity).id.clone()).into()),
            [t] => self.take_transition(execution, *t, true),
            _ => self.take_all(execution, selected, vec![execution], true),
        }
    }

    /// Leaves a skipped activity without running its behavior or listeners.
    fn pass_through(&mut self, execution: ExecutionId, activity: ActivityIndex) -> Result<()> {
        if self.definition.activity(activity).outgoing.is_empty() {
            return self.activity_completed(execution, activity);
        }
        let selected = self.select_outgoing(execution, activity)?;
        match selected.as_slice() {
            [] => Err(PvmError::NoOutgoingTransition(self.definition.activity(activity).id.clone()).into()),
            [t] => self.take_transition(execution, *t, false),
            _ => self.take_all(execution, selected, vec![execution], false),
        }
    }

    /// Takes several transitions at once, reusing the `recyclable` executions
    /// (branches gathered at a join) before creating new concurrent ones.
    pub(crate) fn take_all(
        &mut self,
        execution: ExecutionId,
        transitions: Vec<TransitionIndex>,
        recyclable: Vec<ExecutionId>,
        leave_source: bool,
    ) -> Result<()> {
        let activity = self.current_activity(execution)?;
        let mut recyclable: Vec<ExecutionId> = recyclable
            .into_iter()
            .map(|r| self.resolve(r))
            .filter(|r| self.is_alive(*r))
            .collect();
        if !recyclable.contains(&execution) {
            recyclable.push(execution);
        }

        let execution = if leave_source {
            let continuing = self.leave_activity(execution, activity)?;
            for r in recyclable.iter_mut() {
                if *r == execution {
                    *r = continuing;
                }
            }
            continuing
        } else {
            execution
        };

        let concurrent_root = {
            let e = self.exec(execution)?;
            match e.parent {
                Some(p) if e.is_concurrent => p,
                _ => execution,
            }
        };
        let others: Vec<ExecutionId> = self
            .branch_children(concurrent_root)
            .filter(|c| !recyclable.contains(c))
            .collect();

        if transitions.is_empty() {
            for r in recyclable.iter().filter(|r| **r != execution) {
                self.remove(*r);
            }
            return self.activity_completed(execution, activity);
        }

        if transitions.len() == 1 && others.is_empty() {
            for r in recyclable.iter().filter(|r| **r != concurrent_root) {
                self.remove(*r);
            }
            {
                let root = self.exec_mut(concurrent_root)?;
                root.activity = Some(activity);
                root.is_active = true;
            }
            debug!(instance_id = %self.id, execution = %concurrent_root, "join collapsed");
            return self.take_transition(concurrent_root, transitions[0], false);
        }

        let mut pool: VecDeque<ExecutionId> = recyclable
            .into_iter()
            .filter(|r| *r != concurrent_root)
            .collect();
        let mut branches = Vec::with_capacity(transitions.len());
        for _ in &transitions {
            let branch = match pool.pop_front() {
                Some(b) => b,
                None => {
                    let b = self.alloc(Some(concurrent_root));
                    self.exec_mut(b)?.is_concurrent = true;
                    b
                }
            };
            let e = self.exec_mut(branch)?;
            e.activity = Some(activity);
            e.is_active = true;
            branches.push(branch);
        }
        for unused in pool {
            self.remove(unused);
        }
        {
            let root = self.exec_mut(concurrent_root)?;
            root.activity = None;
            root.is_active = false;
        }
        debug!(
            instance_id = %self.id,
            root = %concurrent_root,
            branches = branches.len(),
            "fork"
        );

        // branches start in declaration order, each after the previous one parked
        self.perform(
            branches
                .into_iter()
                .zip(transitions)
                .map(|(execution, transition)| Operation::TakeBranch {
                    execution,
                    transition,
                    activity,
                }),
        )
    }

    /// Branches parked (inactive) at `activity` next to `execution`.
    pub(crate) fn find_inactive_concurrent_executions(
        &self,
        execution: ExecutionId,
        activity: ActivityIndex,
    ) -> Result<ConcurrentJoin> {
        let e = self.exec(execution)?;
        let root = match e.parent {
            Some(p) if e.is_concurrent => p,
            _ => {
                return Ok(ConcurrentJoin {
                    joined: vec![execution],
                    complete: true,
                });
            }
        };
        let branches: Vec<ExecutionId> = self.branch_children(root).collect();
        let joined: Vec<ExecutionId> = branches
            .iter()
            .copied()
            .filter(|b| {
                self.get(*b)
                    .map(|c| !c.is_active && c.activity == Some(activity))
                    .unwrap_or(false)
                    && !self.has_branch_children(*b)
            })
            .collect();
        let complete = joined.len() == branches.len();
        Ok(ConcurrentJoin { joined, complete })
    }

    // --- ending ---

    pub(crate) fn end(&mut self, execution: ExecutionId) -> Result<()> {
        let activity = self.current_activity(execution)?;
        let (compensating_for, scope_activity, holder) = {
            let e = self.exec(execution)?;
            (e.compensating_for, e.scope_activity, e.parent)
        };
        if let (Some(thrower), Some(holder)) = (compensating_for, holder) {
            if scope_activity == Some(activity) {
                self.fire_activity_event(execution, EventName::End, activity, None)?;
                self.remove_subtree(execution);
                return self.compensation_done(thrower, holder);
            }
        }
        let continuing = self.leave_activity(execution, activity)?;
        self.activity_completed(continuing, activity)
    }

    pub(crate) fn remove_subtree(&mut self, id: ExecutionId) {
        let children = self.get(id).map(|e| e.children.clone()).unwrap_or_default();
        for child in children {
            self.remove_subtree(child);
        }
        self.remove(id);
    }

    pub(crate) fn activity_completed(&mut self, execution: ExecutionId, activity: ActivityIndex) -> Result<()> {
        let (is_concurrent, parent) = {
            let e = self.exec(execution)?;
            (e.is_concurrent, e.parent)
        };
        debug!(
            instance_id = %self.id,
            execution = %execution,
            activity = %self.definition.activity(activity).id,
            "execution ended"
        );
        match parent {
            Some(root) if is_concurrent => {
                self.remove(execution);
                self.prune_concurrent_root(root)
            }
            _ => self.scope_completed(execution),
        }
    }

    /// Re-examines a concurrent root after one of its branches went away.
    fn prune_concurrent_root(&mut self, root: ExecutionId) -> Result<()> {
        let branches: Vec<ExecutionId> = self.branch_children(root).collect();
        match branches.as_slice() {
            [] => {
                if self.exec(root)?.activity.is_some() {
                    // the root already moved on (e.g. a join collapsed into it)
                    return Ok(());
                }
                self.scope_completed(root)
            }
            [only] => {
                let only = *only;
                let (waiting_at, has_children) = {
                    let e = self.exec(only)?;
                    (e.activity.filter(|_| !e.is_active), !e.children.is_empty())
                };
                match waiting_at {
                    Some(join) if !has_children => self.reevaluate_join(only, join),
                    _ => self.merge_into_root(root, only),
                }
            }
            many => {
                let mut joins = many.iter().map(|b| {
                    self.get(*b)
                        .filter(|e| !e.is_active && e.children.is_empty())
                        .and_then(|e| e.activity)
                });
                let first = joins.next().flatten();
                match first {
                    Some(join) if joins.all(|j| j == Some(join)) => {
                        self.reevaluate_join(many[0], join)
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn reevaluate_join(&mut self, execution: ExecutionId, join: ActivityIndex) -> Result<()> {
        debug!(
            instance_id = %self.id,
            execution = %execution,
            activity = %self.definition.activity(join).id,
            "re-evaluate join"
        );
        let behavior = self.definition.activity(join).behavior.clone();
        behavior.execute(&mut ActivityExecution::new(self, execution))
    }

    /// Collapses the last remaining branch into its concurrent root.
    fn merge_into_root(&mut self, root: ExecutionId, branch: ExecutionId) -> Result<()> {
        let position = self.exec(root)?.children.iter().position(|c| *c == branch);
        // `remove` drops subscriptions of the removed execution
        for s in self.subscriptions.values_mut() {
            if s.execution == branch {
                s.execution = root;
            }
        }
        let Some(merged) = self.remove(branch).map(|e| (e.activity, e.is_active, e.signalling, e.children, e.variables)) else {
            return Ok(());
        };
        let (activity, is_active, signalling, children, variables) = merged;
        for child in &children {
            if let Some(c) = self.get_mut(*child) {
                c.parent = Some(root);
            }
        }
        {
            let r = self.exec_mut(root)?;
            r.activity = activity;
            r.is_active = is_active;
            r.signalling |= signalling;
            r.variables.extend(variables);
            let at = position.unwrap_or(r.children.len()).min(r.children.len());
            for (offset, child) in children.into_iter().enumerate() {
                r.children.insert(at + offset, child);
            }
        }
        for e in self.slots.iter_mut().filter_map(|s| s.execution.as_mut()) {
            if e.compensating_for == Some(branch) {
                e.compensating_for = Some(root);
            }
        }
        self.redirect(branch, root);
        debug!(instance_id = %self.id, branch = %branch, root = %root, "merged branch into concurrent root");
        Ok(())
    }

    /// Everything inside the scope of `scope` has finished.
    pub(crate) fn scope_completed(&mut self, scope: ExecutionId) -> Result<()> {
        let (parent, scope_activity) = {
            let e = self.exec(scope)?;
            (e.parent, e.scope_activity)
        };
        if parent.is_none() {
            return self.end_process(None);
        }
        let scope_activity = scope_activity.ok_or_else(|| {
            PvmError::InvalidModel(format!("execution {} has no scope activity", scope))
        })?;
        {
            let e = self.exec_mut(scope)?;
            e.activity = Some(scope_activity);
            e.is_active = true;
        }
        let behavior = self.definition.activity(scope_activity).behavior.clone();
        behavior.last_execution_ended(&mut ActivityExecution::new(self, scope))
    }

    pub(crate) fn end_process(&mut self, reason: Option<String>) -> Result<()> {
        let root = self.root;
        let children = self.exec(root)?.children.clone();
        for child in children.into_iter().rev() {
            self.delete_subtree(child, reason.as_deref())?;
        }
        self.fire_process_event(EventName::End, reason.as_deref())?;
        let r = self.exec_mut(root)?;
        r.is_ended = true;
        r.is_active = false;
        r.activity = None;
        r.delete_reason = reason;
        self.subscriptions.clear();
        self.scheduled_timers.clear();
        info!(instance_id = %self.id, process = %self.definition.id, "process instance ended");
        Ok(())
    }

    pub(crate) fn current_activity(&self, execution: ExecutionId) -> Result<ActivityIndex> {
        self.exec(execution)?
            .activity
            .ok_or_else(|| PvmError::NotWaitState(execution).into())
    }

    // --- event subscriptions ---

    pub(crate) fn add_subscription(
        &mut self,
        kind: EventKind,
        event_name: String,
        activity: ActivityIndex,
        execution: ExecutionId,
        duration_ms: Option<u64>,
    ) -> SubscriptionId {
        let id = self.next_subscription;
        self.next_subscription += 1;
        let activity_id = self.definition.activity(activity).id.clone();
        if kind == EventKind::Timer {
            self.scheduled_timers.push(TimerJob {
                subscription_id: id,
                activity_id: activity_id.clone(),
                due_in: std::time::Duration::from_millis(duration_ms.unwrap_or(0)),
            });
        }
        debug!(
            instance_id = %self.id,
            subscription = id,
            kind = ?kind,
            event = %event_name,
            "subscribe"
        );
        self.subscriptions.insert(
            id,
            EventSubscription {
                id,
                kind,
                event_name,
                activity,
                activity_id,
                execution,
                duration_ms,
            },
        );
        id
    }

    fn register_boundary_events(&mut self, execution: ExecutionId, activity: ActivityIndex) -> Result<()> {
        let def = self.definition.clone();
        for &b in &def.activity(activity).boundary_events {
            let Some(trigger) = def.activity(b).behavior.boundary_trigger() else {
                continue;
            };
            let Some(kind) = trigger.kind() else { continue };
            let (name, duration) = match trigger {
                EventTrigger::Timer { duration_ms } => (def.activity(b).id.clone(), Some(*duration_ms)),
                EventTrigger::Message { name } | EventTrigger::Signal { name } => (name.clone(), None),
                EventTrigger::Error { .. } => continue,
            };
            self.add_subscription(kind, name, b, execution, duration);
        }
        Ok(())
    }

    pub(crate) fn trigger_subscription(&mut self, id: SubscriptionId, data: Option<Value>) -> Result<()> {
        let subscription = self
            .subscriptions
            .remove(&id)
            .ok_or(PvmError::SubscriptionNotFound(id))?;
        let def = self.definition.clone();
        let catching = def.activity(subscription.activity);
        debug!(
            instance_id = %self.id,
            subscription = id,
            activity = %catching.id,
            "event received"
        );
        if catching.attached_to.is_some() {
            if let Some(Value::Object(vars)) = &data {
                for (k, v) in vars {
                    self.set_variable(subscription.execution, k, v.clone())?;
                }
            }
            return self.boundary_event_fired(subscription.execution, subscription.activity);
        }
        let behavior = catching.behavior.clone();
        behavior.trigger(
            &mut ActivityExecution::new(self, subscription.execution),
            &subscription,
            data,
        )
    }

    /// Runs boundary event `boundary` attached to the activity whose scope
    /// execution is `scope`.
    pub(crate) fn boundary_event_fired(&mut self, scope: ExecutionId, boundary: ActivityIndex) -> Result<()> {
        let def = self.definition.clone();
        let b = def.activity(boundary);
        let parent = self
            .exec(scope)?
            .parent
            .ok_or_else(|| PvmError::InvalidModel(format!("boundary event '{}' has no host", b.id)))?;

        if b.behavior.is_interrupting() {
            debug!(instance_id = %self.id, activity = %b.id, "interrupting boundary event");
            let reason = format!("interrupted by boundary event '{}'", b.id);
            self.delete_subtree(scope, Some(&reason))?;
            return self.execute_activity(parent, boundary);
        }

        debug!(instance_id = %self.id, activity = %b.id, "non-interrupting boundary event");
        let parent_is_concurrent = self.exec(parent)?.is_concurrent;
        let root = if parent_is_concurrent {
            self.exec(parent)?
                .parent
                .ok_or_else(|| PvmError::InvalidModel("concurrent execution without parent".into()))?
        } else {
            // wrap the scope into a concurrent branch so it can run next to the event
            let wrapper = self.alloc(None);
            let position = self.exec(parent)?.children.iter().position(|c| *c == scope);
            {
                let w = self.exec_mut(wrapper)?;
                w.parent = Some(parent);
                w.is_concurrent = true;
                w.children.push(scope);
            }
            self.exec_mut(scope)?.parent = Some(wrapper);
            let p = self.exec_mut(parent)?;
            match position {
                Some(at) => p.children[at] = wrapper,
                None => p.children.push(wrapper),
            }
            p.activity = None;
            p.is_active = false;
            parent
        };
        let branch = self.alloc(Some(root));
        self.exec_mut(branch)?.is_concurrent = true;
        self.execute_activity(branch, boundary)
    }

    // --- errors ---

    /// Routes `error` to the nearest enclosing error boundary event.
    pub(crate) fn throw_error(&mut self, execution: ExecutionId, error: BpmnError) -> Result<()> {
        let def = self.definition.clone();
        let mut current = Some(execution);
        while let Some(id) = current {
            let e = self.exec(id)?;
            if let Some(sa) = e.scope_activity.filter(|_| e.is_scope) {
                let catcher = def.activity(sa).boundary_events.iter().copied().find(|b| {
                    def.activity(*b)
                        .behavior
                        .boundary_trigger()
                        .map(|t| t.catches_error(&error.code))
                        .unwrap_or(false)
                });
                if let Some(b) = catcher {
                    info!(
                        instance_id = %self.id,
                        code = %error.code,
                        boundary = %def.activity(b).id,
                        "error caught"
                    );
                    return self.boundary_event_fired(id, b);
                }
            }
            current = e.parent;
        }
        Err(error.into())
    }

    // --- compensation ---

    /// Moves the compensation subscriptions of a completed sub-process into a
    /// new event scope so they outlive the sub-process execution.
    pub(crate) fn create_event_scope(&mut self, scope: ExecutionId) -> Result<()> {
        let (activity, parent, nested) = {
            let e = self.exec(scope)?;
            let nested: Vec<ExecutionId> = e
                .children
                .iter()
                .copied()
                .filter(|c| self.get(*c).map(|c| c.is_event_scope).unwrap_or(false))
                .collect();
            (e.scope_activity, e.parent, nested)
        };
        let has_subscriptions = self
            .subscriptions
            .values()
            .any(|s| s.execution == scope && s.kind == EventKind::Compensate);
        let (Some(activity), Some(parent)) = (activity, parent) else {
            return Ok(());
        };
        if !has_subscriptions && nested.is_empty() {
            return Ok(());
        }

        let holder = self.scope_execution(parent);
        let event_scope = self.alloc(Some(holder));
        let snapshot = self.exec(scope)?.variables.clone();
        {
            let es = self.exec_mut(event_scope)?;
            es.is_event_scope = true;
            es.is_scope = true;
            es.activity = Some(activity);
            es.scope_activity = Some(activity);
            es.variables = snapshot;
        }
        for s in self.subscriptions.values_mut() {
            if s.execution == scope && s.kind == EventKind::Compensate {
                s.execution = event_scope;
            }
        }
        for child in nested {
            if let Some(s) = self.get_mut(scope) {
                s.children.retain(|c| *c != child);
            }
            if let Some(c) = self.get_mut(child) {
                c.parent = Some(event_scope);
            }
            self.exec_mut(event_scope)?.children.push(child);
        }
        debug!(
            instance_id = %self.id,
            event_scope = %event_scope,
            activity = %self.definition.activity(activity).id,
            "event scope created"
        );
        Ok(())
    }

    /// Compensates completed activities of the scope around `thrower`.
    ///
    /// Handlers run newest first; `thrower` leaves once all of them are done.
    pub(crate) fn throw_compensation(&mut self, thrower: ExecutionId, activity_ref: Option<&str>) -> Result<()> {
        let scope = self.scope_execution(thrower);
        let mut holders = vec![scope];
        let mut i = 0;
        while i < holders.len() {
            let children = self.exec(holders[i])?.children.clone();
            holders.extend(
                children
                    .into_iter()
                    .filter(|c| self.get(*c).map(|e| e.is_event_scope).unwrap_or(false)),
            );
            i += 1;
        }
        let mut targets: Vec<EventSubscription> = self
            .subscriptions
            .values()
            .filter(|s| s.kind == EventKind::Compensate && holders.contains(&s.execution))
            .filter(|s| activity_ref.map(|r| r == s.event_name).unwrap_or(true))
            .cloned()
            .collect();
        targets.sort_by(|a, b| b.id.cmp(&a.id));

        if targets.is_empty() {
            debug!(instance_id = %self.id, "nothing to compensate");
            return ActivityExecution::new(self, thrower).leave();
        }

        let mut handlers = Vec::with_capacity(targets.len());
        for s in &targets {
            self.subscriptions.remove(&s.id);
            let h = self.alloc(Some(s.execution));
            let e = self.exec_mut(h)?;
            e.is_scope = true;
            e.scope_activity = Some(s.activity);
            e.compensating_for = Some(thrower);
            handlers.push((h, s.activity));
        }
        info!(instance_id = %self.id, handlers = handlers.len(), "compensating");
        self.perform(
            handlers
                .into_iter()
                .map(|(execution, activity)| Operation::Compensate { execution, activity }),
        )
    }

    fn compensation_done(&mut self, thrower: ExecutionId, holder: ExecutionId) -> Result<()> {
        let mut current = Some(holder);
        while let Some(h) = current {
            let spent = self
                .get(h)
                .map(|e| e.is_event_scope && e.children.is_empty())
                .unwrap_or(false)
                && !self.subscriptions.values().any(|s| s.execution == h);
            if !spent {
                break;
            }
            current = self.get(h).and_then(|e| e.parent);
            self.remove(h);
        }

        let thrower = self.resolve(thrower);
        let waiting = self.executions().any(|e| e.compensating_for == Some(thrower));
        if !waiting && self.is_alive(thrower) {
            debug!(instance_id = %self.id, thrower = %thrower, "compensation done");
            return ActivityExecution::new(self, thrower).leave();
        }
        Ok(())
    }

    // --- terminate ---

    /// Ends everything inside the scope of `execution` at once.
    pub(crate) fn terminate(&mut self, execution: ExecutionId) -> Result<()> {
        let activity = self.current_activity(execution)?;
        let scope = self.scope_execution(execution);
        let reason = format!("terminated by end event '{}'", self.definition.activity(activity).id);
        if scope == execution {
            self.fire_activity_event(execution, EventName::End, activity, None)?;
        } else {
            let children: Vec<ExecutionId> = self
                .exec(scope)?
                .children
                .iter()
                .copied()
                .filter(|c| self.get(*c).map(|e| !e.is_event_scope).unwrap_or(false))
                .collect();
            for child in children.into_iter().rev() {
                self.delete_subtree(child, Some(&reason))?;
            }
        }
        if scope == self.root {
            self.exec_mut(scope)?.activity = None;
            info!(instance_id = %self.id, "process instance terminated");
            return self.end_process(Some(reason));
        }
        self.scope_completed(scope)
    }
}
