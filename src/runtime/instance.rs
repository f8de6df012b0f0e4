use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PvmError;
use crate::runtime::agenda::Agenda;
use crate::runtime::context::ActivityExecution;
use crate::runtime::definition::{ActivityIndex, ProcessDefinition};
use crate::runtime::event::{EventKind, EventSubscription, SubscriptionId, TimerJob};
use crate::runtime::execution::{Execution, ExecutionId, Slot};
use crate::runtime::listener::EventName;

/// 流程实例 (Process Instance)
///
/// Owns the execution tree of one run of a definition. All executions live in
/// an arena of generation-checked slots; the root execution is created with
/// the instance and never removed.
///
/// Every public call runs the interpreter synchronously until all branches are
/// parked or the instance has ended. Callers are expected to serialise access
/// to one instance (the async engine does this with a mutex).
pub struct ProcessInstance {
    pub(crate) id: Uuid,
    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) slots: Vec<Slot>,
    pub(crate) free: Vec<u32>,
    pub(crate) root: ExecutionId,
    pub(crate) subscriptions: BTreeMap<SubscriptionId, EventSubscription>,
    pub(crate) next_subscription: SubscriptionId,
    pub(crate) scheduled_timers: Vec<TimerJob>,
    pub(crate) initial: Option<ActivityIndex>,
    pub(crate) started: bool,
    pub(crate) agenda: Agenda,
}

impl ProcessInstance {
    pub(crate) fn new(definition: Arc<ProcessDefinition>, initial: Option<ActivityIndex>) -> Self {
        let mut instance = Self {
            id: Uuid::new_v4(),
            definition,
            slots: Vec::new(),
            free: Vec::new(),
            root: ExecutionId::new(0, 0),
            subscriptions: BTreeMap::new(),
            next_subscription: 1,
            scheduled_timers: Vec::new(),
            initial,
            started: false,
            agenda: Agenda::default(),
        };
        let root = instance.alloc(None);
        if let Some(e) = instance.get_mut(root) {
            e.is_scope = true;
        }
        instance.root = root;
        instance
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    /// Begins interpretation at the initial activity (or the alternate one
    /// chosen with `create_process_instance_at`).
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(PvmError::AlreadyStarted.into());
        }
        self.started = true;

        let def = self.definition.clone();
        let initial = self
            .initial
            .or(def.initial)
            .ok_or_else(|| PvmError::NoInitialActivity(def.id.clone()))?;
        info!(instance_id = %self.id, process = %def.id, "starting process instance");

        let root = self.root;
        self.fire_process_event(EventName::Start, None)?;

        // an alternate initial activity may sit inside nested scopes
        let mut current = root;
        for scope in def.ancestors(initial) {
            current = self.enter_scope(current, scope)?;
        }
        self.execute_activity(current, initial)
    }

    /// Resumes the execution parked at a wait state.
    pub fn signal(
        &mut self,
        execution: ExecutionId,
        signal_name: Option<&str>,
        signal_data: Option<Value>,
    ) -> Result<()> {
        if !self.started {
            return Err(PvmError::NotStarted.into());
        }
        let id = self.resolve(execution);
        let (activity, is_ended, signalling, is_active, has_branches) = {
            let e = self.get(id).ok_or(PvmError::ExecutionNotFound(execution))?;
            (
                e.activity,
                e.is_ended,
                e.signalling,
                e.is_active,
                self.has_branch_children(id),
            )
        };
        if is_ended {
            return Err(PvmError::ExecutionEnded(execution).into());
        }
        if signalling {
            return Err(PvmError::AlreadySignalled(execution).into());
        }
        let activity = match activity {
            Some(a) if is_active && !has_branches => a,
            _ => return Err(PvmError::NotWaitState(execution).into()),
        };

        let behavior = self.definition.activity(activity).behavior.clone();
        debug!(
            instance_id = %self.id,
            execution = %id,
            activity = %self.definition.activity(activity).id,
            "signal"
        );
        if let Some(e) = self.get_mut(id) {
            e.signalling = true;
        }
        let result = behavior.signal(&mut ActivityExecution::new(self, id), signal_name, signal_data);
        let id = self.resolve(id);
        if let Some(e) = self.get_mut(id) {
            e.signalling = false;
        }
        result
    }

    /// Signals the first execution parked at `activity_id`.
    pub fn signal_activity(
        &mut self,
        activity_id: &str,
        signal_name: Option<&str>,
        signal_data: Option<Value>,
    ) -> Result<()> {
        self.definition.require_activity(activity_id)?;
        let execution = self
            .find_execution(activity_id)
            .ok_or_else(|| PvmError::NoExecutionAt(activity_id.to_string()))?;
        self.signal(execution, signal_name, signal_data)
    }

    /// First execution parked at `activity_id`, in tree order.
    pub fn find_execution(&self, activity_id: &str) -> Option<ExecutionId> {
        self.find_executions(activity_id).into_iter().next()
    }

    pub fn find_executions(&self, activity_id: &str) -> Vec<ExecutionId> {
        let Some(activity) = self.definition.find_activity(activity_id) else {
            return Vec::new();
        };
        self.parked_executions()
            .into_iter()
            .filter(|id| self.get(*id).and_then(|e| e.activity) == Some(activity.index))
            .collect()
    }

    /// Ids of the activities where control is currently parked.
    ///
    /// One entry per parked execution, so concurrent instances of the same
    /// activity show up more than once.
    pub fn find_active_activity_ids(&self) -> Vec<String> {
        self.parked_executions()
            .into_iter()
            .filter_map(|id| self.get(id).and_then(|e| e.activity))
            .map(|a| self.definition.activity(a).id.clone())
            .collect()
    }

    pub fn is_ended(&self) -> bool {
        self.get(self.root).map(|e| e.is_ended).unwrap_or(true)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Reason recorded when the instance was cancelled or terminated.
    pub fn delete_reason(&self) -> Option<&str> {
        self.get(self.root).and_then(|e| e.delete_reason.as_deref())
    }

    /// Forcibly ends the whole tree. Listeners observe `end` events carrying `reason`.
    pub fn delete_cascade(&mut self, reason: &str) -> Result<()> {
        if self.is_ended() {
            return Ok(());
        }
        info!(instance_id = %self.id, reason, "deleting process instance");
        let root = self.root;
        let children: Vec<ExecutionId> = self.exec(root)?.children.clone();
        for child in children.into_iter().rev() {
            self.delete_subtree(child, Some(reason))?;
        }
        if let Some(activity) = self.exec(root)?.activity {
            self.fire_activity_event(root, EventName::End, activity, Some(reason))?;
        }
        if let Some(e) = self.get_mut(root) {
            e.activity = None;
        }
        self.end_process(Some(reason.to_string()))
    }

    // --- events ---

    /// Delivers a message to the oldest subscription waiting for `name`.
    ///
    /// Returns whether anything was waiting for it.
    pub fn message_event_received(&mut self, name: &str, data: Option<Value>) -> Result<bool> {
        let target = self
            .subscriptions
            .values()
            .find(|s| s.kind == EventKind::Message && s.event_name == name)
            .map(|s| s.id);
        match target {
            Some(id) => {
                self.trigger_subscription(id, data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Broadcasts a signal to every subscription waiting for `name`.
    ///
    /// Returns how many subscriptions were triggered.
    pub fn signal_event_received(&mut self, name: &str, data: Option<Value>) -> Result<usize> {
        let targets: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|s| s.kind == EventKind::Signal && s.event_name == name)
            .map(|s| s.id)
            .collect();
        let mut delivered = 0;
        for id in targets {
            // an earlier delivery may have cancelled this one
            if self.subscriptions.contains_key(&id) {
                self.trigger_subscription(id, data.clone())?;
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn fire_timer(&mut self, subscription: SubscriptionId) -> Result<()> {
        match self.subscriptions.get(&subscription) {
            Some(s) if s.kind == EventKind::Timer => self.trigger_subscription(subscription, None),
            _ => Err(PvmError::SubscriptionNotFound(subscription).into()),
        }
    }

    /// Returns `true` when the subscription is still pending.
    pub fn has_subscription(&self, subscription: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&subscription)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &EventSubscription> {
        self.subscriptions.values()
    }

    /// Timers registered since the last call; a driver is expected to schedule them.
    pub fn drain_scheduled_timers(&mut self) -> Vec<TimerJob> {
        std::mem::take(&mut self.scheduled_timers)
    }

    // --- inspection ---

    pub fn root(&self) -> ExecutionId {
        self.root
    }

    pub fn execution(&self, id: ExecutionId) -> Option<&Execution> {
        self.get(self.resolve(id))
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.slots.iter().filter_map(|s| s.execution.as_ref())
    }

    pub fn children(&self, id: ExecutionId) -> Vec<ExecutionId> {
        self.execution(id)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    pub fn event_scope_executions(&self) -> Vec<ExecutionId> {
        self.executions()
            .filter(|e| e.is_event_scope)
            .map(|e| e.id)
            .collect()
    }

    /// Follows merges of concurrent branches into their root.
    ///
    /// A merged handle keeps resolving until its slot hosts another execution
    /// that is merged in turn; only the latest redirect of a slot is kept.
    pub fn resolve(&self, id: ExecutionId) -> ExecutionId {
        let mut current = id;
        while let Some(next) = self
            .slots
            .get(current.index as usize)
            .and_then(|s| s.merged_into)
            .filter(|(generation, _)| *generation == current.generation)
            .map(|(_, target)| target)
        {
            current = next;
        }
        current
    }

    /// Number of arena slots, live or free.
    pub fn arena_len(&self) -> usize {
        self.slots.len()
    }

    // --- arena ---

    pub(crate) fn alloc(&mut self, parent: Option<ExecutionId>) -> ExecutionId {
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                ExecutionId::new(index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    execution: None,
                    merged_into: None,
                });
                ExecutionId::new((self.slots.len() - 1) as u32, 0)
            }
        };
        self.slots[id.index as usize].execution = Some(Execution::new(id, parent));
        if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            p.children.push(id);
        }
        id
    }

    pub(crate) fn get(&self, id: ExecutionId) -> Option<&Execution> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.execution.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ExecutionId) -> Option<&mut Execution> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.execution.as_mut())
    }

    pub(crate) fn exec(&self, id: ExecutionId) -> Result<&Execution, PvmError> {
        self.get(id).ok_or(PvmError::ExecutionNotFound(id))
    }

    pub(crate) fn exec_mut(&mut self, id: ExecutionId) -> Result<&mut Execution, PvmError> {
        self.get_mut(id).ok_or(PvmError::ExecutionNotFound(id))
    }

    pub(crate) fn is_alive(&self, id: ExecutionId) -> bool {
        self.get(id).map(|e| !e.is_ended).unwrap_or(false)
    }

    /// Detaches a single execution from the tree and frees its slot.
    ///
    /// Children are not touched; callers remove or re-parent them first.
    pub(crate) fn remove(&mut self, id: ExecutionId) -> Option<Execution> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let execution = slot.execution.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        if let Some(parent) = execution.parent.and_then(|p| self.get_mut(p)) {
            parent.children.retain(|c| *c != id);
        }
        self.subscriptions.retain(|_, s| s.execution != id);
        Some(execution)
    }

    /// Records that the removed `from` lives on as `to`.
    pub(crate) fn redirect(&mut self, from: ExecutionId, to: ExecutionId) {
        if let Some(slot) = self.slots.get_mut(from.index as usize) {
            slot.merged_into = Some((from.generation, to));
        }
    }

    pub(crate) fn has_branch_children(&self, id: ExecutionId) -> bool {
        self.branch_children(id).next().is_some()
    }

    pub(crate) fn branch_children(&self, id: ExecutionId) -> impl Iterator<Item = ExecutionId> + '_ {
        self.get(id)
            .map(|e| e.children.as_slice())
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(|c| self.get(*c).map(Execution::is_branch).unwrap_or(false))
    }

    /// Nearest scope execution at or above `id`.
    pub(crate) fn scope_execution(&self, id: ExecutionId) -> ExecutionId {
        let mut current = id;
        while let Some(e) = self.get(current) {
            if e.is_scope {
                return current;
            }
            match e.parent {
                Some(p) => current = p,
                None => break,
            }
        }
        self.root
    }

    /// Leaf executions that are parked somewhere, depth first.
    fn parked_executions(&self) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(e) = self.get(id) else { continue };
            if e.is_ended {
                continue;
            }
            // event scopes are never parked, but compensation handlers below them can be
            let has_branches = self.has_branch_children(id);
            if !e.is_event_scope && e.is_active && e.activity.is_some() && !has_branches {
                out.push(id);
            }
            stack.extend(e.children.iter().rev().copied());
        }
        out
    }
}

impl std::fmt::Debug for ProcessInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInstance")
            .field("id", &self.id)
            .field("definition", &self.definition.id)
            .field("active", &self.find_active_activity_ids())
            .field("ended", &self.is_ended())
            .finish()
    }
}
