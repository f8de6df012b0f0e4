//! Continuations of the interpreter.
//!
//! Moving along a transition never calls the next behavior on the current
//! stack. The step is recorded as an [`Operation`] and the outermost call
//! works the agenda off in a loop, so a process that loops through automatic
//! activities runs in constant stack depth.
//!
//! Operations recorded while one operation runs are performed right after it,
//! in the order they were recorded and before anything that was already
//! waiting. That keeps the walk depth first: a forked branch runs until it
//! parks before its sibling starts.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::context::ActivityExecution;
use crate::runtime::definition::{ActivityIndex, TransitionIndex};
use crate::runtime::execution::ExecutionId;
use crate::runtime::instance::ProcessInstance;

#[derive(Debug, Clone)]
pub(crate) enum Operation {
    /// Take `transition` from the activity the execution is at.
    Take {
        execution: ExecutionId,
        transition: TransitionIndex,
        leave_source: bool,
    },
    /// First step of a forked branch; dropped if the branch no longer waits at `activity`.
    TakeBranch {
        execution: ExecutionId,
        transition: TransitionIndex,
        activity: ActivityIndex,
    },
    /// Start a compensation handler that has not run yet.
    Compensate {
        execution: ExecutionId,
        activity: ActivityIndex,
    },
    /// Run one instance of a multi-instance activity.
    RunInstance {
        execution: ExecutionId,
        activity: ActivityIndex,
        behavior: Arc<dyn ActivityBehavior>,
    },
}

/// Pending operations of one instance.
#[derive(Debug, Default)]
pub(crate) struct Agenda {
    /// Performed from the back.
    pending: Vec<Operation>,
    /// Recorded by the operation that is running now.
    staged: Vec<Operation>,
    draining: bool,
}

impl Agenda {
    pub(crate) fn len(&self) -> usize {
        self.pending.len() + self.staged.len()
    }

    fn next(&mut self) -> Option<Operation> {
        self.pending.extend(self.staged.drain(..).rev());
        self.pending.pop()
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.staged.clear();
    }
}

impl ProcessInstance {
    /// Records `operations` and, unless an outer call is already working the
    /// agenda off, performs them and everything they lead to.
    pub(crate) fn perform(&mut self, operations: impl IntoIterator<Item = Operation>) -> Result<()> {
        self.agenda.staged.extend(operations);
        if self.agenda.draining {
            return Ok(());
        }

        self.agenda.draining = true;
        let result = self.drain_agenda();
        self.agenda.draining = false;
        if result.is_err() {
            self.agenda.clear();
        }
        result
    }

    fn drain_agenda(&mut self) -> Result<()> {
        while let Some(operation) = self.agenda.next() {
            if self.is_ended() {
                debug!(instance_id = %self.id, dropped = self.agenda.len() + 1, "instance ended, agenda dropped");
                self.agenda.clear();
                break;
            }
            self.run_operation(operation)?;
        }
        Ok(())
    }

    fn run_operation(&mut self, operation: Operation) -> Result<()> {
        match operation {
            Operation::Take {
                execution,
                transition,
                leave_source,
            } => {
                let execution = self.resolve(execution);
                if !self.is_alive(execution) {
                    debug!(instance_id = %self.id, execution = %execution, "take dropped, execution is gone");
                    return Ok(());
                }
                self.perform_take(execution, transition, leave_source)
            }
            Operation::TakeBranch {
                execution,
                transition,
                activity,
            } => {
                let branch = self.resolve(execution);
                let ready = self
                    .get(branch)
                    .map(|e| !e.is_ended && e.is_active && e.activity == Some(activity))
                    .unwrap_or(false)
                    && !self.has_branch_children(branch);
                if ready {
                    self.perform_take(branch, transition, false)
                } else {
                    Ok(())
                }
            }
            Operation::Compensate { execution, activity } => {
                let pending = self
                    .get(execution)
                    .map(|e| e.activity.is_none() && !e.is_ended)
                    .unwrap_or(false);
                if pending {
                    self.run_activity(execution, activity)
                } else {
                    Ok(())
                }
            }
            Operation::RunInstance {
                execution,
                activity,
                behavior,
            } => {
                let execution = self.resolve(execution);
                let waiting = self
                    .get(execution)
                    .map(|e| e.activity == Some(activity) && e.is_active)
                    .unwrap_or(false);
                if waiting {
                    behavior.execute(&mut ActivityExecution::new(self, execution))
                } else {
                    Ok(())
                }
            }
        }
    }
}
