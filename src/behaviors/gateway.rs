use anyhow::Result;
use tracing::{debug, warn};

use crate::error::PvmError;
use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::context::ActivityExecution;
use crate::runtime::definition::{ProcessDefinition, TransitionIndex};

// --- PARALLEL GATEWAY ---

/// Fork and/or join.
///
/// Arriving branches park here until either every branch of the concurrent
/// root has arrived or as many as there are incoming transitions; then all
/// outgoing transitions are taken, recycling the joined executions.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelGateway;

impl ActivityBehavior for ParallelGateway {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        let def = execution.definition();
        let activity = def.activity(execution.activity_index()?);

        execution.inactivate()?;
        let join = execution.find_inactive_concurrent_executions(activity.index())?;
        let expected = activity.incoming().len().max(1);

        if join.complete || join.joined.len() >= expected {
            debug!(
                activity = %activity.id(),
                joined = join.joined.len(),
                outgoing = activity.outgoing().len(),
                "parallel gateway fires"
            );
            execution.take_all(activity.outgoing().to_vec(), join.joined)
        } else {
            debug!(
                activity = %activity.id(),
                joined = join.joined.len(),
                expected,
                "parallel gateway waits"
            );
            Ok(())
        }
    }
}

// --- EXCLUSIVE GATEWAY ---

/// Takes exactly one outgoing transition.
///
/// Guards are evaluated in declaration order and the first that holds wins;
/// transitions without a guard count as holding. The default flow is only
/// used when no other transition qualifies.
#[derive(Debug, Default, Clone)]
pub struct ExclusiveGateway {
    default_flow: Option<String>,
}

impl ExclusiveGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(flow_id: impl Into<String>) -> Self {
        Self {
            default_flow: Some(flow_id.into()),
        }
    }
}

impl ActivityBehavior for ExclusiveGateway {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        let def = execution.definition();
        let activity = def.activity(execution.activity_index()?);
        if activity.outgoing().is_empty() {
            return execution.end();
        }
        let default = default_transition(&def, activity.outgoing(), self.default_flow.as_deref())?;

        let mut matching = Vec::new();
        for &t in activity.outgoing() {
            if Some(t) == default {
                continue;
            }
            let passes = match def.transition(t).condition() {
                Some(c) => c.evaluate(execution)?,
                None => true,
            };
            if passes {
                matching.push(t);
            }
        }
        if matching.len() > 1 {
            warn!(
                activity = %activity.id(),
                candidates = ?matching.iter().map(|t| def.transition(*t).id()).collect::<Vec<_>>(),
                "more than one outgoing transition matches, taking the first"
            );
        }

        let chosen = matching
            .first()
            .copied()
            .or(default)
            .ok_or_else(|| PvmError::NoOutgoingTransition(activity.id().to_string()))?;
        debug!(activity = %activity.id(), transition = %def.transition(chosen).id(), "exclusive gateway");
        execution.take(chosen)
    }
}

// --- INCLUSIVE GATEWAY ---

/// Takes every outgoing transition whose guard holds (default flow when
/// none does); as a join it waits until every branch present has arrived.
#[derive(Debug, Default, Clone)]
pub struct InclusiveGateway {
    default_flow: Option<String>,
}

impl InclusiveGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(flow_id: impl Into<String>) -> Self {
        Self {
            default_flow: Some(flow_id.into()),
        }
    }
}

impl ActivityBehavior for InclusiveGateway {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        let def = execution.definition();
        let activity = def.activity(execution.activity_index()?);

        execution.inactivate()?;
        let join = execution.find_inactive_concurrent_executions(activity.index())?;
        if !join.complete && activity.incoming().len() > 1 {
            debug!(activity = %activity.id(), joined = join.joined.len(), "inclusive gateway waits");
            return Ok(());
        }

        let default = default_transition(&def, activity.outgoing(), self.default_flow.as_deref())?;
        let mut selected: Vec<TransitionIndex> = Vec::new();
        for &t in activity.outgoing() {
            if Some(t) == default {
                continue;
            }
            let passes = match def.transition(t).condition() {
                Some(c) => c.evaluate(execution)?,
                None => true,
            };
            if passes {
                selected.push(t);
            }
        }
        if selected.is_empty() {
            match default {
                Some(d) => selected.push(d),
                None if activity.outgoing().is_empty() => {}
                None => return Err(PvmError::NoOutgoingTransition(activity.id().to_string()).into()),
            }
        }
        debug!(activity = %activity.id(), selected = selected.len(), "inclusive gateway fires");
        execution.take_all(selected, join.joined)
    }
}

fn default_transition(
    def: &ProcessDefinition,
    outgoing: &[TransitionIndex],
    flow_id: Option<&str>,
) -> Result<Option<TransitionIndex>, PvmError> {
    let Some(flow_id) = flow_id else {
        return Ok(None);
    };
    outgoing
        .iter()
        .copied()
        .find(|t| def.transition(*t).id() == flow_id)
        .map(Some)
        .ok_or_else(|| PvmError::TransitionNotFound(flow_id.to_string()))
}
