use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::actions::TaskHandler;
use crate::actions::builtin::{AssignHandler, LogHandler};
use crate::behaviors::{
    Automatic, BoundaryEvent, Cardinality, CompensationThrowEvent, ErrorEndEvent, ExclusiveGateway,
    InclusiveGateway, IntermediateCatchEvent, MultiInstance, NoneEndEvent, ParallelGateway, ServiceTask,
    SignalThrowEvent, SubProcess, TerminateEndEvent, WaitState,
};
use crate::dsl::{ActivityKind, ActivityModel, FlowModel, MultiInstanceModel, ProcessModel};
use crate::runtime::behavior::ActivityBehavior;
use crate::runtime::builder::ProcessDefinitionBuilder;
use crate::runtime::condition::{Expression, expr};
use crate::runtime::definition::ProcessDefinition;

/// Turns DSL models into process definitions.
///
/// Service tasks are resolved against the registered task handlers; `log`
/// and `assign` are always available.
pub struct Compiler {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        let mut compiler = Self {
            handlers: HashMap::new(),
        };
        compiler.register_handler(Arc::new(LogHandler));
        compiler.register_handler(Arc::new(AssignHandler));
        compiler
    }

    pub fn register_handler(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn handler(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    pub fn compile(&self, model: &ProcessModel) -> Result<Arc<ProcessDefinition>> {
        // 1. Activities and flows, scope by scope
        let builder = ProcessDefinitionBuilder::new(&model.id).name(model.name.as_deref().unwrap_or(&model.id));
        let builder = self.add_scope(builder, &model.activities, &model.flows)?;

        // 2. Validate & link
        let definition = builder.build()?;
        Ok(definition)
    }

    fn add_scope(
        &self,
        mut builder: ProcessDefinitionBuilder,
        activities: &[ActivityModel],
        flows: &[FlowModel],
    ) -> Result<ProcessDefinitionBuilder> {
        for flow in flows {
            if !activities.iter().any(|a| a.id == flow.source) {
                return Err(anyhow!("flow source '{}' is not an activity of this scope", flow.source));
            }
        }
        let explicit_initial = activities.iter().any(|a| a.initial);

        for activity in activities {
            builder = builder.create_activity(&activity.id);
            if let Some(name) = &activity.name {
                builder = builder.name(name);
            }
            let is_initial = activity.initial || (!explicit_initial && activity.kind == ActivityKind::Start);
            if is_initial {
                builder = builder.initial();
            }
            builder = builder.behavior_arc(self.behavior_for(activity)?);
            if let Some(host) = &activity.attached_to {
                builder = builder.attached_to(host);
            }
            if let Some(handler) = &activity.compensated_by {
                builder = builder.compensated_by(handler);
            }
            if activity.is_async {
                builder = builder.async_continuation();
            }
            if activity.exclusive {
                builder = builder.exclusive();
            }
            for flow in flows.iter().filter(|f| f.source == activity.id) {
                builder = add_flow(builder, flow)?;
            }
            if let ActivityKind::SubProcess { activities, flows } = &activity.kind {
                builder = self.add_scope(builder, activities, flows)?;
            }
            builder = builder.end_activity();
        }
        Ok(builder)
    }

    fn behavior_for(&self, activity: &ActivityModel) -> Result<Arc<dyn ActivityBehavior>> {
        let behavior: Arc<dyn ActivityBehavior> = match &activity.kind {
            ActivityKind::Start | ActivityKind::Task => Arc::new(Automatic),
            ActivityKind::UserTask | ActivityKind::ReceiveTask => Arc::new(WaitState),
            ActivityKind::ServiceTask { handler, params, output } => {
                let h = self
                    .handlers
                    .get(handler)
                    .ok_or_else(|| anyhow!("task handler not found: {}", handler))?;
                let params = Value::Object(params.clone().into_iter().collect());
                h.validate(&params)?;
                let mut task = ServiceTask::new(h.clone()).with_params(params);
                if let Some(out) = output {
                    task = task.with_output(out);
                }
                Arc::new(task)
            }
            ActivityKind::ExclusiveGateway { default } => Arc::new(match default {
                Some(flow) => ExclusiveGateway::with_default(flow),
                None => ExclusiveGateway::new(),
            }),
            ActivityKind::ParallelGateway => Arc::new(ParallelGateway),
            ActivityKind::InclusiveGateway { default } => Arc::new(match default {
                Some(flow) => InclusiveGateway::with_default(flow),
                None => InclusiveGateway::new(),
            }),
            ActivityKind::SubProcess { .. } => Arc::new(SubProcess),
            ActivityKind::IntermediateCatch { event } => Arc::new(IntermediateCatchEvent::new(event.clone())),
            ActivityKind::Boundary { event, cancel_activity } => {
                if activity.attached_to.is_none() {
                    return Err(anyhow!("boundary event '{}' is not attached to an activity", activity.id));
                }
                Arc::new(if *cancel_activity {
                    BoundaryEvent::interrupting(event.clone())
                } else {
                    BoundaryEvent::non_interrupting(event.clone())
                })
            }
            ActivityKind::SignalThrow { signal } => Arc::new(SignalThrowEvent::new(signal)),
            ActivityKind::CompensationThrow { activity: target } => Arc::new(match target {
                Some(t) => CompensationThrowEvent::activity(t),
                None => CompensationThrowEvent::all(),
            }),
            ActivityKind::End => Arc::new(NoneEndEvent),
            ActivityKind::ErrorEnd { code } => Arc::new(ErrorEndEvent::new(code)),
            ActivityKind::TerminateEnd => Arc::new(TerminateEndEvent),
        };

        match &activity.multi_instance {
            Some(mi) => Ok(Arc::new(multi_instance(behavior, mi, &activity.id)?)),
            None => Ok(behavior),
        }
    }
}

fn add_flow(builder: ProcessDefinitionBuilder, flow: &FlowModel) -> Result<ProcessDefinitionBuilder> {
    let mut transition = builder.start_transition(&flow.target);
    if let Some(id) = &flow.id {
        transition = transition.id(id);
    }
    if let Some(condition) = &flow.condition {
        transition = transition.condition(expr(condition)?);
    }
    if let Some(skip) = &flow.skip {
        transition = transition.skip_when(expr(skip)?);
    }
    Ok(transition.end_transition())
}

fn multi_instance(
    inner: Arc<dyn ActivityBehavior>,
    model: &MultiInstanceModel,
    activity_id: &str,
) -> Result<MultiInstance> {
    let cardinality = match (&model.count, &model.collection, &model.cardinality) {
        (Some(n), None, None) => Cardinality::Fixed(*n),
        (None, Some(var), None) => Cardinality::Collection(var.clone()),
        (None, None, Some(e)) => Cardinality::Expression(Expression::parse(e)?),
        _ => {
            return Err(anyhow!(
                "multi-instance '{}' needs exactly one of count, collection or cardinality",
                activity_id
            ));
        }
    };
    let mut mi = if model.sequential {
        MultiInstance::sequential(inner, cardinality)
    } else {
        MultiInstance::parallel(inner, cardinality)
    };
    if let Some(var) = &model.element_variable {
        mi = mi.element_variable(var);
    }
    if let Some(condition) = &model.completion_condition {
        mi = mi.completion_condition(expr(condition)?);
    }
    Ok(mi)
}
