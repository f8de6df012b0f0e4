use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::event::EventTrigger;

/// 原始 DSL 定义的流程
///
/// Mirrors the YAML accepted by [`crate::compiler::loader`]; the compiler
/// turns it into a [`ProcessDefinition`](crate::runtime::definition::ProcessDefinition).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Initial process variables.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub activities: Vec<ActivityModel>,
    #[serde(default)]
    pub flows: Vec<FlowModel>,
}

/// DSL 中的活动
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityModel {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Marks the initial activity of its scope; defaults to the `start` activity.
    #[serde(default)]
    pub initial: bool,
    #[serde(flatten)]
    pub kind: ActivityKind,
    #[serde(default)]
    pub attached_to: Option<String>,
    #[serde(default)]
    pub compensated_by: Option<String>,
    #[serde(default)]
    pub multi_instance: Option<MultiInstanceModel>,
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default)]
    pub exclusive: bool,
}

/// DSL 中的活动类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    Start,
    /// Pass-through task.
    Task,
    UserTask,
    ReceiveTask,
    ServiceTask {
        handler: String,
        #[serde(default)]
        params: HashMap<String, Value>,
        #[serde(default)]
        output: Option<String>,
    },
    ExclusiveGateway {
        #[serde(default)]
        default: Option<String>,
    },
    ParallelGateway,
    InclusiveGateway {
        #[serde(default)]
        default: Option<String>,
    },
    SubProcess {
        activities: Vec<ActivityModel>,
        #[serde(default)]
        flows: Vec<FlowModel>,
    },
    IntermediateCatch {
        event: EventTrigger,
    },
    Boundary {
        event: EventTrigger,
        #[serde(default = "default_true")]
        cancel_activity: bool,
    },
    SignalThrow {
        signal: String,
    },
    CompensationThrow {
        #[serde(default)]
        activity: Option<String>,
    },
    End,
    ErrorEnd {
        code: String,
    },
    TerminateEnd,
}

fn default_true() -> bool {
    true
}

/// DSL 中的顺序流
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowModel {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    /// Guard expression, e.g. `${amount > 100}`.
    #[serde(default)]
    pub condition: Option<String>,
    /// When this expression holds the target is passed through without running.
    #[serde(default)]
    pub skip: Option<String>,
}

/// Multi-instance characteristics; exactly one of `count`, `collection` and
/// `cardinality` must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MultiInstanceModel {
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub count: Option<usize>,
    /// Name of an array variable; one instance per element.
    #[serde(default)]
    pub collection: Option<String>,
    /// Expression evaluating to the number of instances.
    #[serde(default)]
    pub cardinality: Option<String>,
    #[serde(default)]
    pub element_variable: Option<String>,
    #[serde(default)]
    pub completion_condition: Option<String>,
}
