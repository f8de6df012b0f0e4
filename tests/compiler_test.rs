use anyhow::Result;
use flowvm::actions::TaskHandler;
use flowvm::compiler::Compiler;
use flowvm::compiler::loader::parse_process;
use flowvm::error::PvmError;
use flowvm::runtime::context::ActivityExecution;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct DoubleHandler;

impl TaskHandler for DoubleHandler {
    fn name(&self) -> &str {
        "double"
    }

    fn execute(&self, params: Value, _execution: &mut ActivityExecution<'_>) -> Result<Value> {
        let n = params.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(json!(n * 2))
    }
}

#[test]
fn test_compile_linear_process() {
    // 1. Parse DSL
    let model = parse_process(
        r#"
id: "linear"
activities:
  - id: "start"
    type: "start"
  - id: "greet"
    type: "service_task"
    handler: "log"
    params:
      msg: "hello"
  - id: "wait"
    type: "user_task"
  - id: "end"
    type: "end"
flows:
  - { source: "start", target: "greet" }
  - { source: "greet", target: "wait" }
  - { source: "wait", target: "end" }
"#,
    )
    .expect("Parse failed");

    // 2. Compile
    let definition = Compiler::new().compile(&model).expect("Compilation failed");

    // 3. Assert definition structure
    assert_eq!(definition.id(), "linear");
    assert_eq!(definition.name(), "linear");
    assert_eq!(definition.activities().count(), 4);
    assert_eq!(definition.transitions().count(), 3);
    assert_eq!(definition.initial().map(|a| a.id()), Some("start"));
    assert!(definition.find_transition("greet->wait").is_some());

    // 4. Run it
    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["wait".to_string()]);
    instance.signal_activity("wait", None, None).expect("Signal failed");
    assert!(instance.is_ended());
}

#[test]
fn test_custom_handler_with_params_and_output() {
    let model = parse_process(
        r#"
id: "custom"
activities:
  - id: "start"
    type: "start"
  - id: "calc"
    type: "service_task"
    handler: "double"
    params:
      n: "${input}"
    output: "result"
  - id: "end"
    type: "end"
flows:
  - { source: "start", target: "calc" }
  - { source: "calc", target: "end" }
"#,
    )
    .expect("Parse failed");

    let mut compiler = Compiler::new();
    compiler.register_handler(Arc::new(DoubleHandler));
    assert!(compiler.handler("double").is_some());
    let definition = compiler.compile(&model).expect("Compilation failed");

    let mut instance = definition.create_process_instance();
    instance.set_process_variable("input", json!(21)).expect("set input");
    instance.start().expect("Start failed");
    assert!(instance.is_ended());
    assert_eq!(instance.get_variable("result"), Some(json!(42)));
}

#[test]
fn test_compile_sub_process_and_boundary() {
    let model = parse_process(
        r#"
id: "nested"
activities:
  - id: "start"
    type: "start"
  - id: "sub"
    type: "sub_process"
    activities:
      - id: "inner_start"
        type: "start"
      - id: "inner_wait"
        type: "receive_task"
    flows:
      - { source: "inner_start", target: "inner_wait" }
  - id: "deadline"
    type: "boundary"
    attached_to: "sub"
    event:
      trigger: "timer"
      duration_ms: 500
  - id: "late"
    type: "user_task"
  - id: "end"
    type: "end"
flows:
  - { source: "start", target: "sub" }
  - { source: "sub", target: "end" }
  - { source: "deadline", target: "late" }
"#,
    )
    .expect("Parse failed");

    let definition = Compiler::new().compile(&model).expect("Compilation failed");
    let sub = definition.find_activity("sub").expect("sub missing");
    let inner = definition.find_activity("inner_wait").expect("inner_wait missing");
    assert!(sub.is_scope());
    assert_eq!(inner.parent(), Some(sub.index()));
    assert_eq!(
        sub.initial(),
        definition.find_activity("inner_start").map(|a| a.index())
    );

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["inner_wait".to_string()]);

    let timers = instance.drain_scheduled_timers();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].due_in, Duration::from_millis(500));
    instance.fire_timer(timers[0].subscription_id).expect("Timer failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["late".to_string()]);
}

#[test]
fn test_compile_parallel_and_multi_instance() {
    let model = parse_process(
        r#"
id: "parallel"
activities:
  - id: "start"
    type: "start"
  - id: "fork"
    type: "parallel_gateway"
  - id: "review"
    type: "user_task"
    multi_instance:
      count: 2
  - id: "notify"
    type: "intermediate_catch"
    event:
      trigger: "message"
      name: "notified"
  - id: "join"
    type: "parallel_gateway"
  - id: "end"
    type: "end"
flows:
  - { source: "start", target: "fork" }
  - { source: "fork", target: "review" }
  - { source: "fork", target: "notify" }
  - { source: "review", target: "join" }
  - { source: "notify", target: "join" }
  - { source: "join", target: "end" }
"#,
    )
    .expect("Parse failed");

    let definition = Compiler::new().compile(&model).expect("Compilation failed");
    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");

    let active: Vec<String> = instance.find_active_activity_ids();
    assert_eq!(active.iter().filter(|a| a.as_str() == "review").count(), 2);
    assert_eq!(
        active.into_iter().collect::<HashSet<_>>(),
        HashSet::from(["review".to_string(), "notify".to_string()])
    );

    instance.signal_activity("review", None, None).expect("Signal 1 failed");
    instance.signal_activity("review", None, None).expect("Signal 2 failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["notify".to_string()]);

    assert!(instance.message_event_received("notified", None).expect("delivery failed"));
    assert!(instance.is_ended());
}

#[test]
fn test_unknown_handler_is_rejected() {
    let model = parse_process(
        r#"
id: "unknown"
activities:
  - id: "x"
    type: "service_task"
    handler: "nope"
"#,
    )
    .expect("Parse failed");

    let err = Compiler::new().compile(&model).expect_err("unknown handler");
    assert!(err.to_string().contains("task handler not found: nope"));
}

#[test]
fn test_flow_from_unknown_source_is_rejected() {
    let model = parse_process(
        r#"
id: "bad-flow"
activities:
  - id: "start"
    type: "start"
flows:
  - { source: "ghost", target: "start" }
"#,
    )
    .expect("Parse failed");

    let err = Compiler::new().compile(&model).expect_err("bad flow source");
    assert!(err.to_string().contains("flow source 'ghost'"));
}

#[test]
fn test_model_errors_surface_from_builder() {
    let model = parse_process(
        r#"
id: "dup"
activities:
  - id: "start"
    type: "start"
  - id: "start"
    type: "end"
"#,
    )
    .expect("Parse failed");

    let err = Compiler::new().compile(&model).expect_err("duplicate activity");
    assert!(matches!(err.downcast_ref::<PvmError>(), Some(PvmError::DuplicateActivity(id)) if id == "start"));
}

#[test]
fn test_ambiguous_multi_instance_is_rejected() {
    let model = parse_process(
        r#"
id: "mi"
activities:
  - id: "start"
    type: "start"
    multi_instance:
      count: 2
      collection: "items"
"#,
    )
    .expect("Parse failed");

    let err = Compiler::new().compile(&model).expect_err("ambiguous cardinality");
    assert!(err.to_string().contains("exactly one of"));
}

#[test]
fn test_boundary_without_host_is_rejected() {
    let model = parse_process(
        r#"
id: "loose"
activities:
  - id: "start"
    type: "start"
  - id: "floating"
    type: "boundary"
    event:
      trigger: "signal"
      name: "s"
"#,
    )
    .expect("Parse failed");

    let err = Compiler::new().compile(&model).expect_err("boundary without host");
    assert!(err.to_string().contains("not attached"));
}
