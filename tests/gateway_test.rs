use flowvm::behaviors::{ExclusiveGateway, InclusiveGateway, NoneEndEvent, WaitState};
use flowvm::error::PvmError;
use flowvm::runtime::builder::ProcessDefinitionBuilder;
use flowvm::runtime::definition::ProcessDefinition;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn exclusive_process() -> Arc<ProcessDefinition> {
    ProcessDefinitionBuilder::new("exclusive")
        .create_activity("gw").initial().behavior(ExclusiveGateway::with_default("to_c"))
            .start_transition("big").id("to_a").condition_expr("x > 10").end_transition()
            .start_transition("medium").id("to_b").condition_expr("x > 5").end_transition()
            .transition_with_id("to_c", "small")
            .end_activity()
        .create_activity("big").behavior(WaitState).end_activity()
        .create_activity("medium").behavior(WaitState).end_activity()
        .create_activity("small").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed")
}

fn run_exclusive(x: i64) -> Vec<String> {
    let definition = exclusive_process();
    let mut instance = definition.create_process_instance();
    instance.set_process_variable("x", json!(x)).expect("set x");
    instance.start().expect("Start failed");
    instance.find_active_activity_ids()
}

#[test]
fn test_exclusive_gateway_first_match_wins() {
    // both guards hold, declaration order decides
    assert_eq!(run_exclusive(20), vec!["big".to_string()]);
    assert_eq!(run_exclusive(7), vec!["medium".to_string()]);
}

#[test]
fn test_exclusive_gateway_default_only_when_nothing_matches() {
    assert_eq!(run_exclusive(1), vec!["small".to_string()]);
}

#[test]
fn test_exclusive_gateway_without_match_or_default_fails() {
    let definition = ProcessDefinitionBuilder::new("no-default")
        .create_activity("gw").initial().behavior(ExclusiveGateway::new())
            .start_transition("a").condition_expr("x > 10").end_transition()
            .end_activity()
        .create_activity("a").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.set_process_variable("x", json!(1)).expect("set x");
    let err = instance.start().expect_err("no transition can be taken");
    assert!(matches!(err.downcast_ref::<PvmError>(), Some(PvmError::NoOutgoingTransition(id)) if id == "gw"));
}

#[test]
fn test_failing_guard_is_a_fault() {
    let definition = ProcessDefinitionBuilder::new("bad-guard")
        .create_activity("gw").initial().behavior(ExclusiveGateway::new())
            .start_transition("a").condition_expr("missing > 10").end_transition()
            .end_activity()
        .create_activity("a").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    let err = instance.start().expect_err("unknown variable must fail");
    assert!(err.downcast_ref::<PvmError>().is_none());
    assert!(err.to_string().contains("missing > 10"));
}

fn inclusive_process() -> Arc<ProcessDefinition> {
    ProcessDefinitionBuilder::new("inclusive")
        .create_activity("split").initial().behavior(InclusiveGateway::with_default("to_d"))
            .start_transition("a").condition_expr("x > 0").end_transition()
            .start_transition("b").condition_expr("x > 5").end_transition()
            .start_transition("c").condition_expr("x > 100").end_transition()
            .transition_with_id("to_d", "d")
            .end_activity()
        .create_activity("a").behavior(WaitState).transition("merge").end_activity()
        .create_activity("b").behavior(WaitState).transition("merge").end_activity()
        .create_activity("c").behavior(WaitState).transition("merge").end_activity()
        .create_activity("d").behavior(WaitState).transition("merge").end_activity()
        .create_activity("merge").behavior(InclusiveGateway::new()).transition("end").end_activity()
        .create_activity("end").behavior(NoneEndEvent).end_activity()
        .build()
        .expect("Build failed")
}

#[test]
fn test_inclusive_gateway_forks_every_matching_flow() {
    let definition = inclusive_process();
    let mut instance = definition.create_process_instance();
    instance.set_process_variable("x", json!(10)).expect("set x");
    instance.start().expect("Start failed");

    let active: HashSet<String> = instance.find_active_activity_ids().into_iter().collect();
    assert_eq!(active, HashSet::from(["a".to_string(), "b".to_string()]));

    // the merge only waits for the branches that were actually started
    instance.signal_activity("a", None, None).expect("Signal a failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["b".to_string()]);
    assert!(!instance.is_ended());

    instance.signal_activity("b", None, None).expect("Signal b failed");
    assert!(instance.is_ended());
}

#[test]
fn test_inclusive_gateway_single_match_passes_merge() {
    let definition = inclusive_process();
    let mut instance = definition.create_process_instance();
    instance.set_process_variable("x", json!(3)).expect("set x");
    instance.start().expect("Start failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["a".to_string()]);

    instance.signal_activity("a", None, None).expect("Signal a failed");
    assert!(instance.is_ended());
}

#[test]
fn test_inclusive_gateway_falls_back_to_default() {
    let definition = inclusive_process();
    let mut instance = definition.create_process_instance();
    instance.set_process_variable("x", json!(-1)).expect("set x");
    instance.start().expect("Start failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["d".to_string()]);
}
