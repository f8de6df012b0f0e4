use flowvm::behaviors::{Automatic, BoundaryEvent, SubProcess, WaitState};
use flowvm::error::PvmError;
use flowvm::runtime::builder::ProcessDefinitionBuilder;
use flowvm::runtime::event::EventTrigger;
use std::time::Duration;

#[test]
fn test_build_links_graph() {
    let definition = ProcessDefinitionBuilder::new("linked")
        .name("Linked Process")
        .create_activity("a").initial().name("Step A").transition("b").end_activity()
        .create_activity("b").behavior(WaitState).property("form", "review").end_activity()
        .build()
        .expect("Build failed");

    assert_eq!(definition.id(), "linked");
    assert_eq!(definition.name(), "Linked Process");
    assert_eq!(definition.initial().map(|a| a.id()), Some("a"));

    let a = definition.find_activity("a").expect("a missing");
    let b = definition.find_activity("b").expect("b missing");
    assert_eq!(a.name(), Some("Step A"));
    assert_eq!(a.outgoing().len(), 1);
    assert_eq!(b.incoming(), a.outgoing());
    assert_eq!(b.property("form"), Some(&serde_json::json!("review")));

    let t = definition.find_transition("a->b").expect("default transition id");
    assert_eq!(t.source(), a.index());
    assert_eq!(t.destination(), b.index());
}

#[test]
fn test_nested_activities_and_scope() {
    let definition = ProcessDefinitionBuilder::new("nested")
        .create_activity("sub").initial().behavior(SubProcess)
            .create_activity("inner").initial().end_activity()
            .end_activity()
        .create_activity("plain").scope().async_continuation().exclusive().end_activity()
        .build()
        .expect("Build failed");

    let sub = definition.find_activity("sub").expect("sub missing");
    let inner = definition.find_activity("inner").expect("inner missing");
    assert!(sub.is_scope());
    assert_eq!(sub.children(), &[inner.index()]);
    assert_eq!(sub.initial(), Some(inner.index()));
    assert_eq!(inner.parent(), Some(sub.index()));
    let plain = definition.find_activity("plain").expect("plain missing");
    assert!(plain.is_scope());
    assert!(plain.is_async() && plain.is_exclusive());
    assert!(!sub.is_async());
    assert_eq!(definition.top_level().count(), 2);
}

#[test]
fn test_duplicate_activity_is_rejected() {
    let result = ProcessDefinitionBuilder::new("dup")
        .create_activity("a").initial().end_activity()
        .create_activity("a").end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::DuplicateActivity(id)) if id == "a"));
}

#[test]
fn test_duplicate_initial_is_rejected() {
    let result = ProcessDefinitionBuilder::new("two-starts")
        .create_activity("a").initial().end_activity()
        .create_activity("b").initial().end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::DuplicateInitial { scope }) if scope == "two-starts"));

    let nested = ProcessDefinitionBuilder::new("nested-starts")
        .create_activity("sub").initial().behavior(SubProcess)
            .create_activity("x").initial().end_activity()
            .create_activity("y").initial().end_activity()
            .end_activity()
        .build();
    assert!(matches!(nested, Err(PvmError::DuplicateInitial { scope }) if scope == "sub"));
}

#[test]
fn test_dangling_transition_is_rejected() {
    let result = ProcessDefinitionBuilder::new("dangling")
        .create_activity("a").initial().transition("nowhere").end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::ActivityNotFound(id)) if id == "nowhere"));
}

#[test]
fn test_duplicate_transition_id_is_rejected() {
    let result = ProcessDefinitionBuilder::new("dup-flow")
        .create_activity("a").initial()
            .transition_with_id("flow", "b")
            .transition_with_id("flow", "c")
            .end_activity()
        .create_activity("b").end_activity()
        .create_activity("c").end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::DuplicateTransition(id)) if id == "flow"));
}

#[test]
fn test_parallel_transitions_get_distinct_default_ids() {
    let definition = ProcessDefinitionBuilder::new("twice")
        .create_activity("a").initial().transition("b").transition("b").end_activity()
        .create_activity("b").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");
    assert_eq!(definition.transitions().count(), 2);
    assert!(definition.find_transition("a->b").is_some());
    assert!(definition.find_transition("a->b#1").is_some());
}

#[test]
fn test_cross_scope_transition_is_rejected() {
    let result = ProcessDefinitionBuilder::new("cross")
        .create_activity("sub").initial().behavior(SubProcess)
            .create_activity("inner").initial().transition("outside").end_activity()
            .end_activity()
        .create_activity("outside").end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::CrossScopeTransition { transition }) if transition == "inner->outside"));
}

#[test]
fn test_boundary_event_makes_host_a_scope() {
    let definition = ProcessDefinitionBuilder::new("boundary")
        .create_activity("task").initial().behavior(WaitState).end_activity()
        .create_activity("timeout")
            .behavior(BoundaryEvent::interrupting(EventTrigger::timer(Duration::from_millis(10))))
            .attached_to("task")
            .end_activity()
        .build()
        .expect("Build failed");

    let task = definition.find_activity("task").expect("task missing");
    let timeout = definition.find_activity("timeout").expect("timeout missing");
    assert!(task.is_scope());
    assert_eq!(task.boundary_events(), &[timeout.index()]);
    assert_eq!(timeout.attached_to(), Some(task.index()));
}

#[test]
fn test_boundary_event_outside_host_scope_is_rejected() {
    let result = ProcessDefinitionBuilder::new("misplaced")
        .create_activity("sub").initial().behavior(SubProcess)
            .create_activity("catch")
                .behavior(BoundaryEvent::interrupting(EventTrigger::message("m")))
                .attached_to("sub")
                .end_activity()
            .end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::InvalidModel(_))));
}

#[test]
fn test_compensation_handler_with_outgoing_is_rejected() {
    let result = ProcessDefinitionBuilder::new("bad-handler")
        .create_activity("book").initial().compensated_by("undo").end_activity()
        .create_activity("undo").transition("book").end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::InvalidModel(_))));

    let ok = ProcessDefinitionBuilder::new("good-handler")
        .create_activity("book").initial().compensated_by("undo").end_activity()
        .create_activity("undo").behavior(Automatic).end_activity()
        .build()
        .expect("Build failed");
    let undo = ok.find_activity("undo").expect("undo missing");
    assert!(undo.is_for_compensation());
    assert_eq!(ok.find_activity("book").and_then(|a| a.compensation_handler()), Some(undo.index()));
}

#[test]
fn test_unbalanced_end_activity_is_rejected() {
    let result = ProcessDefinitionBuilder::new("unbalanced")
        .create_activity("a").initial().end_activity()
        .end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::InvalidModel(_))));
}

#[test]
fn test_invalid_condition_expression_is_rejected() {
    let result = ProcessDefinitionBuilder::new("bad-guard")
        .create_activity("a").initial()
            .start_transition("b").condition_expr("(x > 1").end_transition()
            .end_activity()
        .create_activity("b").end_activity()
        .build();
    assert!(matches!(result, Err(PvmError::InvalidModel(_))));
}

#[test]
fn test_missing_initial_fails_at_start() {
    let definition = ProcessDefinitionBuilder::new("no-start")
        .create_activity("a").end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    let err = instance.start().expect_err("start without initial must fail");
    assert!(matches!(err.downcast_ref::<PvmError>(), Some(PvmError::NoInitialActivity(_))));
}
