use anyhow::{Result, anyhow};
use flowvm::behaviors::{Automatic, BoundaryEvent, NoneEndEvent, ParallelGateway, SubProcess, WaitState};
use flowvm::error::PvmError;
use flowvm::runtime::behavior::ActivityBehavior;
use flowvm::runtime::builder::ProcessDefinitionBuilder;
use flowvm::runtime::condition::{condition_fn, expr};
use flowvm::runtime::context::ActivityExecution;
use flowvm::runtime::event::EventTrigger;
use flowvm::runtime::listener::{EventName, ExecutionEvent, ExecutionListener, RecordingListener};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Writes a few variables with different visibility, then leaves.
#[derive(Debug)]
struct Writer;

impl ActivityBehavior for Writer {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.set_variable("shared", json!(2))?;
        execution.set_variable("fresh", json!(true))?;
        execution.set_variable_local("local", json!("mine"))?;
        execution.leave()
    }
}

/// Parks without accepting signals.
#[derive(Debug)]
struct Park;

impl ActivityBehavior for Park {
    fn execute(&self, _execution: &mut ActivityExecution<'_>) -> Result<()> {
        Ok(())
    }
}

/// Tries to leave through a transition that belongs to another activity.
#[derive(Debug)]
struct WrongWay;

impl ActivityBehavior for WrongWay {
    fn execute(&self, execution: &mut ActivityExecution<'_>) -> Result<()> {
        execution.take_by_id("other->target")
    }
}

/// Signals itself again from inside its own signal handler.
#[derive(Debug)]
struct Reentrant;

impl ActivityBehavior for Reentrant {
    fn execute(&self, _execution: &mut ActivityExecution<'_>) -> Result<()> {
        Ok(())
    }

    fn signal(
        &self,
        execution: &mut ActivityExecution<'_>,
        _signal_name: Option<&str>,
        _signal_data: Option<serde_json::Value>,
    ) -> Result<()> {
        let id = execution.id();
        execution.instance_mut().signal(id, None, None)
    }
}

#[derive(Debug)]
struct Exploding;

impl ExecutionListener for Exploding {
    fn notify(&self, _event: &ExecutionEvent, _execution: &mut ActivityExecution<'_>) -> Result<()> {
        Err(anyhow!("listener exploded"))
    }
}

/// Keeps the delete reason of every `end` event.
#[derive(Debug, Clone, Default)]
struct ReasonListener {
    reasons: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl ExecutionListener for ReasonListener {
    fn notify(&self, event: &ExecutionEvent, _execution: &mut ActivityExecution<'_>) -> Result<()> {
        self.reasons
            .lock()
            .unwrap()
            .push((event.source.id().to_string(), event.delete_reason.clone()));
        Ok(())
    }
}

fn pvm_error(err: &anyhow::Error) -> &PvmError {
    err.downcast_ref::<PvmError>().expect("not a PvmError")
}

// --- variables ---

#[test]
fn test_variable_scoping_across_sub_process() {
    let definition = ProcessDefinitionBuilder::new("scoping")
        .create_activity("sub").initial().behavior(SubProcess).transition("after")
            .create_activity("writer").initial().behavior(Writer).transition("inner_wait").end_activity()
            .create_activity("inner_wait").behavior(WaitState).end_activity()
            .end_activity()
        .create_activity("after").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.set_process_variable("shared", json!(1)).expect("set shared");
    instance.start().expect("Start failed");

    // 1. Inside the sub-process
    let inner = instance.find_execution("inner_wait").expect("not parked in sub-process");
    assert_eq!(instance.get_variable_of(inner, "fresh"), Some(json!(true)));
    assert_eq!(instance.get_variable_of(inner, "local"), Some(json!("mine")));
    assert_eq!(instance.get_variable("shared"), Some(json!(2)));
    assert_eq!(instance.get_variable("fresh"), None);
    assert_eq!(instance.get_variables_of(inner).len(), 3);

    // 2. After the scope is gone
    instance.signal_activity("inner_wait", None, None).expect("Signal failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["after".to_string()]);
    assert_eq!(instance.get_variable("shared"), Some(json!(2)));
    assert_eq!(instance.get_variable("fresh"), None);
    assert_eq!(instance.get_variable("local"), None);
}

#[test]
fn test_signal_data_and_named_transition() {
    let definition = ProcessDefinitionBuilder::new("approval")
        .create_activity("decide").initial().behavior(WaitState)
            .transition_with_id("approve", "approved")
            .transition_with_id("reject", "rejected")
            .end_activity()
        .create_activity("approved").behavior(WaitState).end_activity()
        .create_activity("rejected").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");
    instance
        .signal_activity("decide", Some("reject"), Some(json!({ "comment": "too expensive" })))
        .expect("Signal failed");

    assert_eq!(instance.find_active_activity_ids(), vec!["rejected".to_string()]);
    assert_eq!(instance.get_variable("comment"), Some(json!("too expensive")));
}

#[test]
fn test_variables_survive_process_end() {
    let definition = ProcessDefinitionBuilder::new("done")
        .create_activity("a").initial().behavior(Automatic).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.set_process_variable("result", json!(42)).expect("set result");
    instance.start().expect("Start failed");
    assert!(instance.is_ended());
    assert_eq!(instance.get_variable("result"), Some(json!(42)));
    assert_eq!(instance.get_variables().len(), 1);
}

// --- skip and alternate start ---

#[test]
fn test_skip_predicate_passes_through_destination() {
    let build = || {
        let recorder = RecordingListener::new();
        let definition = ProcessDefinitionBuilder::new("skipping")
            .create_activity("a").initial().behavior(Automatic)
                .start_transition("b").skip_when(expr("skip == true").expect("bad skip")).end_transition()
                .end_activity()
            .create_activity("b").behavior(WaitState)
                .listener(EventName::Start, Arc::new(recorder.clone()))
                .transition("c")
                .end_activity()
            .create_activity("c").behavior(WaitState).end_activity()
            .build()
            .expect("Build failed");
        (definition, recorder)
    };

    let (definition, recorder) = build();
    let mut instance = definition.create_process_instance();
    instance.set_process_variable("skip", json!(true)).expect("set skip");
    instance.start().expect("Start failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["c".to_string()]);
    assert!(recorder.events().is_empty());

    let (definition, recorder) = build();
    let mut instance = definition.create_process_instance();
    instance.set_process_variable("skip", json!(false)).expect("set skip");
    instance.start().expect("Start failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["b".to_string()]);
    assert_eq!(recorder.events(), vec!["start:b"]);
}

#[test]
fn test_skip_predicate_from_closure() {
    let definition = ProcessDefinitionBuilder::new("skip-fn")
        .create_activity("a").initial().behavior(Automatic)
            .start_transition("b")
                .skip_when(condition_fn("always", |_| Ok(true)))
                .end_transition()
            .end_activity()
        .create_activity("b").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");
    // b has no outgoing transition, so skipping it ends the process
    assert!(instance.is_ended());
}

#[test]
fn test_start_at_alternate_activity() {
    let definition = ProcessDefinitionBuilder::new("alternate")
        .create_activity("a").initial().behavior(WaitState).transition("b").end_activity()
        .create_activity("b").behavior(WaitState).transition("c").end_activity()
        .create_activity("c").behavior(NoneEndEvent).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance_at("b").expect("b exists");
    instance.start().expect("Start failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["b".to_string()]);

    assert!(matches!(
        definition.create_process_instance_at("zzz"),
        Err(PvmError::ActivityNotFound(id)) if id == "zzz"
    ));
}

#[test]
fn test_start_at_nested_activity_enters_scopes() {
    let recorder = RecordingListener::new();
    let definition = ProcessDefinitionBuilder::new("alternate-nested")
        .create_activity("outer").initial().behavior(SubProcess)
            .listener(EventName::Start, Arc::new(recorder.clone()))
            .create_activity("x").initial().behavior(WaitState).transition("y").end_activity()
            .create_activity("y").behavior(WaitState)
                .listener(EventName::Start, Arc::new(recorder.clone()))
                .end_activity()
            .end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance_at("y").expect("y exists");
    instance.start().expect("Start failed");

    assert_eq!(recorder.events(), vec!["start:outer", "start:y"]);
    assert_eq!(instance.find_active_activity_ids(), vec!["y".to_string()]);

    instance.signal_activity("y", None, None).expect("Signal failed");
    assert!(instance.is_ended());
}

// --- protocol misuse ---

#[test]
fn test_start_and_signal_lifecycle_errors() {
    let definition = ProcessDefinitionBuilder::new("lifecycle")
        .create_activity("wait").initial().behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    let root = instance.root();

    // 1. Signal before start
    let err = instance.signal(root, None, None).expect_err("not started");
    assert!(matches!(pvm_error(&err), PvmError::NotStarted));

    // 2. Start twice
    instance.start().expect("Start failed");
    let err = instance.start().expect_err("already started");
    assert!(matches!(pvm_error(&err), PvmError::AlreadyStarted));

    // 3. Signal after the end
    instance.signal(root, None, None).expect("Signal failed");
    assert!(instance.is_ended());
    let err = instance.signal(root, None, None).expect_err("already ended");
    assert!(matches!(pvm_error(&err), PvmError::ExecutionEnded(_)));
}

#[test]
fn test_signal_activity_lookup_errors() {
    let definition = ProcessDefinitionBuilder::new("lookup")
        .create_activity("one").initial().behavior(WaitState).transition("two").end_activity()
        .create_activity("two").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");

    let err = instance.signal_activity("nope", None, None).expect_err("unknown activity");
    assert!(matches!(pvm_error(&err), PvmError::ActivityNotFound(id) if id == "nope"));

    let err = instance.signal_activity("two", None, None).expect_err("nothing parked at two");
    assert!(matches!(pvm_error(&err), PvmError::NoExecutionAt(id) if id == "two"));
}

#[test]
fn test_forked_root_is_not_a_wait_state() {
    let definition = ProcessDefinitionBuilder::new("forked")
        .create_activity("fork").initial().behavior(ParallelGateway)
            .transition("w1")
            .transition("w2")
            .end_activity()
        .create_activity("w1").behavior(WaitState).end_activity()
        .create_activity("w2").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");

    let root = instance.root();
    let err = instance.signal(root, None, None).expect_err("root has branches");
    assert!(matches!(pvm_error(&err), PvmError::NotWaitState(_)));
}

#[test]
fn test_behavior_without_signal_support() {
    let definition = ProcessDefinitionBuilder::new("parked")
        .create_activity("park").initial().behavior(Park).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");
    let err = instance.signal_activity("park", None, None).expect_err("signal unsupported");
    assert!(matches!(pvm_error(&err), PvmError::SignalNotSupported(id) if id == "park"));
}

#[test]
fn test_taking_foreign_transition_is_rejected() {
    let definition = ProcessDefinitionBuilder::new("foreign")
        .create_activity("start").initial().behavior(WrongWay).transition("target").end_activity()
        .create_activity("other").transition("target").end_activity()
        .create_activity("target").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    let err = instance.start().expect_err("foreign transition");
    assert!(matches!(
        pvm_error(&err),
        PvmError::ForeignTransition { transition, activity } if transition == "other->target" && activity == "start"
    ));
}

#[test]
fn test_stale_execution_handle_is_rejected() {
    let definition = ProcessDefinitionBuilder::new("stale")
        .create_activity("task").initial().behavior(WaitState).end_activity()
        .create_activity("timeout")
            .behavior(BoundaryEvent::interrupting(EventTrigger::timer(Duration::from_secs(1))))
            .attached_to("task")
            .transition("late")
            .end_activity()
        .create_activity("late").behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");
    let handle = instance.find_execution("task").expect("no execution at task");

    let timers = instance.drain_scheduled_timers();
    instance.fire_timer(timers[0].subscription_id).expect("Timer failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["late".to_string()]);

    let err = instance.signal(handle, None, None).expect_err("handle is gone");
    assert!(matches!(pvm_error(&err), PvmError::ExecutionNotFound(id) if *id == handle));
}

#[test]
fn test_reentrant_signal_is_rejected() {
    let definition = ProcessDefinitionBuilder::new("reentrant")
        .create_activity("loop").initial().behavior(Reentrant).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");
    let err = instance.signal_activity("loop", None, None).expect_err("nested signal");
    assert!(matches!(pvm_error(&err), PvmError::AlreadySignalled(_)));

    // the guard is released again
    let err = instance.signal_activity("loop", None, None).expect_err("nested signal");
    assert!(matches!(pvm_error(&err), PvmError::AlreadySignalled(_)));
}

// --- listeners and cancellation ---

#[test]
fn test_listener_fault_propagates() {
    let definition = ProcessDefinitionBuilder::new("faulty")
        .create_activity("a").initial().behavior(Automatic).transition("b").end_activity()
        .create_activity("b").behavior(WaitState)
            .listener(EventName::Start, Arc::new(Exploding))
            .end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    let err = instance.start().expect_err("listener fault");
    assert!(err.downcast_ref::<PvmError>().is_none());
    assert_eq!(err.to_string(), "listener exploded");
}

#[test]
fn test_delete_cascade_reports_reason() {
    let listener = ReasonListener::default();
    let definition = ProcessDefinitionBuilder::new("cancel")
        .listener(EventName::End, Arc::new(listener.clone()))
        .create_activity("wait").initial().behavior(WaitState).end_activity()
        .build()
        .expect("Build failed");

    let mut instance = definition.create_process_instance();
    instance.start().expect("Start failed");
    instance.delete_cascade("cancelled by user").expect("Delete failed");

    assert!(instance.is_ended());
    assert_eq!(instance.delete_reason(), Some("cancelled by user"));
    let reasons = listener.reasons.lock().unwrap().clone();
    assert_eq!(
        reasons,
        vec![
            ("wait".to_string(), Some("cancelled by user".to_string())),
            ("cancel".to_string(), Some("cancelled by user".to_string())),
        ]
    );

    // 2. Deleting again changes nothing
    instance.delete_cascade("again").expect("Second delete failed");
    assert_eq!(instance.delete_reason(), Some("cancelled by user"));
    assert_eq!(listener.reasons.lock().unwrap().len(), 2);
}
