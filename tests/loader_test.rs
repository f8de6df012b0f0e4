use flowvm::compiler::Compiler;
use flowvm::compiler::loader;
use flowvm::dsl::{ActivityKind, FlowModel};
use serde_json::json;
use std::fs;

const ORDER_YAML: &str = r#"
id: "order"
name: "Order Process"
variables:
  amount: 150
activities:
  - id: "start"
    type: "start"
  - id: "check"
    type: "exclusive_gateway"
    default: "to_auto"
  - id: "approve"
    type: "user_task"
    name: "Manual approval"
  - id: "auto"
    type: "service_task"
    handler: "assign"
    params:
      expression: "approved = true"
  - id: "end"
    type: "end"
flows:
  - source: "start"
    target: "check"
  - id: "to_approve"
    source: "check"
    target: "approve"
    condition: "${amount > 100}"
  - id: "to_auto"
    source: "check"
    target: "auto"
  - source: "approve"
    target: "end"
  - source: "auto"
    target: "end"
"#;

#[test]
fn test_load_yaml_process_model() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("order.yaml");
    fs::write(&file_path, ORDER_YAML).expect("Failed to write temp file");

    let model = loader::load_process_from_yaml(&file_path.to_string_lossy())
        .expect("Failed to load process from YAML");

    assert_eq!(model.id, "order");
    assert_eq!(model.name.as_deref(), Some("Order Process"));
    assert_eq!(model.variables.get("amount"), Some(&json!(150)));
    assert_eq!(model.activities.len(), 5);
    assert_eq!(model.activities[0].kind, ActivityKind::Start);
    assert_eq!(
        model.activities[1].kind,
        ActivityKind::ExclusiveGateway {
            default: Some("to_auto".to_string())
        }
    );
    assert_eq!(model.activities[2].name.as_deref(), Some("Manual approval"));
    match &model.activities[3].kind {
        ActivityKind::ServiceTask { handler, params, output } => {
            assert_eq!(handler, "assign");
            assert_eq!(params.get("expression"), Some(&json!("approved = true")));
            assert!(output.is_none());
        }
        other => panic!("unexpected kind {:?}", other),
    }
    assert_eq!(
        model.flows[1],
        FlowModel {
            id: Some("to_approve".to_string()),
            source: "check".to_string(),
            target: "approve".to_string(),
            condition: Some("${amount > 100}".to_string()),
            skip: None,
        }
    );

    // Cleanup
    temp_dir.close().expect("Failed to close temp dir");
}

#[test]
fn test_load_and_run_definition() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("order.yaml");
    fs::write(&file_path, ORDER_YAML).expect("Failed to write temp file");

    let compiler = Compiler::new();
    let (model, definition) =
        loader::load_definition(&file_path.to_string_lossy(), &compiler).expect("Failed to load definition");
    assert_eq!(definition.id(), "order");
    assert_eq!(definition.initial().map(|a| a.id()), Some("start"));

    // 1. Large order waits for approval
    let mut instance = definition.create_process_instance();
    instance.set_variables(model.variables.clone()).expect("set variables");
    instance.start().expect("Start failed");
    assert_eq!(instance.find_active_activity_ids(), vec!["approve".to_string()]);

    // 2. Small order is approved automatically
    let mut instance = definition.create_process_instance();
    instance.set_process_variable("amount", json!(20)).expect("set amount");
    instance.start().expect("Start failed");
    assert!(instance.is_ended());
    assert_eq!(instance.get_variable("approved"), Some(json!(true)));
}

#[test]
fn test_missing_file_reports_path() {
    let err = loader::load_process_from_yaml("/definitely/not/here.yaml").expect_err("missing file");
    assert!(err.to_string().contains("/definitely/not/here.yaml"));
}

#[test]
fn test_unknown_activity_type_is_rejected() {
    let yaml = r#"
id: "broken"
activities:
  - id: "x"
    type: "teleport"
"#;
    assert!(loader::parse_process(yaml).is_err());
}
