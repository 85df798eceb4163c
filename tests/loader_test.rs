use std::fs;

use procvm::config::{EngineConfig, HistoryLevel};
use procvm::definition::loader;
use procvm::definition::{ActivityKind, ScopeRef};
use procvm::migration::MigrationPlan;

#[test]
fn test_load_process_definition_from_yaml() {
    let yaml_content = r#"
id: "order-v2"
key: "order"
version: 2
name: "Order handling"
listeners:
  start: ["audit"]
activities:
  - id: "start"
    type: "start_event"
  - id: "review"
    type: "user_task"
    name: "Review order"
  - id: "cancel"
    type: "boundary_message"
    attached_to: "review"
    message: "order-canceled"
  - id: "end"
    type: "end_event"
  - id: "canceled"
    type: "end_event"
transitions:
  - id: "t1"
    source: "start"
    target: "review"
  - id: "t2"
    source: "review"
    target: "end"
  - id: "t3"
    source: "cancel"
    target: "canceled"
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("order.yaml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let definition = loader::load_definition_from_yaml(&file_path).expect("Failed to load definition from YAML");

    assert_eq!(definition.id, "order-v2");
    assert_eq!(definition.key, "order");
    assert_eq!(definition.version, 2);
    assert_eq!(definition.listeners.start, vec!["audit".to_string()]);

    // boundary hosts become scopes
    let review = definition.activity("review").expect("review exists");
    assert!(review.scope);
    let cancel = definition.activity("cancel").expect("cancel exists");
    assert_eq!(cancel.kind, ActivityKind::BoundaryMessage);
    assert!(cancel.cancel_activity);
    assert_eq!(cancel.message.as_deref(), Some("order-canceled"));
    assert_eq!(definition.boundary_events("review").len(), 1);
    assert_eq!(
        definition.initial(&ScopeRef::Process).map(|a| a.id.as_str()),
        Some("start")
    );

    temp_dir.close().expect("Failed to close temp dir");
}

#[test]
fn test_key_defaults_to_id() {
    let definition = loader::parse_definition(
        r#"
id: "minimal"
activities:
  - id: "start"
    type: "start_event"
"#,
    )
    .expect("Failed to parse definition");

    assert_eq!(definition.key, "minimal");
    assert_eq!(definition.version, 1);
    assert!(definition.transitions.is_empty());
}

#[test]
fn test_unknown_transition_target_is_rejected() {
    let err = loader::parse_definition(
        r#"
id: "broken"
activities:
  - id: "start"
    type: "start_event"
transitions:
  - id: "t1"
    source: "start"
    target: "missing"
"#,
    )
    .unwrap_err();

    assert!(
        err.to_string()
            .contains("transition 't1' references unknown activity 'missing'"),
        "{}",
        err
    );
}

#[test]
fn test_definition_without_start_event_is_rejected() {
    let err = loader::parse_definition(
        r#"
id: "headless"
activities:
  - id: "review"
    type: "user_task"
"#,
    )
    .unwrap_err();

    assert!(err.to_string().contains("has no start event"), "{}", err);
}

#[test]
fn test_load_missing_file_fails() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let result = loader::load_definition_from_yaml(temp_dir.path().join("absent.yaml"));
    assert!(result.is_err());
}

#[test]
fn test_engine_config_from_yaml() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("engine.yaml");
    fs::write(&file_path, "history_level: full\ndefault_job_retries: 5\n").expect("Failed to write temp file");

    let config = EngineConfig::load(&file_path).expect("Failed to load config");

    assert_eq!(config.history_level, HistoryLevel::Full);
    assert_eq!(config.default_job_retries, 5);
    assert_eq!(config.log_filter, EngineConfig::default().log_filter);
    assert_eq!(config.history_channel_capacity, 1024);
}

#[test]
fn test_migration_plan_from_yaml() {
    let plan: MigrationPlan = serde_yaml::from_str(
        r#"
source_definition_id: "order-v1"
target_definition_id: "order-v2"
instructions:
  - source_activity_id: "review"
    target_activity_id: "review"
  - source_activity_id: "cancel"
    target_activity_id: "cancel"
    update_event_trigger: true
"#,
    )
    .expect("Failed to deserialize plan");

    assert_eq!(plan.instructions.len(), 2);
    assert!(!plan.instructions[0].update_event_trigger);
    assert!(plan.instructions[1].update_event_trigger);
    assert_eq!(
        plan.instruction_for("review").map(|i| i.target_activity_id.as_str()),
        Some("review")
    );
}
