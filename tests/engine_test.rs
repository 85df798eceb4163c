use std::collections::BTreeMap;
use std::sync::Arc;

use procvm::config::{EngineConfig, HistoryLevel};
use procvm::definition::ProcessDefinition;
use procvm::definition::builder::ProcessBuilder;
use procvm::error::{MigrationError, PvmError};
use procvm::migration::{MigrationOptions, MigrationPlan};
use procvm::runtime::engine::Engine;
use procvm::runtime::history::{ChannelHistoryHandler, HistoryEvent, InMemoryHistory};
use serde_json::{Value, json};

fn order_process(id: &str, version: u32) -> ProcessDefinition {
    ProcessBuilder::new(id)
        .key("order")
        .version(version)
        .start("start")
        .user_task("review")
        .end("end")
        .connect("start", "review")
        .connect("review", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_engine_user_task_lifecycle() {
    // 1. Setup Engine
    let engine = Engine::new(EngineConfig::default());
    let definition = engine.deploy(order_process("order-v1", 1)).expect("Failed to deploy");

    // 2. Start
    let mut variables = BTreeMap::new();
    variables.insert("amount".to_string(), json!(42));
    let id = engine
        .start_process_instance(&definition.id, variables)
        .await
        .expect("Failed to start process instance");

    let tasks = engine.tasks(id).await.expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].activity_id, "review");

    // 3. Complete the task with a variable
    let mut result = BTreeMap::new();
    result.insert("approved".to_string(), json!(true));
    engine
        .complete_task(id, tasks[0].id, result)
        .await
        .expect("Failed to complete task");

    // 4. Verify State
    let instance = engine.process_instance(id).await.expect("load").expect("instance exists");
    assert!(instance.ended);
    let variables = engine.variables(id).await.expect("variables");
    assert_eq!(variables.get("amount"), Some(&json!(42)));
    assert_eq!(variables.get("approved"), Some(&json!(true)));
}

#[tokio::test]
async fn test_engine_call_activity_waits_for_called_instance() {
    let engine = Engine::new(EngineConfig::default());
    let parent = ProcessBuilder::new("parent")
        .start("start")
        .call_activity("call", "child")
        .user_task("after")
        .end("end")
        .connect("start", "call")
        .connect("call", "after")
        .connect("after", "end")
        .build()
        .unwrap();
    let child = ProcessBuilder::new("child")
        .start("start")
        .user_task("approve")
        .end("end")
        .connect("start", "approve")
        .connect("approve", "end")
        .build()
        .unwrap();
    engine.deploy(parent).expect("Failed to deploy parent");
    engine.deploy(child).expect("Failed to deploy child");

    // 1. Start the parent; the child is started with a copy of its variables
    let mut variables = BTreeMap::new();
    variables.insert("customer".to_string(), json!("ada"));
    let parent_id = engine
        .start_process_instance("parent", variables)
        .await
        .expect("Failed to start parent");
    let parent = engine.process_instance(parent_id).await.expect("load").expect("parent");
    let child_id = parent
        .tree
        .called_instances
        .values()
        .next()
        .and_then(|r| r.process_instance_id)
        .expect("called instance linked");
    let child = engine.process_instance(child_id).await.expect("load").expect("child");
    assert_eq!(child.definition_id, "child");
    assert_eq!(child.super_execution.map(|s| s.process_instance_id), Some(parent_id));
    assert_eq!(engine.variables(child_id).await.expect("variables").get("customer"), Some(&json!("ada")));

    // 2. Completing the child continues the parent
    let task = engine.tasks(child_id).await.expect("tasks").remove(0);
    let mut result = BTreeMap::new();
    result.insert("approved".to_string(), json!(true));
    engine
        .complete_task(child_id, task.id, result)
        .await
        .expect("Failed to complete child task");

    assert!(engine.process_instance(child_id).await.expect("load").expect("child").ended);
    let tasks = engine.tasks(parent_id).await.expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].activity_id, "after");
    assert_eq!(engine.variables(parent_id).await.expect("variables").get("approved"), Some(&json!(true)));
}

#[tokio::test]
async fn test_engine_deleting_parent_deletes_called_instance() {
    let engine = Engine::new(EngineConfig::default());
    engine
        .deploy(
            ProcessBuilder::new("parent")
                .start("start")
                .call_activity("call", "child")
                .end("end")
                .connect("start", "call")
                .connect("call", "end")
                .build()
                .unwrap(),
        )
        .expect("Failed to deploy parent");
    engine.deploy(order_process("child", 1)).expect("Failed to deploy child");

    let parent_id = engine
        .start_process_instance("parent", BTreeMap::new())
        .await
        .expect("Failed to start parent");
    let parent = engine.process_instance(parent_id).await.expect("load").expect("parent");
    let child_id = parent
        .tree
        .called_instances
        .values()
        .next()
        .and_then(|r| r.process_instance_id)
        .expect("called instance linked");

    engine
        .delete_process_instance(parent_id, "canceled by user", false, false)
        .await
        .expect("Failed to delete");

    assert!(engine.process_instance(parent_id).await.expect("load").expect("parent").ended);
    assert!(engine.process_instance(child_id).await.expect("load").expect("child").ended);
}

#[tokio::test]
async fn test_engine_failing_job_raises_incident() {
    let config = EngineConfig {
        default_job_retries: 2,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);
    let definition = ProcessBuilder::new("failing")
        .start("start")
        .service_task("work", "fail")
        .param("message", "backend unavailable")
        .async_before()
        .done()
        .end("end")
        .connect("start", "work")
        .connect("work", "end")
        .build()
        .unwrap();
    engine.deploy(definition).expect("Failed to deploy");
    let id = engine
        .start_process_instance("failing", BTreeMap::new())
        .await
        .expect("Failed to start");

    let jobs = engine.jobs(id).await.expect("jobs");
    assert_eq!(jobs.len(), 1);
    let job = jobs[0].id;
    assert_eq!(jobs[0].retries, 2);

    // 1. First failure costs a retry
    assert!(engine.execute_job(id, job).await.is_err());
    let jobs = engine.jobs(id).await.expect("jobs");
    assert_eq!(jobs[0].retries, 1);
    assert!(jobs[0].exception_message.as_deref().unwrap_or_default().contains("backend unavailable"));
    assert!(engine.incidents(id).await.expect("incidents").is_empty());

    // 2. The last retry raises an incident
    assert!(engine.execute_job(id, job).await.is_err());
    let incidents = engine.incidents(id).await.expect("incidents");
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].incident_type, "failedJob");
    assert_eq!(incidents[0].job, Some(job));
    assert_eq!(engine.jobs(id).await.expect("jobs")[0].retries, 0);

    // 3. Without retries the job is not executed any more
    let err = engine.execute_job(id, job).await.unwrap_err();
    assert!(err.to_string().contains("no retries left"), "{}", err);
    assert_eq!(engine.incidents(id).await.expect("incidents").len(), 1);
}

#[tokio::test]
async fn test_engine_correlate_message() {
    let engine = Engine::new(EngineConfig::default());
    let definition = ProcessBuilder::new("payment")
        .start("start")
        .message_catch("wait", "payment-received")
        .user_task("ship")
        .end("end")
        .connect("start", "wait")
        .connect("wait", "ship")
        .connect("ship", "end")
        .build()
        .unwrap();
    engine.deploy(definition).expect("Failed to deploy");
    let id = engine
        .start_process_instance("payment", BTreeMap::new())
        .await
        .expect("Failed to start");

    let unknown = engine
        .correlate_message(id, "refund-requested", Value::Null)
        .await
        .expect("correlate");
    assert!(!unknown);
    assert!(engine.tasks(id).await.expect("tasks").is_empty());

    let delivered = engine
        .correlate_message(id, "payment-received", json!({"amount": 10}))
        .await
        .expect("correlate");
    assert!(delivered);
    let tasks = engine.tasks(id).await.expect("tasks");
    assert_eq!(tasks[0].activity_id, "ship");
}

#[tokio::test]
async fn test_engine_migrates_to_new_version() {
    let engine = Engine::new(EngineConfig::default());
    let v1 = engine.deploy(order_process("order-v1", 1)).expect("Failed to deploy v1");
    let id = engine
        .start_process_instance(&v1.id, BTreeMap::new())
        .await
        .expect("Failed to start");
    let v2 = engine.deploy(order_process("order-v2", 2)).expect("Failed to deploy v2");

    // 1. New instances use the latest version of the key
    let latest = engine
        .start_process_instance_by_key("order", Some("order-42".to_string()), BTreeMap::new())
        .await
        .expect("Failed to start by key");
    let latest = engine.process_instance(latest).await.expect("load").expect("instance");
    assert_eq!(latest.definition_id, "order-v2");
    assert_eq!(latest.business_key.as_deref(), Some("order-42"));

    // 2. Migrate the running v1 instance
    let plan = MigrationPlan::builder(&v1, &v2)
        .map_equal_activities()
        .build()
        .expect("valid plan");
    engine
        .migrate(id, &plan, MigrationOptions::default())
        .await
        .expect("Failed to migrate");

    let instance = engine.process_instance(id).await.expect("load").expect("instance");
    assert_eq!(instance.definition_id, "order-v2");
    let tasks = engine.tasks(id).await.expect("tasks");
    assert_eq!(tasks[0].process_definition_id, "order-v2");

    // 3. It continues on v2
    engine
        .complete_task(id, tasks[0].id, BTreeMap::new())
        .await
        .expect("Failed to complete task");
    assert!(engine.process_instance(id).await.expect("load").expect("instance").ended);
}

#[tokio::test]
async fn test_engine_failed_migration_leaves_instance_untouched() {
    let engine = Engine::new(EngineConfig::default());
    let v1 = engine.deploy(order_process("order-v1", 1)).expect("Failed to deploy v1");
    let v2 = engine.deploy(order_process("order-v2", 2)).expect("Failed to deploy v2");
    let id = engine
        .start_process_instance(&v1.id, BTreeMap::new())
        .await
        .expect("Failed to start");
    let before = engine.process_instance(id).await.expect("load").expect("instance");

    let plan = MigrationPlan::builder(&v1, &v2).build().expect("valid plan");
    let err = engine
        .migrate(id, &plan, MigrationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<MigrationError>(),
        Some(MigrationError::InvalidInstance(_))
    ));
    let after = engine.process_instance(id).await.expect("load").expect("instance");
    assert_eq!(after.definition_id, "order-v1");
    assert_eq!(after.tree.render(), before.tree.render());
}

#[tokio::test]
async fn test_engine_rejects_commands_on_ended_instance() {
    let engine = Engine::new(EngineConfig::default());
    engine.deploy(order_process("order-v1", 1)).expect("Failed to deploy");
    let id = engine
        .start_process_instance("order-v1", BTreeMap::new())
        .await
        .expect("Failed to start");
    let task = engine.tasks(id).await.expect("tasks")[0].id;

    engine
        .delete_process_instance(id, "no longer needed", false, false)
        .await
        .expect("Failed to delete");

    let err = engine.complete_task(id, task, BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<PvmError>(), Some(PvmError::InstanceEnded(ended)) if *ended == id));
}

#[tokio::test]
async fn test_engine_dispatches_history() {
    let history = Arc::new(InMemoryHistory::new());
    let mut engine = Engine::new(EngineConfig::default());
    engine.set_history_handler(history.clone());
    engine.deploy(order_process("order-v1", 1)).expect("Failed to deploy");

    let id = engine
        .start_process_instance("order-v1", BTreeMap::new())
        .await
        .expect("Failed to start");
    let task = engine.tasks(id).await.expect("tasks")[0].id;
    engine
        .complete_task(id, task, BTreeMap::new())
        .await
        .expect("Failed to complete task");

    let events = history.events().await;
    assert!(matches!(events.first(), Some(HistoryEvent::ProcessInstanceStart { .. })));
    assert!(matches!(
        events.last(),
        Some(HistoryEvent::ProcessInstanceEnd { canceled: false, .. })
    ));
    assert!(events.iter().all(|e| e.process_instance_id() == id));
    let started: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            HistoryEvent::ActivityInstanceStart { activity_id, .. } => Some(activity_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started.first(), Some(&"start"));
    assert!(started.contains(&"review"));
}

#[tokio::test]
async fn test_engine_history_level_none_records_nothing() {
    let history = Arc::new(InMemoryHistory::new());
    let config = EngineConfig {
        history_level: HistoryLevel::None,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config);
    engine.set_history_handler(history.clone());
    engine.deploy(order_process("order-v1", 1)).expect("Failed to deploy");

    engine
        .start_process_instance("order-v1", BTreeMap::new())
        .await
        .expect("Failed to start");

    assert!(history.events().await.is_empty());
}

#[tokio::test]
async fn test_engine_history_channel() {
    let config = EngineConfig::default();
    let (handler, mut events) = ChannelHistoryHandler::new(config.history_channel_capacity);
    let mut engine = Engine::new(config);
    engine.set_history_handler(Arc::new(handler));
    engine.deploy(order_process("order-v1", 1)).expect("Failed to deploy");

    let id = engine
        .start_process_instance("order-v1", BTreeMap::new())
        .await
        .expect("Failed to start");

    let first = events.recv().await.expect("history event");
    assert!(matches!(
        first,
        HistoryEvent::ProcessInstanceStart { process_instance_id, .. } if process_instance_id == id
    ));
}

#[tokio::test]
async fn test_engine_releases_locks_of_ended_instances() {
    let engine = Engine::new(EngineConfig::default());
    engine.deploy(order_process("order-v1", 1)).expect("Failed to deploy");

    // 1. A running instance keeps its lock entry
    let completed = engine
        .start_process_instance("order-v1", BTreeMap::new())
        .await
        .expect("Failed to start");
    let deleted = engine
        .start_process_instance("order-v1", BTreeMap::new())
        .await
        .expect("Failed to start");
    assert_eq!(engine.locked_instance_count(), 2);

    // 2. Ending or deleting drops it
    let task = engine.tasks(completed).await.expect("tasks")[0].id;
    engine
        .complete_task(completed, task, BTreeMap::new())
        .await
        .expect("Failed to complete task");
    assert_eq!(engine.locked_instance_count(), 1);

    engine
        .delete_process_instance(deleted, "no longer needed", false, false)
        .await
        .expect("Failed to delete");
    assert_eq!(engine.locked_instance_count(), 0);

    // 3. Rejected commands on ended instances leave nothing behind
    let err = engine.complete_task(completed, task, BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<PvmError>(), Some(PvmError::InstanceEnded(_))));
    assert_eq!(engine.locked_instance_count(), 0);
}
