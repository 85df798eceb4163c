use std::collections::BTreeMap;

use procvm::config::EngineConfig;
use procvm::definition::builder::ProcessBuilder;
use procvm::definition::{ActivityKind, ProcessDefinition, ScopeRef};
use procvm::error::MigrationError;
use procvm::migration::{
    self, AttachTarget, MigrationContext, MigrationOptions, MigrationPlan, parser,
};
use procvm::runtime::history::HistoryEvent;
use procvm::runtime::instance::ProcessInstance;
use procvm::runtime::interpreter::Interpreter;
use procvm::runtime::records::EventSubscriptionKind;
use procvm::runtime::services::RuntimeServices;
use procvm::runtime::execution::ExecutionId;
use procvm::runtime::tree::ExecutionTree;
use serde_json::{Value, json};

fn services() -> RuntimeServices {
    RuntimeServices::with_standard_components(EngineConfig::default())
}

fn start(definition: &ProcessDefinition, services: &RuntimeServices) -> ProcessInstance {
    let mut instance = ProcessInstance::new(&definition.id, None);
    Interpreter::new(&mut instance.tree, definition, services)
        .start(BTreeMap::new())
        .expect("Failed to start process");
    instance.refresh_state();
    instance
}

fn complete_task(instance: &mut ProcessInstance, definition: &ProcessDefinition, services: &RuntimeServices, activity_id: &str) {
    let execution = instance
        .tree
        .tasks
        .values()
        .find(|t| t.activity_id == activity_id)
        .and_then(|t| t.execution)
        .unwrap_or_else(|| panic!("no task for '{}'", activity_id));
    Interpreter::new(&mut instance.tree, definition, services)
        .signal(execution, "complete", &Value::Null)
        .expect("Failed to complete task");
    instance.refresh_state();
}

fn user_task_process(id: &str) -> ProcessDefinition {
    ProcessBuilder::new(id)
        .key("order")
        .start("start")
        .user_task("task")
        .end("end")
        .connect("start", "task")
        .connect("task", "end")
        .build()
        .unwrap()
}

fn nested_process(id: &str) -> ProcessDefinition {
    ProcessBuilder::new(id)
        .start("start")
        .sub_process("sub")
        .start("sub_start")
        .user_task("inner")
        .end("sub_end")
        .end_sub_process()
        .end("end")
        .connect("start", "sub")
        .connect("sub_start", "inner")
        .connect("inner", "sub_end")
        .connect("sub", "end")
        .build()
        .unwrap()
}

fn parallel_process(id: &str) -> ProcessDefinition {
    ProcessBuilder::new(id)
        .start("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .parallel_gateway("join")
        .end("end")
        .connect("start", "fork")
        .connect("fork", "a")
        .connect("fork", "b")
        .connect("a", "join")
        .connect("b", "join")
        .connect("join", "end")
        .build()
        .unwrap()
}

fn async_before_process(id: &str) -> ProcessDefinition {
    ProcessBuilder::new(id)
        .start("start")
        .activity("work", ActivityKind::Task)
        .async_before()
        .done()
        .end("end")
        .connect("start", "work")
        .connect("work", "end")
        .build()
        .unwrap()
}

#[test]
fn test_migrate_into_new_sub_process() {
    let services = services();
    let source = user_task_process("order-v1");
    let target = ProcessBuilder::new("order-v2")
        .start("start")
        .sub_process("sub")
        .start("sub_start")
        .user_task("task")
        .end("sub_end")
        .end_sub_process()
        .end("end")
        .connect("start", "sub")
        .connect("sub_start", "task")
        .connect("task", "sub_end")
        .connect("sub", "end")
        .build()
        .unwrap();
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("task", "task")
        .build()
        .expect("valid plan");

    // 1. Start on the flat model
    let mut instance = start(&source, &services);
    let root = instance.tree.root();
    let task_instance = instance.tree[root].activity_instance_id.clone().expect("task instance");

    // 2. Migrate
    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    // 3. The task now lives in a freshly entered subprocess
    assert_eq!(instance.definition_id, "order-v2");
    let task = instance.tree.tasks.values().next().expect("task");
    let execution = task.execution.expect("attached task");
    let scope = instance.tree[execution].clone();
    assert_eq!(scope.parent, Some(root));
    assert_eq!(scope.scope_activity, Some(ScopeRef::activity("sub")));
    assert_eq!(scope.activity.as_deref(), Some("task"));
    assert!(instance.tree.check_well_formed().is_empty());

    let instances = instance.tree.activity_instance_tree(&target.id);
    let sub = instances.instances_for_activity("sub");
    assert_eq!(sub.len(), 1);
    assert_eq!(sub[0].child_activity_instances[0].id, task_instance);

    // 4. The instance continues on the target model
    complete_task(&mut instance, &target, &services, "task");
    assert!(instance.ended);
}

#[test]
fn test_unmapped_leaf_is_reported_and_nothing_changes() {
    let services = services();
    let source = user_task_process("order-v1");
    let target = user_task_process("order-v2");
    let plan = MigrationPlan::builder(&source, &target).build().expect("valid plan");

    let mut instance = start(&source, &services);
    let before = instance.tree.render();
    let root = instance.tree.root();
    let task_instance = instance.tree[root].activity_instance_id.clone().expect("task instance");

    let err = migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .unwrap_err();

    match err {
        MigrationError::InvalidInstance(report) => {
            assert_eq!(report.instance_ids(), vec![task_instance.as_str()]);
            assert!(report.activity_instance_reports[0].failures[0].contains("no migration instruction"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(instance.tree.render(), before);
    assert_eq!(instance.definition_id, "order-v1");
}

#[test]
fn test_ambiguous_async_after_resumption() {
    let services = services();
    let source = ProcessBuilder::new("async-v1")
        .start("start")
        .activity("task", ActivityKind::Task)
        .async_after()
        .done()
        .end("end")
        .connect("start", "task")
        .connect_with_id("flow1", "task", "end")
        .build()
        .unwrap();
    let target = ProcessBuilder::new("async-v2")
        .start("start")
        .activity("task", ActivityKind::Task)
        .async_after()
        .done()
        .end("end_c")
        .end("end_d")
        .connect("start", "task")
        .connect_with_id("c", "task", "end_c")
        .connect_with_id("d", "task", "end_d")
        .build()
        .unwrap();
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("task", "task")
        .build()
        .expect("valid plan");

    let mut instance = start(&source, &services);
    assert_eq!(instance.tree.jobs.len(), 1);

    let err = migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .unwrap_err();

    let MigrationError::InvalidInstance(report) = err else {
        panic!("expected an instance report");
    };
    assert!(report.activity_instance_reports.is_empty());
    assert_eq!(report.transition_instance_reports.len(), 1);
    assert!(
        report.transition_instance_reports[0]
            .failures
            .iter()
            .any(|f| f.contains("ambiguous resumption point"))
    );
}

#[test]
fn test_identical_models_conserve_every_record() {
    let services = services();

    // 1. Concurrent branches
    let source = parallel_process("fork-v1");
    let target = parallel_process("fork-v2");
    let plan = MigrationPlan::builder(&source, &target)
        .map_equal_activities()
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    let counts = instance.tree.record_counts();
    let shape = instance.tree.len();

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    assert_eq!(instance.tree.record_counts(), counts);
    assert_eq!(instance.tree.len(), shape);
    assert_eq!(instance.definition_id, "fork-v2");
    assert!(instance.tree.executions().all(|e| e.process_definition_id == "fork-v2"));
    complete_task(&mut instance, &target, &services, "a");
    complete_task(&mut instance, &target, &services, "b");
    assert!(instance.ended);

    // 2. Nested scope
    let source = nested_process("nested-v1");
    let target = nested_process("nested-v2");
    let plan = MigrationPlan::builder(&source, &target)
        .map_equal_activities()
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    let counts = instance.tree.record_counts();
    let before = instance.tree.activity_instance_tree(&source.id);

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    assert_eq!(instance.tree.record_counts(), counts);
    let after = instance.tree.activity_instance_tree(&target.id);
    assert_eq!(
        after.instances_for_activity("inner")[0].id,
        before.instances_for_activity("inner")[0].id
    );
    assert_eq!(after.instances_for_activity("sub")[0].id, before.instances_for_activity("sub")[0].id);
    complete_task(&mut instance, &target, &services, "inner");
    assert!(instance.ended);
}

#[test]
fn test_resolve_representative_is_stable() {
    let services = services();
    let source = nested_process("nested-v1");
    let target = nested_process("nested-v2");
    let plan = MigrationPlan::builder(&source, &target)
        .map_equal_activities()
        .build()
        .expect("valid plan");
    let instance = start(&source, &services);

    let migrating = parser::parse(&instance.tree, &source, &target, &plan).expect("Failed to parse");

    let inner = migrating.instances_for_source("inner")[0];
    let sub = migrating.instances_for_source("sub")[0];
    let first = migrating.resolve_representative(&instance.tree, inner).expect("representative");
    let second = migrating.resolve_representative(&instance.tree, inner).expect("representative");
    assert_eq!(first, second);
    assert_eq!(
        migrating.resolve_representative(&instance.tree, sub).expect("representative"),
        first
    );
    assert_eq!(instance.tree[first].scope_activity, Some(ScopeRef::activity("sub")));
}

#[test]
fn test_attaching_to_transition_instance_is_rejected() {
    let services = services();
    let source = async_before_process("async-v1");
    let target = async_before_process("async-v2");
    let plan = MigrationPlan::builder(&source, &target)
        .map_equal_activities()
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);

    let mut migrating = parser::parse(&instance.tree, &source, &target, &plan).expect("Failed to parse");
    let transition = migrating.instances_for_source("work")[0];
    let root = migrating.root();
    let mut ctx = MigrationContext::new(
        &mut instance.tree,
        &source,
        &target,
        &services,
        MigrationOptions::default(),
    );

    let err = migrating
        .attach_state(&mut ctx, root, AttachTarget::TransitionInstance(transition))
        .unwrap_err();

    assert!(matches!(err, MigrationError::IllegalAttachTarget { .. }), "{}", err);
}

#[test]
fn test_async_before_job_survives_migration() {
    let services = services();
    let source = async_before_process("async-v1");
    let target = async_before_process("async-v2");
    let plan = MigrationPlan::builder(&source, &target)
        .map_equal_activities()
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    let job = *instance.tree.jobs.keys().next().expect("async job");

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    let migrated = &instance.tree.jobs[&job];
    assert_eq!(migrated.process_definition_id, "async-v2");
    assert_eq!(migrated.activity_id, "work");
    assert_eq!(migrated.execution, Some(instance.tree.root()));

    Interpreter::new(&mut instance.tree, &target, &services)
        .execute_job(job)
        .expect("Failed to execute job");
    instance.refresh_state();
    assert!(instance.ended);
}

#[test]
fn test_emerging_boundary_event_gets_subscription() {
    let services = services();
    let source = user_task_process("order-v1");
    let target = ProcessBuilder::new("order-v2")
        .start("start")
        .user_task("task")
        .boundary_message("cancel", "task", "cancel-order", true)
        .user_task("after")
        .end("end")
        .end("canceled")
        .connect("start", "task")
        .connect("task", "end")
        .connect("cancel", "after")
        .connect("after", "canceled")
        .build()
        .unwrap();
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("task", "task")
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    // 1. The task became a scope carrying the new subscription
    let root = instance.tree.root();
    let children = instance.tree.children(root);
    assert_eq!(children.len(), 1);
    let scope = children[0];
    assert!(instance.tree[scope].is_scope);
    assert_eq!(instance.tree.tasks.values().next().and_then(|t| t.execution), Some(scope));
    let subscriptions = instance.tree.subscriptions_of(scope, EventSubscriptionKind::Message);
    assert_eq!(subscriptions.len(), 1);
    let subscription = subscriptions[0];
    assert_eq!(
        instance.tree.event_subscriptions[&subscription].event_name.as_deref(),
        Some("cancel-order")
    );
    assert!(instance.tree.check_well_formed().is_empty());

    // 2. The boundary event works on the target model
    Interpreter::new(&mut instance.tree, &target, &services)
        .trigger_subscription(subscription, &Value::Null)
        .expect("Failed to trigger subscription");
    assert!(!instance.tree.contains(scope));
    let task = instance.tree.tasks.values().next().expect("task");
    assert_eq!(task.activity_id, "after");
    assert_eq!(task.execution, Some(root));
}

#[test]
fn test_unmapped_sub_process_is_removed() {
    let services = services();
    let source = nested_process("nested-v1");
    let target = ProcessBuilder::new("flat-v2")
        .start("start")
        .user_task("inner")
        .end("end")
        .connect("start", "inner")
        .connect("inner", "end")
        .build()
        .unwrap();
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("inner", "inner")
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    let inner_instance = instance
        .tree
        .activity_instance_tree(&source.id)
        .instances_for_activity("inner")[0]
        .id
        .clone();

    let history = migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    let root = instance.tree.root();
    assert_eq!(instance.tree.len(), 1);
    assert_eq!(instance.tree[root].activity.as_deref(), Some("inner"));
    assert_eq!(instance.tree[root].activity_instance_id.as_deref(), Some(inner_instance.as_str()));
    assert_eq!(instance.tree.tasks.values().next().and_then(|t| t.execution), Some(root));
    assert!(history.iter().any(|e| matches!(
        e,
        HistoryEvent::ActivityInstanceEnd { activity_id, canceled: true, .. } if activity_id == "sub"
    )));
    assert!(history.iter().any(|e| matches!(e, HistoryEvent::ProcessInstanceMigrate { .. })));

    complete_task(&mut instance, &target, &services, "inner");
    assert!(instance.ended);
}

#[test]
fn test_plan_for_other_definition_is_rejected() {
    let services = services();
    let source = user_task_process("order-v1");
    let other = user_task_process("order-v0");
    let target = user_task_process("order-v2");
    let plan = MigrationPlan::builder(&other, &target)
        .map_equal_activities()
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);

    let err = migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .unwrap_err();

    assert!(matches!(err, MigrationError::InvalidPlan { .. }), "{}", err);
}

#[test]
fn test_invalid_instructions_are_collected() {
    let source = user_task_process("order-v1");
    let target = parallel_process("fork-v2");

    let err = MigrationPlan::builder(&source, &target)
        .map_activities("task", "fork")
        .map_activities("missing", "a")
        .build()
        .unwrap_err();

    let MigrationError::InvalidPlan { failures, .. } = err else {
        panic!("expected an invalid plan");
    };
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|f| f.contains("cannot be mapped")));
    assert!(failures.iter().any(|f| f.contains("does not exist")));
}

fn compensation_process(id: &str, compensable: &str) -> ProcessDefinition {
    ProcessBuilder::new(id)
        .start("start")
        .service_task(compensable, "log")
        .param("msg", "booked")
        .compensation_handler("cancel_booking")
        .done()
        .user_task("confirm")
        .end("end")
        .connect("start", compensable)
        .connect(compensable, "confirm")
        .connect("confirm", "end")
        .build()
        .unwrap()
}

/// Scope execution of `scope` on the way from `execution` up to the root.
fn enclosing_scope(tree: &ExecutionTree, execution: ExecutionId, scope: &ScopeRef) -> Option<ExecutionId> {
    let mut current = Some(execution);
    while let Some(id) = current {
        if tree[id].scope_activity.as_ref() == Some(scope) {
            return Some(id);
        }
        current = tree.parent(id);
    }
    None
}

#[test]
fn test_task_losing_boundary_event_stops_being_a_scope() {
    let services = services();
    let source = ProcessBuilder::new("timer-v1")
        .start("start")
        .user_task("task")
        .boundary_timer("timeout", "task", 60_000, true)
        .end("end")
        .end("timed_out")
        .connect("start", "task")
        .connect("task", "end")
        .connect("timeout", "timed_out")
        .build()
        .unwrap();
    let target = user_task_process("timer-v2");
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("task", "task")
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    let root = instance.tree.root();

    // 1. The task runs in its own scope execution next to a timer job
    let scope = instance
        .tree
        .tasks
        .values()
        .next()
        .and_then(|t| t.execution)
        .expect("task execution");
    assert_ne!(scope, root);
    assert!(instance.tree[scope].is_scope);
    assert_eq!(instance.tree.jobs.len(), 1);
    instance.tree.set_variable_local(scope, "note", json!("urgent"));

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    // 2. The scope execution is gone; the root carries the task
    assert_eq!(instance.tree.len(), 1);
    assert!(!instance.tree.contains(scope));
    assert_eq!(instance.tree[root].activity.as_deref(), Some("task"));
    assert!(instance.tree[root].is_active);
    assert!(instance.tree.jobs.is_empty());
    assert_eq!(instance.tree.variable_local(root, "note"), Some(&json!("urgent")));
    let task = instance.tree.tasks.values().next().expect("task");
    assert_eq!(task.execution, Some(root));
    assert_eq!(task.process_definition_id, "timer-v2");
    assert!(instance.tree.check_well_formed().is_empty(), "{:?}", instance.tree.check_well_formed());

    // 3. The instance continues on the target
    complete_task(&mut instance, &target, &services, "task");
    assert!(instance.ended);
}

#[test]
fn test_event_scope_moves_into_new_outer_scope() {
    let services = services();
    let source = ProcessBuilder::new("booking-v1")
        .start("start")
        .sub_process("sub")
        .start("sub_start")
        .service_task("book", "log")
        .compensation_handler("cancel_booking")
        .done()
        .end("sub_end")
        .end_sub_process()
        .user_task("confirm")
        .end("end")
        .connect("start", "sub")
        .connect("sub_start", "book")
        .connect("book", "sub_end")
        .connect("sub", "confirm")
        .connect("confirm", "end")
        .build()
        .unwrap();
    let target = ProcessBuilder::new("booking-v2")
        .start("start")
        .sub_process("outer")
        .start("outer_start")
        .sub_process("sub")
        .start("sub_start")
        .service_task("book", "log")
        .compensation_handler("cancel_booking")
        .done()
        .end("sub_end")
        .end_sub_process()
        .end("outer_end")
        .end_sub_process()
        .user_task("confirm")
        .end("end")
        .connect("start", "outer")
        .connect("outer_start", "sub")
        .connect("sub_start", "book")
        .connect("book", "sub_end")
        .connect("sub", "outer_end")
        .connect("outer", "confirm")
        .connect("confirm", "end")
        .build()
        .unwrap();
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("confirm", "confirm")
        .map_activities("sub", "sub")
        .map_activities("book", "book")
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    let root = instance.tree.root();
    let sub_scope = instance.tree.event_scope_children(root)[0];
    let sub_subscription = instance.tree.subscriptions_of(root, EventSubscriptionKind::Compensate)[0];
    let book_subscription = instance.tree.subscriptions_of(sub_scope, EventSubscriptionKind::Compensate)[0];

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    // 1. A new event scope for the outer sub process hosts the old one
    let tree = &instance.tree;
    assert_eq!(tree[root].activity.as_deref(), Some("confirm"));
    let event_scopes = tree.event_scope_children(root);
    assert_eq!(event_scopes.len(), 1);
    let outer_scope = event_scopes[0];
    assert_ne!(outer_scope, sub_scope);
    assert!(tree[outer_scope].is_scope);
    assert!(tree[outer_scope].is_event_scope);
    assert_eq!(tree[outer_scope].activity.as_deref(), Some("outer"));
    assert_eq!(tree[outer_scope].scope_activity, Some(ScopeRef::activity("outer")));
    assert_eq!(tree.event_scope_children(outer_scope), vec![sub_scope]);
    assert_eq!(tree[sub_scope].activity.as_deref(), Some("sub"));

    // 2. Each event scope is referenced by a compensate subscription on its parent
    let on_root = tree.subscriptions_of(root, EventSubscriptionKind::Compensate);
    assert_eq!(on_root.len(), 1);
    assert_eq!(tree.event_subscriptions[&on_root[0]].activity_id, "outer");
    assert_eq!(tree.event_subscriptions[&on_root[0]].configuration, Some(outer_scope));
    assert_eq!(
        tree.subscriptions_of(outer_scope, EventSubscriptionKind::Compensate),
        vec![sub_subscription]
    );
    assert_eq!(tree.event_subscriptions[&sub_subscription].configuration, Some(sub_scope));
    assert_eq!(
        tree.subscriptions_of(sub_scope, EventSubscriptionKind::Compensate),
        vec![book_subscription]
    );
    assert_eq!(tree.event_subscriptions[&book_subscription].process_definition_id, "booking-v2");
    assert!(tree.check_well_formed().is_empty(), "{:?}", tree.check_well_formed());

    // 3. Event scopes do not show up as activity instances
    let instances = tree.activity_instance_tree(&target.id);
    assert!(instances.instances_for_activity("outer").is_empty());
    assert_eq!(instances.instances_for_activity("confirm").len(), 1);
}

#[test]
fn test_compensation_subscription_keeps_its_identity() {
    let services = services();
    let source = compensation_process("booking-v1", "book");
    let target = compensation_process("booking-v2", "reserve");
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("confirm", "confirm")
        .map_activities("book", "reserve")
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    let root = instance.tree.root();
    let subscription = instance.tree.subscriptions_of(root, EventSubscriptionKind::Compensate)[0];

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    assert_eq!(
        instance.tree.subscriptions_of(root, EventSubscriptionKind::Compensate),
        vec![subscription]
    );
    let migrated = &instance.tree.event_subscriptions[&subscription];
    assert_eq!(migrated.activity_id, "reserve");
    assert_eq!(migrated.process_definition_id, "booking-v2");
    assert_eq!(migrated.configuration, None);
    assert!(instance.tree.check_well_formed().is_empty());
}

#[test]
fn test_unmapped_compensation_subscription_is_removed() {
    let services = services();
    let source = compensation_process("booking-v1", "book");
    let target = compensation_process("booking-v2", "reserve");
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("confirm", "confirm")
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    assert_eq!(instance.tree.event_subscriptions.len(), 1);

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    assert!(instance.tree.event_subscriptions.is_empty());
    assert_eq!(instance.tree.tasks.values().next().map(|t| t.activity_id.as_str()), Some("confirm"));
}

#[test]
fn test_async_transition_instance_moves_into_new_sub_process() {
    let services = services();
    let source = ProcessBuilder::new("fork-v1")
        .start("start")
        .parallel_gateway("fork")
        .user_task("a")
        .activity("b", ActivityKind::Task)
        .async_before()
        .done()
        .parallel_gateway("join")
        .end("end")
        .connect("start", "fork")
        .connect("fork", "a")
        .connect("fork", "b")
        .connect("a", "join")
        .connect("b", "join")
        .connect("join", "end")
        .build()
        .unwrap();
    let target = ProcessBuilder::new("fork-v2")
        .start("start")
        .parallel_gateway("fork")
        .user_task("a")
        .sub_process("sub")
        .start("sub_start")
        .activity("b", ActivityKind::Task)
        .async_before()
        .done()
        .end("sub_end")
        .end_sub_process()
        .parallel_gateway("join")
        .end("end")
        .connect("start", "fork")
        .connect("fork", "a")
        .connect("fork", "sub")
        .connect("sub_start", "b")
        .connect("b", "sub_end")
        .connect("a", "join")
        .connect("sub", "join")
        .connect("join", "end")
        .build()
        .unwrap();
    let plan = MigrationPlan::builder(&source, &target)
        .map_activities("a", "a")
        .map_activities("b", "b")
        .build()
        .expect("valid plan");
    let mut instance = start(&source, &services);
    let job = *instance.tree.jobs.keys().next().expect("async job");

    migration::migrate(&mut instance, &plan, MigrationOptions::default(), &source, &target, &services)
        .expect("Failed to migrate");

    // 1. The job now waits inside an instance of the new sub process
    let migrated = &instance.tree.jobs[&job];
    assert_eq!(migrated.activity_id, "b");
    assert_eq!(migrated.process_definition_id, "fork-v2");
    let execution = migrated.execution.expect("job execution");
    assert!(enclosing_scope(&instance.tree, execution, &ScopeRef::activity("sub")).is_some());
    let instances = instance.tree.activity_instance_tree(&target.id);
    assert_eq!(instances.instances_for_activity("sub").len(), 1);
    assert!(instance.tree.check_well_formed().is_empty(), "{:?}", instance.tree.check_well_formed());

    // 2. Running the job completes the sub process; the branch waits in the join
    Interpreter::new(&mut instance.tree, &target, &services)
        .execute_job(job)
        .expect("Failed to execute job");
    instance.refresh_state();
    assert!(!instance.ended);
    assert!(instance.tree.jobs.is_empty());
    let instances = instance.tree.activity_instance_tree(&target.id);
    assert!(instances.instances_for_activity("sub").is_empty());
    assert!(instance.tree.check_well_formed().is_empty());

    // 3. The other branch completes the instance
    complete_task(&mut instance, &target, &services, "a");
    assert!(instance.ended);
}
