use std::collections::BTreeMap;
use std::sync::Arc;

use procvm::config::EngineConfig;
use procvm::definition::builder::ProcessBuilder;
use procvm::definition::{ActivityKind, ProcessDefinition};
use procvm::error::PvmError;
use procvm::runtime::execution::ExecutionId;
use procvm::runtime::history::HistoryEvent;
use procvm::runtime::interpreter::Interpreter;
use procvm::runtime::job::AsyncResumePoint;
use procvm::runtime::listener::RecordingListener;
use procvm::runtime::records::{EventSubscriptionKind, JobKind};
use procvm::runtime::services::RuntimeServices;
use procvm::runtime::tree::ExecutionTree;
use serde_json::{Value, json};
use uuid::Uuid;

fn services() -> RuntimeServices {
    RuntimeServices::with_standard_components(EngineConfig::default())
}

fn start(definition: &ProcessDefinition, services: &RuntimeServices) -> ExecutionTree {
    let mut tree = ExecutionTree::new(Uuid::new_v4(), &definition.id);
    Interpreter::new(&mut tree, definition, services)
        .start(BTreeMap::new())
        .expect("Failed to start process");
    tree
}

fn signal(tree: &mut ExecutionTree, definition: &ProcessDefinition, services: &RuntimeServices, execution: ExecutionId) {
    Interpreter::new(tree, definition, services)
        .signal(execution, "complete", &Value::Null)
        .expect("Failed to signal execution");
}

fn task_execution(tree: &ExecutionTree, activity_id: &str) -> ExecutionId {
    tree.tasks
        .values()
        .find(|t| t.activity_id == activity_id)
        .and_then(|t| t.execution)
        .unwrap_or_else(|| panic!("no task for '{}'", activity_id))
}

#[test]
fn test_linear_process_waits_in_user_task() {
    let definition = ProcessBuilder::new("linear")
        .start("start")
        .user_task("review")
        .end("end")
        .connect("start", "review")
        .connect("review", "end")
        .build()
        .unwrap();
    let services = services();

    let mut tree = start(&definition, &services);
    let root = tree.root();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[root].activity.as_deref(), Some("review"));
    assert_eq!(tree.tasks.len(), 1);
    let instances = tree.activity_instance_tree(&definition.id);
    assert_eq!(instances.instances_for_activity("review").len(), 1);

    signal(&mut tree, &definition, &services, root);

    assert!(tree[root].is_ended);
    assert!(tree.tasks.is_empty());
}

#[test]
fn test_parallel_fork_and_join() {
    let definition = ProcessBuilder::new("parallel")
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
        .unwrap();
    let services = services();

    // 1. Fork
    let mut tree = start(&definition, &services);
    let root = tree.root();
    assert_eq!(tree.children(root).len(), 2);
    assert!(!tree[root].is_active);
    assert_eq!(tree.tasks.len(), 2);
    assert!(tree.check_well_formed().is_empty());
    let a = task_execution(&tree, "a");
    let b = task_execution(&tree, "b");
    assert!(tree[a].is_concurrent);
    assert!(tree[b].is_concurrent);

    // 2. First branch waits in the join
    signal(&mut tree, &definition, &services, a);
    assert_eq!(tree[a].activity.as_deref(), Some("join"));
    assert!(!tree[a].is_active);
    assert!(tree.check_well_formed().is_empty());

    // 3. Second branch completes the join
    signal(&mut tree, &definition, &services, b);
    assert_eq!(tree.len(), 1);
    assert!(tree[root].is_ended);
}

#[test]
fn test_sub_process_creates_scope_execution() {
    let definition = ProcessBuilder::new("nested")
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
        .unwrap();
    let services = services();

    let mut tree = start(&definition, &services);
    let root = tree.root();
    let scope = task_execution(&tree, "inner");
    assert_eq!(tree.parent(scope), Some(root));
    assert!(tree[scope].is_scope);
    assert!(!tree[root].is_active);

    let instances = tree.activity_instance_tree(&definition.id);
    let sub = instances.instances_for_activity("sub");
    assert_eq!(sub.len(), 1);
    assert_eq!(sub[0].child_activity_instances[0].activity_id, "inner");

    signal(&mut tree, &definition, &services, scope);
    assert!(!tree.contains(scope));
    assert!(tree[root].is_ended);
}

#[test]
fn test_interrupting_message_boundary_cancels_activity() {
    let definition = ProcessBuilder::new("boundary")
        .start("start")
        .user_task("task")
        .boundary_message("cancel", "task", "cancel-order", true)
        .user_task("handle")
        .end("end")
        .end("handled")
        .connect("start", "task")
        .connect("task", "end")
        .connect("cancel", "handle")
        .connect("handle", "handled")
        .build()
        .unwrap();
    let services = services();

    let mut tree = start(&definition, &services);
    let scope = task_execution(&tree, "task");
    assert!(tree[scope].is_scope);
    let subscription = tree
        .subscriptions_of(scope, EventSubscriptionKind::Message)
        .pop()
        .expect("boundary subscription");

    Interpreter::new(&mut tree, &definition, &services)
        .trigger_subscription(subscription, &Value::Null)
        .expect("Failed to trigger subscription");

    assert!(!tree.contains(scope));
    assert!(tree.event_subscriptions.is_empty());
    assert_eq!(tree.tasks.len(), 1);
    assert_eq!(task_execution(&tree, "handle"), tree.root());
}

#[test]
fn test_non_interrupting_timer_adds_concurrent_branch() {
    let definition = ProcessBuilder::new("timer")
        .start("start")
        .user_task("task")
        .boundary_timer("reminder", "task", 60_000, false)
        .user_task("escalate")
        .end("end")
        .end("escalated")
        .connect("start", "task")
        .connect("task", "end")
        .connect("reminder", "escalate")
        .connect("escalate", "escalated")
        .build()
        .unwrap();
    let services = services();

    let mut tree = start(&definition, &services);
    let scope = task_execution(&tree, "task");
    let timer = tree.jobs_of(scope).pop().expect("timer job");
    assert!(matches!(tree.jobs[&timer].kind, JobKind::Timer { due_millis: 60_000 }));

    // 1. The timer fires next to the still running task
    Interpreter::new(&mut tree, &definition, &services)
        .execute_job(timer)
        .expect("Failed to execute timer");
    assert_eq!(tree.tasks.len(), 2);
    assert!(tree.contains(scope));
    assert!(tree.check_well_formed().is_empty(), "{:?}", tree.check_well_formed());

    // 2. Completing the task compacts the tree again
    signal(&mut tree, &definition, &services, scope);
    let root = tree.root();
    assert!(tree.children(root).is_empty());
    assert_eq!(task_execution(&tree, "escalate"), root);

    signal(&mut tree, &definition, &services, root);
    assert!(tree[root].is_ended);
}

#[test]
fn test_bpmn_error_is_caught_by_error_boundary() {
    let definition = ProcessBuilder::new("errors")
        .start("start")
        .service_task("charge", "fail")
        .param("error_code", "card-declined")
        .done()
        .boundary_error("declined", "charge", Some("card-declined"))
        .user_task("fix_payment")
        .end("end")
        .end("fixed")
        .connect("start", "charge")
        .connect("charge", "end")
        .connect("declined", "fix_payment")
        .connect("fix_payment", "fixed")
        .build()
        .unwrap();
    let services = services();

    let tree = start(&definition, &services);
    assert_eq!(tree.len(), 1);
    assert_eq!(task_execution(&tree, "fix_payment"), tree.root());
}

#[test]
fn test_uncaught_bpmn_error_fails_the_operation() {
    let definition = ProcessBuilder::new("uncaught")
        .start("start")
        .service_task("charge", "fail")
        .param("error_code", "timeout")
        .done()
        .boundary_error("declined", "charge", Some("card-declined"))
        .end("end")
        .end("fixed")
        .connect("start", "charge")
        .connect("charge", "end")
        .connect("declined", "fixed")
        .build()
        .unwrap();
    let services = services();
    let mut tree = ExecutionTree::new(Uuid::new_v4(), &definition.id);

    let err = Interpreter::new(&mut tree, &definition, &services)
        .start(BTreeMap::new())
        .unwrap_err();

    match err {
        PvmError::UncaughtError { code, activity } => {
            assert_eq!(code, "timeout");
            assert_eq!(activity, "charge");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_async_before_suspends_into_job() {
    let definition = ProcessBuilder::new("async")
        .start("start")
        .activity("work", ActivityKind::Task)
        .async_before()
        .done()
        .end("end")
        .connect("start", "work")
        .connect("work", "end")
        .build()
        .unwrap();
    let services = services();

    let mut tree = start(&definition, &services);
    let root = tree.root();
    let job = tree.jobs.values().next().expect("async job").clone();
    assert_eq!(job.resume_point(), Some(&AsyncResumePoint::TransitionCreateScope));
    assert_eq!(job.retries, EngineConfig::default().default_job_retries);

    let instances = tree.activity_instance_tree(&definition.id);
    let transitions = instances.transition_instances_for_activity("work");
    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].execution_id, root);

    Interpreter::new(&mut tree, &definition, &services)
        .execute_job(job.id)
        .expect("Failed to execute job");
    assert!(tree.jobs.is_empty());
    assert!(tree[root].is_ended);
}

#[test]
fn test_async_after_resumes_on_outgoing_transition() {
    let definition = ProcessBuilder::new("async-after")
        .start("start")
        .activity("work", ActivityKind::Task)
        .async_after()
        .done()
        .end("end")
        .connect("start", "work")
        .connect_with_id("done", "work", "end")
        .build()
        .unwrap();
    let services = services();

    let tree = start(&definition, &services);
    let job = tree.jobs.values().next().expect("async job");
    assert_eq!(job.resume_point(), Some(&AsyncResumePoint::Transition("done".to_string())));
    assert_eq!(job.activity_id, "work");
}

#[test]
fn test_compensation_handler_leaves_subscription() {
    let definition = ProcessBuilder::new("compensation")
        .start("start")
        .service_task("book", "log")
        .param("msg", "booked")
        .compensation_handler("cancel_booking")
        .done()
        .user_task("confirm")
        .end("end")
        .connect("start", "book")
        .connect("book", "confirm")
        .connect("confirm", "end")
        .build()
        .unwrap();
    let services = services();

    let tree = start(&definition, &services);
    let root = tree.root();
    let subscriptions = tree.subscriptions_of(root, EventSubscriptionKind::Compensate);
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(tree.event_subscriptions[&subscriptions[0]].activity_id, "book");
}

#[test]
fn test_completed_sub_process_keeps_event_scope() {
    let definition = ProcessBuilder::new("event-scope")
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
    let services = services();

    let tree = start(&definition, &services);
    let root = tree.root();
    let event_scopes = tree.event_scope_children(root);
    assert_eq!(event_scopes.len(), 1);
    let event_scope = event_scopes[0];
    assert!(tree[event_scope].is_event_scope);

    let on_root = tree.subscriptions_of(root, EventSubscriptionKind::Compensate);
    assert_eq!(on_root.len(), 1);
    assert_eq!(tree.event_subscriptions[&on_root[0]].configuration, Some(event_scope));
    assert_eq!(tree.subscriptions_of(event_scope, EventSubscriptionKind::Compensate).len(), 1);

    // event scopes are not part of the activity instance tree
    let instances = tree.activity_instance_tree(&definition.id);
    assert!(instances.instances_for_activity("sub").is_empty());
    assert_eq!(instances.instances_for_activity("confirm").len(), 1);
}

#[test]
fn test_delete_process_instance_cancels_everything() {
    let definition = ProcessBuilder::new("delete")
        .start("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .end("end_a")
        .end("end_b")
        .connect("start", "fork")
        .connect("fork", "a")
        .connect("fork", "b")
        .connect("a", "end_a")
        .connect("b", "end_b")
        .build()
        .unwrap();
    let services = services();

    let mut tree = start(&definition, &services);
    let history = {
        let mut pvm = Interpreter::new(&mut tree, &definition, &services);
        pvm.delete_process_instance("no longer needed", false, false)
            .expect("Failed to delete");
        pvm.take_history()
    };

    let root = tree.root();
    assert!(tree[root].is_ended);
    assert!(tree.children(root).is_empty());
    assert!(tree.tasks.is_empty());
    let canceled: Vec<&str> = history
        .iter()
        .filter_map(|e| match e {
            HistoryEvent::ActivityInstanceEnd {
                activity_id,
                canceled: true,
                ..
            } => Some(activity_id.as_str()),
            _ => None,
        })
        .collect();
    assert!(canceled.contains(&"a"));
    assert!(canceled.contains(&"b"));
    assert!(history.iter().any(|e| matches!(e, HistoryEvent::ProcessInstanceEnd { canceled: true, .. })));
}

#[test]
fn test_io_mappings_and_listeners() {
    let definition = ProcessBuilder::new("mappings")
        .start_listener("trace")
        .start("start")
        .activity("review", ActivityKind::UserTask)
        .input("limit", 100)
        .output("reviewed", true)
        .start_listener("trace")
        .end_listener("trace")
        .done()
        .end("end")
        .connect("start", "review")
        .connect("review", "end")
        .build()
        .unwrap();
    let mut services = services();
    services.register_listener(Arc::new(RecordingListener::new("trace", "events")));

    let mut tree = start(&definition, &services);
    let root = tree.root();
    let scope = task_execution(&tree, "review");
    assert_ne!(scope, root);
    assert_eq!(tree.variable_local(scope, "limit"), Some(&json!(100)));

    signal(&mut tree, &definition, &services, scope);

    assert_eq!(tree.variable_local(root, "reviewed"), Some(&json!(true)));
    assert_eq!(tree.variable_local(root, "limit"), None);
    assert_eq!(
        tree.variable_local(root, "events"),
        Some(&json!(["start:mappings", "start:review", "end:review"]))
    );
}

#[test]
fn test_skip_flags_suppress_listeners_and_outputs() {
    let definition = ProcessBuilder::new("skip")
        .start("start")
        .activity("review", ActivityKind::UserTask)
        .output("reviewed", true)
        .end_listener("trace")
        .done()
        .end("end")
        .connect("start", "review")
        .connect("review", "end")
        .build()
        .unwrap();
    let mut services = services();
    services.register_listener(Arc::new(RecordingListener::new("trace", "events")));

    let mut tree = start(&definition, &services);
    Interpreter::new(&mut tree, &definition, &services)
        .delete_process_instance("skip everything", true, true)
        .expect("Failed to delete");

    let root = tree.root();
    assert!(tree[root].is_ended);
    assert_eq!(tree.variable_local(root, "events"), None);
    assert_eq!(tree.variable_local(root, "reviewed"), None);
}

#[test]
fn test_last_of_three_branches_is_pruned_into_scope() {
    let definition = ProcessBuilder::new("three-way")
        .start("start")
        .parallel_gateway("fork")
        .user_task("a")
        .user_task("b")
        .user_task("c")
        .end("end_a")
        .end("end_b")
        .end("end_c")
        .connect("start", "fork")
        .connect("fork", "a")
        .connect("fork", "b")
        .connect("fork", "c")
        .connect("a", "end_a")
        .connect("b", "end_b")
        .connect("c", "end_c")
        .build()
        .unwrap();
    let services = services();

    // 1. Three concurrent branches
    let mut tree = start(&definition, &services);
    let root = tree.root();
    assert_eq!(tree.children(root).len(), 3);
    assert!(tree.check_well_formed().is_empty());

    // 2. Two branches end; the concurrent tree stays expanded until the last one
    let a = task_execution(&tree, "a");
    signal(&mut tree, &definition, &services, a);
    assert_eq!(tree.children(root).len(), 2);
    assert!(tree.check_well_formed().is_empty());

    let b = task_execution(&tree, "b");
    signal(&mut tree, &definition, &services, b);

    // 3. The remaining branch was folded into the scope execution
    assert_eq!(tree.len(), 1);
    assert!(tree.children(root).is_empty());
    assert_eq!(tree[root].activity.as_deref(), Some("c"));
    assert!(tree[root].is_active);
    assert!(!tree[root].is_concurrent);
    assert_eq!(task_execution(&tree, "c"), root);
    assert!(tree.check_well_formed().is_empty(), "{:?}", tree.check_well_formed());

    signal(&mut tree, &definition, &services, root);
    assert!(tree[root].is_ended);
}

#[test]
fn test_fan_out_follows_declaration_order() {
    let definition = ProcessBuilder::new("fan-out")
        .start("start")
        .user_task("split")
        .user_task("a")
        .user_task("b")
        .user_task("c")
        .connect("start", "split")
        .connect("split", "a")
        .connect("split", "b")
        .connect("split", "c")
        .build()
        .unwrap();
    let services = services();

    let mut tree = start(&definition, &services);
    let root = tree.root();
    signal(&mut tree, &definition, &services, root);

    let children = tree.children(root);
    let activities: Vec<Option<&str>> = children.iter().map(|c| tree[*c].activity.as_deref()).collect();
    assert_eq!(activities, vec![Some("a"), Some("b"), Some("c")]);
    assert!(children.iter().all(|c| tree[*c].is_concurrent && tree[*c].is_active));
    assert!(!tree[root].is_active);
    assert_eq!(tree[root].activity, None);
    assert_eq!(tree.tasks.len(), 3);
    assert!(tree.check_well_formed().is_empty(), "{:?}", tree.check_well_formed());
}
