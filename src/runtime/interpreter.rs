use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, trace};

use crate::definition::{Activity, ActivityKind, ProcessDefinition, ScopeRef};
use crate::error::{BpmnError, DefinitionError, PvmError};
use crate::runtime::context::Context;
use crate::runtime::execution::{ActivityInstanceState, Execution, ExecutionId};
use crate::runtime::history::HistoryEvent;
use crate::runtime::job::AsyncResumePoint;
use crate::runtime::listener::{ListenerEvent, ListenerEventName};
use crate::runtime::operation::AtomicOperation;
use crate::runtime::records::{EventSubscriptionKind, JobKind, RecordId};
use crate::runtime::services::RuntimeServices;
use crate::runtime::tree::ExecutionTree;

/// Work the engine has to do outside the tree once the command committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartCalledInstance {
        record: RecordId,
        execution: ExecutionId,
        definition_id: String,
        variables: BTreeMap<String, Value>,
    },
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    execution: ExecutionId,
    operation: AtomicOperation,
    /// Set when resuming from a job: the async check is skipped.
    sync: bool,
}

/// 解释器: runs atomic operations off an explicit LIFO work stack.
///
/// Operations never call each other; each one pushes its successors. Pushing
/// B and then A runs A first, so everything A schedules also runs before B.
/// Executions are re-resolved through the tree's replacement map when their
/// operation is popped, because compaction may have replaced them meanwhile.
pub struct Interpreter<'a> {
    pub tree: &'a mut ExecutionTree,
    pub definition: &'a ProcessDefinition,
    pub services: &'a RuntimeServices,
    work: Vec<WorkItem>,
    effects: Vec<Effect>,
    history: Vec<HistoryEvent>,
}

impl<'a> Interpreter<'a> {
    pub fn new(tree: &'a mut ExecutionTree, definition: &'a ProcessDefinition, services: &'a RuntimeServices) -> Self {
        Self {
            tree,
            definition,
            services,
            work: Vec::new(),
            effects: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn push(&mut self, execution: ExecutionId, operation: AtomicOperation) {
        self.work.push(WorkItem {
            execution,
            operation,
            sync: false,
        });
    }

    fn push_sync(&mut self, execution: ExecutionId, operation: AtomicOperation) {
        self.work.push(WorkItem {
            execution,
            operation,
            sync: true,
        });
    }

    pub fn perform_operation(&mut self, execution: ExecutionId, operation: AtomicOperation) -> Result<(), PvmError> {
        self.push(execution, operation);
        self.run()
    }

    /// Drains the work stack.
    pub fn run(&mut self) -> Result<(), PvmError> {
        while let Some(item) = self.work.pop() {
            let execution = self.tree.resolve_replaced_by(item.execution);
            if !self.tree.contains(execution) {
                trace!(execution = %item.execution, operation = %item.operation, "execution gone, skipping operation");
                continue;
            }
            if !item.sync && item.operation.is_async(self.definition, self.tree, execution) {
                self.schedule_async(execution, item.operation)?;
                continue;
            }
            trace!(execution = %execution, operation = %item.operation, "perform operation");
            if let Err(err) = self.execute(execution, item.operation) {
                self.handle_failure(execution, item.operation, err)?;
            }
        }
        Ok(())
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub fn take_history(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.history)
    }

    pub fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Keeps the event if the configured history level asks for it.
    pub fn record(&mut self, event: HistoryEvent) {
        if self.services.config.history_level >= event.level() {
            self.history.push(event);
        }
    }

    // commands ////////////////////////////////////////////////////////////

    pub fn start(&mut self, variables: BTreeMap<String, Value>) -> Result<(), PvmError> {
        let definition = self.definition;
        let initial = definition
            .initial(&ScopeRef::Process)
            .ok_or_else(|| DefinitionError::NoStartEvent(definition.id.clone()))?;
        let root = self.tree.root();
        for (name, value) in variables {
            self.tree.set_variable_local(root, &name, value);
        }
        self.tree.execution_mut(root)?.activity = Some(initial.id.clone());
        let process_instance_id = self.tree.process_instance_id();
        self.record(HistoryEvent::ProcessInstanceStart {
            process_instance_id,
            definition_id: definition.id.clone(),
        });
        self.push(root, AtomicOperation::ProcessStart);
        self.run()
    }

    pub fn signal(&mut self, execution: ExecutionId, signal: &str, payload: &Value) -> Result<(), PvmError> {
        let services = self.services;
        let activity = self.current_activity(execution)?;
        let behavior = services.behavior(activity.kind)?;
        debug!(execution = %execution, activity = %activity.id, signal, "signal");
        if let Err(err) = behavior.signal(self, execution, signal, payload) {
            self.handle_failure(execution, AtomicOperation::ActivityExecute, err)?;
        }
        self.run()
    }

    pub fn execute_job(&mut self, job_id: RecordId) -> Result<(), PvmError> {
        let job = self
            .tree
            .jobs
            .remove(&job_id)
            .ok_or_else(|| PvmError::IllegalState(format!("job {} not found", job_id)))?;
        let execution = job
            .execution
            .ok_or_else(|| PvmError::IllegalState(format!("job {} is detached", job_id)))?;
        debug!(job = %job_id, execution = %execution, activity = %job.activity_id, "execute job");
        match job.kind {
            JobKind::AsyncContinuation { resume_point } => {
                if let AsyncResumePoint::Transition(transition) = &resume_point {
                    self.tree.execution_mut(execution)?.transition = Some(transition.clone());
                }
                self.push_sync(execution, resume_point.operation());
            }
            JobKind::Timer { .. } => self.fire_boundary_event(execution, &job.activity_id)?,
        }
        self.run()
    }

    /// Triggers a message subscription: boundary events fire, catch events continue.
    pub fn trigger_subscription(&mut self, subscription_id: RecordId, payload: &Value) -> Result<(), PvmError> {
        let definition = self.definition;
        let subscription = self
            .tree
            .event_subscriptions
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| PvmError::IllegalState(format!("event subscription {} not found", subscription_id)))?;
        let execution = subscription
            .execution
            .ok_or_else(|| PvmError::IllegalState(format!("event subscription {} is detached", subscription_id)))?;
        let activity = definition.require_activity(&subscription.activity_id)?;
        if activity.kind.is_boundary_event() {
            self.fire_boundary_event(execution, &activity.id)?;
            self.run()
        } else {
            self.tree.event_subscriptions.remove(&subscription_id);
            self.signal(execution, "message", payload)
        }
    }

    pub fn delete_process_instance(
        &mut self,
        reason: &str,
        skip_custom_listeners: bool,
        skip_io_mappings: bool,
    ) -> Result<(), PvmError> {
        let root = self.tree.root();
        self.delete_cascade(root, reason, skip_custom_listeners, skip_io_mappings)?;
        self.run()
    }

    // helpers for behaviors ///////////////////////////////////////////////

    pub fn current_activity(&self, execution: ExecutionId) -> Result<&'a Activity, PvmError> {
        let definition: &'a ProcessDefinition = self.definition;
        let activity_id = self
            .tree
            .execution(execution)?
            .activity
            .as_deref()
            .ok_or(PvmError::NoActivity(execution))?;
        Ok(definition.require_activity(activity_id)?)
    }

    /// Takes every outgoing transition of the current activity, or ends the execution.
    pub fn leave(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let definition = self.definition;
        let activity = self.current_activity(execution)?;
        let transitions = definition
            .outgoing(&activity.id)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        self.leave_activity_via_transitions(execution, transitions, Vec::new())
    }

    /// `recyclables` are ended before the propagating execution continues.
    pub fn leave_activity_via_transitions(
        &mut self,
        execution: ExecutionId,
        transitions: Vec<String>,
        recyclables: Vec<ExecutionId>,
    ) -> Result<(), PvmError> {
        let recyclables: Vec<ExecutionId> = recyclables.into_iter().filter(|r| *r != execution).collect();
        if transitions.is_empty() {
            let complete_scope = !self.tree.execution(execution)?.is_concurrent;
            self.end(execution, complete_scope)?;
        } else {
            self.tree.execution_mut(execution)?.transitions_to_take = transitions;
            self.push(execution, AtomicOperation::TransitionNotifyListenerEnd);
        }
        for recyclable in recyclables.into_iter().rev() {
            self.end(recyclable, false)?;
        }
        Ok(())
    }

    pub fn end(&mut self, execution: ExecutionId, complete_scope: bool) -> Result<(), PvmError> {
        let e = self.tree.execution_mut(execution)?;
        e.is_active = false;
        e.is_ended = true;
        if complete_scope {
            e.activity_instance_state = ActivityInstanceState::ScopeComplete;
        }
        self.push(execution, AtomicOperation::ActivityNotifyListenerEnd);
        Ok(())
    }

    /// Inactive executions waiting in `activity_id` next to `execution`.
    pub fn find_inactive_concurrent_executions(
        &self,
        execution: ExecutionId,
        activity_id: &str,
    ) -> Result<Vec<ExecutionId>, PvmError> {
        let e = self.tree.execution(execution)?;
        if !e.is_concurrent {
            let waiting = !e.is_active && e.activity.as_deref() == Some(activity_id);
            return Ok(if waiting { vec![execution] } else { Vec::new() });
        }
        let parent = e.parent.ok_or(PvmError::ExecutionNotFound(execution))?;
        Ok(self
            .tree
            .non_event_scope_children(parent)
            .into_iter()
            .filter(|c| {
                self.tree
                    .get(*c)
                    .map(|c| c.is_concurrent && !c.is_active && c.activity.as_deref() == Some(activity_id))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Starts a boundary event of the activity whose scope execution is `event_scope_execution`.
    pub fn fire_boundary_event(&mut self, event_scope_execution: ExecutionId, boundary_id: &str) -> Result<(), PvmError> {
        let definition = self.definition;
        let boundary = definition.require_activity(boundary_id)?;
        debug!(execution = %event_scope_execution, boundary = %boundary.id, interrupting = boundary.cancel_activity, "fire boundary event");
        if boundary.cancel_activity {
            self.tree.execution_mut(event_scope_execution)?.next_activity = Some(boundary.id.clone());
            self.push(event_scope_execution, AtomicOperation::ActivityStartCancelScope);
        } else {
            let flow_scope = boundary.flow_scope();
            let parent = self
                .tree
                .parent(event_scope_execution)
                .ok_or(PvmError::ExecutionNotFound(event_scope_execution))?;
            let flow_execution = self.tree.find_scope_execution(parent, &flow_scope).ok_or_else(|| {
                PvmError::ScopeExecutionNotFound {
                    scope: flow_scope.to_string(),
                    execution: event_scope_execution,
                }
            })?;
            self.tree.execution_mut(flow_execution)?.next_activity = Some(boundary.id.clone());
            self.push(flow_execution, AtomicOperation::ActivityStartConcurrent);
        }
        Ok(())
    }

    /// Creates and enters the scope execution of `activity_id` below `parent`
    /// without executing the activity. The new execution is left inactive and
    /// without a current activity, ready to receive children.
    pub fn instantiate_scope(
        &mut self,
        parent: ExecutionId,
        activity_id: &str,
        skip_custom_listeners: bool,
        skip_io_mappings: bool,
    ) -> Result<ExecutionId, PvmError> {
        let definition = self.definition;
        let activity = definition.require_activity(activity_id)?;
        let child = self.create_scope_execution(parent, activity)?;
        {
            let c = self.tree.execution_mut(child)?;
            c.skip_custom_listeners = skip_custom_listeners;
            c.skip_io_mappings = skip_io_mappings;
        }
        self.start_activity_instance(child, activity)?;
        let c = self.tree.execution_mut(child)?;
        c.activity = None;
        c.activity_instance_id = None;
        c.is_active = false;
        c.skip_custom_listeners = false;
        c.skip_io_mappings = false;
        Ok(child)
    }

    /// Marks `execution` as delete root and schedules the removal of its subtree.
    pub fn delete_cascade(
        &mut self,
        execution: ExecutionId,
        reason: &str,
        skip_custom_listeners: bool,
        skip_io_mappings: bool,
    ) -> Result<(), PvmError> {
        let e = self.tree.execution_mut(execution)?;
        e.delete_root = true;
        e.delete_reason = Some(reason.to_string());
        e.skip_custom_listeners |= skip_custom_listeners;
        e.skip_io_mappings |= skip_io_mappings;
        self.push(execution, AtomicOperation::DeleteCascade);
        Ok(())
    }

    // operations //////////////////////////////////////////////////////////

    fn execute(&mut self, execution: ExecutionId, operation: AtomicOperation) -> anyhow::Result<()> {
        match operation {
            AtomicOperation::ProcessStart => self.process_start(execution)?,
            AtomicOperation::ProcessEnd => self.process_end(execution)?,
            AtomicOperation::ActivityStartCreateScope => self.activity_start_create_scope(execution)?,
            AtomicOperation::ActivityStart => self.activity_start(execution)?,
            AtomicOperation::ActivityExecute => self.activity_execute(execution)?,
            AtomicOperation::ActivityNotifyListenerEnd => self.activity_notify_listener_end(execution)?,
            AtomicOperation::ActivityEnd => self.activity_end(execution)?,
            AtomicOperation::ActivityLeave => self.leave(execution)?,
            AtomicOperation::ActivityStartConcurrent => self.activity_start_concurrent(execution)?,
            AtomicOperation::ActivityStartCancelScope => self.activity_start_cancel_scope(execution)?,
            AtomicOperation::TransitionNotifyListenerEnd => self.transition_notify_listener_end(execution)?,
            AtomicOperation::TransitionDestroyScope => self.transition_destroy_scope(execution)?,
            AtomicOperation::TransitionNotifyListenerTake => self.transition_notify_listener_take(execution)?,
            AtomicOperation::TransitionCreateScope => self.transition_create_scope(execution)?,
            AtomicOperation::TransitionNotifyListenerStart => self.transition_notify_listener_start(execution)?,
            AtomicOperation::TransitionCancelScope => self.transition_cancel_scope(execution)?,
            AtomicOperation::DeleteCascade => self.delete_cascade_step(execution)?,
            AtomicOperation::DeleteCascadeFireActivityEnd => self.delete_cascade_fire_activity_end(execution)?,
        }
        Ok(())
    }

    fn handle_failure(
        &mut self,
        execution: ExecutionId,
        operation: AtomicOperation,
        err: anyhow::Error,
    ) -> Result<(), PvmError> {
        if operation.handles_failure_as_bpmn_error() {
            if let Some(bpmn) = err.downcast_ref::<BpmnError>() {
                let code = bpmn.code.clone();
                return self.propagate_bpmn_error(execution, &code);
            }
        }
        match err.downcast::<PvmError>() {
            Ok(err) => Err(err),
            Err(err) => {
                let activity = self
                    .tree
                    .get(execution)
                    .and_then(|e| e.activity.clone())
                    .unwrap_or_default();
                Err(PvmError::Behavior {
                    execution,
                    activity,
                    message: format!("{:#}", err),
                })
            }
        }
    }

    /// Walks up the scope executions until an error boundary event catches `code`.
    fn propagate_bpmn_error(&mut self, execution: ExecutionId, code: &str) -> Result<(), PvmError> {
        let definition = self.definition;
        let thrower = self
            .tree
            .get(execution)
            .and_then(|e| e.activity.clone())
            .unwrap_or_default();
        let mut current = Some(execution);
        while let Some(c) = current {
            let e = self.tree.execution(c)?;
            current = e.parent;
            if !e.is_scope || e.is_event_scope {
                continue;
            }
            let Some(ScopeRef::Activity(scope_id)) = &e.scope_activity else {
                continue;
            };
            let catching = definition.boundary_events(scope_id).into_iter().find(|b| {
                b.kind == ActivityKind::BoundaryError && b.error_code.as_deref().is_none_or(|expected| expected == code)
            });
            if let Some(boundary) = catching {
                debug!(code, thrower = %thrower, boundary = %boundary.id, "error caught");
                self.tree.execution_mut(c)?.next_activity = Some(boundary.id.clone());
                self.push(c, AtomicOperation::ActivityStartCancelScope);
                return Ok(());
            }
        }
        Err(PvmError::UncaughtError {
            code: code.to_string(),
            activity: thrower,
        })
    }

    fn schedule_async(&mut self, execution: ExecutionId, operation: AtomicOperation) -> Result<(), PvmError> {
        let resume_point = operation.resume_point(self.tree, execution).ok_or_else(|| {
            PvmError::IllegalState(format!("operation {} cannot continue asynchronously", operation))
        })?;
        let activity = self.tree.execution(execution)?.activity.clone().unwrap_or_default();
        let retries = self.services.config.default_job_retries;
        let job = self.tree.create_job(
            execution,
            &activity,
            JobKind::AsyncContinuation {
                resume_point: resume_point.clone(),
            },
            retries,
        );
        debug!(execution = %execution, job = %job, activity = %activity, resume_point = %resume_point, "async continuation scheduled");
        Ok(())
    }

    fn process_start(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let definition = self.definition;
        self.notify_listeners(execution, ListenerEventName::Start, &definition.id, &definition.listeners.start)?;
        self.push_sync(execution, AtomicOperation::ActivityStartCreateScope);
        Ok(())
    }

    fn process_end(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let definition = self.definition;
        self.notify_listeners(execution, ListenerEventName::End, &definition.id, &definition.listeners.end)?;
        self.finish_process_instance(execution, false)
    }

    fn finish_process_instance(&mut self, root: ExecutionId, canceled: bool) -> Result<(), PvmError> {
        for child in self.tree.children(root) {
            self.tree.remove(child);
        }
        // variables of an ended instance stay readable
        self.tree.remove_records_of(root, true);
        let e = self.tree.execution_mut(root)?;
        e.is_ended = true;
        e.is_active = false;
        e.activity = None;
        e.activity_instance_id = None;
        e.scope_instance_id = None;
        let process_instance_id = self.tree.process_instance_id();
        debug!(process_instance = %process_instance_id, canceled, "process instance ended");
        self.record(HistoryEvent::ProcessInstanceEnd {
            process_instance_id,
            canceled,
        });
        Ok(())
    }

    fn activity_start_create_scope(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let activity = self.current_activity(execution)?;
        if activity.scope {
            let child = self.create_scope_execution(execution, activity)?;
            self.push(child, AtomicOperation::ActivityStart);
        } else {
            self.push(execution, AtomicOperation::ActivityStart);
        }
        Ok(())
    }

    fn activity_start(&mut self, execution: ExecutionId) -> anyhow::Result<()> {
        let activity = self.current_activity(execution)?;
        self.start_activity_instance(execution, activity)?;
        self.push(execution, AtomicOperation::ActivityExecute);
        Ok(())
    }

    fn activity_execute(&mut self, execution: ExecutionId) -> anyhow::Result<()> {
        let services = self.services;
        let activity = self.current_activity(execution)?;
        let behavior = services.behavior(activity.kind)?;
        trace!(execution = %execution, activity = %activity.id, kind = %activity.kind, "execute behavior");
        behavior.execute(self, execution)
    }

    fn activity_notify_listener_end(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let activity = self.current_activity(execution)?;
        self.end_activity_instance(execution, activity)?;
        self.push(execution, AtomicOperation::ActivityEnd);
        Ok(())
    }

    fn activity_end(&mut self, execution: ExecutionId) -> anyhow::Result<()> {
        let definition = self.definition;
        let services = self.services;
        let activity = self.current_activity(execution)?;

        let mut propagating = execution;
        let e = self.tree.execution(execution)?;
        if owns_scope(e, activity) && !e.is_concurrent {
            let parent = e.parent.ok_or(PvmError::ExecutionNotFound(execution))?;
            self.tree.remove(execution);
            self.tree.execution_mut(parent)?.activity = Some(activity.id.clone());
            propagating = parent;
        }

        match activity.flow_scope() {
            ScopeRef::Process => {
                let p = self.tree.execution(propagating)?;
                if p.is_concurrent {
                    let scope = p.parent.ok_or(PvmError::ExecutionNotFound(propagating))?;
                    self.tree.remove(propagating);
                    self.tree.try_prune_last_concurrent_child(scope);
                } else {
                    self.tree.execution_mut(propagating)?.is_ended = true;
                    self.push(propagating, AtomicOperation::ProcessEnd);
                }
            }
            ScopeRef::Activity(flow_scope_id) => {
                let flow_scope = definition.require_activity(&flow_scope_id)?;
                let behavior = services.behavior(flow_scope.kind)?;
                if !behavior.is_composite() {
                    return Err(PvmError::IllegalState(format!(
                        "flow scope '{}' of activity '{}' is not a composite activity",
                        flow_scope.id, activity.id
                    ))
                    .into());
                }
                let p = self.tree.execution(propagating)?;
                if p.is_concurrent {
                    let scope = p.parent.ok_or(PvmError::ExecutionNotFound(propagating))?;
                    behavior.concurrent_child_execution_ended(self, scope, propagating)?;
                } else {
                    self.tree.execution_mut(propagating)?.activity = Some(flow_scope.id.clone());
                    behavior.complete(self, propagating)?;
                }
            }
        }
        Ok(())
    }

    fn activity_start_concurrent(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let next = self
            .tree
            .execution_mut(execution)?
            .next_activity
            .take()
            .ok_or(PvmError::NoActivity(execution))?;
        let concurrent = self.tree.create_concurrent_execution(execution)?;
        let c = self.tree.execution_mut(concurrent)?;
        c.activity = Some(next);
        c.is_active = true;
        self.push(concurrent, AtomicOperation::ActivityStartCreateScope);
        Ok(())
    }

    fn activity_start_cancel_scope(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let next = self
            .tree
            .execution_mut(execution)?
            .next_activity
            .take()
            .ok_or(PvmError::NoActivity(execution))?;
        let parent = self.tree.parent(execution).ok_or(PvmError::ExecutionNotFound(execution))?;
        {
            let p = self.tree.execution_mut(parent)?;
            p.activity = Some(next.clone());
            p.is_active = true;
            p.transition = None;
        }
        // the cascade runs first, then the cancelling activity starts on the parent
        self.push(parent, AtomicOperation::ActivityStartCreateScope);
        self.delete_cascade(execution, &format!("Cancel scope activity {} executed.", next), false, false)
    }

    fn transition_notify_listener_end(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let activity = self.current_activity(execution)?;
        self.end_activity_instance(execution, activity)?;
        self.push(execution, AtomicOperation::TransitionDestroyScope);
        Ok(())
    }

    fn transition_destroy_scope(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let activity = self.current_activity(execution)?;
        let transitions = std::mem::take(&mut self.tree.execution_mut(execution)?.transitions_to_take);

        let e = self.tree.execution(execution)?;
        let propagating = if owns_scope(e, activity) && !e.is_concurrent {
            let parent = e.parent.ok_or(PvmError::ExecutionNotFound(execution))?;
            let transition = e.transition.clone();
            self.tree.remove(execution);
            let p = self.tree.execution_mut(parent)?;
            p.activity = Some(activity.id.clone());
            p.transition = transition;
            p.is_active = true;
            parent
        } else {
            execution
        };

        match transitions.as_slice() {
            [] => Err(PvmError::NoTransition(execution)),
            [transition] => self.take(propagating, transition),
            _ => {
                let (scope_execution, propagating_is_concurrent) = {
                    let p = self.tree.execution_mut(propagating)?;
                    p.is_active = false;
                    let scope = if p.is_scope {
                        propagating
                    } else {
                        p.parent.ok_or(PvmError::ExecutionNotFound(propagating))?
                    };
                    (scope, p.is_concurrent)
                };

                let mut outgoing: Vec<(ExecutionId, String)> = Vec::new();
                for (i, transition) in transitions.iter().enumerate() {
                    let concurrent = if i == 0 {
                        propagating
                    } else {
                        let concurrent = self.tree.create_concurrent_execution(scope_execution)?;
                        if i == 1 && !propagating_is_concurrent {
                            // the first transition moves to the child that replaced the scope
                            outgoing.remove(0);
                            let replacing = self
                                .tree
                                .non_event_scope_children(scope_execution)
                                .into_iter()
                                .find(|c| *c != propagating)
                                .ok_or(PvmError::ExecutionNotFound(propagating))?;
                            outgoing.push((replacing, transitions[0].clone()));
                        }
                        concurrent
                    };
                    outgoing.push((concurrent, transition.clone()));
                }

                for (concurrent, transition) in outgoing.into_iter().rev() {
                    self.take(concurrent, &transition)?;
                }
                Ok(())
            }
        }
    }

    fn take(&mut self, execution: ExecutionId, transition_id: &str) -> Result<(), PvmError> {
        let definition = self.definition;
        let transition = definition
            .transition(transition_id)
            .ok_or_else(|| PvmError::IllegalState(format!("unknown transition '{}'", transition_id)))?;
        let e = self.tree.execution_mut(execution)?;
        e.activity = Some(transition.source.clone());
        e.activity_instance_id = None;
        e.transition = Some(transition.id.clone());
        e.is_active = true;
        self.push(execution, AtomicOperation::TransitionNotifyListenerTake);
        Ok(())
    }

    fn transition_notify_listener_take(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let definition = self.definition;
        let transition_id = self
            .tree
            .execution(execution)?
            .transition
            .clone()
            .ok_or(PvmError::NoTransition(execution))?;
        let transition = definition
            .transition(&transition_id)
            .ok_or_else(|| PvmError::IllegalState(format!("unknown transition '{}'", transition_id)))?;
        self.notify_listeners(execution, ListenerEventName::Take, &transition.id, &transition.listeners)?;
        self.tree.execution_mut(execution)?.activity = Some(transition.target.clone());
        self.push(execution, AtomicOperation::TransitionCreateScope);
        Ok(())
    }

    fn transition_create_scope(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let activity = self.current_activity(execution)?;
        if activity.cancel_scope {
            self.push(execution, AtomicOperation::TransitionCancelScope);
        } else if activity.scope {
            let child = self.create_scope_execution(execution, activity)?;
            let transition = self.tree.execution_mut(execution)?.transition.take();
            self.tree.execution_mut(child)?.transition = transition;
            self.push(child, AtomicOperation::TransitionNotifyListenerStart);
        } else {
            self.push(execution, AtomicOperation::TransitionNotifyListenerStart);
        }
        Ok(())
    }

    fn transition_notify_listener_start(&mut self, execution: ExecutionId) -> anyhow::Result<()> {
        let activity = self.current_activity(execution)?;
        self.tree.execution_mut(execution)?.transition = None;
        self.start_activity_instance(execution, activity)?;
        self.push(execution, AtomicOperation::ActivityExecute);
        Ok(())
    }

    fn transition_cancel_scope(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let activity = self.current_activity(execution)?;
        let flow_scope = activity.flow_scope();
        let scope_execution =
            self.tree
                .find_scope_execution(execution, &flow_scope)
                .ok_or_else(|| PvmError::ScopeExecutionNotFound {
                    scope: flow_scope.to_string(),
                    execution,
                })?;
        let children = self.tree.non_event_scope_children(scope_execution);
        {
            let s = self.tree.execution_mut(scope_execution)?;
            s.activity = Some(activity.id.clone());
            s.activity_instance_id = None;
            s.is_active = true;
            s.transition = None;
        }
        debug!(execution = %execution, scope_execution = %scope_execution, activity = %activity.id, "cancel flow scope");
        self.push_sync(scope_execution, AtomicOperation::ActivityStartCreateScope);
        let reason = format!("Cancel scope activity {} executed.", activity.id);
        for child in children.into_iter().rev() {
            self.delete_cascade(child, &reason, false, false)?;
        }
        Ok(())
    }

    fn delete_cascade_step(&mut self, delete_root: ExecutionId) -> Result<(), PvmError> {
        let leaf = self.tree.left_most_leaf(delete_root);
        let (skip_listeners, skip_io) = {
            let root = self.tree.execution(delete_root)?;
            (root.skip_custom_listeners, root.skip_io_mappings)
        };
        {
            let l = self.tree.execution_mut(leaf)?;
            l.skip_custom_listeners |= skip_listeners;
            l.skip_io_mappings |= skip_io;
        }
        if leaf != delete_root {
            self.push(delete_root, AtomicOperation::DeleteCascade);
        }
        self.push(leaf, AtomicOperation::DeleteCascadeFireActivityEnd);
        Ok(())
    }

    fn delete_cascade_fire_activity_end(&mut self, execution: ExecutionId) -> Result<(), PvmError> {
        let definition = self.definition;
        let is_event_scope = {
            let e = self.tree.execution_mut(execution)?;
            e.activity_instance_state = ActivityInstanceState::Canceled;
            e.is_event_scope
        };

        if !is_event_scope {
            let e = self.tree.execution(execution)?;
            if e.activity_instance_id.is_some() {
                let activity = self.current_activity(execution)?;
                self.end_activity_instance(execution, activity)?;
            }
            let e = self.tree.execution(execution)?;
            if e.scope_instance_id.is_some() {
                if let Some(ScopeRef::Activity(scope_id)) = e.scope_activity.clone() {
                    self.tree.execution_mut(execution)?.activity = Some(scope_id.clone());
                    let scope_activity = definition.require_activity(&scope_id)?;
                    self.end_activity_instance(execution, scope_activity)?;
                }
            }
        }

        if execution == self.tree.root() {
            self.notify_listeners(execution, ListenerEventName::End, &definition.id, &definition.listeners.end)?;
            self.finish_process_instance(execution, true)
        } else {
            self.tree.remove(execution);
            Ok(())
        }
    }

    // shared steps ////////////////////////////////////////////////////////

    fn create_scope_execution(&mut self, parent: ExecutionId, activity: &Activity) -> Result<ExecutionId, PvmError> {
        let definition = self.definition;
        let child = self.tree.create_child(parent);
        {
            let c = self.tree.execution_mut(child)?;
            c.is_scope = true;
            c.is_active = true;
            c.activity = Some(activity.id.clone());
            c.scope_activity = Some(ScopeRef::activity(&activity.id));
        }
        {
            let p = self.tree.execution_mut(parent)?;
            p.is_active = false;
            p.activity = None;
        }
        let retries = self.services.config.default_job_retries;
        for boundary in definition.boundary_events(&activity.id) {
            match boundary.kind {
                ActivityKind::BoundaryMessage => {
                    self.tree.create_event_subscription(
                        child,
                        EventSubscriptionKind::Message,
                        boundary.message.as_deref(),
                        &boundary.id,
                    );
                }
                ActivityKind::BoundaryTimer => {
                    let due_millis = boundary.timer_millis.unwrap_or_default();
                    self.tree
                        .create_job(child, &boundary.id, JobKind::Timer { due_millis }, retries);
                }
                _ => {}
            }
        }
        trace!(parent = %parent, scope_execution = %child, activity = %activity.id, "scope created");
        Ok(child)
    }

    fn start_activity_instance(&mut self, execution: ExecutionId, activity: &Activity) -> Result<(), PvmError> {
        let activity_instance_id = self.tree.enter_activity_instance(execution)?;
        self.tree.execution_mut(execution)?.activity_instance_state = ActivityInstanceState::Default;
        let process_instance_id = self.tree.process_instance_id();
        self.record(HistoryEvent::ActivityInstanceStart {
            process_instance_id,
            activity_instance_id,
            activity_id: activity.id.clone(),
            execution,
        });
        if !activity.inputs.is_empty() && !self.tree.execution(execution)?.skip_io_mappings {
            for (name, value) in &activity.inputs {
                self.tree.set_variable_local(execution, name, value.clone());
            }
        }
        self.notify_listeners(execution, ListenerEventName::Start, &activity.id, &activity.listeners.start)
    }

    /// Output mappings, end listeners and compensation bookkeeping, then leaves the instance.
    fn end_activity_instance(&mut self, execution: ExecutionId, activity: &Activity) -> Result<(), PvmError> {
        let (canceled, skip_io, owns, parent) = {
            let e = self.tree.execution(execution)?;
            (e.is_canceled(), e.skip_io_mappings, owns_scope(e, activity), e.parent)
        };

        if !canceled && !skip_io && !activity.outputs.is_empty() {
            let target = if owns { parent.unwrap_or(execution) } else { execution };
            for (name, value) in &activity.outputs {
                self.tree.set_variable(target, name, value.clone());
            }
        }
        self.notify_listeners(execution, ListenerEventName::End, &activity.id, &activity.listeners.end)?;
        if !canceled {
            self.create_compensation_records(execution, activity)?;
        }

        let activity_instance_id = {
            let e = self.tree.execution(execution)?;
            e.activity_instance_id
                .clone()
                .or_else(|| if owns { e.scope_instance_id.clone() } else { None })
        };
        if let Some(activity_instance_id) = activity_instance_id {
            let process_instance_id = self.tree.process_instance_id();
            self.record(HistoryEvent::ActivityInstanceEnd {
                process_instance_id,
                activity_instance_id,
                activity_id: activity.id.clone(),
                canceled,
            });
        }
        self.tree.leave_activity_instance(execution);
        Ok(())
    }

    /// A completed compensable activity leaves a compensate subscription in its
    /// flow scope; a completed subprocess with such subscriptions keeps them
    /// below an event-scope execution.
    fn create_compensation_records(&mut self, execution: ExecutionId, activity: &Activity) -> Result<(), PvmError> {
        let e = self.tree.execution(execution)?;
        let owns = owns_scope(e, activity);
        let search_from = if owns {
            e.parent.ok_or(PvmError::ExecutionNotFound(execution))?
        } else {
            execution
        };
        let Some(flow_execution) = self.tree.find_scope_execution(search_from, &activity.flow_scope()) else {
            return Ok(());
        };

        if activity.kind == ActivityKind::SubProcess && owns {
            let subscriptions = self.tree.subscriptions_of(execution, EventSubscriptionKind::Compensate);
            let event_scopes = self.tree.event_scope_children(execution);
            if subscriptions.is_empty() && event_scopes.is_empty() {
                return Ok(());
            }
            let event_scope = self.tree.create_child(flow_execution);
            {
                let es = self.tree.execution_mut(event_scope)?;
                es.is_scope = true;
                es.is_event_scope = true;
                es.is_active = false;
                es.activity = Some(activity.id.clone());
                es.scope_activity = Some(ScopeRef::activity(&activity.id));
            }
            for (name, value) in self.tree.variables_local(execution) {
                self.tree.set_variable_local(event_scope, &name, value);
            }
            for subscription in subscriptions {
                if let Some(s) = self.tree.event_subscriptions.get_mut(&subscription) {
                    s.execution = Some(event_scope);
                }
            }
            for child in event_scopes {
                self.tree.set_parent(child, Some(event_scope));
            }
            let subscription =
                self.tree
                    .create_event_subscription(flow_execution, EventSubscriptionKind::Compensate, None, &activity.id);
            if let Some(s) = self.tree.event_subscriptions.get_mut(&subscription) {
                s.configuration = Some(event_scope);
            }
            debug!(execution = %execution, event_scope = %event_scope, activity = %activity.id, "event scope created");
        } else if activity.compensation_handler.is_some() {
            self.tree
                .create_event_subscription(flow_execution, EventSubscriptionKind::Compensate, None, &activity.id);
        }
        Ok(())
    }

    fn notify_listeners(
        &mut self,
        execution: ExecutionId,
        name: ListenerEventName,
        element_id: &str,
        listeners: &[String],
    ) -> Result<(), PvmError> {
        if listeners.is_empty() || self.tree.execution(execution)?.skip_custom_listeners {
            return Ok(());
        }
        let services = self.services;
        let definition = self.definition;
        for listener_name in listeners {
            let listener = services
                .listener(listener_name)
                .ok_or_else(|| PvmError::IllegalState(format!("listener '{}' is not registered", listener_name)))?;
            let event = ListenerEvent { name, element_id };
            let mut ctx = Context::new(&mut *self.tree, definition, execution, Some(element_id));
            listener
                .notify(&mut ctx, &event)
                .map_err(|err| PvmError::Behavior {
                    execution,
                    activity: element_id.to_string(),
                    message: format!("{:#}", err),
                })?;
        }
        Ok(())
    }
}

/// Whether `execution` is the scope execution created for `activity` and currently sits in it.
fn owns_scope(execution: &Execution, activity: &Activity) -> bool {
    execution.is_scope
        && activity.scope
        && execution.activity.as_deref() == Some(activity.id.as_str())
        && execution.scope_activity.as_ref().and_then(|s| s.activity_id()) == Some(activity.id.as_str())
}
