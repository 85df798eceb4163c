use std::collections::HashSet;

use crate::definition::{ActivityKind, ProcessDefinition, ScopeRef};
use crate::error::{InstanceReport, MigratingInstanceReport, MigrationError};
use crate::migration::dependent::{DependentKind, EmergingDependent, EventTrigger, MigratingDependent, RemovingDependent};
use crate::migration::instance::{InstanceKind, MigratingId, MigratingProcessInstance};
use crate::migration::plan::MigrationPlan;
use crate::migration::validation::migrate_resume_point;
use crate::runtime::activity_instance::ActivityInstance;
use crate::runtime::execution::ExecutionId;
use crate::runtime::records::{EventSubscriptionKind, JobKind, RecordId};
use crate::runtime::tree::ExecutionTree;

/// Builds the migrating instances of `tree` and validates them against the
/// plan. Nothing is mutated; any failure is reported for all instances at once.
pub fn parse(
    tree: &ExecutionTree,
    source: &ProcessDefinition,
    target: &ProcessDefinition,
    plan: &MigrationPlan,
) -> Result<MigratingProcessInstance, MigrationError> {
    let process_instance_id = tree.process_instance_id();
    let activity_tree = tree.activity_instance_tree(&source.id);
    let root_execution = tree.root();

    let mut parser = Parser {
        tree,
        source,
        target,
        plan,
        instance: MigratingProcessInstance::new(process_instance_id, &source.id, &target.id),
        report: MigratingInstanceReport::new(process_instance_id),
    };

    let root = parser.instance.add(
        None,
        Some(ScopeRef::Process),
        Some(ScopeRef::Process),
        InstanceKind::Activity {
            activity_instance_id: activity_tree.id.clone(),
            representative: root_execution,
            scope_execution: true,
            active: tree.execution(root_execution)?.is_active,
            is_process_instance: true,
        },
    );
    parser.collect_variables(root, root_execution);
    parser.collect_compensation(root, root_execution);
    parser.parse_children(&activity_tree, root, root_execution, &ScopeRef::Process)?;

    if parser.report.has_failures() {
        return Err(MigrationError::InvalidInstance(parser.report));
    }
    Ok(parser.instance)
}

struct Parser<'a> {
    tree: &'a ExecutionTree,
    source: &'a ProcessDefinition,
    target: &'a ProcessDefinition,
    plan: &'a MigrationPlan,
    instance: MigratingProcessInstance,
    report: MigratingInstanceReport,
}

impl Parser<'_> {
    /// `mapped_ancestor` is the target scope of the closest mapped ancestor instance.
    fn parse_children(
        &mut self,
        activity_instance: &ActivityInstance,
        parent: MigratingId,
        parent_representative: ExecutionId,
        mapped_ancestor: &ScopeRef,
    ) -> Result<(), MigrationError> {
        let tree = self.tree;
        for child in &activity_instance.child_activity_instances {
            let source_scope = ScopeRef::activity(&child.activity_id);
            let target_scope = self.plan.target_of(&source_scope);
            let representative = *child
                .execution_ids
                .first()
                .ok_or_else(|| MigrationError::IllegalState(format!("activity instance {} has no execution", child.id)))?;
            let execution = tree.execution(representative)?;
            let scope_execution = execution.is_scope && execution.scope_activity.as_ref() == Some(&source_scope);
            let is_leaf = child.child_activity_instances.is_empty() && child.child_transition_instances.is_empty();

            let mut failures = Vec::new();
            match &target_scope {
                None if is_leaf => failures.push(format!(
                    "there is no migration instruction for activity '{}'",
                    child.activity_id
                )),
                None => {}
                Some(target_scope) => self.check_ancestor(mapped_ancestor, target_scope, &mut failures),
            }
            if !failures.is_empty() {
                self.report.activity_instance_reports.push(InstanceReport {
                    instance_id: child.id.clone(),
                    source_activity_id: child.activity_id.clone(),
                    failures,
                });
            }

            let id = self.instance.add(
                Some(parent),
                Some(source_scope),
                target_scope.clone(),
                InstanceKind::Activity {
                    activity_instance_id: child.id.clone(),
                    representative,
                    scope_execution,
                    active: execution.is_active,
                    is_process_instance: false,
                },
            );

            let owns_execution = scope_execution || representative != parent_representative;
            let target_activity = target_scope.as_ref().and_then(|s| s.activity_id()).map(str::to_string);
            self.collect_activity_dependents(id, representative, &child.activity_id, target_activity.as_deref());
            if owns_execution {
                self.collect_variables(id, representative);
            }
            if scope_execution {
                self.collect_compensation(id, representative);
            }

            let child_representative = if scope_execution {
                representative
            } else {
                parent_representative
            };
            let next_ancestor = target_scope.as_ref().unwrap_or(mapped_ancestor).clone();
            self.parse_children(child, id, child_representative, &next_ancestor)?;
        }

        for transition in &activity_instance.child_transition_instances {
            let source_scope = ScopeRef::activity(&transition.activity_id);
            let target_scope = self.plan.target_of(&source_scope);
            let representative = transition.execution_id;
            let job = tree
                .jobs
                .values()
                .find(|j| {
                    j.execution == Some(representative)
                        && j.activity_id == transition.activity_id
                        && j.is_async_continuation()
                })
                .ok_or_else(|| {
                    MigrationError::IllegalState(format!("transition instance {} has no job", transition.id))
                })?;
            let source_point = job
                .resume_point()
                .cloned()
                .ok_or_else(|| MigrationError::IllegalState(format!("job {} has no resume point", job.id)))?;

            let mut failures = Vec::new();
            let mut resume_point = source_point.clone();
            match &target_scope {
                None => failures.push(format!(
                    "there is no migration instruction for activity '{}'",
                    transition.activity_id
                )),
                Some(target_scope) => {
                    self.check_ancestor(mapped_ancestor, target_scope, &mut failures);
                    if let Some(target_activity) = target_scope.activity_id() {
                        match migrate_resume_point(&source_point, self.target, target_activity) {
                            Ok(point) => resume_point = point,
                            Err(failure) => failures.push(failure),
                        }
                    }
                }
            }
            if !failures.is_empty() {
                self.report.transition_instance_reports.push(InstanceReport {
                    instance_id: transition.id.clone(),
                    source_activity_id: transition.activity_id.clone(),
                    failures,
                });
            }

            let id = self.instance.add(
                Some(parent),
                Some(source_scope),
                target_scope.clone(),
                InstanceKind::Transition {
                    id: transition.id.clone(),
                    representative,
                    active: tree.execution(representative)?.is_active,
                    job: job.id,
                    resume_point,
                },
            );

            let target_activity = target_scope.as_ref().and_then(|s| s.activity_id()).map(str::to_string);
            let incidents: Vec<RecordId> = tree
                .incidents
                .values()
                .filter(|i| i.job == Some(job.id))
                .map(|i| i.id)
                .collect();
            if let Some(instance) = self.instance.get_mut(id) {
                for incident in incidents {
                    instance.dependents.push(MigratingDependent::new(
                        DependentKind::Incident,
                        incident,
                        target_activity.clone(),
                    ));
                }
            }
            if representative != parent_representative {
                self.collect_variables(id, representative);
            }
        }
        Ok(())
    }

    fn check_ancestor(&self, mapped_ancestor: &ScopeRef, target_scope: &ScopeRef, failures: &mut Vec<String>) {
        if target_scope == mapped_ancestor || !self.target.is_ancestor(mapped_ancestor, target_scope) {
            failures.push(format!(
                "target activity '{}' is not a descendant of '{}', the target of the closest mapped ancestor",
                target_scope, mapped_ancestor
            ));
        }
    }

    fn collect_variables(&mut self, id: MigratingId, execution: ExecutionId) {
        let variables: Vec<RecordId> = self
            .tree
            .variables
            .values()
            .filter(|v| v.execution == Some(execution))
            .map(|v| v.id)
            .collect();
        if let Some(instance) = self.instance.get_mut(id) {
            for variable in variables {
                instance
                    .dependents
                    .push(MigratingDependent::new(DependentKind::Variable, variable, None));
            }
        }
    }

    /// Trigger taken over from `target_activity` when its instruction asks for it.
    fn trigger_for(&self, source_activity: &str, target_activity: Option<&str>) -> Option<EventTrigger> {
        let instruction = self.plan.instruction_for(source_activity)?;
        if !instruction.update_event_trigger {
            return None;
        }
        let activity = self.target.activity(target_activity?)?;
        match activity.kind {
            ActivityKind::BoundaryTimer => Some(EventTrigger::Timer(activity.timer_millis.unwrap_or_default())),
            ActivityKind::BoundaryMessage | ActivityKind::MessageCatchEvent => {
                Some(EventTrigger::Message(activity.message.clone()))
            }
            _ => None,
        }
    }

    fn boundary_target(&self, boundary_id: &str) -> Option<String> {
        self.plan
            .instruction_for(boundary_id)
            .map(|i| i.target_activity_id.clone())
    }

    fn is_boundary_of(&self, activity_id: &str, host: &str) -> bool {
        self.source
            .activity(activity_id)
            .is_some_and(|a| a.kind.is_boundary_event() && a.attached_to.as_deref() == Some(host))
    }

    fn collect_activity_dependents(
        &mut self,
        id: MigratingId,
        execution: ExecutionId,
        source_activity: &str,
        target_activity: Option<&str>,
    ) {
        let tree = self.tree;
        let owned = |record_execution: Option<ExecutionId>, activity_id: &str| {
            record_execution == Some(execution) && activity_id == source_activity
        };
        let target = target_activity.map(str::to_string);

        let mut dependents = Vec::new();
        let mut removing = Vec::new();

        for task in tree.tasks.values().filter(|r| owned(r.execution, &r.activity_id)) {
            dependents.push(MigratingDependent::new(DependentKind::Task, task.id, target.clone()));
        }
        for task in tree.external_tasks.values().filter(|r| owned(r.execution, &r.activity_id)) {
            dependents.push(MigratingDependent::new(DependentKind::ExternalTask, task.id, target.clone()));
        }
        for called in tree.called_instances.values().filter(|r| owned(r.execution, &r.activity_id)) {
            dependents.push(MigratingDependent::new(DependentKind::CalledInstance, called.id, target.clone()));
        }

        for subscription in tree
            .event_subscriptions
            .values()
            .filter(|s| s.execution == Some(execution) && s.kind == EventSubscriptionKind::Message)
        {
            if subscription.activity_id == source_activity {
                dependents.push(
                    MigratingDependent::new(DependentKind::EventSubscription, subscription.id, target.clone())
                        .with_trigger(self.trigger_for(source_activity, target_activity)),
                );
            } else if self.is_boundary_of(&subscription.activity_id, source_activity) {
                match self.boundary_target(&subscription.activity_id) {
                    Some(boundary) => {
                        let trigger = self.trigger_for(&subscription.activity_id, Some(&boundary));
                        dependents.push(
                            MigratingDependent::new(DependentKind::EventSubscription, subscription.id, Some(boundary))
                                .with_trigger(trigger),
                        );
                    }
                    None => removing.push(RemovingDependent::EventSubscription(subscription.id)),
                }
            }
        }

        let mut migrating_jobs: HashSet<RecordId> = HashSet::new();
        for job in tree.jobs.values().filter(|j| j.execution == Some(execution)) {
            if !matches!(job.kind, JobKind::Timer { .. }) || !self.is_boundary_of(&job.activity_id, source_activity) {
                continue;
            }
            match self.boundary_target(&job.activity_id) {
                Some(boundary) => {
                    let trigger = self.trigger_for(&job.activity_id, Some(&boundary));
                    migrating_jobs.insert(job.id);
                    dependents
                        .push(MigratingDependent::new(DependentKind::Job, job.id, Some(boundary)).with_trigger(trigger));
                }
                None => removing.push(RemovingDependent::Job(job.id)),
            }
        }

        for incident in tree.incidents.values().filter(|i| i.execution == Some(execution)) {
            let belongs = match incident.job {
                Some(job) => migrating_jobs.contains(&job),
                None => incident.activity_id == source_activity,
            };
            if belongs {
                let incident_target = match incident.job {
                    Some(job) => dependents
                        .iter()
                        .find(|d| d.kind == DependentKind::Job && d.record == job)
                        .and_then(|d| d.target_activity_id.clone()),
                    None => target.clone(),
                };
                dependents.push(MigratingDependent::new(DependentKind::Incident, incident.id, incident_target));
            }
        }

        let mut emerging = Vec::new();
        if let Some(target_activity) = target_activity {
            let targeted: HashSet<&str> = dependents
                .iter()
                .filter_map(|d| d.target_activity_id.as_deref())
                .collect();
            for boundary in self.target.boundary_events(target_activity) {
                if targeted.contains(boundary.id.as_str()) {
                    continue;
                }
                match boundary.kind {
                    ActivityKind::BoundaryMessage => emerging.push(EmergingDependent::MessageSubscription {
                        activity_id: boundary.id.clone(),
                        event_name: boundary.message.clone(),
                    }),
                    ActivityKind::BoundaryTimer => emerging.push(EmergingDependent::TimerJob {
                        activity_id: boundary.id.clone(),
                        due_millis: boundary.timer_millis.unwrap_or_default(),
                    }),
                    _ => {}
                }
            }
        }

        if let Some(instance) = self.instance.get_mut(id) {
            instance.dependents.extend(dependents);
            instance.removing.extend(removing);
            instance.emerging.extend(emerging);
        }
    }

    /// Compensate subscriptions held by `execution`: those with an event scope
    /// become event-scope instances, the others compensation subscription instances.
    fn collect_compensation(&mut self, id: MigratingId, execution: ExecutionId) {
        let tree = self.tree;
        for subscription_id in tree.subscriptions_of(execution, EventSubscriptionKind::Compensate) {
            let Some(subscription) = tree.event_subscriptions.get(&subscription_id) else {
                continue;
            };
            let source_scope = ScopeRef::activity(&subscription.activity_id);
            let target_scope = self.plan.target_of(&source_scope);
            match subscription.configuration {
                Some(event_scope) => {
                    let child = self.instance.add(
                        Some(id),
                        Some(source_scope),
                        target_scope,
                        InstanceKind::EventScope {
                            execution: event_scope,
                            subscription: Some(subscription_id),
                        },
                    );
                    self.collect_variables(child, event_scope);
                    self.collect_compensation(child, event_scope);
                }
                None if target_scope.is_some() => {
                    self.instance.add(
                        Some(id),
                        Some(source_scope),
                        target_scope,
                        InstanceKind::CompensationSubscription {
                            subscription: subscription_id,
                        },
                    );
                }
                None => {
                    if let Some(instance) = self.instance.get_mut(id) {
                        instance
                            .removing
                            .push(RemovingDependent::CompensationSubscription(subscription_id));
                    }
                }
            }
        }
    }
}
