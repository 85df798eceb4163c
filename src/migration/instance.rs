use std::fmt;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::definition::{ProcessDefinition, ScopeRef};
use crate::error::MigrationError;
use crate::migration::dependent::{DependentKind, EmergingDependent, MigratingDependent, RemovingDependent};
use crate::migration::plan::MigrationOptions;
use crate::runtime::execution::ExecutionId;
use crate::runtime::history::HistoryEvent;
use crate::runtime::interpreter::Interpreter;
use crate::runtime::job::AsyncResumePoint;
use crate::runtime::records::{JobKind, RecordId};
use crate::runtime::services::RuntimeServices;
use crate::runtime::tree::ExecutionTree;

/// Index of a migrating instance inside its [`MigratingProcessInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MigratingId(pub usize);

impl fmt::Display for MigratingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mi-{}", self.0)
    }
}

/// Both ends of the parent/child relation between migrating instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentLink {
    pub parent: Option<MigratingId>,
    pub children: Vec<MigratingId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceKind {
    Activity {
        activity_instance_id: String,
        representative: ExecutionId,
        /// The representative is the scope execution of this instance.
        scope_execution: bool,
        active: bool,
        is_process_instance: bool,
    },
    Transition {
        id: String,
        representative: ExecutionId,
        active: bool,
        job: RecordId,
        /// Resume point in the target definition.
        resume_point: AsyncResumePoint,
    },
    EventScope {
        execution: ExecutionId,
        /// Compensate subscription whose configuration is `execution`.
        subscription: Option<RecordId>,
    },
    CompensationSubscription {
        subscription: RecordId,
    },
}

/// Where a detached instance is attached again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachTarget {
    ScopeInstance(MigratingId),
    TransitionInstance(MigratingId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratingInstance {
    pub id: MigratingId,
    pub link: ParentLink,
    /// `None` for instances created during the migration.
    pub source_scope: Option<ScopeRef>,
    pub current_scope: ScopeRef,
    /// `None` when the instance is not mapped.
    pub target_scope: Option<ScopeRef>,
    pub kind: InstanceKind,
    pub dependents: Vec<MigratingDependent>,
    pub removing: Vec<RemovingDependent>,
    pub emerging: Vec<EmergingDependent>,
    pub detached: bool,
}

impl MigratingInstance {
    /// Activity instances with their own scope execution and event scopes.
    pub fn is_scope_instance(&self) -> bool {
        match &self.kind {
            InstanceKind::Activity { scope_execution, .. } => *scope_execution,
            InstanceKind::EventScope { .. } => true,
            _ => false,
        }
    }

    pub fn is_compensation(&self) -> bool {
        matches!(
            self.kind,
            InstanceKind::EventScope { .. } | InstanceKind::CompensationSubscription { .. }
        )
    }

    pub fn is_process_instance(&self) -> bool {
        matches!(
            self.kind,
            InstanceKind::Activity {
                is_process_instance: true,
                ..
            }
        )
    }

    pub fn is_mapped(&self) -> bool {
        self.target_scope.is_some()
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            InstanceKind::Activity { .. } => "activity instance",
            InstanceKind::Transition { .. } => "transition instance",
            InstanceKind::EventScope { .. } => "event scope instance",
            InstanceKind::CompensationSubscription { .. } => "compensation subscription",
        }
    }

    pub fn instance_id(&self) -> String {
        match &self.kind {
            InstanceKind::Activity {
                activity_instance_id, ..
            } => activity_instance_id.clone(),
            InstanceKind::Transition { id, .. } => id.clone(),
            InstanceKind::EventScope { execution, .. } => execution.to_string(),
            InstanceKind::CompensationSubscription { subscription } => subscription.to_string(),
        }
    }
}

/// Mutable state shared by every step of one migration.
pub struct MigrationContext<'a> {
    pub tree: &'a mut ExecutionTree,
    pub source: &'a ProcessDefinition,
    pub target: &'a ProcessDefinition,
    pub services: &'a RuntimeServices,
    pub options: MigrationOptions,
    history: Vec<HistoryEvent>,
}

impl<'a> MigrationContext<'a> {
    pub fn new(
        tree: &'a mut ExecutionTree,
        source: &'a ProcessDefinition,
        target: &'a ProcessDefinition,
        services: &'a RuntimeServices,
        options: MigrationOptions,
    ) -> Self {
        Self {
            tree,
            source,
            target,
            services,
            options,
            history: Vec::new(),
        }
    }

    pub fn record(&mut self, event: HistoryEvent) {
        if self.services.config.history_level >= event.level() {
            self.history.push(event);
        }
    }

    pub fn take_history(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.history)
    }

    pub(crate) fn extend_history(&mut self, events: Vec<HistoryEvent>) {
        self.history.extend(events);
    }
}

/// 迁移实例树: the migrating instances of one process instance.
#[derive(Debug, Clone)]
pub struct MigratingProcessInstance {
    pub process_instance_id: Uuid,
    pub source_definition_id: String,
    pub target_definition_id: String,
    instances: Vec<MigratingInstance>,
}

fn illegal(message: impl Into<String>) -> MigrationError {
    MigrationError::IllegalState(message.into())
}

impl MigratingProcessInstance {
    pub fn new(process_instance_id: Uuid, source_definition_id: &str, target_definition_id: &str) -> Self {
        Self {
            process_instance_id,
            source_definition_id: source_definition_id.to_string(),
            target_definition_id: target_definition_id.to_string(),
            instances: Vec::new(),
        }
    }

    /// Adds an instance below `parent`. The first instance added is the root.
    pub fn add(
        &mut self,
        parent: Option<MigratingId>,
        source_scope: Option<ScopeRef>,
        target_scope: Option<ScopeRef>,
        kind: InstanceKind,
    ) -> MigratingId {
        let id = MigratingId(self.instances.len());
        let current_scope = source_scope
            .clone()
            .or_else(|| target_scope.clone())
            .unwrap_or(ScopeRef::Process);
        self.instances.push(MigratingInstance {
            id,
            link: ParentLink {
                parent,
                children: Vec::new(),
            },
            source_scope,
            current_scope,
            target_scope,
            kind,
            dependents: Vec::new(),
            removing: Vec::new(),
            emerging: Vec::new(),
            detached: false,
        });
        if let Some(parent) = parent.and_then(|p| self.instances.get_mut(p.0)) {
            parent.link.children.push(id);
        }
        id
    }

    pub fn root(&self) -> MigratingId {
        MigratingId(0)
    }

    pub fn get(&self, id: MigratingId) -> Option<&MigratingInstance> {
        self.instances.get(id.0)
    }

    pub fn get_mut(&mut self, id: MigratingId) -> Option<&mut MigratingInstance> {
        self.instances.get_mut(id.0)
    }

    fn instance(&self, id: MigratingId) -> Result<&MigratingInstance, MigrationError> {
        self.get(id).ok_or_else(|| illegal(format!("migrating instance {} not found", id)))
    }

    fn instance_mut(&mut self, id: MigratingId) -> Result<&mut MigratingInstance, MigrationError> {
        self.instances
            .get_mut(id.0)
            .ok_or_else(|| illegal(format!("migrating instance {} not found", id)))
    }

    pub fn instances(&self) -> impl Iterator<Item = &MigratingInstance> {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn children(&self, id: MigratingId) -> Vec<MigratingId> {
        self.get(id).map(|i| i.link.children.clone()).unwrap_or_default()
    }

    /// Instances whose source scope is the activity `activity_id`.
    pub fn instances_for_source(&self, activity_id: &str) -> Vec<MigratingId> {
        self.instances
            .iter()
            .filter(|i| i.source_scope.as_ref().and_then(|s| s.activity_id()) == Some(activity_id))
            .map(|i| i.id)
            .collect()
    }

    /// Moves `child` below `parent`, or unlinks it.
    pub fn set_parent(&mut self, child: MigratingId, parent: Option<MigratingId>) {
        let old = self.get(child).and_then(|c| c.link.parent);
        if let Some(old) = old.and_then(|o| self.instances.get_mut(o.0)) {
            old.link.children.retain(|c| *c != child);
        }
        if let Some(new) = parent.and_then(|p| self.instances.get_mut(p.0)) {
            new.link.children.push(child);
        }
        if let Some(c) = self.instances.get_mut(child.0) {
            c.link.parent = parent;
        }
    }

    pub fn is_detached(&self, id: MigratingId) -> bool {
        self.get(id).map(|i| i.detached).unwrap_or(true)
    }

    /// Execution the instance is represented by and that its children attach beneath.
    pub fn resolve_representative(&self, tree: &ExecutionTree, id: MigratingId) -> Result<ExecutionId, MigrationError> {
        let instance = self.instance(id)?;
        match &instance.kind {
            InstanceKind::Activity {
                activity_instance_id,
                representative,
                scope_execution,
                ..
            } => {
                if *scope_execution {
                    return Ok(*representative);
                }
                // compaction may have replaced the execution or moved the instance to a new child
                let resolved = tree.resolve_replaced_by(*representative);
                let execution = tree
                    .get(resolved)
                    .ok_or_else(|| illegal(format!("representative of {} is gone", activity_instance_id)))?;
                if execution.activity_instance_id.as_deref() == Some(activity_instance_id.as_str()) {
                    return Ok(resolved);
                }
                Ok(execution
                    .children
                    .iter()
                    .copied()
                    .find(|c| {
                        tree.get(*c)
                            .is_some_and(|c| c.activity_instance_id.as_deref() == Some(activity_instance_id.as_str()))
                    })
                    .unwrap_or(resolved))
            }
            InstanceKind::Transition {
                representative, job, ..
            } => {
                let owner = tree.jobs.get(job).and_then(|j| j.execution).unwrap_or(*representative);
                Ok(tree.resolve_replaced_by(owner))
            }
            InstanceKind::EventScope { execution, .. } => Ok(*execution),
            InstanceKind::CompensationSubscription { subscription } => tree
                .event_subscriptions
                .get(subscription)
                .and_then(|s| s.execution)
                .ok_or_else(|| illegal(format!("compensation subscription {} is detached", subscription))),
        }
    }

    /// Execution a child of `parent` can live in: the parent's scope
    /// execution itself, or a new concurrent child when it is occupied.
    pub fn create_attachable_execution(
        &mut self,
        ctx: &mut MigrationContext<'_>,
        parent: MigratingId,
    ) -> Result<ExecutionId, MigrationError> {
        let scope = self.resolve_representative(ctx.tree, parent)?;
        let occupied =
            ctx.tree.execution(scope)?.activity.is_some() || !ctx.tree.non_event_scope_children(scope).is_empty();
        if occupied {
            let concurrent = ctx.tree.create_concurrent_execution(scope)?;
            trace!(scope = %scope, execution = %concurrent, "attachable execution created");
            Ok(concurrent)
        } else {
            Ok(scope)
        }
    }

    /// Reverses [`Self::create_attachable_execution`]: a concurrent execution
    /// is removed and its scope compacted if possible.
    pub fn destroy_attachable_execution(tree: &mut ExecutionTree, execution: ExecutionId) {
        let Some(e) = tree.get(execution) else {
            return;
        };
        if !e.is_concurrent {
            return;
        }
        let parent = e.parent;
        tree.remove(execution);
        if let Some(parent) = parent {
            tree.try_prune_last_concurrent_child(parent);
        }
    }

    fn set_dependents_execution(&self, tree: &mut ExecutionTree, id: MigratingId, execution: Option<ExecutionId>) {
        if let Some(instance) = self.get(id) {
            for dependent in &instance.dependents {
                dependent.set_execution(tree, execution);
            }
            if let InstanceKind::Transition { job, .. } = &instance.kind {
                if let Some(j) = tree.jobs.get_mut(job) {
                    j.execution = execution;
                }
            }
        }
    }

    pub fn detach_state(&mut self, ctx: &mut MigrationContext<'_>, id: MigratingId) -> Result<(), MigrationError> {
        let instance = self.instance(id)?;
        if instance.is_process_instance() {
            return Err(illegal("the process instance cannot be detached"));
        }
        let kind = instance.kind.clone();
        let parent = instance.link.parent;
        let representative = self.resolve_representative(ctx.tree, id)?;
        let parent_representative = match parent {
            Some(p) => Some(self.resolve_representative(ctx.tree, p)?),
            None => None,
        };
        trace!(instance = %instance.instance_id(), kind = instance.kind_name(), "detach");

        self.set_dependents_execution(ctx.tree, id, None);

        match kind {
            InstanceKind::Activity {
                scope_execution: true,
                ..
            } => {
                let old_parent = ctx.tree.parent(representative);
                ctx.tree.set_parent(representative, None);
                if let Some(old_parent) = old_parent {
                    Self::destroy_attachable_execution(ctx.tree, old_parent);
                }
            }
            InstanceKind::Activity { .. } => {
                let e = ctx.tree.execution_mut(representative)?;
                let was_active = e.is_active;
                e.activity = None;
                e.activity_instance_id = None;
                e.transition = None;
                e.is_active = false;
                if let InstanceKind::Activity { active, .. } = &mut self.instance_mut(id)?.kind {
                    *active = was_active;
                }
                Self::destroy_attachable_execution(ctx.tree, representative);
            }
            InstanceKind::Transition { .. } => {
                let e = ctx.tree.execution_mut(representative)?;
                let was_active = e.is_active;
                let is_scope = e.is_scope;
                e.activity = None;
                e.transition = None;
                e.is_active = false;
                if let InstanceKind::Transition { active, .. } = &mut self.instance_mut(id)?.kind {
                    *active = was_active;
                }
                if Some(representative) != parent_representative {
                    if is_scope {
                        let old_parent = ctx.tree.parent(representative);
                        ctx.tree.remove(representative);
                        if let Some(old_parent) = old_parent {
                            Self::destroy_attachable_execution(ctx.tree, old_parent);
                        }
                    } else {
                        Self::destroy_attachable_execution(ctx.tree, representative);
                    }
                }
            }
            InstanceKind::EventScope {
                execution,
                subscription,
            } => {
                ctx.tree.set_parent(execution, None);
                if let Some(s) = subscription.and_then(|s| ctx.tree.event_subscriptions.get_mut(&s)) {
                    s.execution = None;
                }
            }
            InstanceKind::CompensationSubscription { subscription } => {
                if let Some(s) = ctx.tree.event_subscriptions.get_mut(&subscription) {
                    s.execution = None;
                }
            }
        }

        self.set_parent(id, None);
        self.instance_mut(id)?.detached = true;
        Ok(())
    }

    pub fn attach_state(
        &mut self,
        ctx: &mut MigrationContext<'_>,
        id: MigratingId,
        target: AttachTarget,
    ) -> Result<(), MigrationError> {
        let instance = self.instance(id)?;
        let parent = match target {
            AttachTarget::ScopeInstance(parent) => parent,
            AttachTarget::TransitionInstance(transition) => {
                return Err(MigrationError::IllegalAttachTarget {
                    kind: instance.kind_name(),
                    instance: instance.instance_id(),
                    transition_instance: self.instance(transition)?.instance_id(),
                });
            }
        };
        if let InstanceKind::Transition { id: transition_id, .. } = &instance.kind {
            if let Some(called) = instance
                .dependents
                .iter()
                .find(|d| d.kind == DependentKind::CalledInstance)
            {
                return Err(MigrationError::IllegalAttachTarget {
                    kind: DependentKind::CalledInstance.as_str(),
                    instance: called.record.to_string(),
                    transition_instance: transition_id.clone(),
                });
            }
        }
        if !self.instance(parent)?.is_scope_instance() {
            return Err(illegal(format!(
                "{} is not a scope instance and cannot host {}",
                self.instance(parent)?.instance_id(),
                instance.instance_id()
            )));
        }
        let kind = instance.kind.clone();
        let current_activity = instance.current_scope.activity_id().map(str::to_string);
        trace!(instance = %instance.instance_id(), kind = instance.kind_name(), parent = %parent, "attach");

        match kind {
            InstanceKind::Activity {
                representative,
                scope_execution: true,
                ..
            } => {
                let attachable = self.create_attachable_execution(ctx, parent)?;
                ctx.tree.set_parent(representative, Some(attachable));
            }
            InstanceKind::Activity {
                activity_instance_id,
                active,
                ..
            } => {
                let attachable = self.create_attachable_execution(ctx, parent)?;
                let e = ctx.tree.execution_mut(attachable)?;
                e.activity = current_activity;
                e.activity_instance_id = Some(activity_instance_id);
                e.is_active = active;
                if let InstanceKind::Activity { representative, .. } = &mut self.instance_mut(id)?.kind {
                    *representative = attachable;
                }
            }
            InstanceKind::Transition { active, job, .. } => {
                let attachable = self.create_attachable_execution(ctx, parent)?;
                let transition = match ctx.tree.jobs.get(&job).and_then(|j| j.resume_point()) {
                    Some(AsyncResumePoint::Transition(t)) => Some(t.clone()),
                    _ => None,
                };
                let e = ctx.tree.execution_mut(attachable)?;
                e.activity = current_activity;
                e.transition = transition;
                e.is_active = active;
                if let InstanceKind::Transition { representative, .. } = &mut self.instance_mut(id)?.kind {
                    *representative = attachable;
                }
                if let Some(j) = ctx.tree.jobs.get_mut(&job) {
                    j.execution = Some(attachable);
                }
            }
            InstanceKind::EventScope {
                execution,
                subscription,
            } => {
                let host = self.resolve_representative(ctx.tree, parent)?;
                ctx.tree.set_parent(execution, Some(host));
                if let Some(s) = subscription.and_then(|s| ctx.tree.event_subscriptions.get_mut(&s)) {
                    s.execution = Some(host);
                }
            }
            InstanceKind::CompensationSubscription { subscription } => {
                let host = self.resolve_representative(ctx.tree, parent)?;
                if let Some(s) = ctx.tree.event_subscriptions.get_mut(&subscription) {
                    s.execution = Some(host);
                }
            }
        }

        self.set_parent(id, Some(parent));
        self.instance_mut(id)?.detached = false;
        let representative = self.resolve_representative(ctx.tree, id)?;
        self.set_dependents_execution(ctx.tree, id, Some(representative));
        Ok(())
    }

    /// Moves the instance's own state onto its target scope.
    pub fn migrate_state(&mut self, ctx: &mut MigrationContext<'_>, id: MigratingId) -> Result<(), MigrationError> {
        let instance = self.instance(id)?;
        let target_scope = instance
            .target_scope
            .clone()
            .ok_or_else(|| illegal(format!("{} has no target scope", instance.instance_id())))?;
        let current_activity = instance.current_scope.activity_id().map(str::to_string);
        let kind = instance.kind.clone();
        let target_definition_id = ctx.target.id.clone();
        let process_instance_id = self.process_instance_id;
        let representative = self.resolve_representative(ctx.tree, id)?;

        match (&kind, &target_scope) {
            (
                InstanceKind::Activity {
                    is_process_instance: true,
                    ..
                },
                _,
            ) => {
                ctx.tree.execution_mut(representative)?.process_definition_id = target_definition_id.clone();
                ctx.record(HistoryEvent::ProcessInstanceMigrate {
                    process_instance_id,
                    definition_id: target_definition_id,
                });
            }
            (
                InstanceKind::Activity {
                    activity_instance_id,
                    scope_execution,
                    ..
                },
                ScopeRef::Activity(target_activity),
            ) => {
                {
                    let e = ctx.tree.execution_mut(representative)?;
                    e.process_definition_id = target_definition_id.clone();
                    if *scope_execution {
                        e.scope_activity = Some(target_scope.clone());
                        if e.activity.is_some() && e.activity == current_activity {
                            e.activity = Some(target_activity.clone());
                        }
                    } else {
                        e.activity = Some(target_activity.clone());
                    }
                }
                self.update_concurrent_parent(ctx, representative)?;
                ctx.record(HistoryEvent::ActivityInstanceMigrate {
                    process_instance_id,
                    activity_instance_id: activity_instance_id.clone(),
                    activity_id: target_activity.clone(),
                    definition_id: target_definition_id,
                });
                let target_is_scope = ctx.target.is_scope(&target_scope);
                if *scope_execution && !target_is_scope {
                    self.become_non_scope(ctx, id, target_activity)?;
                } else if !*scope_execution && target_is_scope {
                    self.become_scope(ctx, id, &target_scope)?;
                }
            }
            (InstanceKind::Transition { job, resume_point, .. }, ScopeRef::Activity(target_activity)) => {
                {
                    let e = ctx.tree.execution_mut(representative)?;
                    e.process_definition_id = target_definition_id.clone();
                    e.activity = Some(target_activity.clone());
                    e.transition = match resume_point {
                        AsyncResumePoint::Transition(t) => Some(t.clone()),
                        _ => None,
                    };
                }
                self.update_concurrent_parent(ctx, representative)?;
                if let Some(j) = ctx.tree.jobs.get_mut(job) {
                    j.execution = Some(representative);
                    j.activity_id = target_activity.clone();
                    j.process_definition_id = target_definition_id;
                    j.kind = JobKind::AsyncContinuation {
                        resume_point: resume_point.clone(),
                    };
                }
            }
            (
                InstanceKind::EventScope {
                    execution,
                    subscription,
                },
                ScopeRef::Activity(target_activity),
            ) => {
                {
                    let e = ctx.tree.execution_mut(*execution)?;
                    e.process_definition_id = target_definition_id.clone();
                    e.activity = Some(target_activity.clone());
                    e.scope_activity = Some(target_scope.clone());
                }
                if let Some(s) = subscription.and_then(|s| ctx.tree.event_subscriptions.get_mut(&s)) {
                    s.activity_id = target_activity.clone();
                    s.process_definition_id = target_definition_id;
                }
            }
            (InstanceKind::CompensationSubscription { subscription }, ScopeRef::Activity(target_activity)) => {
                if let Some(s) = ctx.tree.event_subscriptions.get_mut(subscription) {
                    s.activity_id = target_activity.clone();
                    s.process_definition_id = target_definition_id;
                }
            }
            (_, ScopeRef::Process) => {
                return Err(illegal(format!(
                    "{} cannot be migrated to the process scope",
                    self.instance(id)?.instance_id()
                )));
            }
        }

        self.instance_mut(id)?.current_scope = target_scope;
        Ok(())
    }

    fn update_concurrent_parent(
        &self,
        ctx: &mut MigrationContext<'_>,
        execution: ExecutionId,
    ) -> Result<(), MigrationError> {
        if let Some(parent) = ctx.tree.parent(execution) {
            let p = ctx.tree.execution_mut(parent)?;
            if p.is_concurrent {
                p.process_definition_id = ctx.target.id.clone();
            }
        }
        Ok(())
    }

    /// A non-scope activity instance whose target is a scope gets a scope
    /// execution below its current one.
    fn become_scope(
        &mut self,
        ctx: &mut MigrationContext<'_>,
        id: MigratingId,
        target_scope: &ScopeRef,
    ) -> Result<(), MigrationError> {
        let representative = self.resolve_representative(ctx.tree, id)?;
        let (activity_instance_id, active) = match &self.instance(id)?.kind {
            InstanceKind::Activity {
                activity_instance_id, ..
            } => (
                activity_instance_id.clone(),
                ctx.tree.execution(representative)?.is_active,
            ),
            _ => return Err(illegal("only activity instances can become scopes")),
        };

        let scope_execution = ctx.tree.create_child(representative);
        {
            let s = ctx.tree.execution_mut(scope_execution)?;
            s.is_scope = true;
            s.scope_activity = Some(target_scope.clone());
            s.activity = target_scope.activity_id().map(str::to_string);
            s.activity_instance_id = Some(activity_instance_id.clone());
            s.scope_instance_id = Some(activity_instance_id);
            s.is_active = active;
        }
        {
            let p = ctx.tree.execution_mut(representative)?;
            p.activity = None;
            p.activity_instance_id = None;
            p.is_active = false;
        }
        if let InstanceKind::Activity {
            representative: rep,
            scope_execution: scope,
            ..
        } = &mut self.instance_mut(id)?.kind
        {
            *rep = scope_execution;
            *scope = true;
        }
        debug!(execution = %representative, scope_execution = %scope_execution, "activity instance became a scope");
        Ok(())
    }

    /// A scope activity instance whose target is not a scope hands its state
    /// to the parent execution and drops its scope execution.
    fn become_non_scope(
        &mut self,
        ctx: &mut MigrationContext<'_>,
        id: MigratingId,
        target_activity: &str,
    ) -> Result<(), MigrationError> {
        let scope_execution = self.resolve_representative(ctx.tree, id)?;
        let activity_instance_id = match &self.instance(id)?.kind {
            InstanceKind::Activity {
                activity_instance_id, ..
            } => activity_instance_id.clone(),
            _ => return Err(illegal("only activity instances can stop being scopes")),
        };
        let parent = ctx
            .tree
            .parent(scope_execution)
            .ok_or_else(|| illegal(format!("scope execution {} has no parent", scope_execution)))?;

        self.set_dependents_execution(ctx.tree, id, None);
        for child in ctx.tree.children(scope_execution) {
            ctx.tree.set_parent(child, Some(parent));
        }
        let active = ctx.tree.execution(scope_execution)?.is_active;
        {
            let p = ctx.tree.execution_mut(parent)?;
            p.activity = Some(target_activity.to_string());
            p.activity_instance_id = Some(activity_instance_id);
            p.is_active = active;
        }
        ctx.tree.remove(scope_execution);

        if let InstanceKind::Activity {
            representative,
            scope_execution: scope,
            ..
        } = &mut self.instance_mut(id)?.kind
        {
            *representative = parent;
            *scope = false;
        }
        self.set_dependents_execution(ctx.tree, id, Some(parent));
        debug!(scope_execution = %scope_execution, execution = %parent, "activity instance stopped being a scope");
        Ok(())
    }

    /// Migrates the dependent records and creates the emerging ones.
    pub fn migrate_dependent_entities(
        &mut self,
        ctx: &mut MigrationContext<'_>,
        id: MigratingId,
    ) -> Result<(), MigrationError> {
        let representative = self.resolve_representative(ctx.tree, id)?;
        let target_definition_id = ctx.target.id.clone();
        let dependents = self.instance(id)?.dependents.clone();
        for dependent in &dependents {
            if let Some(event) = dependent.migrate_state(ctx.tree, representative, &target_definition_id) {
                ctx.record(event);
            }
        }

        let emerging = std::mem::take(&mut self.instance_mut(id)?.emerging);
        let retries = ctx.services.config.default_job_retries;
        for dependent in &emerging {
            let record = dependent.create(ctx.tree, representative, retries);
            trace!(execution = %representative, record = %record, "emerging dependent created");
        }
        Ok(())
    }

    /// Removes the records of a mapped instance that have no counterpart in the target.
    pub fn remove_unmapped_dependents(
        &mut self,
        ctx: &mut MigrationContext<'_>,
        id: MigratingId,
    ) -> Result<(), MigrationError> {
        let removing = std::mem::take(&mut self.instance_mut(id)?.removing);
        for dependent in removing {
            dependent.remove(ctx.tree);
        }
        Ok(())
    }

    /// Detaches every child and returns them.
    pub fn detach_children(
        &mut self,
        ctx: &mut MigrationContext<'_>,
        id: MigratingId,
    ) -> Result<Vec<MigratingId>, MigrationError> {
        let children = self.children(id);
        for child in &children {
            self.detach_state(ctx, *child)?;
        }
        Ok(children)
    }

    /// Deletes an unmapped instance from the tree. Activity instances run the
    /// regular delete cascade against the source definition.
    pub fn remove(&mut self, ctx: &mut MigrationContext<'_>, id: MigratingId) -> Result<(), MigrationError> {
        let instance = self.instance(id)?;
        let kind = instance.kind.clone();
        debug!(instance = %instance.instance_id(), kind = instance.kind_name(), "remove unmapped instance");
        match kind {
            InstanceKind::Activity {
                is_process_instance: true,
                ..
            } => return Err(illegal("the process instance cannot be removed")),
            InstanceKind::Activity {
                representative,
                scope_execution: true,
                ..
            } => {
                let old_parent = ctx.tree.parent(representative);
                let source = ctx.source;
                let services = ctx.services;
                let options = ctx.options;
                let history = {
                    let mut interpreter = Interpreter::new(&mut *ctx.tree, source, services);
                    interpreter.delete_cascade(
                        representative,
                        "migration",
                        options.skip_custom_listeners,
                        options.skip_io_mappings,
                    )?;
                    interpreter.run()?;
                    interpreter.take_history()
                };
                ctx.extend_history(history);
                if let Some(old_parent) = old_parent {
                    Self::destroy_attachable_execution(ctx.tree, old_parent);
                }
            }
            InstanceKind::EventScope {
                execution,
                subscription,
            } => {
                ctx.tree.remove(execution);
                if let Some(subscription) = subscription {
                    ctx.tree.event_subscriptions.remove(&subscription);
                }
            }
            InstanceKind::CompensationSubscription { subscription } => {
                ctx.tree.event_subscriptions.remove(&subscription);
            }
            InstanceKind::Activity { .. } | InstanceKind::Transition { .. } => {
                return Err(illegal(format!(
                    "{} '{}' is a leaf and cannot be removed",
                    self.instance(id)?.kind_name(),
                    self.instance(id)?.instance_id()
                )));
            }
        }
        self.set_parent(id, None);
        self.instance_mut(id)?.detached = true;
        Ok(())
    }

    /// Registers an activity instance created for a scope that only exists in the target.
    pub fn add_emerged_activity_instance(
        &mut self,
        parent: MigratingId,
        scope: ScopeRef,
        execution: ExecutionId,
        activity_instance_id: String,
    ) -> MigratingId {
        self.add(
            Some(parent),
            None,
            Some(scope),
            InstanceKind::Activity {
                activity_instance_id,
                representative: execution,
                scope_execution: true,
                active: false,
                is_process_instance: false,
            },
        )
    }

    pub fn add_emerged_event_scope(
        &mut self,
        parent: MigratingId,
        scope: ScopeRef,
        execution: ExecutionId,
        subscription: RecordId,
    ) -> MigratingId {
        self.add(
            Some(parent),
            None,
            Some(scope),
            InstanceKind::EventScope {
                execution,
                subscription: Some(subscription),
            },
        )
    }
}
