use std::collections::HashMap;

use tracing::debug;

use crate::definition::ScopeRef;
use crate::error::MigrationError;
use crate::migration::instance::{AttachTarget, MigratingId, MigratingProcessInstance, MigrationContext};
use crate::runtime::interpreter::Interpreter;
use crate::runtime::records::EventSubscriptionKind;

/// Target scopes that already have an instance on the current branch of the walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeInstanceBranch {
    instances: HashMap<ScopeRef, MigratingId>,
}

impl ScopeInstanceBranch {
    pub fn get(&self, scope: &ScopeRef) -> Option<MigratingId> {
        self.instances.get(scope).copied()
    }

    pub fn register(&mut self, scope: ScopeRef, instance: MigratingId) {
        self.instances.insert(scope, instance);
    }

    pub fn contains(&self, scope: &ScopeRef) -> bool {
        self.instances.contains_key(scope)
    }
}

/// Migrates every instance top-down, creating target scopes that are missing
/// on a branch once and sharing them between siblings.
pub fn walk(instance: &mut MigratingProcessInstance, ctx: &mut MigrationContext<'_>) -> Result<(), MigrationError> {
    let root = instance.root();
    instance.migrate_state(ctx, root)?;
    instance.migrate_dependent_entities(ctx, root)?;

    let mut branch = ScopeInstanceBranch::default();
    branch.register(ScopeRef::Process, root);
    walk_children(instance, ctx, root, &branch)
}

fn walk_children(
    instance: &mut MigratingProcessInstance,
    ctx: &mut MigrationContext<'_>,
    parent: MigratingId,
    branch: &ScopeInstanceBranch,
) -> Result<(), MigrationError> {
    // activity and compensation instances materialize scopes differently, so they track them apart
    let mut activity_branch = branch.clone();
    let mut compensation_branch = branch.clone();
    for child in instance.children(parent) {
        let Some(c) = instance.get(child) else {
            continue;
        };
        if c.source_scope.is_none() {
            continue;
        }
        if c.is_compensation() {
            visit(instance, ctx, child, &mut compensation_branch)?;
        } else {
            visit(instance, ctx, child, &mut activity_branch)?;
        }
    }
    Ok(())
}

fn visit(
    instance: &mut MigratingProcessInstance,
    ctx: &mut MigrationContext<'_>,
    id: MigratingId,
    branch: &mut ScopeInstanceBranch,
) -> Result<(), MigrationError> {
    let (target_scope, parent, is_compensation) = {
        let c = instance
            .get(id)
            .ok_or_else(|| MigrationError::IllegalState(format!("migrating instance {} not found", id)))?;
        let target_scope = c
            .target_scope
            .clone()
            .ok_or_else(|| MigrationError::IllegalState(format!("{} '{}' is not mapped", c.kind_name(), c.instance_id())))?;
        let parent = c
            .link
            .parent
            .ok_or_else(|| MigrationError::IllegalState(format!("{} '{}' has no parent", c.kind_name(), c.instance_id())))?;
        (target_scope, parent, c.is_compensation())
    };
    let target_flow_scope = flow_scope(ctx, &target_scope)?;

    if branch.get(&target_flow_scope) != Some(parent) {
        let mut missing = Vec::new();
        let mut scope = target_flow_scope;
        let mut anchor = loop {
            if let Some(existing) = branch.get(&scope) {
                break existing;
            }
            missing.push(scope.clone());
            scope = flow_scope(ctx, &scope)?;
        };

        instance.detach_state(ctx, id)?;
        for scope in missing.into_iter().rev() {
            anchor = if is_compensation {
                instantiate_event_scope(instance, ctx, anchor, &scope)?
            } else {
                instantiate_scope(instance, ctx, anchor, &scope)?
            };
            branch.register(scope, anchor);
        }
        instance.attach_state(ctx, id, AttachTarget::ScopeInstance(anchor))?;
    }

    instance.migrate_state(ctx, id)?;
    instance.migrate_dependent_entities(ctx, id)?;

    if instance.get(id).is_some_and(|i| i.is_scope_instance()) {
        let mut own = branch.clone();
        own.register(target_scope, id);
        walk_children(instance, ctx, id, &own)?;
    }
    Ok(())
}

fn flow_scope(ctx: &MigrationContext<'_>, scope: &ScopeRef) -> Result<ScopeRef, MigrationError> {
    ctx.target
        .flow_scope_of(scope)
        .ok_or_else(|| MigrationError::IllegalState(format!("'{}' has no flow scope in '{}'", scope, ctx.target.id)))
}

/// Enters a scope of the target definition below `anchor` without executing it.
fn instantiate_scope(
    instance: &mut MigratingProcessInstance,
    ctx: &mut MigrationContext<'_>,
    anchor: MigratingId,
    scope: &ScopeRef,
) -> Result<MigratingId, MigrationError> {
    let activity_id = scope
        .activity_id()
        .ok_or_else(|| MigrationError::IllegalState("the process scope cannot be instantiated".to_string()))?;
    let attachable = instance.create_attachable_execution(ctx, anchor)?;
    let target = ctx.target;
    let services = ctx.services;
    let options = ctx.options;
    let (execution, history) = {
        let mut interpreter = Interpreter::new(&mut *ctx.tree, target, services);
        let execution = interpreter.instantiate_scope(
            attachable,
            activity_id,
            options.skip_custom_listeners,
            options.skip_io_mappings,
        )?;
        (execution, interpreter.take_history())
    };
    ctx.extend_history(history);
    let activity_instance_id = ctx
        .tree
        .execution(execution)?
        .scope_instance_id
        .clone()
        .ok_or_else(|| MigrationError::IllegalState(format!("scope execution {} has no activity instance", execution)))?;
    debug!(scope = %scope, execution = %execution, "scope instantiated for migration");
    Ok(instance.add_emerged_activity_instance(anchor, scope.clone(), execution, activity_instance_id))
}

/// Creates the event scope execution and compensate subscription a completed
/// instance of `scope` would have left behind.
fn instantiate_event_scope(
    instance: &mut MigratingProcessInstance,
    ctx: &mut MigrationContext<'_>,
    anchor: MigratingId,
    scope: &ScopeRef,
) -> Result<MigratingId, MigrationError> {
    let activity_id = scope
        .activity_id()
        .ok_or_else(|| MigrationError::IllegalState("the process scope has no event scope".to_string()))?;
    let host = instance.resolve_representative(ctx.tree, anchor)?;
    let event_scope = ctx.tree.create_child(host);
    {
        let e = ctx.tree.execution_mut(event_scope)?;
        e.is_scope = true;
        e.is_event_scope = true;
        e.is_active = false;
        e.activity = Some(activity_id.to_string());
        e.scope_activity = Some(scope.clone());
        e.process_definition_id = ctx.target.id.clone();
    }
    let subscription = ctx
        .tree
        .create_event_subscription(host, EventSubscriptionKind::Compensate, None, activity_id);
    if let Some(s) = ctx.tree.event_subscriptions.get_mut(&subscription) {
        s.configuration = Some(event_scope);
        s.process_definition_id = ctx.target.id.clone();
    }
    debug!(scope = %scope, execution = %event_scope, "event scope instantiated for migration");
    Ok(instance.add_emerged_event_scope(anchor, scope.clone(), event_scope, subscription))
}
