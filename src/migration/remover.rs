use tracing::debug;

use crate::error::MigrationError;
use crate::migration::instance::{AttachTarget, MigratingId, MigratingProcessInstance, MigrationContext};

/// Deletes every unmapped scope instance, bottom-up. The children of a removed
/// instance move to its parent; mapped instances lose their unmapped dependents.
pub fn remove_unmapped_instances(
    instance: &mut MigratingProcessInstance,
    ctx: &mut MigrationContext<'_>,
) -> Result<(), MigrationError> {
    let root = instance.root();
    visit(instance, ctx, root)
}

fn visit(
    instance: &mut MigratingProcessInstance,
    ctx: &mut MigrationContext<'_>,
    id: MigratingId,
) -> Result<(), MigrationError> {
    for child in instance.children(id) {
        visit(instance, ctx, child)?;
    }

    let Some(current) = instance.get(id) else {
        return Ok(());
    };
    if current.is_mapped() || current.is_process_instance() {
        return instance.remove_unmapped_dependents(ctx, id);
    }

    let parent = current
        .link
        .parent
        .ok_or_else(|| MigrationError::IllegalState(format!("unmapped instance {} has no parent", id)))?;
    debug!(instance = %current.instance_id(), kind = current.kind_name(), "instance has no target scope");

    let children = instance.detach_children(ctx, id)?;
    instance.remove(ctx, id)?;
    for child in children {
        instance.attach_state(ctx, child, AttachTarget::ScopeInstance(parent))?;
    }
    Ok(())
}
