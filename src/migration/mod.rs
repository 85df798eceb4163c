//! Live migration of a process instance onto another process definition.
//!
//! A migration runs in three phases. The parser builds a migrating instance
//! tree from the activity instance tree and checks every instance against the
//! plan. The remover deletes unmapped scope instances bottom-up. The walker then
//! migrates the remaining instances top-down, creating target scopes that have
//! no counterpart in the source.

pub mod dependent;
pub mod instance;
pub mod parser;
pub mod plan;
pub mod remover;
pub mod validation;
pub mod walker;

use tracing::{debug, info};

use crate::definition::ProcessDefinition;
use crate::error::{MigrationError, PvmError};
use crate::runtime::history::HistoryEvent;
use crate::runtime::instance::ProcessInstance;
use crate::runtime::services::RuntimeServices;

pub use instance::{AttachTarget, MigratingId, MigratingInstance, MigratingProcessInstance, MigrationContext};
pub use plan::{MigrationInstruction, MigrationOptions, MigrationPlan, MigrationPlanBuilder};
pub use walker::ScopeInstanceBranch;

/// Migrates `instance` from `source` to `target` following `plan`.
///
/// The instance is left untouched when the plan or the instance is invalid,
/// or when any later step fails. Returns the history the migration produced.
pub fn migrate(
    instance: &mut ProcessInstance,
    plan: &MigrationPlan,
    options: MigrationOptions,
    source: &ProcessDefinition,
    target: &ProcessDefinition,
    services: &RuntimeServices,
) -> Result<Vec<HistoryEvent>, MigrationError> {
    if instance.ended {
        return Err(PvmError::InstanceEnded(instance.id).into());
    }
    if instance.definition_id != plan.source_definition_id {
        return Err(MigrationError::InvalidPlan {
            source_definition: plan.source_definition_id.clone(),
            target_definition: plan.target_definition_id.clone(),
            failures: vec![format!(
                "process instance {} runs definition '{}'",
                instance.id, instance.definition_id
            )],
        });
    }
    validation::validate_plan(plan, source, target)?;

    let mut migrating = parser::parse(&instance.tree, source, target, plan)?;
    info!(
        process_instance = %instance.id,
        source = %source.id,
        target = %target.id,
        instances = migrating.len(),
        "migrating process instance"
    );

    let mut tree = instance.tree.clone();
    let history = {
        let mut ctx = MigrationContext::new(&mut tree, source, target, services, options);
        remover::remove_unmapped_instances(&mut migrating, &mut ctx)?;
        walker::walk(&mut migrating, &mut ctx)?;
        ctx.take_history()
    };
    tree.set_process_definition(&target.id);

    let violations = tree.check_well_formed();
    if !violations.is_empty() {
        return Err(MigrationError::IllegalState(violations.join("; ")));
    }
    debug!(tree = %tree.render(), "migrated execution tree");

    instance.tree = tree;
    instance.definition_id = target.id.clone();
    Ok(history)
}
