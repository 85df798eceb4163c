use crate::definition::{ActivityKind, ScopeRef};
use crate::error::DefinitionError;
use crate::runtime::execution::ExecutionId;
use crate::runtime::interpreter::Interpreter;
use crate::runtime::node::ActivityBehavior;
use crate::runtime::operation::AtomicOperation;
use anyhow::Result;
use tracing::debug;

// --- PARALLEL GATEWAY ---

/// Forks on all outgoing transitions; joins once every incoming transition
/// has an inactive execution waiting in the gateway.
#[derive(Debug)]
pub struct ParallelGatewayBehavior;

impl ActivityBehavior for ParallelGatewayBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::ParallelGateway
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        let definition = pvm.definition;
        let activity = pvm.current_activity(execution)?;
        pvm.tree.execution_mut(execution)?.is_active = false;

        let joined = pvm.find_inactive_concurrent_executions(execution, &activity.id)?;
        let expected = definition.incoming(&activity.id).len();
        debug!(gateway = %activity.id, joined = joined.len(), expected, "parallel gateway");

        if joined.len() == expected {
            let outgoing = definition
                .outgoing(&activity.id)
                .into_iter()
                .map(|t| t.id.clone())
                .collect();
            pvm.leave_activity_via_transitions(execution, outgoing, joined)?;
        }
        Ok(())
    }
}

// --- SUBPROCESS ---

/// Embedded subprocess: starts its initial activity and completes once the
/// last child activity ended.
#[derive(Debug)]
pub struct SubProcessBehavior;

impl ActivityBehavior for SubProcessBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::SubProcess
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        let definition = pvm.definition;
        let activity = pvm.current_activity(execution)?;
        let initial = definition
            .initial(&ScopeRef::activity(&activity.id))
            .ok_or_else(|| DefinitionError::NoStartEvent(activity.id.clone()))?;
        pvm.tree.execution_mut(execution)?.activity = Some(initial.id.clone());
        pvm.push(execution, AtomicOperation::ActivityStartCreateScope);
        Ok(())
    }

    fn is_composite(&self) -> bool {
        true
    }
}
