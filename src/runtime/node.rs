use std::fmt::Debug;

use anyhow::Result;
use serde_json::Value;

use crate::definition::ActivityKind;
use crate::error::PvmError;
use crate::runtime::execution::ExecutionId;
use crate::runtime::interpreter::Interpreter;

/// 活动行为接口
/// One implementation per activity kind. Behaviors only see the interpreter;
/// every structural change goes through it so that follow-up operations end
/// up on the work stack.
pub trait ActivityBehavior: Send + Sync + Debug {
    fn kind(&self) -> ActivityKind;

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()>;

    /// External trigger of a waiting execution (task completion, message, called instance end).
    fn signal(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId, signal: &str, payload: &Value) -> Result<()> {
        let _ = (signal, payload);
        let activity = pvm.tree.execution(execution)?.activity.clone().unwrap_or_default();
        Err(PvmError::NotSignallable(activity).into())
    }

    /// Composite behaviors own child activities and decide when their scope completes.
    fn is_composite(&self) -> bool {
        false
    }

    /// A concurrent child of the composite's scope execution ended.
    fn concurrent_child_execution_ended(
        &self,
        pvm: &mut Interpreter<'_>,
        scope_execution: ExecutionId,
        ended: ExecutionId,
    ) -> Result<()> {
        pvm.tree.remove(ended);
        pvm.tree.try_prune_last_concurrent_child(scope_execution);
        Ok(())
    }

    /// The last child activity of the composite's scope ended.
    fn complete(&self, pvm: &mut Interpreter<'_>, scope_execution: ExecutionId) -> Result<()> {
        Ok(pvm.leave(scope_execution)?)
    }
}
