use crate::definition::ActivityKind;
use crate::runtime::execution::ExecutionId;
use crate::runtime::interpreter::Interpreter;
use crate::runtime::node::ActivityBehavior;
use anyhow::Result;

/// None start event of the process or of a subprocess.
#[derive(Debug)]
pub struct StartEventBehavior;

impl ActivityBehavior for StartEventBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::StartEvent
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        Ok(pvm.leave(execution)?)
    }
}

#[derive(Debug)]
pub struct EndEventBehavior;

impl ActivityBehavior for EndEventBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::EndEvent
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        Ok(pvm.end(execution, true)?)
    }
}

/// Reached through the cancel-scope path, so it is the last execution of its scope.
#[derive(Debug)]
pub struct TerminateEndEventBehavior;

impl ActivityBehavior for TerminateEndEventBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::TerminateEndEvent
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        Ok(pvm.end(execution, true)?)
    }
}

/// Task without any work: passes straight through.
#[derive(Debug)]
pub struct TaskBehavior;

impl ActivityBehavior for TaskBehavior {
    fn kind(&self) -> ActivityKind {
        ActivityKind::Task
    }

    fn execute(&self, pvm: &mut Interpreter<'_>, execution: ExecutionId) -> Result<()> {
        Ok(pvm.leave(execution)?)
    }
}
