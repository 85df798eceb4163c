use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::runtime::execution::ExecutionId;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("process definition '{0}' not found")]
    NotFound(String),
    #[error("process definition '{0}' has no start event")]
    NoStartEvent(String),
    #[error("duplicate activity id '{0}'")]
    DuplicateActivity(String),
    #[error("activity '{activity}' not found in process definition '{definition}'")]
    UnknownActivity { definition: String, activity: String },
    #[error("activity '{activity}' references unknown flow scope '{parent}'")]
    UnknownFlowScope { activity: String, parent: String },
    #[error("transition '{transition}' references unknown activity '{activity}'")]
    UnknownTransitionEnd { transition: String, activity: String },
    #[error("boundary event '{0}' is not attached to an activity")]
    UnattachedBoundaryEvent(String),
}

/// Failures raised while the interpreter advances an execution tree.
#[derive(Debug, Error)]
pub enum PvmError {
    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),
    #[error("execution {0} has no current activity")]
    NoActivity(ExecutionId),
    #[error("execution {0} has no transition to take")]
    NoTransition(ExecutionId),
    #[error("cannot create a concurrent execution below non-scope execution {0}")]
    NotAScope(ExecutionId),
    #[error("no execution for scope '{scope}' found above execution {execution}")]
    ScopeExecutionNotFound { scope: String, execution: ExecutionId },
    #[error("no behavior registered for activity kind '{0}'")]
    MissingBehavior(String),
    #[error("activity '{0}' does not accept signals")]
    NotSignallable(String),
    #[error("behavior of activity '{activity}' failed on execution {execution}: {message}")]
    Behavior {
        execution: ExecutionId,
        activity: String,
        message: String,
    },
    #[error("error '{code}' thrown by activity '{activity}' was not caught")]
    UncaughtError { code: String, activity: String },
    #[error("process instance {0} has already ended")]
    InstanceEnded(Uuid),
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(
        "migration plan from '{source_definition}' to '{target_definition}' is not valid: {}",
        .failures.join("; ")
    )]
    InvalidPlan {
        source_definition: String,
        target_definition: String,
        failures: Vec<String>,
    },
    #[error("{0}")]
    InvalidInstance(MigratingInstanceReport),
    #[error("cannot attach {kind} '{instance}' to transition instance '{transition_instance}'")]
    IllegalAttachTarget {
        kind: &'static str,
        instance: String,
        transition_instance: String,
    },
    #[error("migration state is inconsistent: {0}")]
    IllegalState(String),
    #[error(transparent)]
    Pvm(#[from] PvmError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

/// Report for one activity or transition instance that cannot be migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReport {
    pub instance_id: String,
    pub source_activity_id: String,
    pub failures: Vec<String>,
}

/// Collects every instance-level failure found before a migration mutates anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratingInstanceReport {
    pub process_instance_id: Uuid,
    pub failures: Vec<String>,
    pub activity_instance_reports: Vec<InstanceReport>,
    pub transition_instance_reports: Vec<InstanceReport>,
}

impl MigratingInstanceReport {
    pub fn new(process_instance_id: Uuid) -> Self {
        Self {
            process_instance_id,
            failures: Vec::new(),
            activity_instance_reports: Vec::new(),
            transition_instance_reports: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
            || !self.activity_instance_reports.is_empty()
            || !self.transition_instance_reports.is_empty()
    }

    /// Ids of all activity and transition instances named in the report.
    pub fn instance_ids(&self) -> Vec<&str> {
        self.activity_instance_reports
            .iter()
            .chain(self.transition_instance_reports.iter())
            .map(|r| r.instance_id.as_str())
            .collect()
    }
}

impl fmt::Display for MigratingInstanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot migrate process instance {}:", self.process_instance_id)?;
        for failure in &self.failures {
            write!(f, "\n\t{}", failure)?;
        }
        for report in &self.activity_instance_reports {
            write!(
                f,
                "\n\tactivity instance '{}' ({}): {}",
                report.instance_id,
                report.source_activity_id,
                report.failures.join(", ")
            )?;
        }
        for report in &self.transition_instance_reports {
            write!(
                f,
                "\n\ttransition instance '{}' ({}): {}",
                report.instance_id,
                report.source_activity_id,
                report.failures.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Business error thrown by a behavior or service handler. The interpreter
/// routes it to the nearest matching error boundary event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("BPMN error '{code}'")]
pub struct BpmnError {
    pub code: String,
}

impl BpmnError {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}
