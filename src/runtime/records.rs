use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::runtime::execution::ExecutionId;
use crate::runtime::job::AsyncResumePoint;

/// Identity of a dependent record owned by an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec-{}", self.0)
    }
}

// A record with `execution == None` is detached: it survives removal of
// its former execution until it is attached again.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: RecordId,
    pub name: String,
    pub value: Value,
    pub execution: Option<ExecutionId>,
    pub process_definition_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: RecordId,
    pub activity_id: String,
    pub name: String,
    pub assignee: Option<String>,
    pub execution: Option<ExecutionId>,
    pub process_definition_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobKind {
    /// Continues the operation chain at the stored resume point.
    AsyncContinuation { resume_point: AsyncResumePoint },
    /// Fires the boundary timer event `activity_id` of the job.
    Timer { due_millis: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: RecordId,
    pub kind: JobKind,
    pub activity_id: String,
    pub execution: Option<ExecutionId>,
    pub retries: u32,
    pub exception_message: Option<String>,
    pub process_definition_id: String,
}

impl Job {
    pub fn is_async_continuation(&self) -> bool {
        matches!(self.kind, JobKind::AsyncContinuation { .. })
    }

    pub fn resume_point(&self) -> Option<&AsyncResumePoint> {
        match &self.kind {
            JobKind::AsyncContinuation { resume_point } => Some(resume_point),
            JobKind::Timer { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: RecordId,
    pub incident_type: String,
    pub message: String,
    pub activity_id: String,
    pub execution: Option<ExecutionId>,
    pub job: Option<RecordId>,
    pub process_definition_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSubscriptionKind {
    Message,
    Compensate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: RecordId,
    pub kind: EventSubscriptionKind,
    pub event_name: Option<String>,
    /// Activity triggered by the event (boundary event, catch event or compensable activity).
    pub activity_id: String,
    pub execution: Option<ExecutionId>,
    /// Event-scope execution holding the state to compensate.
    pub configuration: Option<ExecutionId>,
    pub process_definition_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTask {
    pub id: RecordId,
    pub topic: String,
    pub activity_id: String,
    pub execution: Option<ExecutionId>,
    pub process_definition_id: String,
}

/// Reference from a call activity to the process instance it started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalledInstance {
    pub id: RecordId,
    pub process_instance_id: Option<Uuid>,
    pub called_definition_id: String,
    pub activity_id: String,
    pub execution: Option<ExecutionId>,
}

/// Number of dependent records of each kind currently held by a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordCounts {
    pub variables: usize,
    pub tasks: usize,
    pub jobs: usize,
    pub incidents: usize,
    pub event_subscriptions: usize,
    pub external_tasks: usize,
    pub called_instances: usize,
}
