use crate::runtime::execution::ExecutionId;
use crate::runtime::history::HistoryEvent;
use crate::runtime::records::{EventSubscriptionKind, JobKind, RecordId};
use crate::runtime::tree::ExecutionTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentKind {
    Variable,
    Task,
    Job,
    EventSubscription,
    ExternalTask,
    CalledInstance,
    Incident,
}

impl DependentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependentKind::Variable => "variable",
            DependentKind::Task => "task",
            DependentKind::Job => "job",
            DependentKind::EventSubscription => "event subscription",
            DependentKind::ExternalTask => "external task",
            DependentKind::CalledInstance => "called process instance",
            DependentKind::Incident => "incident",
        }
    }
}

/// Event trigger taken over from the target activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTrigger {
    Message(Option<String>),
    Timer(u64),
}

/// A record that moves along with the instance owning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratingDependent {
    pub kind: DependentKind,
    pub record: RecordId,
    /// `None` keeps the record's activity reference (variables have none).
    pub target_activity_id: Option<String>,
    pub trigger: Option<EventTrigger>,
}

impl MigratingDependent {
    pub fn new(kind: DependentKind, record: RecordId, target_activity_id: Option<String>) -> Self {
        Self {
            kind,
            record,
            target_activity_id,
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: Option<EventTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    /// Points the record at `execution`, or detaches it.
    pub fn set_execution(&self, tree: &mut ExecutionTree, execution: Option<ExecutionId>) {
        match self.kind {
            DependentKind::Variable => {
                if let Some(r) = tree.variables.get_mut(&self.record) {
                    r.execution = execution;
                }
            }
            DependentKind::Task => {
                if let Some(r) = tree.tasks.get_mut(&self.record) {
                    r.execution = execution;
                }
            }
            DependentKind::Job => {
                if let Some(r) = tree.jobs.get_mut(&self.record) {
                    r.execution = execution;
                }
            }
            DependentKind::EventSubscription => {
                if let Some(r) = tree.event_subscriptions.get_mut(&self.record) {
                    r.execution = execution;
                }
            }
            DependentKind::ExternalTask => {
                if let Some(r) = tree.external_tasks.get_mut(&self.record) {
                    r.execution = execution;
                }
            }
            DependentKind::CalledInstance => {
                if let Some(r) = tree.called_instances.get_mut(&self.record) {
                    r.execution = execution;
                }
            }
            DependentKind::Incident => {
                if let Some(r) = tree.incidents.get_mut(&self.record) {
                    r.execution = execution;
                }
            }
        }
    }

    /// Moves the record onto the target definition. Returns the history
    /// event the migration produces, if any.
    pub fn migrate_state(
        &self,
        tree: &mut ExecutionTree,
        execution: ExecutionId,
        target_definition_id: &str,
    ) -> Option<HistoryEvent> {
        self.set_execution(tree, Some(execution));
        let process_instance_id = tree.process_instance_id();
        let activity = self.target_activity_id.clone();
        match self.kind {
            DependentKind::Variable => {
                let r = tree.variables.get_mut(&self.record)?;
                r.process_definition_id = target_definition_id.to_string();
                Some(HistoryEvent::VariableMigrate {
                    process_instance_id,
                    variable: r.id,
                    name: r.name.clone(),
                    definition_id: target_definition_id.to_string(),
                })
            }
            DependentKind::Task => {
                let r = tree.tasks.get_mut(&self.record)?;
                r.process_definition_id = target_definition_id.to_string();
                if let Some(activity) = activity {
                    r.activity_id = activity;
                }
                Some(HistoryEvent::TaskMigrate {
                    process_instance_id,
                    task: r.id,
                    activity_id: r.activity_id.clone(),
                    definition_id: target_definition_id.to_string(),
                })
            }
            DependentKind::Job => {
                let r = tree.jobs.get_mut(&self.record)?;
                r.process_definition_id = target_definition_id.to_string();
                if let Some(activity) = activity {
                    r.activity_id = activity;
                }
                let is_timer = matches!(r.kind, JobKind::Timer { .. });
                if let (Some(EventTrigger::Timer(due_millis)), true) = (&self.trigger, is_timer) {
                    r.kind = JobKind::Timer { due_millis: *due_millis };
                }
                None
            }
            DependentKind::EventSubscription => {
                let r = tree.event_subscriptions.get_mut(&self.record)?;
                r.process_definition_id = target_definition_id.to_string();
                if let Some(activity) = activity {
                    r.activity_id = activity;
                }
                if let Some(EventTrigger::Message(name)) = &self.trigger {
                    r.event_name = name.clone();
                }
                None
            }
            DependentKind::ExternalTask => {
                let r = tree.external_tasks.get_mut(&self.record)?;
                r.process_definition_id = target_definition_id.to_string();
                if let Some(activity) = activity {
                    r.activity_id = activity;
                }
                None
            }
            DependentKind::CalledInstance => {
                let r = tree.called_instances.get_mut(&self.record)?;
                if let Some(activity) = activity {
                    r.activity_id = activity;
                }
                None
            }
            DependentKind::Incident => {
                let r = tree.incidents.get_mut(&self.record)?;
                r.process_definition_id = target_definition_id.to_string();
                if let Some(activity) = activity {
                    r.activity_id = activity;
                }
                None
            }
        }
    }
}

/// A record of a mapped instance that has no counterpart in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovingDependent {
    EventSubscription(RecordId),
    /// Removed together with its incidents.
    Job(RecordId),
    CompensationSubscription(RecordId),
}

impl RemovingDependent {
    pub fn remove(&self, tree: &mut ExecutionTree) {
        match self {
            RemovingDependent::EventSubscription(id) | RemovingDependent::CompensationSubscription(id) => {
                tree.event_subscriptions.remove(id);
            }
            RemovingDependent::Job(id) => {
                tree.jobs.remove(id);
                tree.incidents.retain(|_, i| i.job != Some(*id));
            }
        }
    }
}

/// A record the target activity needs but the source never created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmergingDependent {
    MessageSubscription {
        activity_id: String,
        event_name: Option<String>,
    },
    TimerJob {
        activity_id: String,
        due_millis: u64,
    },
}

impl EmergingDependent {
    pub fn create(&self, tree: &mut ExecutionTree, execution: ExecutionId, retries: u32) -> RecordId {
        match self {
            EmergingDependent::MessageSubscription {
                activity_id,
                event_name,
            } => tree.create_event_subscription(
                execution,
                EventSubscriptionKind::Message,
                event_name.as_deref(),
                activity_id,
            ),
            EmergingDependent::TimerJob {
                activity_id,
                due_millis,
            } => tree.create_job(
                execution,
                activity_id,
                JobKind::Timer {
                    due_millis: *due_millis,
                },
                retries,
            ),
        }
    }
}
