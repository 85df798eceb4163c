pub mod builder;
pub mod loader;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DefinitionError;

/// A scope of a process definition: the process itself or a scope activity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScopeRef {
    Process,
    Activity(String),
}

impl ScopeRef {
    pub fn activity(id: &str) -> Self {
        ScopeRef::Activity(id.to_string())
    }

    pub fn activity_id(&self) -> Option<&str> {
        match self {
            ScopeRef::Process => None,
            ScopeRef::Activity(id) => Some(id),
        }
    }
}

impl fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeRef::Process => write!(f, "<process>"),
            ScopeRef::Activity(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    StartEvent,
    EndEvent,
    TerminateEndEvent,
    Task,
    UserTask,
    ServiceTask,
    ExternalTask,
    SubProcess,
    CallActivity,
    ParallelGateway,
    MessageCatchEvent,
    BoundaryMessage,
    BoundaryTimer,
    BoundaryError,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::StartEvent => "start_event",
            ActivityKind::EndEvent => "end_event",
            ActivityKind::TerminateEndEvent => "terminate_end_event",
            ActivityKind::Task => "task",
            ActivityKind::UserTask => "user_task",
            ActivityKind::ServiceTask => "service_task",
            ActivityKind::ExternalTask => "external_task",
            ActivityKind::SubProcess => "sub_process",
            ActivityKind::CallActivity => "call_activity",
            ActivityKind::ParallelGateway => "parallel_gateway",
            ActivityKind::MessageCatchEvent => "message_catch_event",
            ActivityKind::BoundaryMessage => "boundary_message",
            ActivityKind::BoundaryTimer => "boundary_timer",
            ActivityKind::BoundaryError => "boundary_error",
        }
    }

    pub fn is_boundary_event(&self) -> bool {
        matches!(
            self,
            ActivityKind::BoundaryMessage | ActivityKind::BoundaryTimer | ActivityKind::BoundaryError
        )
    }

    /// Composite activities decide themselves how their scope completes.
    pub fn is_composite(&self) -> bool {
        matches!(self, ActivityKind::SubProcess)
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution listener names, resolved against the engine's listener registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listeners {
    #[serde(default)]
    pub start: Vec<String>,
    #[serde(default)]
    pub end: Vec<String>,
}

impl Listeners {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// Flow scope; `None` places the activity directly in the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub scope: bool,
    #[serde(default)]
    pub async_before: bool,
    #[serde(default)]
    pub async_after: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_to: Option<String>,
    /// Interrupting boundary event.
    #[serde(default = "default_true")]
    pub cancel_activity: bool,
    /// Entering this activity cancels every other branch of its flow scope.
    #[serde(default)]
    pub cancel_scope: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub called_element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_handler: Option<String>,
    #[serde(default)]
    pub for_compensation: bool,
    #[serde(default)]
    pub listeners: Listeners,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl Activity {
    pub fn new(id: &str, kind: ActivityKind) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            kind,
            parent: None,
            scope: false,
            async_before: false,
            async_after: false,
            attached_to: None,
            cancel_activity: true,
            cancel_scope: false,
            message: None,
            timer_millis: None,
            error_code: None,
            topic: None,
            handler: None,
            params: Value::Null,
            called_element: None,
            compensation_handler: None,
            for_compensation: false,
            listeners: Listeners::default(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn flow_scope(&self) -> ScopeRef {
        match &self.parent {
            Some(parent) => ScopeRef::Activity(parent.clone()),
            None => ScopeRef::Process,
        }
    }

    pub fn has_io_mappings(&self) -> bool {
        !self.inputs.is_empty() || !self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub listeners: Vec<String>,
}

/// 流程定义 (immutable once deployed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub listeners: Listeners,
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl ProcessDefinition {
    /// Validates references and derives flags that follow from the graph:
    /// scope activities, boundary flow scopes and cancel-scope targets.
    pub fn prepare(&mut self) -> Result<(), DefinitionError> {
        if self.key.is_empty() {
            self.key = self.id.clone();
        }

        let mut ids = HashSet::new();
        for activity in &self.activities {
            if !ids.insert(activity.id.clone()) {
                return Err(DefinitionError::DuplicateActivity(activity.id.clone()));
            }
        }

        for activity in &self.activities {
            if let Some(parent) = &activity.parent {
                if !ids.contains(parent) {
                    return Err(DefinitionError::UnknownFlowScope {
                        activity: activity.id.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        for transition in &self.transitions {
            for end in [&transition.source, &transition.target] {
                if !ids.contains(end) {
                    return Err(DefinitionError::UnknownTransitionEnd {
                        transition: transition.id.clone(),
                        activity: end.clone(),
                    });
                }
            }
        }

        // boundary events live in the flow scope of the activity they are attached to
        let mut host_scopes = Vec::new();
        for activity in &self.activities {
            if activity.kind.is_boundary_event() {
                let host_id = activity
                    .attached_to
                    .as_ref()
                    .ok_or_else(|| DefinitionError::UnattachedBoundaryEvent(activity.id.clone()))?;
                let host = self
                    .activities
                    .iter()
                    .find(|a| &a.id == host_id)
                    .ok_or_else(|| DefinitionError::UnknownActivity {
                        definition: self.id.clone(),
                        activity: host_id.clone(),
                    })?;
                host_scopes.push((activity.id.clone(), host.parent.clone(), host_id.clone()));
            }
        }
        let hosts: HashSet<String> = host_scopes.iter().map(|(_, _, host)| host.clone()).collect();
        for (boundary_id, parent, _) in host_scopes {
            if let Some(boundary) = self.activities.iter_mut().find(|a| a.id == boundary_id) {
                boundary.parent = parent;
            }
        }

        for activity in &mut self.activities {
            if activity.kind == ActivityKind::SubProcess
                || hosts.contains(&activity.id)
                || activity.has_io_mappings()
            {
                activity.scope = true;
            }
            if activity.kind == ActivityKind::TerminateEndEvent {
                activity.cancel_scope = true;
            }
        }

        if self.initial(&ScopeRef::Process).is_none() {
            return Err(DefinitionError::NoStartEvent(self.id.clone()));
        }
        Ok(())
    }

    pub fn activity(&self, id: &str) -> Option<&Activity> {
        self.activities.iter().find(|a| a.id == id)
    }

    pub fn require_activity(&self, id: &str) -> Result<&Activity, DefinitionError> {
        self.activity(id).ok_or_else(|| DefinitionError::UnknownActivity {
            definition: self.id.clone(),
            activity: id.to_string(),
        })
    }

    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.id == id)
    }

    pub fn outgoing(&self, activity_id: &str) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.source == activity_id).collect()
    }

    pub fn incoming(&self, activity_id: &str) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.target == activity_id).collect()
    }

    /// Activities whose flow scope is `scope`, in declaration order.
    pub fn children(&self, scope: &ScopeRef) -> Vec<&Activity> {
        self.activities.iter().filter(|a| &a.flow_scope() == scope).collect()
    }

    /// The none start event of a scope.
    pub fn initial(&self, scope: &ScopeRef) -> Option<&Activity> {
        self.activities
            .iter()
            .find(|a| a.kind == ActivityKind::StartEvent && &a.flow_scope() == scope)
    }

    pub fn boundary_events(&self, activity_id: &str) -> Vec<&Activity> {
        self.activities
            .iter()
            .filter(|a| a.attached_to.as_deref() == Some(activity_id))
            .collect()
    }

    pub fn contains_scope(&self, scope: &ScopeRef) -> bool {
        match scope {
            ScopeRef::Process => true,
            ScopeRef::Activity(id) => self.activity(id).is_some(),
        }
    }

    pub fn is_scope(&self, scope: &ScopeRef) -> bool {
        match scope {
            ScopeRef::Process => true,
            ScopeRef::Activity(id) => self.activity(id).map(|a| a.scope).unwrap_or(false),
        }
    }

    /// A scope without child activities.
    pub fn is_leaf(&self, scope: &ScopeRef) -> bool {
        self.children(scope).is_empty()
    }

    pub fn flow_scope_of(&self, scope: &ScopeRef) -> Option<ScopeRef> {
        match scope {
            ScopeRef::Process => None,
            ScopeRef::Activity(id) => self.activity(id).map(|a| a.flow_scope()),
        }
    }

    /// Nearest enclosing scope of `scope` that is itself a scope, skipping non-scope activities.
    pub fn scope_parent(&self, scope: &ScopeRef) -> Option<ScopeRef> {
        let mut current = self.flow_scope_of(scope)?;
        while !self.is_scope(&current) {
            current = self.flow_scope_of(&current)?;
        }
        Some(current)
    }

    /// `scope` followed by all enclosing scopes up to and including the process.
    pub fn scope_ancestry(&self, scope: &ScopeRef) -> Vec<ScopeRef> {
        let mut ancestry = vec![scope.clone()];
        let mut current = scope.clone();
        while let Some(parent) = self.flow_scope_of(&current) {
            ancestry.push(parent.clone());
            current = parent;
        }
        ancestry
    }

    pub fn is_ancestor(&self, ancestor: &ScopeRef, scope: &ScopeRef) -> bool {
        self.scope_ancestry(scope).iter().any(|s| s == ancestor)
    }
}

/// Resolves deployed process definitions by id.
pub trait DefinitionResolver: Send + Sync {
    fn resolve(&self, definition_id: &str) -> Result<Arc<ProcessDefinition>, DefinitionError>;
}

#[derive(Default)]
pub struct DefinitionRepository {
    definitions: DashMap<String, Arc<ProcessDefinition>>,
}

impl DefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(&self, mut definition: ProcessDefinition) -> Result<Arc<ProcessDefinition>, DefinitionError> {
        definition.prepare()?;
        let definition = Arc::new(definition);
        self.definitions.insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    pub fn latest_by_key(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions
            .iter()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl DefinitionResolver for DefinitionRepository {
    fn resolve(&self, definition_id: &str) -> Result<Arc<ProcessDefinition>, DefinitionError> {
        self.definitions
            .get(definition_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| DefinitionError::NotFound(definition_id.to_string()))
    }
}
