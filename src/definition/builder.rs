use serde_json::Value;

use crate::definition::{Activity, ActivityKind, Listeners, ProcessDefinition, Transition};
use crate::error::DefinitionError;

/// Fluent builder for process definitions.
///
/// Activities are added to the innermost open sub process; `sub_process`
/// opens a new one and `end_sub_process` closes it again.
pub struct ProcessBuilder {
    id: String,
    key: String,
    version: u32,
    name: Option<String>,
    listeners: Listeners,
    activities: Vec<Activity>,
    transitions: Vec<Transition>,
    open_scopes: Vec<String>,
}

impl ProcessBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            key: id.to_string(),
            version: 1,
            name: None,
            listeners: Listeners::default(),
            activities: Vec::new(),
            transitions: Vec::new(),
            open_scopes: Vec::new(),
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn start_listener(mut self, listener: &str) -> Self {
        self.listeners.start.push(listener.to_string());
        self
    }

    pub fn end_listener(mut self, listener: &str) -> Self {
        self.listeners.end.push(listener.to_string());
        self
    }

    /// Adds an activity and returns a builder to configure it further.
    pub fn activity(self, id: &str, kind: ActivityKind) -> ActivityBuilder {
        let mut activity = Activity::new(id, kind);
        activity.parent = self.open_scopes.last().cloned();
        ActivityBuilder {
            process_builder: self,
            activity,
        }
    }

    pub fn start(self, id: &str) -> Self {
        self.activity(id, ActivityKind::StartEvent).done()
    }

    pub fn end(self, id: &str) -> Self {
        self.activity(id, ActivityKind::EndEvent).done()
    }

    pub fn terminate_end(self, id: &str) -> Self {
        self.activity(id, ActivityKind::TerminateEndEvent).done()
    }

    pub fn task(self, id: &str) -> Self {
        self.activity(id, ActivityKind::Task).done()
    }

    pub fn user_task(self, id: &str) -> Self {
        self.activity(id, ActivityKind::UserTask).done()
    }

    pub fn service_task(self, id: &str, handler: &str) -> ActivityBuilder {
        let mut builder = self.activity(id, ActivityKind::ServiceTask);
        builder.activity.handler = Some(handler.to_string());
        builder
    }

    pub fn external_task(self, id: &str, topic: &str) -> Self {
        let mut builder = self.activity(id, ActivityKind::ExternalTask);
        builder.activity.topic = Some(topic.to_string());
        builder.done()
    }

    pub fn call_activity(self, id: &str, called_element: &str) -> Self {
        let mut builder = self.activity(id, ActivityKind::CallActivity);
        builder.activity.called_element = Some(called_element.to_string());
        builder.done()
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.activity(id, ActivityKind::ParallelGateway).done()
    }

    pub fn message_catch(self, id: &str, message: &str) -> Self {
        let mut builder = self.activity(id, ActivityKind::MessageCatchEvent);
        builder.activity.message = Some(message.to_string());
        builder.done()
    }

    pub fn boundary_message(self, id: &str, attached_to: &str, message: &str, interrupting: bool) -> Self {
        let mut builder = self.activity(id, ActivityKind::BoundaryMessage);
        builder.activity.attached_to = Some(attached_to.to_string());
        builder.activity.message = Some(message.to_string());
        builder.activity.cancel_activity = interrupting;
        builder.done()
    }

    pub fn boundary_timer(self, id: &str, attached_to: &str, millis: u64, interrupting: bool) -> Self {
        let mut builder = self.activity(id, ActivityKind::BoundaryTimer);
        builder.activity.attached_to = Some(attached_to.to_string());
        builder.activity.timer_millis = Some(millis);
        builder.activity.cancel_activity = interrupting;
        builder.done()
    }

    pub fn boundary_error(self, id: &str, attached_to: &str, error_code: Option<&str>) -> Self {
        let mut builder = self.activity(id, ActivityKind::BoundaryError);
        builder.activity.attached_to = Some(attached_to.to_string());
        builder.activity.error_code = error_code.map(str::to_string);
        builder.done()
    }

    /// Opens a sub process; following activities are placed inside it.
    pub fn sub_process(self, id: &str) -> Self {
        let mut builder = self.activity(id, ActivityKind::SubProcess).done();
        builder.open_scopes.push(id.to_string());
        builder
    }

    pub fn end_sub_process(mut self) -> Self {
        self.open_scopes.pop();
        self
    }

    /// Connects two activities with a transition named `<source>-<target>`.
    pub fn connect(self, source: &str, target: &str) -> Self {
        let id = format!("{}-{}", source, target);
        self.connect_with_id(&id, source, target)
    }

    pub fn connect_with_id(mut self, id: &str, source: &str, target: &str) -> Self {
        self.transitions.push(Transition {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            listeners: Vec::new(),
        });
        self
    }

    pub fn build(self) -> Result<ProcessDefinition, DefinitionError> {
        let mut definition = ProcessDefinition {
            id: self.id,
            key: self.key,
            version: self.version,
            name: self.name,
            listeners: self.listeners,
            activities: self.activities,
            transitions: self.transitions,
        };
        definition.prepare()?;
        Ok(definition)
    }
}

pub struct ActivityBuilder {
    process_builder: ProcessBuilder,
    activity: Activity,
}

impl ActivityBuilder {
    pub fn name(mut self, name: &str) -> Self {
        self.activity.name = Some(name.to_string());
        self
    }

    pub fn async_before(mut self) -> Self {
        self.activity.async_before = true;
        self
    }

    pub fn async_after(mut self) -> Self {
        self.activity.async_after = true;
        self
    }

    pub fn scope(mut self) -> Self {
        self.activity.scope = true;
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.activity.params.is_object() {
            self.activity.params = Value::Object(Default::default());
        }
        if let Some(params) = self.activity.params.as_object_mut() {
            params.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn input(mut self, variable: &str, value: impl Into<Value>) -> Self {
        self.activity.inputs.insert(variable.to_string(), value.into());
        self
    }

    pub fn output(mut self, variable: &str, value: impl Into<Value>) -> Self {
        self.activity.outputs.insert(variable.to_string(), value.into());
        self
    }

    pub fn start_listener(mut self, listener: &str) -> Self {
        self.activity.listeners.start.push(listener.to_string());
        self
    }

    pub fn end_listener(mut self, listener: &str) -> Self {
        self.activity.listeners.end.push(listener.to_string());
        self
    }

    pub fn compensation_handler(mut self, handler: &str) -> Self {
        self.activity.compensation_handler = Some(handler.to_string());
        self
    }

    pub fn for_compensation(mut self) -> Self {
        self.activity.for_compensation = true;
        self
    }

    pub fn done(mut self) -> ProcessBuilder {
        self.process_builder.activities.push(self.activity);
        self.process_builder
    }
}
