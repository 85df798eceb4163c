use std::fmt::{self, Debug};

use anyhow::Result;
use serde_json::Value;

use crate::runtime::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEventName {
    Start,
    End,
    Take,
}

impl ListenerEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerEventName::Start => "start",
            ListenerEventName::End => "end",
            ListenerEventName::Take => "take",
        }
    }
}

impl fmt::Display for ListenerEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a listener is notified about: the event and the element it fired on.
#[derive(Debug, Clone, Copy)]
pub struct ListenerEvent<'a> {
    pub name: ListenerEventName,
    /// Activity id, transition id, or the process definition id.
    pub element_id: &'a str,
}

/// 执行监听器接口
/// Custom code attached to start, end and take events by name. Skipped when
/// the execution carries the skip-custom-listeners flag.
pub trait ExecutionListener: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn notify(&self, ctx: &mut Context<'_>, event: &ListenerEvent<'_>) -> Result<()>;
}

/// Appends `"<event>:<element>"` to a list variable on the process instance.
#[derive(Debug)]
pub struct RecordingListener {
    name: String,
    variable: String,
}

impl RecordingListener {
    pub fn new(name: &str, variable: &str) -> Self {
        Self {
            name: name.to_string(),
            variable: variable.to_string(),
        }
    }
}

impl ExecutionListener for RecordingListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn notify(&self, ctx: &mut Context<'_>, event: &ListenerEvent<'_>) -> Result<()> {
        let mut entries = match ctx.get_var(&self.variable) {
            Some(Value::Array(entries)) => entries,
            _ => Vec::new(),
        };
        entries.push(Value::String(format!("{}:{}", event.name, event.element_id)));
        ctx.set_var(&self.variable, Value::Array(entries));
        Ok(())
    }
}
