use std::collections::HashMap;
use std::sync::Arc;

use crate::actions::ServiceHandler;
use crate::actions::builtin::{AssignAction, FailAction, LogAction};
use crate::config::EngineConfig;
use crate::definition::ActivityKind;
use crate::error::PvmError;
use crate::nodes;
use crate::runtime::listener::ExecutionListener;
use crate::runtime::node::ActivityBehavior;

/// Registries the interpreter resolves behaviors, listeners and handlers from.
pub struct RuntimeServices {
    behaviors: HashMap<ActivityKind, Arc<dyn ActivityBehavior>>,
    listeners: HashMap<String, Arc<dyn ExecutionListener>>,
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
    pub config: EngineConfig,
}

impl RuntimeServices {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            behaviors: HashMap::new(),
            listeners: HashMap::new(),
            handlers: HashMap::new(),
            config,
        }
    }

    /// Behaviors for every activity kind plus the builtin service handlers.
    pub fn with_standard_components(config: EngineConfig) -> Self {
        let mut services = Self::new(config);
        for behavior in nodes::standard_behaviors() {
            services.register_behavior(behavior);
        }
        services.register_handler(Arc::new(LogAction));
        services.register_handler(Arc::new(AssignAction));
        services.register_handler(Arc::new(FailAction));
        services
    }

    pub fn register_behavior(&mut self, behavior: Arc<dyn ActivityBehavior>) {
        self.behaviors.insert(behavior.kind(), behavior);
    }

    pub fn register_listener(&mut self, listener: Arc<dyn ExecutionListener>) {
        self.listeners.insert(listener.name().to_string(), listener);
    }

    pub fn register_handler(&mut self, handler: Arc<dyn ServiceHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn behavior(&self, kind: ActivityKind) -> Result<&Arc<dyn ActivityBehavior>, PvmError> {
        self.behaviors
            .get(&kind)
            .ok_or_else(|| PvmError::MissingBehavior(kind.to_string()))
    }

    pub fn listener(&self, name: &str) -> Option<&Arc<dyn ExecutionListener>> {
        self.listeners.get(name)
    }

    pub fn handler(&self, name: &str) -> Option<&Arc<dyn ServiceHandler>> {
        self.handlers.get(name)
    }
}
