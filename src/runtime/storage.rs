use async_trait::async_trait;
use uuid::Uuid;
use crate::runtime::instance::ProcessInstance;
use anyhow::Result;
use dashmap::DashMap;

// --- Interfaces ---

/// Persists whole process instances. The engine loads a copy, runs a command
/// against it and saves it back only if the command succeeded.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn load(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>>;
    async fn save(&self, instance: ProcessInstance) -> Result<()>;
    async fn remove(&self, instance_id: Uuid) -> Result<()>;
    async fn list(&self) -> Result<Vec<Uuid>>;
}

// --- In-Memory Implementations ---

#[derive(Default)]
pub struct InMemoryProcessStore {
    instances: DashMap<Uuid, ProcessInstance>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn load(&self, instance_id: Uuid) -> Result<Option<ProcessInstance>> {
        Ok(self.instances.get(&instance_id).map(|i| i.value().clone()))
    }

    async fn save(&self, instance: ProcessInstance) -> Result<()> {
        self.instances.insert(instance.id, instance);
        Ok(())
    }

    async fn remove(&self, instance_id: Uuid) -> Result<()> {
        self.instances.remove(&instance_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Uuid>> {
        Ok(self.instances.iter().map(|i| *i.key()).collect())
    }
}
