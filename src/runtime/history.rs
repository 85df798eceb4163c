use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::config::HistoryLevel;
use crate::runtime::execution::ExecutionId;
use crate::runtime::records::RecordId;

/// 历史事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    ProcessInstanceStart {
        process_instance_id: Uuid,
        definition_id: String,
    },
    ProcessInstanceEnd {
        process_instance_id: Uuid,
        canceled: bool,
    },
    ActivityInstanceStart {
        process_instance_id: Uuid,
        activity_instance_id: String,
        activity_id: String,
        execution: ExecutionId,
    },
    ActivityInstanceEnd {
        process_instance_id: Uuid,
        activity_instance_id: String,
        activity_id: String,
        canceled: bool,
    },
    ProcessInstanceMigrate {
        process_instance_id: Uuid,
        definition_id: String,
    },
    ActivityInstanceMigrate {
        process_instance_id: Uuid,
        activity_instance_id: String,
        activity_id: String,
        definition_id: String,
    },
    TaskMigrate {
        process_instance_id: Uuid,
        task: RecordId,
        activity_id: String,
        definition_id: String,
    },
    VariableMigrate {
        process_instance_id: Uuid,
        variable: RecordId,
        name: String,
        definition_id: String,
    },
}

impl HistoryEvent {
    /// Lowest configured level at which the event is produced.
    pub fn level(&self) -> HistoryLevel {
        match self {
            HistoryEvent::VariableMigrate { .. } => HistoryLevel::Audit,
            _ => HistoryLevel::Activity,
        }
    }

    pub fn process_instance_id(&self) -> Uuid {
        match self {
            HistoryEvent::ProcessInstanceStart { process_instance_id, .. }
            | HistoryEvent::ProcessInstanceEnd { process_instance_id, .. }
            | HistoryEvent::ActivityInstanceStart { process_instance_id, .. }
            | HistoryEvent::ActivityInstanceEnd { process_instance_id, .. }
            | HistoryEvent::ProcessInstanceMigrate { process_instance_id, .. }
            | HistoryEvent::ActivityInstanceMigrate { process_instance_id, .. }
            | HistoryEvent::TaskMigrate { process_instance_id, .. }
            | HistoryEvent::VariableMigrate { process_instance_id, .. } => *process_instance_id,
        }
    }
}

/// Receives history events after the command that produced them committed.
#[async_trait]
pub trait HistoryEventHandler: Send + Sync {
    async fn handle(&self, event: HistoryEvent) -> Result<()>;
}

/// Forwards events into a bounded tokio channel.
pub struct ChannelHistoryHandler {
    sender: mpsc::Sender<HistoryEvent>,
}

impl ChannelHistoryHandler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<HistoryEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { sender: tx }, rx)
    }
}

#[async_trait]
impl HistoryEventHandler for ChannelHistoryHandler {
    async fn handle(&self, event: HistoryEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|e| anyhow!("History channel closed: {}", e))
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct InMemoryHistory {
    events: Mutex<Vec<HistoryEvent>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<HistoryEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl HistoryEventHandler for InMemoryHistory {
    async fn handle(&self, event: HistoryEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}
