use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};

/// How much history the engine hands to its [`HistoryEventHandler`](crate::runtime::history::HistoryEventHandler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryLevel {
    None,
    Activity,
    #[default]
    Audit,
    Full,
}

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub history_level: HistoryLevel,
    /// Retries a freshly created job starts with.
    pub default_job_retries: u32,
    /// `tracing_subscriber` filter directive used by the binaries.
    pub log_filter: String,
    /// Capacity of the history event channel.
    pub history_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_level: HistoryLevel::default(),
            default_job_retries: 3,
            log_filter: "info".to_string(),
            history_channel_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config from {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to deserialize engine config from {}", path.display()))?;
        Ok(config)
    }
}
