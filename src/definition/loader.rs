use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};

use crate::definition::ProcessDefinition;

pub fn load_definition_from_yaml(file_path: impl AsRef<Path>) -> Result<ProcessDefinition> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    parse_definition(&yaml_content)
        .with_context(|| format!("Failed to load process definition from {}", file_path.display()))
}

pub fn parse_definition(yaml_content: &str) -> Result<ProcessDefinition> {
    let mut definition: ProcessDefinition =
        serde_yaml::from_str(yaml_content).context("Failed to deserialize YAML content")?;
    definition.prepare()?;
    Ok(definition)
}
