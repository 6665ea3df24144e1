use anyhow::{Result, Context as AnyhowContext};
use std::fs;
use std::path::Path;
use crate::config::OrchestratorConfig;
use crate::dsl::ChainSpec;

pub fn load_chain_from_yaml(file_path: impl AsRef<Path>) -> Result<ChainSpec> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    let spec: ChainSpec = serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize chain from {}", file_path.display()))?;

    Ok(spec)
}

pub fn load_config_from_yaml(file_path: impl AsRef<Path>) -> Result<OrchestratorConfig> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read config file from {}", file_path.display()))?;

    serde_yaml::from_str(&yaml_content)
        .with_context(|| format!("Failed to deserialize config from {}", file_path.display()))
}
