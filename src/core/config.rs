use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;
use crate::services::store::StorageConfig;
use crate::services::upload::UploadConfig;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub unattended: bool,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineOptions,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PipelineOptions {
    /// Delete the partially created book when a run aborts.
    #[serde(default)]
    pub cleanup_on_failure: bool,
}

/// Returns the configured value, or the environment variable when the value
/// is blank.
pub fn resolve_secret(value: &str, env_var: &str) -> Option<String> {
    let value = value.trim();
    if !value.is_empty() {
        return Some(value.to_string());
    }
    std::env::var(env_var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config.yml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    /// Every credential the selected providers need but do not have.
    pub fn missing_credentials(&self) -> Vec<String> {
        let mut missing = self.llm.missing_credentials();
        missing.extend(self.image.missing_credentials());
        missing.extend(self.upload.missing_credentials());
        missing.extend(self.storage.missing_credentials());
        missing
    }
}
