//! `contentworks.toml` loading.
//!
//! The file has three parts: `[pipeline]` (validated into a
//! [`LoadedConfig`]), `[producers.<stage>]` and `[destinations.<name>]`
//! (adapter wiring). Secrets never live in the file; a destination names the
//! environment variable that holds its token.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pipeline::{LoadedConfig, PipelineConfig};
use serde::Deserialize;

const DEFAULT_PRODUCER_TIMEOUT_SECS: u64 = 300;
const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub producers: BTreeMap<String, ProducerConfig>,

    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
}

/// How one stage's external command is launched.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerConfig {
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl ProducerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_PRODUCER_TIMEOUT_SECS))
    }
}

/// One destination platform endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub endpoint: String,

    /// Environment variable holding the bearer token, if the platform needs one.
    pub token_env: Option<String>,

    pub timeout_secs: Option<u64>,
}

impl DestinationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_PUBLISH_TIMEOUT_SECS))
    }

    /// Reads the token from the environment. A named but unset variable is an error.
    pub fn token(&self) -> Result<Option<String>> {
        match &self.token_env {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("token variable {var} is not set")),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("config is not valid TOML")?;
        Ok(config)
    }

    /// Validates the pipeline part and checks adapter tables against it.
    ///
    /// Every destination listed under `[pipeline.publish]` needs a
    /// `[destinations.<name>]` table. Adapter tables nothing refers to are
    /// rejected as probable typos.
    pub fn validate(&self) -> Result<LoadedConfig> {
        let loaded = self.pipeline.validate()?;

        for destination in &loaded.publish().destinations {
            if !self.destinations.contains_key(destination.as_str()) {
                bail!("destination '{destination}' has no [destinations.{destination}] table");
            }
        }
        for name in self.destinations.keys() {
            if !loaded
                .publish()
                .destinations
                .iter()
                .any(|d| d.as_str() == name)
            {
                bail!("[destinations.{name}] is not listed in pipeline.publish.destinations");
            }
        }
        for name in self.producers.keys() {
            if !self.pipeline.stages.iter().any(|s| &s.id == name) {
                bail!("[producers.{name}] does not match any declared stage");
            }
        }
        for (name, producer) in &self.producers {
            if producer.command.is_empty() {
                bail!("[producers.{name}] has an empty command");
            }
        }
        Ok(loaded)
    }
}
