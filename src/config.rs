//! Configuration types for the FinSim orchestrator

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides (e.g. `FINSIM_RETRY_BUDGET`)
pub const ENV_PREFIX: &str = "FINSIM";

fn default_agent_timeout_ms() -> u64 { 30_000 }
fn default_retry_budget() -> u32 { 1 }
fn default_max_rounds() -> u32 { 3 }
fn default_context_window() -> usize { 20 }
fn default_max_content_chars() -> usize { 16_000 }

/// Speaker selection policy used within a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Declared participant order
    #[default]
    RoundRobin,
    /// Participant whose capabilities best match the recent conversation
    Relevance,
}

/// Turn, retry and round limits for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Deadline for a single `act` call
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    /// Retries after a failed attempt before the turn is skipped
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Round limit for steps that do not set one
    #[serde(default = "default_max_rounds")]
    pub default_max_rounds: u32,
    /// Transcript items handed to an agent per turn
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Longest accepted utterance, in characters
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
    /// Speaker selection policy
    #[serde(default)]
    pub selection: SelectionPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: default_agent_timeout_ms(),
            retry_budget: default_retry_budget(),
            default_max_rounds: default_max_rounds(),
            context_window: default_context_window(),
            max_content_chars: default_max_content_chars(),
            selection: SelectionPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file, then `FINSIM_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make a run meaningless
    pub fn validate(&self) -> Result<()> {
        if self.agent_timeout_ms == 0 {
            return Err(Error::config("agent_timeout_ms must be greater than 0"));
        }
        if self.default_max_rounds == 0 {
            return Err(Error::config("default_max_rounds must be greater than 0"));
        }
        if self.context_window == 0 {
            return Err(Error::config("context_window must be greater than 0"));
        }
        if self.max_content_chars == 0 {
            return Err(Error::config("max_content_chars must be greater than 0"));
        }
        Ok(())
    }

    /// Per-turn deadline
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    /// Set the per-turn deadline
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retry budget
    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = retries;
        self
    }

    /// Set the default round limit
    pub fn with_default_max_rounds(mut self, rounds: u32) -> Self {
        self.default_max_rounds = rounds;
        self
    }

    /// Set the selection policy
    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }
}
