use crate::backend::DEFAULT_CALL_TIMEOUT;
use crate::error::ArenaError;
use crate::fallback::{DEFAULT_CHUNK_DELAY, DEFAULT_CHUNK_WORDS, FallbackCatalogue, FallbackSample};
use crate::judge::DEFAULT_PREVIEW_CHARS;
use crate::orchestrator::DEFAULT_TURN_DELAY;
use crate::models::{ModelDescriptor, ModelId};
use crate::pricing::{ModelPricing, PricingTable};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// HTTP server settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Address the SSE server binds to
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Per-session behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Pause between two model turns
    #[serde(default = "default_turn_delay_ms")]
    pub turn_delay_ms: u64,
    /// Deadline for a single provider call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Optional deadline for all model turns of a session
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    /// Optional directory where finished sessions are written as JSON
    #[serde(default)]
    pub storage_dir: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_delay_ms: default_turn_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            deadline_secs: None,
            storage_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn turn_delay(&self) -> Duration {
        Duration::from_millis(self.turn_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Replay pacing for recorded fallback responses
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FallbackConfig {
    #[serde(default = "default_chunk_words")]
    pub chunk_words: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chunk_words: default_chunk_words(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

/// An OpenAI-compatible endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    /// OpenAI-compatible API endpoint
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
}

/// A competing model
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub id: ModelId,
    pub display_name: String,
    /// Name of the provider entry serving this model
    pub provider: String,
    /// Model name sent upstream; defaults to the id
    #[serde(default)]
    pub upstream_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Recorded response replayed when the provider is rate limited
    #[serde(default)]
    pub fallback: Option<FallbackSample>,
}

impl ModelConfig {
    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor::new(self.id.clone(), self.display_name.clone())
    }

    pub fn upstream_model(&self) -> &str {
        self.upstream_model.as_deref().unwrap_or(self.id.as_str())
    }
}

/// The model that scores the others
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeConfig {
    pub id: ModelId,
    #[serde(default = "default_judge_name")]
    pub display_name: String,
    pub provider: String,
    #[serde(default)]
    pub upstream_model: Option<String>,
    #[serde(default = "default_judge_temperature")]
    pub temperature: f64,
    #[serde(default = "default_judge_max_tokens")]
    pub max_tokens: u32,
    /// Characters of each response shown to the judge
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

impl JudgeConfig {
    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor::new(self.id.clone(), self.display_name.clone())
    }

    pub fn upstream_model(&self) -> &str {
        self.upstream_model.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Pricing entry added to or overriding the built-in table
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingConfig {
    pub model: ModelId,
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_turn_delay_ms() -> u64 {
    DEFAULT_TURN_DELAY.as_millis() as u64
}

fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT.as_secs()
}

fn default_chunk_words() -> usize {
    DEFAULT_CHUNK_WORDS
}

fn default_chunk_delay_ms() -> u64 {
    DEFAULT_CHUNK_DELAY.as_millis() as u64
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_judge_name() -> String {
    "Judge".to_string()
}

fn default_judge_temperature() -> f64 {
    0.1
}

fn default_judge_max_tokens() -> u32 {
    1500
}

fn default_preview_chars() -> usize {
    DEFAULT_PREVIEW_CHARS
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    pub providers: Vec<ProviderConfig>,
    /// Competing models, in dispatch order
    pub models: Vec<ModelConfig>,
    pub judge: JudgeConfig,
    #[serde(default)]
    pub pricing: Vec<PricingConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Built-in prices with the configured overrides applied
    pub fn pricing_table(&self) -> PricingTable {
        let mut table = PricingTable::builtin();
        for entry in &self.pricing {
            table.insert(
                entry.model.clone(),
                ModelPricing::new(entry.input_per_1k, entry.output_per_1k),
            );
        }
        table
    }

    /// Built-in samples with per-model samples from the config applied
    pub fn fallback_catalogue(&self) -> FallbackCatalogue {
        let mut catalogue = FallbackCatalogue::builtin().with_pacing(
            self.fallback.chunk_words,
            Duration::from_millis(self.fallback.chunk_delay_ms),
        );
        for model in &self.models {
            if let Some(sample) = &model.fallback {
                catalogue.insert(model.id.clone(), sample.clone());
            }
        }
        catalogue
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.models.iter().map(ModelConfig::descriptor).collect()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Fail fast on references that would otherwise break mid-session
    pub fn validate(&self) -> Result<(), ArenaError> {
        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if !provider_names.insert(provider.name.as_str()) {
                return Err(ArenaError::config(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
        }

        for entry in &self.pricing {
            check_amount(&entry.model, "input price", entry.input_per_1k)?;
            check_amount(&entry.model, "output price", entry.output_per_1k)?;
        }

        let pricing = self.pricing_table();
        let mut model_ids = HashSet::new();
        for model in &self.models {
            if !model_ids.insert(&model.id) {
                return Err(ArenaError::config(format!("duplicate model '{}'", model.id)));
            }
            if let Some(sample) = &model.fallback {
                check_amount(&model.id, "fallback cost", sample.cost)?;
            }
            self.check_route(&model.id, &model.provider, &pricing)?;
        }
        self.check_route(&self.judge.id, &self.judge.provider, &pricing)?;

        Ok(())
    }

    fn check_route(
        &self,
        model: &ModelId,
        provider: &str,
        pricing: &PricingTable,
    ) -> Result<(), ArenaError> {
        if self.provider(provider).is_none() {
            return Err(ArenaError::config(format!(
                "model '{}' references unknown provider '{}'",
                model, provider
            )));
        }
        pricing.require(model)?;
        Ok(())
    }
}

/// Costs are never negative
fn check_amount(model: &ModelId, what: &str, amount: f64) -> Result<(), ArenaError> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(ArenaError::config(format!(
            "model '{}' has invalid {} {}",
            model, what, amount
        )));
    }
    Ok(())
}
