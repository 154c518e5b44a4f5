//! Cost-aware entry point to the chat backend.
//!
//! Built once per process and shared read-only across sessions.

use crate::backend::{ChatBackend, FragmentStream, StreamItem};
use crate::error::ArenaError;
use crate::models::{ModelId, ModelRunResult, TurnState, Usage};
use crate::pricing::{ModelPricing, PricingTable};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// How a model should be called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeMode {
    Generate,
    Stream,
}

/// Result of [`Gateway::invoke`]
pub enum Invocation {
    Completed(ModelRunResult),
    Streaming(FragmentStream),
}

impl Invocation {
    /// Reply as fragments; a completed run yields its whole text, then its usage
    pub fn into_stream(self) -> FragmentStream {
        match self {
            Self::Streaming(fragments) => fragments,
            Self::Completed(run) => {
                let usage = run.usage();
                stream::iter(vec![Ok(StreamItem::Text(run.text)), Ok(StreamItem::Usage(usage))])
                    .boxed()
            }
        }
    }
}

pub struct Gateway {
    backend: Arc<dyn ChatBackend>,
    pricing: Arc<PricingTable>,
}

impl Gateway {
    pub fn new(backend: Arc<dyn ChatBackend>, pricing: Arc<PricingTable>) -> Self {
        Self { backend, pricing }
    }

    /// Ensure a model is priced and routed before it is called
    pub fn check_model(&self, model: &ModelId) -> Result<ModelPricing, ArenaError> {
        let pricing = self.pricing.require(model)?;
        if !self.backend.supports(model) {
            return Err(ArenaError::config(format!(
                "no backend route for model '{}'",
                model
            )));
        }
        Ok(pricing)
    }

    pub fn cost(&self, model: &ModelId, usage: Usage) -> Result<f64, ArenaError> {
        self.pricing.cost_for_usage(model, usage)
    }

    /// Call a model in the given mode, after checking it is priced and routed
    pub async fn invoke(
        &self,
        model: &ModelId,
        prompt: &str,
        mode: InvokeMode,
    ) -> Result<Invocation, ArenaError> {
        match mode {
            InvokeMode::Generate => Ok(Invocation::Completed(self.generate(model, prompt).await?)),
            InvokeMode::Stream => Ok(Invocation::Streaming(self.open_stream(model, prompt).await?)),
        }
    }

    /// Call a model once and account for the whole reply
    async fn generate(&self, model: &ModelId, prompt: &str) -> Result<ModelRunResult, ArenaError> {
        let pricing = self.check_model(model)?;
        let started = Instant::now();

        let completion = self.backend.generate(model, prompt).await?;
        let usage = completion.usage.unwrap_or_else(|| {
            warn!(model = %model, "provider reported no usage; counting zero tokens");
            Usage::default()
        });

        let mut run = ModelRunResult::pending(model.clone());
        run.text = completion.text;
        run.prompt_tokens = usage.prompt_tokens;
        run.completion_tokens = usage.completion_tokens;
        run.cost = pricing.cost(usage.prompt_tokens, usage.completion_tokens);
        run.latency_ms = started.elapsed().as_millis() as u64;
        run.state = TurnState::Completed;

        debug!(model = %model, latency_ms = run.latency_ms, cost = run.cost, "generate completed");
        Ok(run)
    }

    async fn open_stream(&self, model: &ModelId, prompt: &str) -> Result<FragmentStream, ArenaError> {
        self.check_model(model)?;
        Ok(self.backend.stream(model, prompt).await?)
    }
}
