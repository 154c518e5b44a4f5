//! In-process doubles shared by the unit tests.

use crate::backend::{ChatBackend, Completion, FragmentStream, StreamItem};
use crate::error::ProviderError;
use crate::fallback::FallbackCatalogue;
use crate::gateway::Gateway;
use crate::judge::Judge;
use crate::models::{ModelDescriptor, ModelId, Usage};
use crate::orchestrator::{Orchestrator, SequentialDispatch};
use crate::pricing::{ModelPricing, PricingTable};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const JUDGE_MODEL: &str = "test/judge";

#[derive(Debug, Clone)]
enum Script {
    Reply {
        fragments: Vec<String>,
        usage: Option<Usage>,
    },
    Fail(ProviderError),
    FailAfter {
        fragments: Vec<String>,
        error: ProviderError,
    },
    Hang,
    Endless,
}

/// Backend that replays canned behaviour per model
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    scripts: HashMap<ModelId, Script>,
    calls: Arc<Mutex<Vec<ModelId>>>,
    pulled: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(mut self, model: &str, script: Script) -> Self {
        self.scripts.insert(ModelId::from(model), script);
        self
    }

    pub fn reply(self, model: &str, fragments: &[&str], usage: Usage) -> Self {
        self.script(
            model,
            Script::Reply {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                usage: Some(usage),
            },
        )
    }

    pub fn reply_without_usage(self, model: &str, fragments: &[&str]) -> Self {
        self.script(
            model,
            Script::Reply {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                usage: None,
            },
        )
    }

    /// Fail when the call is opened; the kind is classified from the message
    pub fn fail(self, model: &str, message: &str) -> Self {
        self.script(model, Script::Fail(ProviderError::from_message(message)))
    }

    pub fn fail_after(self, model: &str, fragments: &[&str], message: &str) -> Self {
        self.script(
            model,
            Script::FailAfter {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                error: ProviderError::from_message(message),
            },
        )
    }

    pub fn hang(self, model: &str) -> Self {
        self.script(model, Script::Hang)
    }

    pub fn endless(self, model: &str) -> Self {
        self.script(model, Script::Endless)
    }

    /// Models called so far, in order
    pub fn calls(&self) -> Vec<ModelId> {
        self.calls.lock().unwrap().clone()
    }

    /// Fragments handed out by endless streams
    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    fn lookup(&self, model: &ModelId) -> Script {
        self.calls.lock().unwrap().push(model.clone());
        self.scripts
            .get(model)
            .cloned()
            .unwrap_or_else(|| Script::Fail(ProviderError::unknown("unscripted model")))
    }
}

fn text_items(fragments: Vec<String>) -> Vec<Result<StreamItem, ProviderError>> {
    fragments.into_iter().map(|f| Ok(StreamItem::Text(f))).collect()
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn supports(&self, model: &ModelId) -> bool {
        self.scripts.contains_key(model)
    }

    async fn generate(&self, model: &ModelId, _prompt: &str) -> Result<Completion, ProviderError> {
        match self.lookup(model) {
            Script::Reply { fragments, usage } => Ok(Completion {
                text: fragments.concat(),
                usage,
            }),
            Script::Fail(error) | Script::FailAfter { error, .. } => Err(error),
            Script::Hang | Script::Endless => {
                std::future::pending::<()>().await;
                Err(ProviderError::unknown("unreachable"))
            }
        }
    }

    async fn stream(&self, model: &ModelId, _prompt: &str) -> Result<FragmentStream, ProviderError> {
        match self.lookup(model) {
            Script::Reply { fragments, usage } => {
                let mut items = text_items(fragments);
                if let Some(usage) = usage {
                    items.push(Ok(StreamItem::Usage(usage)));
                }
                Ok(stream::iter(items).boxed())
            }
            Script::Fail(error) => Err(error),
            Script::FailAfter { fragments, error } => {
                let mut items = text_items(fragments);
                items.push(Err(error));
                Ok(stream::iter(items).boxed())
            }
            Script::Hang => Ok(stream::pending().boxed()),
            Script::Endless => {
                let pulled = self.pulled.clone();
                Ok(stream::repeat_with(move || {
                    pulled.fetch_add(1, Ordering::SeqCst);
                    Ok(StreamItem::Text("tick ".to_string()))
                })
                .boxed())
            }
        }
    }
}

pub fn test_pricing() -> PricingTable {
    let mut table = PricingTable::new();
    table.insert("test/a".into(), ModelPricing::new(0.01, 0.02));
    table.insert("test/b".into(), ModelPricing::new(0.01, 0.02));
    table.insert("test/c".into(), ModelPricing::new(0.03, 0.06));
    table.insert(JUDGE_MODEL.into(), ModelPricing::new(0.001, 0.002));
    table
}

pub fn descriptor(id: &str) -> ModelDescriptor {
    let name = id.rsplit('/').next().unwrap_or(id).to_uppercase();
    ModelDescriptor::new(id, format!("Model {}", name))
}

pub fn gateway(backend: ScriptedBackend) -> Arc<Gateway> {
    Arc::new(Gateway::new(Arc::new(backend), Arc::new(test_pricing())))
}

/// Orchestrator over the given models with no pacing delays
pub fn orchestrator(
    backend: ScriptedBackend,
    catalogue: FallbackCatalogue,
    models: &[&str],
) -> Orchestrator {
    let gateway = gateway(backend);
    let judge = Judge::new(gateway.clone(), descriptor(JUDGE_MODEL), 400);
    Orchestrator::new(
        gateway,
        Arc::new(catalogue.with_pacing(2, Duration::ZERO)),
        judge,
        models.iter().map(|id| descriptor(id)).collect(),
    )
    .with_policy(Box::new(SequentialDispatch::new(Duration::ZERO)))
}
