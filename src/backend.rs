use crate::config::{Config, ProviderConfig};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::models::{ModelId, Usage};
use anyhow::Context;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionStreamOptions,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    CreateChatCompletionResponse, CreateChatCompletionStreamResponse,
};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Deadline applied to every provider call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One element of a streamed reply
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Text(String),
    Usage(Usage),
}

pub type FragmentStream = BoxStream<'static, Result<StreamItem, ProviderError>>;

/// A whole reply from generate mode
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<Usage>,
}

/// A chat model provider
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Whether a route exists for this model
    fn supports(&self, model: &ModelId) -> bool;

    /// Generate the whole reply in one call
    async fn generate(&self, model: &ModelId, prompt: &str) -> Result<Completion, ProviderError>;

    /// Stream the reply as text fragments followed by a usage summary
    async fn stream(&self, model: &ModelId, prompt: &str) -> Result<FragmentStream, ProviderError>;
}

/// How to reach one model on an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub api_base: String,
    pub api_key: String,
    pub upstream_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

struct ModelRoute {
    client: Client<OpenAIConfig>,
    upstream_model: String,
    temperature: f64,
    max_tokens: u32,
    system_prompt: Option<String>,
}

/// Backend speaking the OpenAI chat completions protocol
pub struct OpenAiBackend {
    routes: HashMap<ModelId, ModelRoute>,
    http: reqwest::Client,
    call_timeout: Duration,
}

impl OpenAiBackend {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            routes: HashMap::new(),
            http,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Build routes for every configured model and the judge
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut backend = Self::new()?.with_call_timeout(config.session.call_timeout());

        for model in &config.models {
            let provider = Self::provider_for(config, &model.provider)?;
            backend.add_route(
                model.id.clone(),
                RouteSpec {
                    api_base: provider.api_endpoint.clone(),
                    api_key: Self::read_api_key(provider)?,
                    upstream_model: model.upstream_model().to_string(),
                    temperature: model.temperature,
                    max_tokens: model.max_tokens,
                    system_prompt: model.system_prompt.clone(),
                },
            );
        }

        let judge = &config.judge;
        let provider = Self::provider_for(config, &judge.provider)?;
        backend.add_route(
            judge.id.clone(),
            RouteSpec {
                api_base: provider.api_endpoint.clone(),
                api_key: Self::read_api_key(provider)?,
                upstream_model: judge.upstream_model().to_string(),
                temperature: judge.temperature,
                max_tokens: judge.max_tokens,
                system_prompt: None,
            },
        );

        Ok(backend)
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn add_route(&mut self, model: ModelId, spec: RouteSpec) {
        let openai_config = OpenAIConfig::new()
            .with_api_key(spec.api_key)
            .with_api_base(spec.api_base);
        let client = Client::with_config(openai_config)
            .with_http_client(self.http.clone())
            .with_backoff(no_retry());

        self.routes.insert(
            model,
            ModelRoute {
                client,
                upstream_model: spec.upstream_model,
                temperature: spec.temperature,
                max_tokens: spec.max_tokens,
                system_prompt: spec.system_prompt,
            },
        );
    }

    fn provider_for<'a>(config: &'a Config, name: &str) -> anyhow::Result<&'a ProviderConfig> {
        config
            .provider(name)
            .with_context(|| format!("Provider {} is not configured", name))
    }

    fn read_api_key(provider: &ProviderConfig) -> anyhow::Result<String> {
        std::env::var(&provider.env_var_api_key)
            .with_context(|| format!("Environment variable {} not found", provider.env_var_api_key))
    }

    fn route(&self, model: &ModelId) -> Result<&ModelRoute, ProviderError> {
        self.routes
            .get(model)
            .ok_or_else(|| ProviderError::unknown(format!("no route for model '{}'", model)))
    }

    fn build_request(
        route: &ModelRoute,
        prompt: &str,
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, ProviderError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
        if let Some(system_prompt) = &route.system_prompt {
            messages.push(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt.clone())
                    .build()
                    .map_err(classify_openai_error)?
                    .into(),
            );
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.to_string())
                .build()
                .map_err(classify_openai_error)?
                .into(),
        );

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&route.upstream_model)
            .messages(messages)
            .temperature(route.temperature as f32)
            .max_tokens(route.max_tokens.min(u16::MAX as u32) as u16);
        if stream {
            args.stream_options(ChatCompletionStreamOptions {
                include_usage: true,
            });
        }

        args.build().map_err(classify_openai_error)
    }

    fn timeout_error(&self) -> ProviderError {
        ProviderError::timeout(format!(
            "request timed out after {}s",
            self.call_timeout.as_secs_f64()
        ))
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    fn supports(&self, model: &ModelId) -> bool {
        self.routes.contains_key(model)
    }

    async fn generate(&self, model: &ModelId, prompt: &str) -> Result<Completion, ProviderError> {
        let route = self.route(model)?;
        let request = Self::build_request(route, prompt, false)?;

        let response = tokio::time::timeout(self.call_timeout, route.client.chat().create(request))
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(classify_openai_error)?;

        Ok(extract_completion(response))
    }

    async fn stream(&self, model: &ModelId, prompt: &str) -> Result<FragmentStream, ProviderError> {
        let route = self.route(model)?;
        let request = Self::build_request(route, prompt, true)?;
        let deadline = Instant::now() + self.call_timeout;

        let opened = tokio::time::timeout_at(deadline, route.client.chat().create_stream(request))
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(classify_openai_error)?;

        let fragments = opened
            .flat_map(|chunk| {
                let items = match chunk {
                    Ok(chunk) => stream_items(chunk).into_iter().map(Ok).collect(),
                    Err(err) => vec![Err(classify_openai_error(err))],
                };
                stream::iter(items)
            })
            .boxed();

        Ok(with_deadline(fragments, deadline, self.timeout_error()))
    }
}

/// Rate limits must reach the caller as errors, so the client never retries
fn no_retry() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build()
}

/// End the stream with `on_timeout` if the next item is not ready before `deadline`
pub fn with_deadline(
    fragments: FragmentStream,
    deadline: Instant,
    on_timeout: ProviderError,
) -> FragmentStream {
    stream::unfold(Some(fragments), move |state| {
        let on_timeout = on_timeout.clone();
        async move {
            let mut inner = state?;
            match tokio::time::timeout_at(deadline, inner.next()).await {
                Ok(Some(item)) => Some((item, Some(inner))),
                Ok(None) => None,
                Err(_) => Some((Err(on_timeout), None)),
            }
        }
    })
    .boxed()
}

/// Map an async-openai error onto the arena's error kinds
pub fn classify_openai_error(err: OpenAIError) -> ProviderError {
    match err {
        OpenAIError::Reqwest(e) if e.is_timeout() => ProviderError::timeout(e.to_string()),
        OpenAIError::ApiError(api) => {
            let label = api.r#type.clone().unwrap_or_default();
            let kind = ProviderErrorKind::classify(&format!("{} {}", label, api.message));
            ProviderError::new(kind, api.message)
        }
        other => ProviderError::from_message(other.to_string()),
    }
}

fn stream_items(chunk: CreateChatCompletionStreamResponse) -> Vec<StreamItem> {
    let mut items: Vec<StreamItem> = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(StreamItem::Text)
        .collect();

    if let Some(usage) = chunk.usage {
        items.push(StreamItem::Usage(Usage::new(
            usage.prompt_tokens,
            usage.completion_tokens,
        )));
    }

    items
}

fn extract_completion(response: CreateChatCompletionResponse) -> Completion {
    let text = match response.choices.first() {
        Some(choice) => choice.message.content.clone().unwrap_or_default(),
        None => String::new(),
    };

    let usage = response
        .usage
        .map(|usage| Usage::new(usage.prompt_tokens, usage.completion_tokens));

    Completion { text, usage }
}
