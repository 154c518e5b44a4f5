use crate::error::{ArenaError, ProviderError, ProviderErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a (provider, model) pair, e.g. `openai/gpt-4o`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ModelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A model as presented to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub display_name: String,
}

impl ModelDescriptor {
    pub fn new(id: impl Into<ModelId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// One prompt fanned out to an ordered set of models
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    prompt: String,
    models: Vec<ModelId>,
}

impl ModelRequest {
    /// Reject blank prompts before any model is invoked
    pub fn new(prompt: impl Into<String>, models: Vec<ModelId>) -> Result<Self, ArenaError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(ArenaError::validation("prompt must not be empty"));
        }
        Ok(Self { prompt, models })
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn models(&self) -> &[ModelId] {
        &self.models
    }
}

/// Token usage reported by a provider (or approximated for fallbacks)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// Lifecycle of a single model turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnState {
    Pending,
    Running,
    Completed,
    FallbackCompleted,
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::FallbackCompleted | Self::Failed
        )
    }
}

/// Outcome of one model turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRunResult {
    pub model_id: ModelId,
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ProviderErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub used_fallback: bool,
    pub state: TurnState,
}

impl ModelRunResult {
    pub fn pending(model_id: ModelId) -> Self {
        Self {
            model_id,
            text: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            latency_ms: 0,
            error_kind: None,
            error: None,
            used_fallback: false,
            state: TurnState::Pending,
        }
    }

    /// A turn that failed: no text, tokens or cost count towards the session
    pub fn failed(model_id: ModelId, error: &ProviderError, latency_ms: u64) -> Self {
        Self {
            error_kind: Some(error.kind),
            error: Some(error.message.clone()),
            latency_ms,
            state: TurnState::Failed,
            ..Self::pending(model_id)
        }
    }

    pub fn usage(&self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }

    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }

    pub fn is_failed(&self) -> bool {
        self.state == TurnState::Failed
    }
}

/// A model that produced nothing the judge could score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedModel {
    pub model: ModelId,
    pub kind: ProviderErrorKind,
    pub error: String,
}

impl FailedModel {
    pub fn from_run(run: &ModelRunResult) -> Option<Self> {
        if !run.is_failed() {
            return None;
        }
        Some(Self {
            model: run.model_id.clone(),
            kind: run.error_kind.unwrap_or(ProviderErrorKind::Unknown),
            error: run.error.clone().unwrap_or_default(),
        })
    }
}

/// The five rubric dimensions the judge scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    /// 0 to 10
    pub relevance: f64,
    /// 0 to 5
    pub reasoning: f64,
    /// 0 to 5
    pub style: f64,
    /// 0 to 10
    pub accuracy: f64,
    /// 0 to 5
    pub honesty: f64,
}

impl Rubric {
    /// Substituted whenever the judge's reply cannot be used
    pub const NEUTRAL: Rubric = Rubric {
        relevance: 5.0,
        reasoning: 2.5,
        style: 2.5,
        accuracy: 5.0,
        honesty: 2.5,
    };

    pub fn clamped(self) -> Self {
        Self {
            relevance: clamp_score(self.relevance, 10.0),
            reasoning: clamp_score(self.reasoning, 5.0),
            style: clamp_score(self.style, 5.0),
            accuracy: clamp_score(self.accuracy, 10.0),
            honesty: clamp_score(self.honesty, 5.0),
        }
    }

    pub fn total(&self) -> f64 {
        self.relevance * 2.0 + self.accuracy * 2.0 + self.reasoning + self.style + self.honesty
    }

    pub fn soundness(&self) -> f64 {
        self.reasoning + self.accuracy + self.honesty
    }
}

fn clamp_score(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, max)
}

/// Judge's assessment of one model's response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeScore {
    pub model_id: ModelId,
    pub relevance: f64,
    pub reasoning: f64,
    pub style: f64,
    pub accuracy: f64,
    pub honesty: f64,
    pub explanation: String,
    pub total_score: f64,
    pub soundness_score: f64,
}

impl JudgeScore {
    pub fn from_rubric(model_id: ModelId, rubric: Rubric, explanation: impl Into<String>) -> Self {
        let rubric = rubric.clamped();
        Self {
            model_id,
            relevance: rubric.relevance,
            reasoning: rubric.reasoning,
            style: rubric.style,
            accuracy: rubric.accuracy,
            honesty: rubric.honesty,
            explanation: explanation.into(),
            total_score: rubric.total(),
            soundness_score: rubric.soundness(),
        }
    }

    pub fn neutral(model_id: ModelId, explanation: impl Into<String>) -> Self {
        Self::from_rubric(model_id, Rubric::NEUTRAL, explanation)
    }
}

/// A scored model response with its composite ranking value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedResult {
    pub model_id: ModelId,
    pub display_name: String,
    pub run: ModelRunResult,
    pub score: JudgeScore,
    pub final_score: f64,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SessionOutcome {
    /// Judged and ranked; empty when no models were requested
    Completed { evaluations: Vec<RankedResult> },
    /// Every model failed, so there was nothing to judge
    NoCandidates,
    /// The judge call itself failed
    JudgeFailed { error: String },
}

/// Everything a finished session produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub prompt: String,
    pub runs: Vec<ModelRunResult>,
    pub outcome: SessionOutcome,
    pub judge_cost: f64,
    pub total_cost: f64,
}

impl SessionReport {
    pub fn evaluations(&self) -> &[RankedResult] {
        match &self.outcome {
            SessionOutcome::Completed { evaluations } => evaluations,
            _ => &[],
        }
    }

    pub fn winner(&self) -> Option<&RankedResult> {
        self.evaluations().first()
    }

    pub fn failures(&self) -> Vec<FailedModel> {
        self.runs.iter().filter_map(FailedModel::from_run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_request_rejects_blank_prompt() {
        let err = ModelRequest::new("   ", vec![ModelId::from("a")]).unwrap_err();
        assert!(matches!(err, ArenaError::Validation(_)));
    }

    #[test]
    fn test_model_request_keeps_order() {
        let request = ModelRequest::new("ping", vec!["b".into(), "a".into()]).unwrap();
        assert_eq!(request.prompt(), "ping");
        assert_eq!(request.models()[0].as_str(), "b");
        assert_eq!(request.models()[1].as_str(), "a");
    }

    #[test]
    fn test_neutral_score_totals() {
        let score = JudgeScore::neutral("a".into(), "neutral");
        assert_eq!(score.total_score, 27.5);
        assert_eq!(score.soundness_score, 10.0);
    }

    #[test]
    fn test_rubric_is_clamped_to_ranges() {
        let rubric = Rubric {
            relevance: 14.0,
            reasoning: -1.0,
            style: 5.5,
            accuracy: f64::NAN,
            honesty: 3.0,
        }
        .clamped();
        assert_eq!(rubric.relevance, 10.0);
        assert_eq!(rubric.reasoning, 0.0);
        assert_eq!(rubric.style, 5.0);
        assert_eq!(rubric.accuracy, 0.0);
        assert_eq!(rubric.honesty, 3.0);
    }

    #[test]
    fn test_failed_run_carries_no_cost() {
        let run = ModelRunResult::failed("a".into(), &ProviderError::auth("bad key"), 12);
        assert!(run.is_failed());
        assert!(!run.has_text());
        assert_eq!(run.cost, 0.0);
        assert_eq!(run.usage(), Usage::default());

        let failure = FailedModel::from_run(&run).unwrap();
        assert_eq!(failure.kind, ProviderErrorKind::Auth);
        assert_eq!(failure.error, "bad key");
    }

    #[test]
    fn test_run_result_serializes_camel_case() {
        let run = ModelRunResult::pending("a".into());
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["modelId"], "a");
        assert_eq!(json["usedFallback"], false);
        assert_eq!(json["state"], "pending");
        assert!(json.get("errorKind").is_none());
    }
}
