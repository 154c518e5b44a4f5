//! Session driver: dispatches model turns, runs the judge and reports.

use crate::backend::StreamItem;
use crate::error::{ArenaError, ProviderError};
use crate::events::{EventEmitter, SessionEvent};
use crate::fallback::{FallbackCatalogue, FallbackSample};
use crate::gateway::{Gateway, InvokeMode};
use crate::judge::{Candidate, Judge, rank};
use crate::ledger::SessionLedger;
use crate::models::{
    FailedModel, ModelDescriptor, ModelId, ModelRequest, ModelRunResult, SessionOutcome,
    SessionReport, TurnState, Usage,
};
use crate::sink::ResultSink;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, error, info, warn};

pub const DEFAULT_TURN_DELAY: Duration = Duration::from_millis(500);

const CHECKPOINT_EVERY: usize = 10;
const SESSION_DEADLINE_EXCEEDED: &str = "session deadline exceeded";
const NO_CANDIDATES: &str = "no model produced a response to judge";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Dispatching,
    Evaluating,
    Done,
}

fn advance(phase: &mut SessionPhase, next: SessionPhase) {
    debug!(from = ?phase, to = ?next, "session phase");
    *phase = next;
}

/// What a dispatch policy is asked to run
pub struct SessionPlan<'a> {
    pub prompt: &'a str,
    pub models: &'a [ModelDescriptor],
    pub deadline: Option<Instant>,
}

impl SessionPlan<'_> {
    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Decides how model turns are scheduled within a session.
///
/// Implementations must return one result per planned model, in plan order,
/// and record the cost of every turn that did not fail in the ledger.
#[async_trait]
pub trait DispatchPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(
        &self,
        turns: &TurnExecutor,
        plan: &SessionPlan<'_>,
        emitter: &EventEmitter,
        ledger: &mut SessionLedger,
    ) -> Result<Vec<ModelRunResult>, ArenaError>;
}

/// One model at a time, in configured order, with a pause between turns
pub struct SequentialDispatch {
    turn_delay: Duration,
}

impl SequentialDispatch {
    pub fn new(turn_delay: Duration) -> Self {
        Self { turn_delay }
    }
}

#[async_trait]
impl DispatchPolicy for SequentialDispatch {
    fn name(&self) -> &'static str {
        "sequential"
    }

    async fn dispatch(
        &self,
        turns: &TurnExecutor,
        plan: &SessionPlan<'_>,
        emitter: &EventEmitter,
        ledger: &mut SessionLedger,
    ) -> Result<Vec<ModelRunResult>, ArenaError> {
        let mut runs = Vec::with_capacity(plan.models.len());

        for (index, model) in plan.models.iter().enumerate() {
            if index > 0 && !self.turn_delay.is_zero() {
                let wake = Instant::now() + self.turn_delay;
                sleep_until(plan.deadline.map_or(wake, |deadline| deadline.min(wake))).await;
            }
            if emitter.is_closed() {
                return Err(ArenaError::Disconnected);
            }

            if plan.deadline_passed() {
                warn!(model = %model.id, "skipping model after session deadline");
                let err = ProviderError::timeout(SESSION_DEADLINE_EXCEEDED);
                emitter
                    .emit(SessionEvent::Error {
                        model: model.id.clone(),
                        error: err.message.clone(),
                        kind: Some(err.kind),
                        details: Some("model was not called".to_string()),
                    })
                    .await?;
                runs.push(ModelRunResult::failed(model.id.clone(), &err, 0));
                continue;
            }

            let run = turns.run_turn(model, plan.prompt, emitter, plan.deadline).await?;
            debug_assert!(run.state.is_terminal());
            if !run.is_failed() {
                ledger.record(run.model_id.as_str(), run.cost);
            }
            runs.push(run);
        }

        Ok(runs)
    }
}

enum LiveOutcome {
    Finished(Option<Usage>),
    Failed(ProviderError),
}

/// Runs a single model turn: live stream, fallback replay or surfaced error
pub struct TurnExecutor {
    gateway: Arc<Gateway>,
    catalogue: Arc<FallbackCatalogue>,
}

impl TurnExecutor {
    pub fn new(gateway: Arc<Gateway>, catalogue: Arc<FallbackCatalogue>) -> Self {
        Self { gateway, catalogue }
    }

    pub async fn run_turn(
        &self,
        model: &ModelDescriptor,
        prompt: &str,
        emitter: &EventEmitter,
        deadline: Option<Instant>,
    ) -> Result<ModelRunResult, ArenaError> {
        info!(model = %model.id, "model turn started");
        emitter
            .emit(SessionEvent::ModelStart {
                model: model.id.clone(),
            })
            .await?;

        let started = Instant::now();
        let mut run = ModelRunResult::pending(model.id.clone());
        run.state = TurnState::Running;

        let outcome = self
            .stream_live(&mut run, prompt, emitter, deadline)
            .await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            LiveOutcome::Finished(usage) => {
                let usage = usage.unwrap_or_else(|| {
                    warn!(model = %model.id, "provider reported no usage; counting zero tokens");
                    Usage::default()
                });
                run.prompt_tokens = usage.prompt_tokens;
                run.completion_tokens = usage.completion_tokens;
                run.cost = self.gateway.cost(&model.id, usage)?;
                run.latency_ms = latency_ms;
                run.state = TurnState::Completed;

                info!(model = %model.id, latency_ms, cost = run.cost, "model turn completed");
                emitter
                    .emit(SessionEvent::ModelComplete {
                        model: model.id.clone(),
                        latency_ms,
                        usage,
                        cost: run.cost,
                        is_mock: None,
                        details: None,
                    })
                    .await?;
                Ok(run)
            }
            LiveOutcome::Failed(err) if err.is_fallback_eligible() => {
                match self.catalogue.get(&model.id) {
                    Some(sample) => self.replay_fallback(run, sample, &err, started, emitter).await,
                    None => {
                        self.surface_failure(&model.id, &err, Some("no fallback sample"), latency_ms, emitter)
                            .await
                    }
                }
            }
            LiveOutcome::Failed(err) => {
                self.surface_failure(&model.id, &err, None, latency_ms, emitter)
                    .await
            }
        }
    }

    async fn stream_live(
        &self,
        run: &mut ModelRunResult,
        prompt: &str,
        emitter: &EventEmitter,
        deadline: Option<Instant>,
    ) -> Result<LiveOutcome, ArenaError> {
        let model = run.model_id.clone();
        let invoke = self.gateway.invoke(&model, prompt, InvokeMode::Stream);
        let opened = match deadline {
            Some(deadline) => match timeout_at(deadline, invoke).await {
                Ok(opened) => opened,
                Err(_) => {
                    return Ok(LiveOutcome::Failed(ProviderError::timeout(
                        SESSION_DEADLINE_EXCEEDED,
                    )));
                }
            },
            None => invoke.await,
        };
        let mut stream = match opened {
            Ok(invocation) => invocation.into_stream(),
            Err(ArenaError::Provider(err)) => return Ok(LiveOutcome::Failed(err)),
            Err(err) => return Err(err),
        };

        let mut usage = None;
        let mut fragments = 0usize;
        loop {
            let next = match deadline {
                Some(deadline) => match timeout_at(deadline, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return Ok(LiveOutcome::Failed(ProviderError::timeout(
                            SESSION_DEADLINE_EXCEEDED,
                        )));
                    }
                },
                None => stream.next().await,
            };

            match next {
                Some(Ok(StreamItem::Text(fragment))) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    fragments += 1;
                    if fragments % CHECKPOINT_EVERY == 0 {
                        debug!(model = %model, fragments, chars = run.text.len(), "stream checkpoint");
                    }
                    run.text.push_str(&fragment);
                    emitter
                        .emit(SessionEvent::TextDelta {
                            model: model.clone(),
                            text_delta: fragment,
                        })
                        .await?;
                }
                Some(Ok(StreamItem::Usage(reported))) => usage = Some(reported),
                Some(Err(err)) => return Ok(LiveOutcome::Failed(err)),
                None => return Ok(LiveOutcome::Finished(usage)),
            }
        }
    }

    async fn replay_fallback(
        &self,
        mut run: ModelRunResult,
        sample: &FallbackSample,
        err: &ProviderError,
        started: Instant,
        emitter: &EventEmitter,
    ) -> Result<ModelRunResult, ArenaError> {
        warn!(model = %run.model_id, error = %err, "rate limited; replaying fallback sample");

        let details = (!run.text.is_empty()).then(|| {
            format!(
                "replaced {} chars of partial live text with a recorded sample",
                run.text.chars().count()
            )
        });
        run.text.clear();
        let mut chunks = self.catalogue.replay(sample);
        while let Some(chunk) = chunks.next().await {
            run.text.push_str(&chunk);
            emitter
                .emit(SessionEvent::TextDelta {
                    model: run.model_id.clone(),
                    text_delta: chunk,
                })
                .await?;
        }

        let usage = sample.token_split();
        run.prompt_tokens = usage.prompt_tokens;
        run.completion_tokens = usage.completion_tokens;
        run.cost = sample.cost;
        run.latency_ms = started.elapsed().as_millis() as u64;
        run.error_kind = Some(err.kind);
        run.error = Some(err.message.clone());
        run.used_fallback = true;
        run.state = TurnState::FallbackCompleted;

        emitter
            .emit(SessionEvent::ModelComplete {
                model: run.model_id.clone(),
                latency_ms: run.latency_ms,
                usage,
                cost: run.cost,
                is_mock: Some(true),
                details,
            })
            .await?;
        Ok(run)
    }

    async fn surface_failure(
        &self,
        model: &ModelId,
        err: &ProviderError,
        details: Option<&str>,
        latency_ms: u64,
        emitter: &EventEmitter,
    ) -> Result<ModelRunResult, ArenaError> {
        error!(model = %model, kind = %err.kind, error = %err.message, "model turn failed");
        emitter
            .emit(SessionEvent::Error {
                model: model.clone(),
                error: err.message.clone(),
                kind: Some(err.kind),
                details: details.map(str::to_string),
            })
            .await?;
        Ok(ModelRunResult::failed(model.clone(), err, latency_ms))
    }
}

pub struct Orchestrator {
    turns: TurnExecutor,
    judge: Judge,
    models: Vec<ModelDescriptor>,
    policy: Box<dyn DispatchPolicy>,
    deadline: Option<Duration>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl Orchestrator {
    pub fn new(
        gateway: Arc<Gateway>,
        catalogue: Arc<FallbackCatalogue>,
        judge: Judge,
        models: Vec<ModelDescriptor>,
    ) -> Self {
        Self {
            turns: TurnExecutor::new(gateway, catalogue),
            judge,
            models,
            policy: Box::new(SequentialDispatch::new(DEFAULT_TURN_DELAY)),
            deadline: None,
            sink: None,
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn DispatchPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Configured models, in dispatch order
    pub fn models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Request for the given prompt against every configured model
    pub fn request(&self, prompt: impl Into<String>) -> Result<ModelRequest, ArenaError> {
        ModelRequest::new(prompt, self.models.iter().map(|m| m.id.clone()).collect())
    }

    fn resolve(&self, request: &ModelRequest) -> Result<Vec<ModelDescriptor>, ArenaError> {
        request
            .models()
            .iter()
            .map(|id| {
                self.models
                    .iter()
                    .find(|m| &m.id == id)
                    .cloned()
                    .ok_or_else(|| ArenaError::validation(format!("unknown model '{}'", id)))
            })
            .collect()
    }

    /// Run one session, emitting frames as it goes.
    ///
    /// Returns [`ArenaError::Disconnected`] when the client stops listening;
    /// every other failure is reported through the event stream and the
    /// returned report.
    pub async fn run_session(
        &self,
        request: ModelRequest,
        emitter: EventEmitter,
    ) -> Result<SessionReport, ArenaError> {
        let mut phase = SessionPhase::Idle;
        let models = self.resolve(&request)?;
        info!(models = models.len(), policy = self.policy.name(), "session started");

        emitter
            .emit(SessionEvent::Start {
                models: models.clone(),
            })
            .await?;

        advance(&mut phase, SessionPhase::Dispatching);
        let mut ledger = SessionLedger::new();
        let plan = SessionPlan {
            prompt: request.prompt(),
            models: &models,
            deadline: self.deadline.map(|d| Instant::now() + d),
        };
        let runs = self
            .policy
            .dispatch(&self.turns, &plan, &emitter, &mut ledger)
            .await?;

        advance(&mut phase, SessionPhase::Evaluating);
        if runs.is_empty() {
            emitter
                .emit(SessionEvent::FinalResults {
                    evaluations: Vec::new(),
                    total_cost: 0.0,
                    failures: Vec::new(),
                })
                .await?;
            let report = SessionReport {
                prompt: request.prompt().to_string(),
                runs,
                outcome: SessionOutcome::Completed {
                    evaluations: Vec::new(),
                },
                judge_cost: 0.0,
                total_cost: 0.0,
            };
            self.persist(&report).await;
            advance(&mut phase, SessionPhase::Done);
            return Ok(report);
        }

        let (outcome, judge_cost) = self
            .evaluate(request.prompt(), &models, &runs, &emitter, &mut ledger)
            .await?;

        let report = SessionReport {
            prompt: request.prompt().to_string(),
            runs,
            outcome,
            judge_cost,
            total_cost: ledger.total_rounded(),
        };
        self.persist(&report).await;

        for entry in ledger.entries() {
            debug!(label = %entry.label, cost = entry.cost, "ledger entry");
        }
        advance(&mut phase, SessionPhase::Done);
        info!(total_cost = report.total_cost, "session finished");
        Ok(report)
    }

    async fn evaluate(
        &self,
        prompt: &str,
        models: &[ModelDescriptor],
        runs: &[ModelRunResult],
        emitter: &EventEmitter,
        ledger: &mut SessionLedger,
    ) -> Result<(SessionOutcome, f64), ArenaError> {
        let candidates: Vec<Candidate<'_>> = models
            .iter()
            .zip(runs)
            .filter(|(_, run)| !run.is_failed())
            .map(|(model, run)| Candidate { model, run })
            .collect();

        if !candidates.iter().any(|c| c.run.has_text()) {
            warn!("{}", NO_CANDIDATES);
            emitter
                .emit(SessionEvent::JudgeError {
                    error: NO_CANDIDATES.to_string(),
                })
                .await?;
            return Ok((SessionOutcome::NoCandidates, 0.0));
        }

        emitter.emit(SessionEvent::JudgeStart {}).await?;
        let verdict = match self.judge.evaluate(prompt, &candidates, emitter).await {
            Ok(verdict) => verdict,
            Err(ArenaError::Disconnected) => return Err(ArenaError::Disconnected),
            Err(err) => {
                error!(judge = %self.judge.model().id, error = %err, "judge call failed");
                emitter
                    .emit(SessionEvent::JudgeError {
                        error: err.to_string(),
                    })
                    .await?;
                return Ok((
                    SessionOutcome::JudgeFailed {
                        error: err.to_string(),
                    },
                    0.0,
                ));
            }
        };

        debug!(
            prompt_tokens = verdict.usage.prompt_tokens,
            completion_tokens = verdict.usage.completion_tokens,
            reply_chars = verdict.reply.len(),
            "judge replied"
        );
        ledger.record("judge", verdict.cost);
        let evaluations = rank(&candidates, verdict.scores);
        let failures: Vec<FailedModel> = runs.iter().filter_map(FailedModel::from_run).collect();
        if let Some(winner) = evaluations.first() {
            info!(winner = %winner.model_id, final_score = winner.final_score, "ranking complete");
        }

        emitter
            .emit(SessionEvent::FinalResults {
                evaluations: evaluations.clone(),
                total_cost: ledger.total_rounded(),
                failures,
            })
            .await?;
        Ok((SessionOutcome::Completed { evaluations }, verdict.cost))
    }

    /// Store every finished session, empty ones included. Failures are only logged.
    async fn persist(&self, report: &SessionReport) {
        let Some(sink) = &self.sink else {
            return;
        };
        match sink.persist(report).await {
            Ok(path) => info!(path = %path.display(), "session result stored"),
            Err(err) => warn!(error = %err, "failed to store session result"),
        }
    }
}
