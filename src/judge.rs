//! Scoring pass over the collected responses.
//!
//! The judge is one more streamed model call. Its free-text reply is searched
//! for the first balanced `{...}` block, which is decoded strictly; anything
//! unusable degrades to the neutral rubric instead of failing the session.

use crate::backend::StreamItem;
use crate::error::ArenaError;
use crate::events::{EventEmitter, SessionEvent};
use crate::gateway::{Gateway, InvokeMode};
use crate::models::{
    JudgeScore, ModelDescriptor, ModelRunResult, RankedResult, Rubric, Usage,
};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_PREVIEW_CHARS: usize = 400;

/// One response put in front of the judge
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub model: &'a ModelDescriptor,
    pub run: &'a ModelRunResult,
}

/// A score decoded from the judge's reply, or the neutral substitute
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedScore {
    Strict(JudgeScore),
    Fallback(JudgeScore),
}

impl ParsedScore {
    pub fn score(&self) -> &JudgeScore {
        match self {
            Self::Strict(score) | Self::Fallback(score) => score,
        }
    }

    pub fn into_score(self) -> JudgeScore {
        match self {
            Self::Strict(score) | Self::Fallback(score) => score,
        }
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict(_))
    }
}

#[derive(Debug)]
pub struct JudgeVerdict {
    /// In candidate order
    pub scores: Vec<JudgeScore>,
    pub usage: Usage,
    pub cost: f64,
    pub reply: String,
}

#[derive(Debug, Deserialize)]
struct JudgeReply {
    evaluations: Vec<JudgeEntry>,
}

#[derive(Debug, Deserialize)]
struct JudgeEntry {
    #[serde(alias = "modelId", alias = "model_id", alias = "name")]
    model: String,
    relevance: f64,
    reasoning: f64,
    style: f64,
    accuracy: f64,
    honesty: f64,
    #[serde(default)]
    explanation: String,
}

impl JudgeEntry {
    fn rubric(&self) -> Rubric {
        Rubric {
            relevance: self.relevance,
            reasoning: self.reasoning,
            style: self.style,
            accuracy: self.accuracy,
            honesty: self.honesty,
        }
    }
}

pub struct Judge {
    gateway: Arc<Gateway>,
    model: ModelDescriptor,
    preview_chars: usize,
}

impl Judge {
    pub fn new(gateway: Arc<Gateway>, model: ModelDescriptor, preview_chars: usize) -> Self {
        Self {
            gateway,
            model,
            preview_chars,
        }
    }

    pub fn model(&self) -> &ModelDescriptor {
        &self.model
    }

    /// Stream the judge call, forwarding its text as `judge-delta` frames, then
    /// score every candidate.
    pub async fn evaluate(
        &self,
        prompt: &str,
        candidates: &[Candidate<'_>],
        emitter: &EventEmitter,
    ) -> Result<JudgeVerdict, ArenaError> {
        let judge_prompt = build_judge_prompt(prompt, candidates, self.preview_chars);
        info!(judge = %self.model.id, candidates = candidates.len(), "judging responses");

        let mut stream = self
            .gateway
            .invoke(&self.model.id, &judge_prompt, InvokeMode::Stream)
            .await?
            .into_stream();
        let mut reply = String::new();
        let mut usage = None;
        while let Some(item) = stream.next().await {
            match item? {
                StreamItem::Text(fragment) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    reply.push_str(&fragment);
                    emitter
                        .emit(SessionEvent::JudgeDelta {
                            text_delta: fragment,
                        })
                        .await?;
                }
                StreamItem::Usage(reported) => usage = Some(reported),
            }
        }

        let usage = usage.unwrap_or_else(|| {
            warn!(judge = %self.model.id, "judge reported no usage; counting zero tokens");
            Usage::default()
        });
        let cost = self.gateway.cost(&self.model.id, usage)?;

        let parsed = parse_scores(&reply, candidates);
        let neutral: Vec<&str> = parsed
            .iter()
            .filter(|score| !score.is_strict())
            .map(|score| score.score().model_id.as_str())
            .collect();
        if !neutral.is_empty() {
            let err = ArenaError::JudgeParse(format!(
                "neutral scores used for {}",
                neutral.join(", ")
            ));
            warn!(error = %err, "judge reply not fully usable");
        }

        Ok(JudgeVerdict {
            scores: parsed.into_iter().map(ParsedScore::into_score).collect(),
            usage,
            cost,
            reply,
        })
    }
}

pub fn build_judge_prompt(prompt: &str, candidates: &[Candidate<'_>], preview_chars: usize) -> String {
    let mut out = String::new();
    out.push_str("You are an impartial judge comparing answers from several AI models.\n\n");
    out.push_str("Original prompt:\n");
    out.push_str(prompt);
    out.push_str("\n\nScore every response on this rubric:\n");
    out.push_str("- relevance (0-10): does it address the prompt\n");
    out.push_str("- reasoning (0-5): quality of the reasoning\n");
    out.push_str("- style (0-5): clarity and presentation\n");
    out.push_str("- accuracy (0-10): factual correctness\n");
    out.push_str("- honesty (0-5): acknowledges uncertainty and limits\n\n");
    out.push_str("Responses:\n");

    for candidate in candidates {
        let text = if candidate.run.has_text() {
            preview(&candidate.run.text, preview_chars)
        } else {
            "(empty response)".to_string()
        };
        out.push_str(&format!(
            "\n### {} (model id: {})\n{}\n",
            candidate.model.display_name, candidate.model.id, text
        ));
    }

    out.push_str(
        "\nReply with a JSON object of the form \
         {\"evaluations\": [{\"model\": \"<model id>\", \"relevance\": 0, \"reasoning\": 0, \
         \"style\": 0, \"accuracy\": 0, \"honesty\": 0, \"explanation\": \"...\"}]} \
         containing one entry per response.\n",
    );
    out
}

/// Truncate to at most `max_chars` characters, marking the cut
pub fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// First brace-balanced `{...}` span, ignoring braces inside JSON strings
pub fn extract_json_block(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in reply[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&reply[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Decode the judge's reply into one score per candidate, in candidate order
pub fn parse_scores(reply: &str, candidates: &[Candidate<'_>]) -> Vec<ParsedScore> {
    let neutral_all = |reason: &str| {
        candidates
            .iter()
            .map(|c| ParsedScore::Fallback(JudgeScore::neutral(c.model.id.clone(), reason)))
            .collect()
    };

    let Some(block) = extract_json_block(reply) else {
        debug!("judge reply contains no JSON block");
        return neutral_all("judge reply contained no scores");
    };
    let parsed: JudgeReply = match serde_json::from_str(block) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "judge JSON block did not decode");
            return neutral_all("judge reply could not be parsed");
        }
    };

    candidates
        .iter()
        .map(|candidate| match match_entry(&parsed.evaluations, candidate.model) {
            Some(entry) => ParsedScore::Strict(JudgeScore::from_rubric(
                candidate.model.id.clone(),
                entry.rubric(),
                entry.explanation.clone(),
            )),
            None => ParsedScore::Fallback(JudgeScore::neutral(
                candidate.model.id.clone(),
                "judge did not score this response",
            )),
        })
        .collect()
}

fn match_entry<'a>(entries: &'a [JudgeEntry], model: &ModelDescriptor) -> Option<&'a JudgeEntry> {
    if let Some(entry) = entries.iter().find(|e| e.model == model.id.as_str()) {
        return Some(entry);
    }

    let name = model.display_name.to_lowercase();
    if name.is_empty() {
        return None;
    }
    let mut matches = entries
        .iter()
        .filter(|e| e.model.to_lowercase().contains(&name));
    match (matches.next(), matches.next()) {
        (Some(entry), None) => Some(entry),
        _ => None,
    }
}

/// Quality score minus one point per second of latency and per ten cents spent
pub fn final_score(total_score: f64, latency_ms: u64, cost: f64) -> f64 {
    total_score - latency_ms as f64 / 1000.0 - cost * 10.0
}

/// Pair candidates with their scores and sort best first; ties keep input order
pub fn rank(candidates: &[Candidate<'_>], scores: Vec<JudgeScore>) -> Vec<RankedResult> {
    let mut ranked: Vec<RankedResult> = candidates
        .iter()
        .zip(scores)
        .map(|(candidate, score)| RankedResult {
            model_id: candidate.model.id.clone(),
            display_name: candidate.model.display_name.clone(),
            final_score: final_score(score.total_score, candidate.run.latency_ms, candidate.run.cost),
            run: candidate.run.clone(),
            score,
        })
        .collect();
    ranked.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TurnState;
    use crate::testing::{JUDGE_MODEL, ScriptedBackend, descriptor, gateway};

    fn run(id: &str, text: &str, latency_ms: u64, cost: f64) -> ModelRunResult {
        let mut run = ModelRunResult::pending(id.into());
        run.text = text.to_string();
        run.latency_ms = latency_ms;
        run.cost = cost;
        run.state = TurnState::Completed;
        run
    }

    #[test]
    fn test_extract_json_block_skips_prose_and_string_braces() {
        let reply = r#"Here you go: {"evaluations": [{"explanation": "uses } and {"}]} trailing"#;
        assert_eq!(
            extract_json_block(reply),
            Some(r#"{"evaluations": [{"explanation": "uses } and {"}]}"#)
        );
        assert_eq!(extract_json_block("no json"), None);
        assert_eq!(extract_json_block("{\"open\": 1"), None);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo wörld", 4), "héll...");
        assert_eq!(preview("short", 400), "short");
    }

    #[test]
    fn test_malformed_reply_gives_neutral_scores() {
        let a = descriptor("test/a");
        let b = descriptor("test/b");
        let (run_a, run_b) = (run("test/a", "pong", 5, 0.0), run("test/b", "mock-B", 5, 0.5));
        let candidates = [
            Candidate { model: &a, run: &run_a },
            Candidate { model: &b, run: &run_b },
        ];

        for reply in ["I liked both", "{\"evaluations\": [oops]}"] {
            let parsed = parse_scores(reply, &candidates);
            assert_eq!(parsed.len(), 2);
            for score in &parsed {
                assert!(!score.is_strict());
                assert_eq!(score.score().total_score, 27.5);
                assert_eq!(score.score().soundness_score, 10.0);
            }
        }
    }

    #[test]
    fn test_parse_matches_by_id_then_display_name() {
        let a = descriptor("test/a");
        let b = descriptor("test/b");
        let c = descriptor("test/c");
        let (run_a, run_b, run_c) = (
            run("test/a", "x", 0, 0.0),
            run("test/b", "y", 0, 0.0),
            run("test/c", "z", 0, 0.0),
        );
        let candidates = [
            Candidate { model: &a, run: &run_a },
            Candidate { model: &b, run: &run_b },
            Candidate { model: &c, run: &run_c },
        ];
        let reply = r#"Scores:
        {"evaluations": [
            {"model": "test/a", "relevance": 9, "reasoning": 4, "style": 4, "accuracy": 8, "honesty": 5, "explanation": "solid"},
            {"model": "the MODEL B answer", "relevance": 20, "reasoning": 1, "style": 1, "accuracy": 1, "honesty": 1}
        ]}"#;

        let parsed = parse_scores(reply, &candidates);
        assert!(parsed[0].is_strict());
        assert_eq!(parsed[0].score().total_score, 9.0 * 2.0 + 8.0 * 2.0 + 4.0 + 4.0 + 5.0);
        assert_eq!(parsed[0].score().explanation, "solid");

        assert!(parsed[1].is_strict());
        assert_eq!(parsed[1].score().relevance, 10.0);

        assert!(!parsed[2].is_strict());
        assert_eq!(parsed[2].score().total_score, 27.5);
    }

    #[test]
    fn test_ambiguous_display_name_match_is_neutral() {
        let a = descriptor("test/a");
        let run_a = run("test/a", "x", 0, 0.0);
        let candidates = [Candidate { model: &a, run: &run_a }];
        let reply = r#"{"evaluations": [
            {"model": "Model A v1", "relevance": 1, "reasoning": 1, "style": 1, "accuracy": 1, "honesty": 1},
            {"model": "Model A v2", "relevance": 2, "reasoning": 2, "style": 2, "accuracy": 2, "honesty": 2}
        ]}"#;
        assert!(!parse_scores(reply, &candidates)[0].is_strict());
    }

    #[test]
    fn test_rank_is_deterministic_and_stable() {
        let a = descriptor("test/a");
        let b = descriptor("test/b");
        let c = descriptor("test/c");
        let (run_a, run_b, run_c) = (
            run("test/a", "x", 1000, 0.0),
            run("test/b", "y", 0, 0.1),
            run("test/c", "z", 0, 0.0),
        );
        let candidates = [
            Candidate { model: &a, run: &run_a },
            Candidate { model: &b, run: &run_b },
            Candidate { model: &c, run: &run_c },
        ];
        let scores = || {
            vec![
                JudgeScore::neutral("test/a".into(), ""),
                JudgeScore::neutral("test/b".into(), ""),
                JudgeScore::neutral("test/c".into(), ""),
            ]
        };

        let first = rank(&candidates, scores());
        let second = rank(&candidates, scores());
        assert_eq!(first, second);

        let order: Vec<&str> = first.iter().map(|r| r.model_id.as_str()).collect();
        assert_eq!(order, vec!["test/c", "test/a", "test/b"]);
        assert_eq!(first[0].final_score, 27.5);
        assert_eq!(first[1].final_score, 26.5);
        assert_eq!(first[2].final_score, 26.5);
    }

    #[test]
    fn test_final_score_formula() {
        assert_eq!(final_score(30.0, 2000, 0.5), 23.0);
    }

    #[tokio::test]
    async fn test_evaluate_streams_deltas_and_costs_the_call() {
        let reply = r#"{"evaluations": [{"model": "test/a", "relevance": 10, "reasoning": 5, "style": 5, "accuracy": 10, "honesty": 5}]}"#;
        let (head, tail) = reply.split_at(20);
        let backend = ScriptedBackend::new().reply(JUDGE_MODEL, &[head, tail], Usage::new(1000, 1000));
        let judge = Judge::new(gateway(backend), descriptor(JUDGE_MODEL), DEFAULT_PREVIEW_CHARS);

        let a = descriptor("test/a");
        let run_a = run("test/a", "pong", 1, 0.0);
        let (emitter, mut rx) = EventEmitter::channel(8);
        let verdict = judge
            .evaluate("ping", &[Candidate { model: &a, run: &run_a }], &emitter)
            .await
            .unwrap();
        drop(emitter);

        assert_eq!(verdict.reply, reply);
        assert_eq!(verdict.scores[0].total_score, 45.0);
        assert!((verdict.cost - 0.003).abs() < 1e-12);

        let mut deltas = Vec::new();
        while let Some(event) = rx.recv().await {
            if let SessionEvent::JudgeDelta { text_delta } = event {
                deltas.push(text_delta);
            }
        }
        assert_eq!(deltas.concat(), reply);
    }

    #[tokio::test]
    async fn test_evaluate_surfaces_judge_provider_failure() {
        let backend = ScriptedBackend::new().fail(JUDGE_MODEL, "500 internal error");
        let judge = Judge::new(gateway(backend), descriptor(JUDGE_MODEL), DEFAULT_PREVIEW_CHARS);
        let a = descriptor("test/a");
        let run_a = run("test/a", "pong", 1, 0.0);
        let (emitter, _rx) = EventEmitter::channel(8);

        let err = judge
            .evaluate("ping", &[Candidate { model: &a, run: &run_a }], &emitter)
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::Provider(_)));
    }
}
