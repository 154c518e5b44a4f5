use crate::events::SessionEvent;
use crate::models::{ModelDescriptor, SessionOutcome, SessionReport};
use crate::pricing::{PricingTable, round_usd};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print a finished session in the specified format
pub fn print_report(report: &SessionReport, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_plain(report)),
        OutputFormat::Json => print_json(report),
    }
}

/// Echo live frames to the terminal while a session runs
pub fn print_event(event: &SessionEvent) {
    let mut stdout = io::stdout();
    match event {
        SessionEvent::ModelStart { model } => {
            let _ = writeln!(stdout, "\n--- {} ---", model);
        }
        SessionEvent::TextDelta { text_delta, .. } => {
            let _ = write!(stdout, "{}", text_delta);
        }
        SessionEvent::ModelComplete {
            latency_ms,
            cost,
            is_mock,
            ..
        } => {
            let mock = if is_mock.unwrap_or(false) { " (fallback)" } else { "" };
            let _ = writeln!(stdout, "\n[{} ms, ${:.6}{}]", latency_ms, cost, mock);
        }
        SessionEvent::Error { model, error, .. } => {
            let _ = writeln!(stdout, "\n[{} failed: {}]", model, error);
        }
        SessionEvent::JudgeStart {} => {
            let _ = writeln!(stdout, "\n--- judge ---");
        }
        SessionEvent::JudgeError { error } => {
            let _ = writeln!(stdout, "\n[judge: {}]", error);
        }
        _ => {}
    }
    let _ = stdout.flush();
}

/// Print the configured models with their prices
pub fn print_models(models: &[ModelDescriptor], pricing: &PricingTable) {
    println!("{:<32} {:<24} {:>10} {:>10}", "Model", "Name", "In/1k", "Out/1k");
    println!("{}", "-".repeat(79));
    for model in models {
        match pricing.get(&model.id) {
            Some(price) => println!(
                "{:<32} {:<24} {:>10.5} {:>10.5}",
                model.id, model.display_name, price.input_per_1k, price.output_per_1k
            ),
            None => println!("{:<32} {:<24} {:>10} {:>10}", model.id, model.display_name, "-", "-"),
        }
    }
}

/// Render a session as the plain-text summary
pub fn render_plain(report: &SessionReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Prompt: {}\n\n", report.prompt));

    match &report.outcome {
        SessionOutcome::Completed { evaluations } if evaluations.is_empty() => {
            out.push_str("No models were run.\n");
        }
        SessionOutcome::Completed { evaluations } => {
            out.push_str("RANKING\n-------\n");
            out.push_str(&format!(
                "{:<4} {:<24} {:>8} {:>10} {:>10} {:>10}\n",
                "#", "Model", "Score", "Final", "Latency", "Cost"
            ));
            for (rank, result) in evaluations.iter().enumerate() {
                let name = if result.run.used_fallback {
                    format!("{} *", result.display_name)
                } else {
                    result.display_name.clone()
                };
                out.push_str(&format!(
                    "{:<4} {:<24} {:>8.1} {:>10.3} {:>8}ms {:>10.6}\n",
                    rank + 1,
                    name,
                    result.score.total_score,
                    result.final_score,
                    result.run.latency_ms,
                    round_usd(result.run.cost),
                ));
            }
            if evaluations.iter().any(|r| r.run.used_fallback) {
                out.push_str("* replayed from a recorded sample after a rate limit\n");
            }
            if let Some(winner) = report.winner() {
                out.push_str(&format!("\nWinner: {}\n", winner.display_name));
            }
        }
        SessionOutcome::NoCandidates => {
            out.push_str("No model produced a response.\n");
        }
        SessionOutcome::JudgeFailed { error } => {
            out.push_str(&format!("Judge failed: {}\n", error));
        }
    }

    let failures = report.failures();
    if !failures.is_empty() {
        out.push_str("\nFAILURES\n--------\n");
        for failure in &failures {
            out.push_str(&format!("{} ({}): {}\n", failure.model, failure.kind, failure.error));
        }
    }

    out.push_str(&format!(
        "\nJudge cost: ${:.6}\nTotal cost: ${:.6}\n",
        report.judge_cost, report.total_cost
    ));
    out
}

/// Print results in JSON format
fn print_json(report: &SessionReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::models::{JudgeScore, ModelRunResult, RankedResult, TurnState};

    fn report() -> SessionReport {
        let mut a = ModelRunResult::pending("test/a".into());
        a.text = "pong".to_string();
        a.latency_ms = 12;
        a.cost = 0.00003;
        a.state = TurnState::Completed;

        let mut b = ModelRunResult::pending("test/b".into());
        b.text = "mock-B".to_string();
        b.cost = 0.5;
        b.used_fallback = true;
        b.state = TurnState::FallbackCompleted;

        let c = ModelRunResult::failed("test/c".into(), &ProviderError::auth("401 unauthorized"), 3);

        let ranked = |run: &ModelRunResult, name: &str, final_score: f64| RankedResult {
            model_id: run.model_id.clone(),
            display_name: name.to_string(),
            run: run.clone(),
            score: JudgeScore::neutral(run.model_id.clone(), ""),
            final_score,
        };
        let evaluations = vec![ranked(&a, "Model A", 27.48), ranked(&b, "Model B", 22.5)];

        SessionReport {
            prompt: "ping".to_string(),
            runs: vec![a, b, c],
            outcome: SessionOutcome::Completed { evaluations },
            judge_cost: 0.00002,
            total_cost: 0.50005,
        }
    }

    #[test]
    fn test_render_plain_lists_ranking_and_failures() {
        let text = render_plain(&report());

        let first = text.find("Model A").unwrap();
        let second = text.find("Model B *").unwrap();
        assert!(first < second);
        assert!(text.contains("replayed from a recorded sample"));
        assert!(text.contains("test/c (auth): 401 unauthorized"));
        assert!(text.contains("Winner: Model A"));
        assert!(text.contains("Total cost: $0.500050"));
    }

    #[test]
    fn test_render_plain_no_candidates() {
        let mut report = report();
        report.outcome = SessionOutcome::NoCandidates;
        let text = render_plain(&report);
        assert!(text.contains("No model produced a response."));
        assert!(!text.contains("RANKING"));
    }

    #[test]
    fn test_report_serializes_to_json() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["outcome"]["status"], "completed");
        assert_eq!(json["outcome"]["evaluations"][0]["modelId"], "test/a");
        assert_eq!(json["totalCost"], 0.50005);
    }
}
