use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod backend;
mod config;
mod error;
mod events;
mod fallback;
mod gateway;
mod judge;
mod ledger;
mod models;
mod orchestrator;
mod output;
mod pricing;
mod server;
mod sink;
#[cfg(test)]
mod testing;

use crate::backend::OpenAiBackend;
use crate::config::Config;
use crate::events::{DEFAULT_EVENT_BUFFER, EventEmitter};
use crate::gateway::{Gateway, Invocation, InvokeMode};
use crate::judge::Judge;
use crate::models::ModelId;
use crate::orchestrator::{Orchestrator, SequentialDispatch};
use crate::output::OutputFormat;
use crate::server::AppState;
use crate::sink::FileResultSink;

/// LLM Arena - stream one prompt through several models and let a judge rank them
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "arena.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the comparison stream over HTTP
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one comparison session in the terminal
    Run {
        prompt: String,

        /// Output format: plain or json
        #[arg(short, long, default_value = "plain")]
        output: OutputFormat,
    },
    /// Call one model once, without streaming
    Probe { model: String, prompt: String },
    /// List configured models and their prices
    Models,
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_gateway(config: &Config) -> Result<Arc<Gateway>> {
    let backend = OpenAiBackend::from_config(config)?;
    Ok(Arc::new(Gateway::new(
        Arc::new(backend),
        Arc::new(config.pricing_table()),
    )))
}

fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let gateway = build_gateway(config)?;
    let judge = Judge::new(
        gateway.clone(),
        config.judge.descriptor(),
        config.judge.preview_chars,
    );

    let mut orchestrator = Orchestrator::new(
        gateway,
        Arc::new(config.fallback_catalogue()),
        judge,
        config.descriptors(),
    )
    .with_policy(Box::new(SequentialDispatch::new(config.session.turn_delay())))
    .with_deadline(config.session.deadline());

    if let Some(dir) = &config.session.storage_dir {
        let sink = FileResultSink::new(dir);
        info!(dir = %sink.dir().display(), "finished sessions will be stored");
        orchestrator = orchestrator.with_sink(Arc::new(sink));
    }
    Ok(orchestrator)
}

async fn run_once(config: &Config, prompt: String, format: OutputFormat) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let request = orchestrator.request(prompt)?;

    let (emitter, mut rx) = EventEmitter::channel(DEFAULT_EVENT_BUFFER);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if matches!(format, OutputFormat::Plain) {
                output::print_event(&event);
            }
        }
    });

    let report = orchestrator
        .run_session(request, emitter)
        .await
        .context("Session failed")?;
    printer.await.context("Event printer panicked")?;

    println!();
    output::print_report(&report, format);
    Ok(())
}

async fn probe(config: &Config, model: String, prompt: String) -> Result<()> {
    let gateway = build_gateway(config)?;
    let invocation = gateway
        .invoke(&ModelId::new(model), &prompt, InvokeMode::Generate)
        .await
        .context("Probe call failed")?;
    let Invocation::Completed(run) = invocation else {
        anyhow::bail!("Probe expected a completed reply");
    };

    let usage = run.usage();
    println!("{}", run.text);
    println!();
    println!(
        "tokens: {} prompt / {} completion, cost: ${:.6}, latency: {} ms",
        usage.prompt_tokens, usage.completion_tokens, run.cost, run.latency_ms
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = Config::from_file(&args.config)?;
    config.validate().context("Invalid configuration")?;
    info!(models = config.models.len(), judge = %config.judge.id, "configuration loaded");

    match args.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let state = AppState::new(build_orchestrator(&config)?);
            server::serve(state, &bind).await?;
        }
        Command::Run { prompt, output } => run_once(&config, prompt, output).await?,
        Command::Probe { model, prompt } => probe(&config, model, prompt).await?,
        Command::Models => output::print_models(&config.descriptors(), &config.pricing_table()),
    }

    Ok(())
}
