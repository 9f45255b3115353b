//! CLI interface for atomic-ops

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::{self, Config};
use crate::execution::ExecutionRecord;
use crate::feedback::BehavioralSignal;
use crate::features::RequestContext;
use crate::learning::{LearningMetricSnapshot, LearningRunner};
use crate::pipeline::{OperationView, Pipeline, SubmitRequest, SubmitResponse, UndoReport};
use crate::types::Classification;

#[derive(Parser)]
#[command(name = "atomic-ops")]
#[command(about = "Classify, verify and execute directives as atomic operations", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true, env = "ATOMIC_OPS_CONFIG")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a directive
    Submit {
        directive: String,
        #[arg(short, long, env = "ATOMIC_OPS_REQUESTER", default_value = "local")]
        requester: String,
        /// Request context as a JSON object
        #[arg(long)]
        context: Option<String>,
    },
    /// Execute an operation waiting for approval
    Approve { id: String },
    /// Cancel an operation waiting for approval
    Reject { id: String },
    /// Show what executing an operation would do
    Preview { id: String },
    /// Undo an operation, or the requester's latest reversible one
    Undo {
        id: Option<String>,
        #[arg(short, long, env = "ATOMIC_OPS_REQUESTER", default_value = "local")]
        requester: String,
    },
    /// Record feedback on an operation
    Feedback {
        id: String,
        #[command(subcommand)]
        command: FeedbackCommands,
    },
    /// Show an operation with its reasoning, verification and execution
    Show { id: String },
    /// List recent operations
    History {
        #[arg(short, long, env = "ATOMIC_OPS_REQUESTER", default_value = "local")]
        requester: String,
        #[arg(short, long, default_value = "7")]
        days: i64,
    },
    /// Compute learning metrics
    Learn {
        /// Only this requester (default: every active requester)
        #[arg(short, long)]
        requester: Option<String>,
        /// Keep running on the configured interval until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum FeedbackCommands {
    /// Rate the result 1-5
    Rating {
        rating: u8,
        /// Per-dimension rating, e.g. `--dimension accuracy=4`
        #[arg(short, long, value_parser = parse_dimension)]
        dimension: Vec<(String, u8)>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Supply the classification the system should have chosen
    Correct {
        /// Triple as destination/consumer/semantics
        classification: String,
        #[arg(long)]
        reasoning: Option<String>,
    },
    /// Report a retry, undo or abandon
    Behavior {
        /// retry, undo or abandon
        signal: String,
        #[arg(long, default_value = "0")]
        latency_ms: u64,
    },
    /// Report whether the result was kept
    Outcome {
        #[arg(long)]
        persisted: bool,
        #[arg(long, default_value = "1")]
        days: u32,
        #[arg(long)]
        reused: bool,
        #[arg(long)]
        referenced: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

fn parse_dimension(s: &str) -> Result<(String, u8), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let value: u8 = value.trim().parse().map_err(|e| format!("invalid rating '{}': {}", value, e))?;
    Ok((name.trim().to_string(), value))
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Commands::Config { command } = &cli.command {
        match command {
            ConfigCommands::Show => print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?),
            ConfigCommands::Path => match &cli.config {
                Some(path) => println!("{}", path.display()),
                None => println!("{}", config::config_path()?.display()),
            },
        }
        return Ok(());
    }

    let pipeline = Pipeline::open(config).await?;
    let json = cli.json;

    match cli.command {
        Commands::Submit { directive, requester, context } => {
            let mut request = SubmitRequest::new(directive, requester);
            if let Some(raw) = context {
                let context: RequestContext = serde_json::from_str(&raw).context("Invalid --context JSON")?;
                request = request.with_context(context);
            }
            let response = pipeline.submit(request).await?;
            emit(json, &response, print_submit)?;
        }
        Commands::Approve { id } => {
            let view = pipeline.approve(&id).await?;
            emit(json, &view, print_view)?;
        }
        Commands::Reject { id } => {
            let view = pipeline.reject(&id).await?;
            emit(json, &view, print_view)?;
        }
        Commands::Preview { id } => {
            let records = pipeline.preview(&id).await?;
            emit(json, &records, |records| {
                for record in records {
                    print_execution(record);
                }
            })?;
        }
        Commands::Undo { id, requester } => {
            let report = match id {
                Some(id) => pipeline.undo(&id).await?,
                None => pipeline.undo_latest(&requester).await?,
            };
            emit(json, &report, print_undo)?;
        }
        Commands::Feedback { id, command } => {
            let collector = pipeline.feedback();
            match command {
                FeedbackCommands::Rating { rating, dimension, comment } => {
                    let dimensions: BTreeMap<String, u8> = dimension.into_iter().collect();
                    collector.rate(&id, rating, dimensions, comment).await?;
                }
                FeedbackCommands::Correct { classification, reasoning } => {
                    let Some(corrected) = Classification::parse(&classification) else {
                        bail!("Invalid classification '{}', expected destination/consumer/semantics", classification);
                    };
                    collector.correct(&id, corrected, reasoning).await?;
                }
                FeedbackCommands::Behavior { signal, latency_ms } => {
                    let Some(signal) = BehavioralSignal::parse(&signal) else {
                        bail!("Unknown signal '{}', expected retry, undo or abandon", signal);
                    };
                    collector.behavioral(&id, signal, latency_ms).await?;
                }
                FeedbackCommands::Outcome { persisted, days, reused, referenced } => {
                    collector.outcome(&id, persisted, days, reused, referenced).await?;
                }
            }
            let summary = collector.summary(&id).await?;
            emit(json, &summary, |s| {
                println!("Feedback recorded for {} ({} events)", s.operation_id, s.event_count);
                if let Some(rate) = s.approval_rate {
                    println!("  approval rate: {:.0}%", rate * 100.0);
                }
            })?;
        }
        Commands::Show { id } => {
            let view = pipeline.operation(&id).await?;
            emit(json, &view, print_view)?;
        }
        Commands::History { requester, days } => {
            let ops = pipeline.history(&requester, Utc::now() - Duration::days(days)).await?;
            emit(json, &ops, |ops| {
                if ops.is_empty() {
                    println!("No operations in the last {} days.", days);
                }
                for op in ops {
                    let triple = op.classification.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}  {:<17}  {:<24}  {}",
                        op.created_at.format("%Y-%m-%d %H:%M"),
                        op.status.as_str(),
                        triple,
                        op.directive
                    );
                    println!("    {}", op.id);
                }
            })?;
        }
        Commands::Learn { requester, watch } => {
            let learning = pipeline.learning().clone();
            if watch {
                let interval = std::time::Duration::from_secs(pipeline.config().learning.interval_secs);
                let runner = LearningRunner::spawn(learning, interval);
                println!("Computing learning metrics every {}s. Press Ctrl-C to stop.", interval.as_secs());
                tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
                runner.shutdown().await;
                return Ok(());
            }
            let snapshots = match requester {
                Some(requester) => vec![learning.compute(&requester, Utc::now()).await?],
                None => learning.run_once(Utc::now()).await,
            };
            emit(json, &snapshots, |snapshots| {
                if snapshots.is_empty() {
                    println!("No active requesters.");
                }
                for snapshot in snapshots {
                    print_snapshot(snapshot);
                }
            })?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn emit<T: Serialize + ?Sized>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

fn percent(value: Option<f64>) -> String {
    value.map(|v| format!("{:.0}%", v * 100.0)).unwrap_or_else(|| "n/a".to_string())
}

fn print_submit(response: &SubmitResponse) {
    println!("Operation {}", response.operation_id);
    match response.classification {
        Some(c) => println!("  classification: {} ({:.2})", c, response.confidence),
        None if response.steps.is_empty() => println!("  classification: none"),
        None => {}
    }
    if let Some(error) = &response.error {
        println!("  error: {}", error);
    }
    if let Some(report) = &response.verification {
        println!(
            "  verification: {} ({:.2})",
            if report.passed { "passed" } else { "failed" },
            report.confidence
        );
        for issue in report.issues() {
            println!("    - {}", issue);
        }
    }
    for (i, step) in response.steps.iter().enumerate() {
        let triple = step.classification.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  step {}: {} {} [{}]", i + 1, step.operation_id, triple, step.status);
    }
    if let Some(record) = &response.execution {
        print_execution(record);
    }
    if response.awaiting_approval() {
        println!("  awaiting approval: atomic-ops approve {}", response.operation_id);
    } else {
        println!("  status: {}", response.status);
    }
}

fn print_execution(record: &ExecutionRecord) {
    let mode = if record.simulated { "simulated" } else { "executed" };
    println!(
        "  {} via {}: {} in {}ms",
        mode,
        record.executor,
        if record.success { "ok" } else { "failed" },
        record.duration_ms
    );
    if !record.stdout.is_empty() {
        println!("{}", record.stdout.trim_end());
    }
    if !record.stderr.is_empty() {
        eprintln!("{}", record.stderr.trim_end());
    }
    if let Some(error) = &record.error {
        println!("  error: {}", error);
    }
    if record.reversible {
        println!("  reversible: {} undo action(s)", record.undo_actions.len());
    }
}

fn print_view(view: &OperationView) {
    let op = &view.operation;
    println!("Operation {}", op.id);
    println!("  directive: {}", op.directive);
    println!("  requester: {}", op.requester);
    match op.failure {
        Some(kind) => println!("  status: {} ({})", op.status, kind.as_str()),
        None => println!("  status: {}", op.status),
    }
    if let Some(c) = op.classification {
        println!("  classification: {} ({:.2})", c, op.confidence);
    }
    if let Some(reasoning) = &view.reasoning {
        println!("  strategy: {}", reasoning.strategy);
        if let Some(from) = reasoning.corrected_from {
            println!("  corrected from: {}", from);
        }
    }
    for result in &view.verification {
        let verdict = if result.skipped {
            "skip"
        } else if result.passed {
            "pass"
        } else {
            "FAIL"
        };
        println!("  [{}] {:<10} {:.2}", verdict, result.layer.as_str(), result.confidence);
        for issue in &result.issues {
            println!("      - {}", issue);
        }
    }
    if let Some(record) = &view.execution {
        print_execution(record);
        if view.undo_consumed {
            println!("  undone");
        }
    }
    if view.feedback.event_count > 0 {
        println!(
            "  feedback: {} event(s), rating {}, approval rate {}",
            view.feedback.event_count,
            view.feedback.avg_rating.map(|r| format!("{:.1}", r)).unwrap_or_else(|| "n/a".to_string()),
            percent(view.feedback.approval_rate)
        );
    }
    for (id, score) in &view.similar {
        println!("  similar: {} ({:.2})", id, score);
    }
    for (i, step) in view.steps.iter().enumerate() {
        println!("  step {}:", i + 1);
        print_view(step);
    }
}

fn print_undo(report: &UndoReport) {
    println!("Undid {}", report.operation_id);
    for action in &report.actions {
        println!("  - {}", action);
    }
}

fn print_snapshot(snapshot: &LearningMetricSnapshot) {
    println!("{} ({} operations, {} days)", snapshot.requester, snapshot.sample_size, snapshot.window_days);
    println!("  accuracy:        {}", percent(snapshot.accuracy));
    if let Some(delta) = snapshot.improvement {
        println!("  improvement:     {:+.1} pts", delta * 100.0);
    }
    println!("  correction rate: {}", percent(snapshot.correction_rate));
    println!(
        "  per axis:        destination {}, consumer {}, semantics {}",
        percent(snapshot.per_axis.destination),
        percent(snapshot.per_axis.consumer),
        percent(snapshot.per_axis.semantics)
    );
    println!("  engagement:      {}", percent(snapshot.quality.engagement));
    println!("  calibration:     x{:.2}", snapshot.calibration());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_dimension() {
        assert_eq!(parse_dimension("accuracy=4").unwrap(), ("accuracy".to_string(), 4));
        assert!(parse_dimension("accuracy").is_err());
        assert!(parse_dimension("accuracy=high").is_err());
    }

    #[test]
    fn test_parse_feedback_correct() {
        let cli = Cli::try_parse_from([
            "atomic-ops",
            "feedback",
            "op-1",
            "correct",
            "file/human/execute",
            "--reasoning",
            "it writes a file",
        ])
        .unwrap();
        match cli.command {
            Commands::Feedback { id, command: FeedbackCommands::Correct { classification, .. } } => {
                assert_eq!(id, "op-1");
                assert_eq!(classification, "file/human/execute");
            }
            _ => panic!("wrong command"),
        }
    }
}
