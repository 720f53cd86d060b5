//! cityrules-analyzer - document rule extraction CLI
//!
//! Sends every page image (or markdown chapter) in a directory to an LLM
//! generation service with a fixed number of requests in flight, sanitizes
//! each reply into JSON and persists outcomes as they complete.
//!
//! Ctrl-C stops submitting new work, drains in-flight attempts, prints the
//! partial summary and exits with status 130.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cityrules_analyzer::config::{apply_overrides, client_config, Overrides, PipelineConfig};
use cityrules_analyzer::services::result_sink::{JsonFileSink, ResultSink, SqliteSink};
use cityrules_analyzer::services::task_source::{
    TaskSource, DEFAULT_IMAGE_PROMPT, DEFAULT_MARKDOWN_PROMPT,
};
use cityrules_analyzer::services::OpenRouterClient;
use cityrules_analyzer::workflow::render_summary;
use cityrules_analyzer::Scheduler;
use cityrules_common::config::{load_config, resolve_api_key, SinkKind, TomlConfig};
use cityrules_common::events::{EventBus, PipelineEvent};
use cityrules_common::human_time::format_eta;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Exit status after Ctrl-C
const EXIT_CANCELLED: i32 = 130;

/// Command-line arguments for cityrules-analyzer
#[derive(Parser, Debug)]
#[command(name = "cityrules-analyzer")]
#[command(about = "Extract zoning rules from documents with an LLM, N requests at a time")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze page images (.png, .jpg, .jpeg, .webp)
    Images(RunArgs),
    /// Analyze markdown chapters (.md)
    Markdown(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory to scan for input files
    #[arg(short, long)]
    input: PathBuf,

    /// Output root (run directory or database is created here)
    #[arg(short, long, env = "CITYRULES_OUTPUT")]
    output: Option<PathBuf>,

    /// Number of requests kept in flight
    #[arg(short = 'n', long, env = "CITYRULES_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Model identifier sent to the service
    #[arg(short, long, env = "CITYRULES_MODEL")]
    model: Option<String>,

    /// Maximum service calls per task
    #[arg(long, env = "CITYRULES_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// File holding the prompt (markdown: `{content}` marks where the chapter goes)
    #[arg(short, long, value_name = "FILE")]
    prompt_file: Option<PathBuf>,

    /// Config file (default: $CITYRULES_CONFIG, then ~/.config/cityrules/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Result sink: json or sqlite
    #[arg(long, env = "CITYRULES_SINK")]
    sink: Option<SinkKind>,

    /// Requeue failed tasks once after the main pass
    #[arg(long)]
    retry_failed: bool,

    /// Resample once when a reply contains no recoverable JSON
    #[arg(long)]
    sanitizer_retry: bool,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            concurrency: self.concurrency,
            max_attempts: self.max_attempts,
            model: self.model.clone(),
            output_root: self.output.clone(),
            sink: self.sink,
            retry_failed: self.retry_failed,
            sanitizer_retry: self.sanitizer_retry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Images,
    Markdown,
}

impl InputKind {
    fn run_prefix(self) -> &'static str {
        match self {
            InputKind::Images => "image_analysis",
            InputKind::Markdown => "markdown_analysis",
        }
    }

    fn default_prompt(self) -> &'static str {
        match self {
            InputKind::Images => DEFAULT_IMAGE_PROMPT,
            InputKind::Markdown => DEFAULT_MARKDOWN_PROMPT,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (kind, args) = match cli.command {
        Command::Images(args) => (InputKind::Images, args),
        Command::Markdown(args) => (InputKind::Markdown, args),
    };

    let mut config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config);
    apply_overrides(&mut config, &args.overrides());

    info!(
        "Starting cityrules-analyzer {} ({} {}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("CITYRULES_GIT_HASH"),
        env!("CITYRULES_BUILD_PROFILE"),
        env!("CITYRULES_BUILD_TIMESTAMP"),
    );

    let cancelled = run(kind, &args, config).await?;
    if cancelled {
        std::process::exit(EXIT_CANCELLED);
    }
    Ok(())
}

/// Logs go to stderr so stdout carries only progress and the summary
fn init_tracing(config: &TomlConfig) {
    let fallback = format!("cityrules_analyzer={0},cityrules_common={0}", config.logging.level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Returns whether the run was cancelled
async fn run(kind: InputKind, args: &RunArgs, config: TomlConfig) -> Result<bool> {
    let pipeline = PipelineConfig::from_settings(&config.pipeline);
    pipeline.validate().context("Invalid pipeline settings")?;

    let prompt = load_prompt(args.prompt_file.as_deref(), kind)?;
    let source = match kind {
        InputKind::Images => TaskSource::scan_images(&args.input, &prompt),
        InputKind::Markdown => TaskSource::scan_markdown(&args.input, &prompt),
    }
    .with_context(|| format!("Failed to scan {}", args.input.display()))?;

    if source.is_empty() {
        warn!(input = %args.input.display(), "No input files found, nothing to do");
        return Ok(false);
    }

    let api_key = resolve_api_key(&config).context("API key required")?;
    let client = OpenRouterClient::new(client_config(&config, api_key))
        .context("Failed to build HTTP client")?;

    let run_id = Uuid::new_v4();
    let sink = open_sink(&config, kind, run_id).await?;
    let location = sink.location();

    info!(
        tasks = source.len(),
        concurrency = pipeline.concurrency,
        model = %config.service.model,
        output = %location,
        "Pipeline configured"
    );

    let events = EventBus::default();
    let printer = tokio::spawn(print_progress(events.subscribe()));

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(Arc::new(client), sink, pipeline)
        .with_event_bus(events)
        .with_cancellation(cancel.clone())
        .with_run_id(run_id);

    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, finishing in-flight requests");
            cancel.cancel();
        }
    });

    let report = scheduler.run(source).await.context("Pipeline run failed")?;
    ctrl_c.abort();
    // The printer ends on RunFinished
    let _ = printer.await;

    println!("{}", render_summary(&report.summary));
    println!("Results: {}", location);

    Ok(report.summary.cancelled)
}

fn load_prompt(path: Option<&Path>, kind: InputKind) -> Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file {}", path.display())),
        None => Ok(kind.default_prompt().to_string()),
    }
}

async fn open_sink(config: &TomlConfig, kind: InputKind, run_id: Uuid) -> Result<Arc<dyn ResultSink>> {
    let root = &config.output.root;
    let sink: Arc<dyn ResultSink> = match config.output.sink {
        SinkKind::Json => Arc::new(
            JsonFileSink::create(root, kind.run_prefix())
                .with_context(|| format!("Failed to create run directory in {}", root.display()))?,
        ),
        SinkKind::Sqlite => Arc::new(
            SqliteSink::open(root, run_id)
                .await
                .with_context(|| format!("Failed to open result database in {}", root.display()))?,
        ),
    };
    Ok(sink)
}

/// One stdout line per completed task
async fn print_progress(mut rx: broadcast::Receiver<PipelineEvent>) {
    loop {
        match rx.recv().await {
            Ok(PipelineEvent::TaskCompleted {
                task_id,
                success,
                snapshot,
                ..
            }) => {
                println!(
                    "{} {} | Progress: {}/{} ({:.1}%) | Rate: {:.2}/s | ETA: {}",
                    if success { "✅" } else { "❌" },
                    task_id,
                    snapshot.completed,
                    snapshot.total,
                    snapshot.percent(),
                    snapshot.rate_per_sec,
                    format_eta(snapshot.eta_secs),
                );
            }
            Ok(PipelineEvent::RetryPassStarted { tasks, .. }) => {
                println!("Retrying {} failed task(s)", tasks);
            }
            Ok(PipelineEvent::RunFinished { .. }) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress output fell behind");
            }
        }
    }
}
