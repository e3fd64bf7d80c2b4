//! CLI binary for paperflow.
//!
//! A thin shim over the library crate: `process` maps flags to a
//! `PipelineConfig` and runs one document through the pipeline, `quote`
//! prices a membership upgrade.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use paperflow::{
    resolve_document, upgrade_price, Document, FailureReason, FileKind, FlowKind, JobMetadata,
    MembershipState, Money, PeriodType, PipelineConfig, PipelineOrchestrator, Plan,
    SessionContext, Stage, StageEvent, StageObserver, TaskResult,
};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI stage observer using indicatif ───────────────────────────────────────

/// Spinner that prints one line per stage the task enters.
struct CliObserver {
    bar: ProgressBar,
    started: Instant,
}

impl CliObserver {
    fn new(document: &str) -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Starting");
        bar.set_message(document.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            started: Instant::now(),
        })
    }

    fn elapsed(&self) -> String {
        dim(&format!("{:.1}s", self.started.elapsed().as_secs_f64()))
    }
}

impl StageObserver for CliObserver {
    fn on_stage_change(&self, event: &StageEvent) {
        let detail = match (event.stage, event.word_count) {
            (Stage::Detecting, Some(words)) => format!("{words} words"),
            _ => String::new(),
        };
        self.bar.println(format!(
            "  {} {:<10} {}  {}",
            green("✓"),
            event.stage,
            dim(&detail),
            self.elapsed()
        ));
        self.bar.set_prefix(event.stage.to_string());
    }

    fn on_completed(&self, event: &StageEvent) {
        self.bar.finish_and_clear();
        eprintln!("{} {}  {}", green("✔"), bold("Completed"), self.elapsed());
        if let Some(artifact) = event.artifact() {
            if let Some(url) = &artifact.report_url {
                eprintln!("   report: {url}");
            }
            if let Some(url) = &artifact.output_url {
                eprintln!("   output: {url}");
            }
        }
    }

    fn on_failed(&self, _event: &StageEvent, reason: &FailureReason) {
        self.bar.finish_and_clear();
        eprintln!("{} {}  {}", red("✘"), red(&reason.to_string()), self.elapsed());
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Detect AI content in a PDF
  paperflow process thesis.pdf --user-id u1 --token "$PAPERFLOW_TOKEN"

  # Detect, then rewrite
  paperflow process essay.docx --reduce --title "Essay" --author "A. Writer"

  # Raw text, JSON result
  paperflow process --text "Some paragraph to check" --json

  # Price an upgrade from monthly level 1 to monthly level 2
  paperflow quote --current-period monthly --current-price 30 --current-level 1 \
      --started-at 2024-06-05T12:00:00Z --target-period monthly --target-price 60 \
      --target-level 2 --now 2024-06-15T12:00:00Z

ENVIRONMENT VARIABLES:
  PAPERFLOW_BASE_URL      Remote service base URL
  PAPERFLOW_USER          User id sent with job submissions
  PAPERFLOW_TOKEN         Bearer token for the remote service
  RUST_LOG                Override the log filter
"#;

/// Drive documents through remote upload, parse, detection and rewrite jobs.
#[derive(Parser, Debug)]
#[command(
    name = "paperflow",
    version,
    about = "Drive documents through remote upload, parse, detection and rewrite jobs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PAPERFLOW_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and the result.
    #[arg(short, long, global = true, env = "PAPERFLOW_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a document and wait for its detection (or rewrite) result.
    Process(ProcessArgs),
    /// Price a membership upgrade.
    Quote(QuoteArgs),
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Local file path, HTTP/HTTPS URL, or (with --text) the text itself.
    input: String,

    /// Treat INPUT as raw text instead of a path or URL.
    #[arg(long)]
    text: bool,

    /// Override the file type inferred from the extension.
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// Also rewrite the document after detection.
    #[arg(long)]
    reduce: bool,

    /// Title forwarded with the job submission.
    #[arg(long)]
    title: Option<String>,

    /// Author forwarded with the job submission.
    #[arg(long)]
    author: Option<String>,

    /// Print the final task as JSON.
    #[arg(long)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long, env = "PAPERFLOW_NO_PROGRESS")]
    no_progress: bool,

    /// Remote service base URL.
    #[arg(long, env = "PAPERFLOW_BASE_URL", default_value = "http://localhost:8080")]
    base_url: String,

    /// User id sent with job submissions.
    #[arg(long, env = "PAPERFLOW_USER", default_value = "anonymous")]
    user_id: String,

    /// Bearer token for the remote service.
    #[arg(long, env = "PAPERFLOW_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Delay between status queries, in milliseconds.
    #[arg(long, env = "PAPERFLOW_POLL_INTERVAL_MS", default_value_t = 3_000)]
    poll_interval_ms: u64,

    /// Give up on a job after this many seconds.
    #[arg(long, env = "PAPERFLOW_POLL_TIMEOUT", default_value_t = 600)]
    poll_timeout: u64,

    /// HTTP download timeout in seconds (URL inputs).
    #[arg(long, env = "PAPERFLOW_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Pdf,
    Docx,
    Doc,
    Txt,
}

impl From<KindArg> for FileKind {
    fn from(v: KindArg) -> Self {
        match v {
            KindArg::Pdf => FileKind::Pdf,
            KindArg::Docx => FileKind::Docx,
            KindArg::Doc => FileKind::Doc,
            KindArg::Txt => FileKind::Txt,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PeriodArg {
    Monthly,
    Yearly,
}

impl From<PeriodArg> for PeriodType {
    fn from(v: PeriodArg) -> Self {
        match v {
            PeriodArg::Monthly => PeriodType::Monthly,
            PeriodArg::Yearly => PeriodType::Yearly,
        }
    }
}

#[derive(Args, Debug)]
struct QuoteArgs {
    /// Current billing period; omit for a new subscription.
    #[arg(long, value_enum, requires_all = ["current_price", "current_level", "started_at"])]
    current_period: Option<PeriodArg>,

    /// Current plan price, e.g. 30 or 29.99.
    #[arg(long)]
    current_price: Option<Money>,

    #[arg(long)]
    current_level: Option<u32>,

    /// When the current period started (RFC 3339).
    #[arg(long)]
    started_at: Option<DateTime<Utc>>,

    #[arg(long, value_enum)]
    target_period: PeriodArg,

    #[arg(long)]
    target_price: Money,

    #[arg(long)]
    target_level: u32,

    /// Pricing time (RFC 3339); defaults to now.
    #[arg(long)]
    now: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner gives the feedback that matters; library INFO logs would
    // only interleave with it.
    let show_progress = match &cli.command {
        Command::Process(args) => !cli.quiet && !args.no_progress && !args.json,
        Command::Quote(_) => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Process(args) => process(args, show_progress, cli.quiet).await,
        Command::Quote(args) => quote(args),
    }
}

async fn process(args: ProcessArgs, show_progress: bool, quiet: bool) -> Result<()> {
    let document = if args.text {
        Document::from_text(args.input.clone())
    } else {
        resolve_document(
            &args.input,
            args.kind.map(FileKind::from),
            args.download_timeout,
        )
        .await
        .context("Failed to read input")?
    };

    let mut builder = PipelineConfig::builder()
        .base_url(args.base_url.clone())
        .poll_interval_ms(args.poll_interval_ms)
        .poll_timeout_secs(args.poll_timeout)
        .download_timeout_secs(args.download_timeout);
    if show_progress {
        builder = builder.observer(CliObserver::new(&document.name));
    }
    let config = builder.build().context("Invalid configuration")?;

    let session = SessionContext::with_static_token(args.user_id.clone(), args.token.clone());
    let orchestrator =
        PipelineOrchestrator::connect(config, session).context("Failed to set up HTTP client")?;

    let flow = if args.reduce {
        FlowKind::DetectAndReduce
    } else {
        FlowKind::DetectOnly
    };
    let metadata = JobMetadata {
        title: args.title.clone(),
        author: args.author.clone(),
        ..Default::default()
    };

    let task = orchestrator
        .run_to_completion(document, flow, metadata)
        .await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&task).context("Failed to serialise task")?
        );
    }

    match task.result {
        Some(TaskResult::Success(artifact)) => {
            if !args.json && !quiet && !show_progress {
                eprintln!("Completed ({} words)", artifact.word_count);
            }
            if !args.json {
                if let Some(score) = artifact.score {
                    println!("score: {score:.1}");
                }
                if let Some(url) = artifact.report_url {
                    println!("report: {url}");
                }
                if let Some(url) = artifact.output_url {
                    println!("output: {url}");
                }
            }
            Ok(())
        }
        Some(TaskResult::Failure { reason }) => anyhow::bail!("Task failed: {reason}"),
        None => anyhow::bail!("Task ended in {} without a result", task.stage),
    }
}

fn quote(args: QuoteArgs) -> Result<()> {
    let current = match (
        args.current_period,
        args.current_price,
        args.current_level,
        args.started_at,
    ) {
        (Some(period), Some(price), Some(level), Some(started_at)) => Some(MembershipState {
            plan_id: "current".into(),
            period_type: period.into(),
            price,
            level,
            started_at,
        }),
        (None, ..) => None,
        _ => anyhow::bail!(
            "--current-period needs --current-price, --current-level and --started-at"
        ),
    };
    let target = Plan {
        id: "target".into(),
        name: "target".into(),
        period: args.target_period.into(),
        price: args.target_price,
        level: args.target_level,
    };
    let now = args.now.unwrap_or_else(Utc::now);

    let price = upgrade_price(current.as_ref(), &target, now).context("Upgrade not allowed")?;
    println!("{price}");
    Ok(())
}
