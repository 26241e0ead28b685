// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sandforge main entry point - CLI and job runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tokio::sync::watch;

use sandforge::config::{self, CliOptions, ResolvedConfig, SandboxBackend};
use sandforge::progress::{EventKind, EventPhase, ProgressEvent, ProgressHub, ProgressSubscription};
use sandforge::providers::{create_provider_from_config, ScriptedProvider, ScriptedTurn};
use sandforge::sandbox::create_sandbox_provider;
use sandforge::store::{JobRecord, JobStatus, Store};
use sandforge::telemetry::{init_telemetry, TelemetryConfig, GLOBAL_METRICS};
use sandforge::tools::{CREATE_OR_UPDATE_FILES, TERMINAL};
use sandforge::types::SharedProvider;
use sandforge::workflow::{FileOperation, JobService, TerminalResult, WorkflowController, WorkflowSettings};

/// Sandforge version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sandforge - build apps from a prompt inside a sandbox.
#[derive(Parser)]
#[command(name = "sandforge")]
#[command(author, version, about = "Build apps from a prompt inside a sandbox", long_about = None)]
struct Cli {
    /// Completion service to use
    #[arg(short, long, env = "SANDFORGE_PROVIDER")]
    provider: Option<String>,

    /// Model to use
    #[arg(short, long, env = "SANDFORGE_MODEL")]
    model: Option<String>,

    /// Base URL for the completion API
    #[arg(long, env = "SANDFORGE_BASE_URL")]
    base_url: Option<String>,

    /// SQLite database path
    #[arg(long, env = "SANDFORGE_DATABASE")]
    database: Option<PathBuf>,

    /// Run sandboxes as local directories
    #[arg(long)]
    local: bool,

    /// Model turns per run
    #[arg(long)]
    max_turns: Option<usize>,

    /// Replay a canned model script instead of calling a provider
    #[arg(long)]
    dry_run: bool,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value = "text")]
    output_format: OutputFormat,

    /// Shorthand for `--output-format json`
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print a metrics report on exit
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for job results and progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a prompt and run it to completion
    Run {
        /// What to build
        prompt: String,

        /// Project the job belongs to
        #[arg(long, default_value = "default")]
        project: String,

        /// Owner recorded on the job
        #[arg(long, env = "USER", default_value = "local")]
        owner: String,
    },

    /// Show a job's status and result
    Status {
        job_id: String,
    },

    /// Re-run a job that failed or was interrupted
    Retry {
        job_id: String,
    },

    /// List recent jobs
    Jobs {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Apply file operations (JSON array) to a completed job
    Apply {
        job_id: String,
        /// File containing the operations
        operations: PathBuf,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    if cli.json {
        cli.output_format = OutputFormat::Json;
    }

    // Logs go to stderr; keep them quiet unless asked
    let telemetry = TelemetryConfig::from_verbosity(cli.verbose).with_ansi(cli.output_format == OutputFormat::Text);
    let _telemetry = init_telemetry(&telemetry).context("failed to initialize logging")?;

    let workspace_root = std::env::current_dir()?;
    let options = CliOptions {
        provider: cli.provider.clone(),
        model: cli.model.clone(),
        base_url: cli.base_url.clone(),
        database: cli.database.as_ref().map(|p| p.to_string_lossy().into_owned()),
        sandbox_backend: cli.local.then_some(SandboxBackend::Local),
        max_turns: cli.max_turns,
    };

    let result = handle_command(&cli, &workspace_root, options).await;

    if cli.metrics {
        eprintln!("{}", GLOBAL_METRICS.snapshot().format_report());
    }
    result
}

async fn handle_command(cli: &Cli, workspace_root: &Path, options: CliOptions) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                let config = config::load_config(workspace_root, options)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
        Commands::Init => {
            let path = config::init_config(workspace_root, None)?;
            println!("Created config file: {}", path.display());
        }
        Commands::Version => {
            println!("sandforge {}", VERSION);
        }
        Commands::Status { job_id } => {
            let config = config::load_config(workspace_root, options)?;
            let store = open_store(&config)?;
            print_record(&store.record(job_id)?, cli.output_format)?;
        }
        Commands::Jobs { limit } => {
            let config = config::load_config(workspace_root, options)?;
            let store = open_store(&config)?;
            let jobs = store.list_jobs(*limit)?;
            match cli.output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Text => {
                    if jobs.is_empty() {
                        println!("{}", "No jobs yet".dimmed());
                    }
                    for job in jobs {
                        println!(
                            "{}  {}  {}",
                            job.id.bright_white(),
                            status_label(job.status),
                            job.project_id.dimmed()
                        );
                    }
                }
            }
        }
        Commands::Run { prompt, project, owner } => {
            let service = build_service(cli, workspace_root, options)?;
            let job_id = service.submit(owner, project, prompt).await?;
            if cli.output_format == OutputFormat::Text {
                println!("{} Job {}", "→".cyan(), job_id.bright_white());
            }
            run_job(&service, &job_id, cli.output_format).await?;
        }
        Commands::Retry { job_id } => {
            let service = build_service(cli, workspace_root, options)?;
            run_job(&service, job_id, cli.output_format).await?;
        }
        Commands::Apply { job_id, operations } => {
            let raw = std::fs::read_to_string(operations)
                .with_context(|| format!("failed to read {}", operations.display()))?;
            let operations: Vec<FileOperation> = serde_json::from_str(&raw)?;
            let service = build_service(cli, workspace_root, options)?;

            let mut events = service.controller().hub().subscribe(job_id);
            let result = service
                .controller()
                .apply_file_operations(job_id, &operations)
                .await;
            drain(&mut events, cli.output_format);
            print_result(&result?, cli.output_format)?;
        }
    }
    Ok(())
}

fn build_service(cli: &Cli, workspace_root: &Path, options: CliOptions) -> anyhow::Result<JobService> {
    let config = config::load_config(workspace_root, options)?;
    let provider: SharedProvider = if cli.dry_run {
        Arc::new(dry_run_script())
    } else {
        create_provider_from_config(&config).context("failed to create provider")?
    };
    let sandboxes = create_sandbox_provider(&config.sandbox).context("failed to create sandbox provider")?;
    let store = open_store(&config)?;

    let controller = WorkflowController::new(
        store,
        provider,
        sandboxes,
        ProgressHub::new(),
        WorkflowSettings::from_config(&config),
    );
    Ok(JobService::new(Arc::new(controller)))
}

fn open_store(config: &ResolvedConfig) -> anyhow::Result<Store> {
    Store::open(&config.database).with_context(|| format!("failed to open database {}", config.database))
}

/// A short fixed session: write a page, list it, finish, then narrate.
fn dry_run_script() -> ScriptedProvider {
    ScriptedProvider::new([
        ScriptedTurn::tool_call(
            "call-1",
            CREATE_OR_UPDATE_FILES,
            serde_json::json!({
                "files": [{
                    "path": "app/page.tsx",
                    "content": "export default function Page() {\n  return <main>Hello from sandforge</main>;\n}\n"
                }]
            }),
        ),
        ScriptedTurn::tool_call("call-2", TERMINAL, serde_json::json!({"command": "ls -R app"})),
        ScriptedTurn::text("<task_summary>Created a landing page at app/page.tsx.</task_summary>"),
        ScriptedTurn::text("Landing Page"),
        ScriptedTurn::text("I built a simple landing page for you."),
    ])
}

/// Fire the generate trigger and render progress until it settles.
/// Ctrl-C cancels the run; the job stays resumable.
async fn run_job(service: &JobService, job_id: &str, format: OutputFormat) -> anyhow::Result<()> {
    let mut events = service.controller().hub().subscribe(job_id);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let run = service.generate(job_id, Some(cancel_rx));
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Some(event) = events.recv() => render_event(&event, format),
            _ = tokio::signal::ctrl_c() => {
                if format == OutputFormat::Text {
                    eprintln!("{}", "Cancelling...".yellow());
                }
                let _ = cancel_tx.send(true);
            }
        }
    };
    drain(&mut events, format);

    let result = result?;
    match format {
        OutputFormat::Json => print_record(&service.record(job_id)?, format),
        OutputFormat::Text => {
            print_result(&result, format)?;
            if matches!(result, TerminalResult::Completed { .. } | TerminalResult::Failed { .. }) {
                print_record(&service.record(job_id)?, format)?;
            }
            Ok(())
        }
    }
}

fn drain(events: &mut ProgressSubscription, format: OutputFormat) {
    while let Some(event) = events.try_recv() {
        render_event(&event, format);
    }
}

fn render_event(event: &ProgressEvent, format: OutputFormat) {
    if format == OutputFormat::Json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }

    // Thinking events stream too often to be useful in a terminal
    if event.kind == EventKind::Thinking && event.phase == EventPhase::InProgress {
        return;
    }

    let marker = match event.phase {
        EventPhase::Started => "▸".cyan(),
        EventPhase::InProgress => "…".dimmed(),
        EventPhase::Completed => "✓".green(),
        EventPhase::Failed => "✗".red(),
    };
    let mut line = format!("{} {}", marker, event.title);
    if let Some(description) = &event.description {
        line.push_str(&format!(" {}", description.dimmed()));
    }
    if let Some(seconds) = event.duration_seconds {
        line.push_str(&format!(" {}", format!("({:.1}s)", seconds).dimmed()));
    }
    println!("{}", line);
}

fn print_result(result: &TerminalResult, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
        OutputFormat::Text => match result {
            TerminalResult::Completed { sandbox_url, .. } => {
                println!("{}", "Job completed".green().bold());
                if let Some(url) = sandbox_url {
                    println!("Preview: {}", url.bright_blue());
                }
            }
            TerminalResult::Failed { message, .. } => println!("{} {}", "Job failed:".red().bold(), message),
            TerminalResult::Skipped { reason, .. } => {
                println!("{} {:?}", "Skipped:".yellow(), reason)
            }
            TerminalResult::Cancelled { job_id } => {
                println!("{} run `sandforge retry {}` to resume", "Cancelled;".yellow(), job_id)
            }
            TerminalResult::FilesUpdated { files, .. } => {
                println!("{} {} files", "Saved".green(), files)
            }
        },
    }
    Ok(())
}

fn print_record(record: &JobRecord, format: OutputFormat) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    println!("{} {}", record.job_id.bright_white(), status_label(record.status));
    if !record.final_message.is_empty() {
        println!("\n{}\n", record.final_message);
    }
    if let Some(fragment) = &record.fragment {
        println!("{} {}", "Fragment:".bright_cyan(), fragment.title);
        println!("{} {}", "Sandbox:".bright_cyan(), fragment.sandbox_url);
        for path in fragment.files.keys() {
            println!("  {}", path);
        }
    }
    if let Some(seconds) = record.generation_seconds {
        println!("{}", format!("Generated in {:.1}s", seconds).dimmed());
    }
    Ok(())
}

fn status_label(status: JobStatus) -> colored::ColoredString {
    match status {
        JobStatus::Pending => status.as_str().yellow(),
        JobStatus::Completed => status.as_str().green(),
        JobStatus::Error => status.as_str().red(),
    }
}
