mod adapters;
mod config;
mod github;
mod review;
mod server;

use adapters::llm::{create_backend, ModelBackend};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use review::{FileReviewer, Orchestrator, PromptRegistry, RunOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pullscope")]
#[command(about = "Webhook-driven code review for GitHub pull requests", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    model: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook service
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,
    },
    /// Review the pull request in one event payload, then exit
    Event {
        #[arg(long, help = "Payload file (defaults to $GITHUB_EVENT_PATH)")]
        path: Option<PathBuf>,

        #[arg(long, help = "Event name, e.g. pull_request (defaults to $GITHUB_EVENT_NAME)")]
        kind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration from file and merge with CLI options
    let mut config = config::Config::load()?;
    let (cli_host, cli_port) = match &cli.command {
        Commands::Serve { host, port } => (host.clone(), *port),
        _ => (None, None),
    };
    config.merge_with_cli(cli.model.clone(), cli_host, cli_port);

    match cli.command {
        Commands::Serve { .. } => serve_command(config).await,
        Commands::Event { path, kind } => event_command(config, path, kind).await,
    }
}

async fn serve_command(config: config::Config) -> Result<()> {
    let (orchestrator, prompts) = build_pipeline(&config)?;

    let state = Arc::new(server::AppState {
        orchestrator,
        prompts,
        webhook_secret: config.webhook_secret.clone(),
        started_at: Instant::now(),
    });

    server::serve(state, &config.host, config.port).await
}

/// One-shot mode for GitHub Actions: read the event payload the runner
/// wrote, run the pipeline once, print the published summary.
async fn event_command(
    config: config::Config,
    path: Option<PathBuf>,
    kind: Option<String>,
) -> Result<()> {
    let path = path
        .or_else(|| std::env::var("GITHUB_EVENT_PATH").ok().map(PathBuf::from))
        .context("no event payload: pass --path or set GITHUB_EVENT_PATH")?;
    let kind = kind
        .or_else(|| std::env::var("GITHUB_EVENT_NAME").ok())
        .context("no event name: pass --kind or set GITHUB_EVENT_NAME")?;

    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading event payload {}", path.display()))?;
    let payload: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;

    let (orchestrator, _prompts) = build_pipeline(&config)?;

    match server::normalize_event(&kind, &payload)? {
        server::Dispatch::Run(event) => {
            info!(
                kind = %event.event_kind,
                pull_number = event.pull_number,
                "processing event payload"
            );
            if let RunOutcome::Completed(verdict) = orchestrator.run(event).await? {
                println!("{}", verdict.summary_text);
            }
        }
        server::Dispatch::Ignored(reason) => {
            info!(event = %kind, reason, "event does not trigger a review");
        }
        server::Dispatch::Unsupported => {
            anyhow::bail!("unsupported event type: {}", kind);
        }
    }

    Ok(())
}

/// Wires the GitHub client, model backend and reviewer into an orchestrator.
fn build_pipeline(config: &config::Config) -> Result<(Arc<Orchestrator>, Arc<PromptRegistry>)> {
    let token = config
        .github_token
        .clone()
        .context("no GitHub token: set GITHUB_TOKEN or github_token in .pullscope.yml")?;

    let github = Arc::new(github::GitHubClient::new(
        token,
        Some(config.github_api_url.clone()),
        &config.exclude,
    )?);

    let backend: Arc<dyn ModelBackend> = Arc::from(create_backend(&config.backend_config())?);
    info!(backend = backend.name(), "model backend ready");

    let prompts = Arc::new(PromptRegistry::with_defaults());
    let reviewer = Arc::new(FileReviewer::new(
        backend,
        prompts.clone(),
        config.retry_policy(),
        config.max_input_chars,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        github.clone(),
        github,
        reviewer,
        config.orchestrator_config(),
    ));

    Ok((orchestrator, prompts))
}
