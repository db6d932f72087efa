//! issuesmith entry point: polls labeled GitHub issues and turns them into
//! pull requests via an LLM-driven agent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use smith_ai::{OpenAiClient, OpenAiConfig};
use smith_github::{AgentIdentity, GithubClient, RepoRef};
use smith_runtime::{EngineConfig, IssuePoller, PollerConfig, TaskExecutionEngine};

#[derive(Parser, Debug)]
#[command(
    name = "issuesmith",
    version,
    about = "Polls labeled GitHub issues and opens pull requests for them"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one poll cycle and exit.
    Run(RunArgs),
    /// Poll on a fixed interval until interrupted.
    Daemon(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Source repository to poll for labeled issues, as owner/repo.
    #[arg(long, env = "SMITH_REPO")]
    repo: String,

    /// Repository receiving branches and pull requests; defaults to the
    /// source repository.
    #[arg(long, env = "SMITH_TARGET_REPO")]
    target_repo: Option<String>,

    /// Label that marks an issue as eligible for processing.
    #[arg(long, env = "SMITH_LABEL", default_value = "ai-agent")]
    label: String,

    /// Base branch that issue branches fork from and PRs merge into.
    #[arg(long, env = "SMITH_BASE_BRANCH", default_value = "main")]
    base_branch: String,

    /// Daemon loop period in seconds.
    #[arg(long, env = "SMITH_POLL_INTERVAL_SECONDS", default_value_t = 300)]
    poll_interval_seconds: u64,

    /// Model identifier backing the task execution engine.
    #[arg(long, env = "SMITH_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// Round budget: maximum reasoning rounds per issue execution.
    #[arg(long, env = "SMITH_MAX_TURNS", default_value_t = 20)]
    max_turns: usize,

    /// Step budget: maximum model calls plus tool executions per execution.
    #[arg(long, env = "SMITH_MAX_STEPS", default_value_t = 50)]
    max_steps: usize,

    /// Exact login of the agent's account, for self-comment classification.
    #[arg(long, env = "SMITH_BOT_LOGIN")]
    bot_login: Option<String>,

    #[arg(
        long,
        env = "SMITH_GITHUB_API_BASE",
        default_value = "https://api.github.com"
    )]
    github_api_base: String,

    #[arg(long, default_value_t = 30_000)]
    request_timeout_ms: u64,

    #[arg(long, default_value_t = 3)]
    retry_max_attempts: usize,

    #[arg(long, default_value_t = 500)]
    retry_base_delay_ms: u64,

    /// Log filter, e.g. `info` or `smith_runtime=debug`.
    #[arg(long, env = "SMITH_LOG", default_value = "info")]
    log_level: String,
}

/// Credential preference order: the dedicated agent token first, then the
/// generic token. Startup fails with a diagnostic naming both variables.
fn resolve_github_token(
    smith_token: Option<String>,
    github_token: Option<String>,
) -> Result<String> {
    for candidate in [smith_token, github_token].into_iter().flatten() {
        let trimmed = candidate.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(trimmed);
        }
    }
    bail!("no GitHub credential found: set SMITH_GITHUB_TOKEN or GITHUB_TOKEN")
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_poller(args: &RunArgs) -> Result<IssuePoller> {
    let token = resolve_github_token(
        std::env::var("SMITH_GITHUB_TOKEN").ok(),
        std::env::var("GITHUB_TOKEN").ok(),
    )?;
    let openai_key = std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty())
        .context("no reasoning-engine credential found: set OPENAI_API_KEY")?;
    let openai_base = std::env::var("SMITH_OPENAI_API_BASE")
        .ok()
        .filter(|base| !base.trim().is_empty())
        .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

    let target = args.target_repo.as_deref().unwrap_or(&args.repo);
    let repo = RepoRef::parse(target)?;
    tracing::info!(
        repo = %repo.as_slug(),
        label = %args.label,
        base_branch = %args.base_branch,
        model = %args.model,
        "starting issuesmith"
    );

    let gateway = GithubClient::new(
        args.github_api_base.clone(),
        token,
        repo,
        args.request_timeout_ms,
        args.retry_max_attempts,
        args.retry_base_delay_ms,
    )?;
    let llm = OpenAiClient::new(OpenAiConfig {
        api_base: openai_base,
        api_key: openai_key,
        request_timeout_ms: args.request_timeout_ms,
        max_retries: args.retry_max_attempts,
    })
    .context("failed to create reasoning-engine client")?;
    let engine = TaskExecutionEngine::new(
        Arc::new(llm),
        EngineConfig {
            model: args.model.clone(),
            max_turns: args.max_turns,
            max_steps: args.max_steps,
            ..EngineConfig::default()
        },
    );
    let identity = AgentIdentity::new(args.bot_login.clone(), Vec::new());
    let config = PollerConfig {
        label: args.label.clone(),
        base_branch: args.base_branch.clone(),
        poll_interval: Duration::from_secs(args.poll_interval_seconds.max(1)),
    };
    Ok(IssuePoller::new(gateway, engine, identity, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            init_tracing(&args.log_level);
            let mut poller = build_poller(&args)?;
            let report = poller.run_once().await?;
            tracing::info!(
                discovered = report.discovered,
                processed = report.processed,
                skipped = report.skipped,
                failed = report.failed,
                follow_ups = report.follow_ups,
                "run complete"
            );
            Ok(())
        }
        Command::Daemon(args) => {
            init_tracing(&args.log_level);
            let mut poller = build_poller(&args)?;
            poller.run_daemon().await
        }
    }
}
