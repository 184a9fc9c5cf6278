use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use codegraph_cache::{CacheManager, FingerprintComputer};
use codegraph_orchestration::{
    Credentials, GitSync, JobOrchestrator, JobStatus, SyncOptions, SyncRequest,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod logging;
mod settings;

use settings::Settings;

/// Extra time `sync` waits beyond the job's own timeout
const WAIT_GRACE: Duration = Duration::from_secs(30);

/// Fingerprint-validated analysis cache and repository sync jobs
#[derive(Parser)]
#[command(name = "codegraph", author, version, about, long_about = None)]
struct Cli {
    /// Settings file (YAML, `version: 1`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or clear the analysis cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Print the fingerprint of a project
    Fingerprint {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        language: Option<String>,
    },
    /// Clone or update a remote repository and print the finished job
    Sync {
        /// `https://host/owner/repo`, `git@host:owner/repo` or `owner/repo`
        #[arg(long)]
        repo: String,
        #[arg(long)]
        username: String,
        #[arg(long, env = "CODEGRAPH_GIT_TOKEN", hide_env_values = true)]
        token: String,
        #[arg(long, default_value = SyncRequest::DEFAULT_BRANCH)]
        branch: String,
        /// Delete any existing checkout first
        #[arg(long)]
        force_clean: bool,
        /// Reuse a checkout younger than the update interval
        #[arg(long)]
        no_sync: bool,
    },
    /// Manage local checkouts
    Repos {
        #[command(subcommand)]
        command: ReposCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Entry count, total size and per-entry details
    Stats,
    /// Drop one project's entry, or everything
    Clear {
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(long, requires = "project")]
        language: Option<String>,
    },
    /// Would the next lookup for this project be a hit?
    Status {
        #[arg(long)]
        project: PathBuf,
        #[arg(long)]
        language: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReposCommand {
    /// Checkouts of one user with branch, last commit and status
    List {
        #[arg(long)]
        username: String,
    },
    /// Keep the most recently updated checkouts and delete the rest
    Cleanup {
        #[arg(long)]
        username: String,
        #[arg(long, default_value_t = 10)]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json)?;

    let settings = Settings::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load settings from {}", path.display()),
        None => "Failed to load default settings".to_string(),
    })?;

    match cli.command {
        Commands::Cache { command } => run_cache(command, &settings),
        Commands::Fingerprint { project, language } => {
            let config = settings.analysis_for(language.as_deref())?;
            let fingerprint = FingerprintComputer::new().compute(&project, &config)?;
            let files: serde_json::Map<String, serde_json::Value> = fingerprint
                .files
                .iter()
                .map(|(path, hash)| (path.clone(), json!(hash.to_hex())))
                .collect();
            print_json(&json!({
                "project": project,
                "configuration": fingerprint.config.to_string(),
                "file_count": fingerprint.file_count(),
                "combined": fingerprint.combined.to_hex(),
                "files": files,
            }))
        }
        Commands::Sync {
            repo,
            username,
            token,
            branch,
            force_clean,
            no_sync,
        } => {
            let request = SyncRequest::new(&repo, Credentials::new(username, token))?
                .with_branch(branch)
                .with_options(SyncOptions {
                    force_clean,
                    sync_enabled: !no_sync,
                });
            run_sync(request, &settings).await
        }
        Commands::Repos { command } => run_repos(command, &settings).await,
    }
}

fn run_cache(command: CacheCommand, settings: &Settings) -> Result<()> {
    let manager = CacheManager::from_config(&settings.cache)?;

    match command {
        CacheCommand::Stats => print_json(&manager.stats()),
        CacheCommand::Clear {
            project: Some(project),
            language,
        } => {
            let config = settings.analysis_for(language.as_deref())?;
            let removed = manager.invalidate(&project, &config)?;
            print_json(&json!({ "project": project, "removed": removed }))
        }
        CacheCommand::Clear { project: None, .. } => {
            let removed = manager.invalidate_all()?;
            print_json(&json!({ "removed": removed }))
        }
        CacheCommand::Status { project, language } => {
            let config = settings.analysis_for(language.as_deref())?;
            let key = manager.key_for(&project, &config)?;
            let cached = manager.store().contains(&key);
            let stale = manager.is_stale(&project, &config)?;
            print_json(&json!({
                "project": project,
                "language": config.language,
                "key": key,
                "cached": cached,
                "stale": stale,
            }))
        }
    }
}

async fn run_sync(request: SyncRequest, settings: &Settings) -> Result<()> {
    let git = GitSync::new(settings.orchestrator.clone());
    let version = git.check_available().await?;
    info!("Using {}", version);

    let orchestrator = JobOrchestrator::new(settings.orchestrator.clone(), Arc::new(git))?;
    let subject = request.subject();
    let id = orchestrator.submit(subject, request)?;
    let job = orchestrator
        .wait(id, settings.orchestrator.sync_timeout() + WAIT_GRACE)
        .await?;
    orchestrator.close().await;

    print_json(&job)?;
    match job.status {
        JobStatus::Completed => Ok(()),
        status => bail!("Sync job {} finished as {}", id, status),
    }
}

async fn run_repos(command: ReposCommand, settings: &Settings) -> Result<()> {
    let git = GitSync::new(settings.orchestrator.clone());

    match command {
        ReposCommand::List { username } => {
            print_json(&git.list_repositories(&username).await?)
        }
        ReposCommand::Cleanup { username, keep } => {
            let removed = git.cleanup_repositories(&username, keep).await?;
            print_json(&json!({ "username": username, "removed": removed }))
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
