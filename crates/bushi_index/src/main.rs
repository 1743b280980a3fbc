use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bushi_core::ExportOptions;
use bushi_core::git::init_mark_file;
use bushi_index::config::{self, Config, ConfigError, ResolvedConfig};
use bushi_index::db::{IndexDb, StoreError};
use bushi_index::ingest::{IngestError, IngestReport, Ingestor, Outcome, ingest_all};
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Exit status after Ctrl-C or SIGTERM.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "bushi", version, about = "Index git repositories into SQLite")]
struct Cli {
    /// Configuration file (default: ./bushi.toml)
    #[arg(short, long, global = true, env = "BUSHI_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest commits and references of every (or the named) repository
    Sync {
        /// Only this repository; repeatable
        #[arg(long = "repo", value_name = "NAME")]
        repos: Vec<String>,
        /// Clear mark files first and re-export the whole history
        #[arg(long)]
        full: bool,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-resolve and store the given references of one repository
    Refs {
        /// Repository name
        repo: String,
        /// Fully qualified reference names, e.g. refs/heads/main
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Validate the configuration and list the repositories
    Check {
        /// Print the resolved configuration as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("index error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("repository {0:?} is not configured")]
    UnknownRepository(String),
    #[error("failed to reset mark file: {0}")]
    MarkFile(#[source] std::io::Error),
    #[error("failed to encode report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let debug = env::var_os("BUSHI_DEBUG").is_some_and(|value| !value.is_empty());
    let default_filter = if debug {
        "bushi=debug,bushi_core=debug,bushi_index=debug"
    } else {
        "bushi=info,bushi_core=info,bushi_index=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode, AppError> {
    let path = config::config_path(cli.config.as_deref());
    info!("Loading configuration from {}", path.display());
    let config = Config::load(&path)?;

    match cli.command {
        Command::Sync { repos, full, json } => sync(config, repos, full, json).await,
        Command::Refs { repo, names } => refs(config, repo, names).await,
        Command::Check { json } => check(config, json),
    }
}

fn open_ingestor(resolved: &ResolvedConfig) -> Result<Arc<Ingestor<IndexDb>>, AppError> {
    info!("Database path: {}", resolved.sqlite.display());
    let db = IndexDb::open(&resolved.sqlite, resolved.write_timeout)?;
    let options = ExportOptions {
        channel_capacity: resolved.ingest.channel_capacity,
        idle_timeout: resolved.ingest.export_idle_timeout(),
    };
    Ok(Arc::new(Ingestor::new(Arc::new(db), options)))
}

async fn sync(
    config: Config,
    repos: Vec<String>,
    full: bool,
    json: bool,
) -> Result<ExitCode, AppError> {
    let resolved = config.resolve(full && repos.is_empty())?;

    let targets = if repos.is_empty() {
        resolved.repositories.clone()
    } else {
        let mut targets = Vec::with_capacity(repos.len());
        for name in &repos {
            let target = resolved
                .repository(name)
                .ok_or_else(|| AppError::UnknownRepository(name.clone()))?;
            if full {
                init_mark_file(&target.marks_file, true).map_err(AppError::MarkFile)?;
            }
            targets.push(target.clone());
        }
        targets
    };

    let ingestor = open_ingestor(&resolved)?;
    info!(
        repositories = targets.len(),
        jobs = resolved.ingest.jobs,
        "Starting bushi sync v{}",
        env!("CARGO_PKG_VERSION")
    );

    let report = tokio::select! {
        report = ingest_all(ingestor, targets, resolved.ingest.jobs, resolved.ingest.fail_fast) => report,
        _ = shutdown_signal() => {
            warn!("Interrupted; in-flight repositories are abandoned");
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    };

    print_report(&report, json)?;
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn refs(config: Config, repo: String, names: Vec<String>) -> Result<ExitCode, AppError> {
    let resolved = config.resolve(false)?;
    let target = resolved
        .repository(&repo)
        .cloned()
        .ok_or(AppError::UnknownRepository(repo))?;
    let ingestor = open_ingestor(&resolved)?;

    let report =
        tokio::task::spawn_blocking(move || ingestor.refresh_references(&target, names)).await??;
    println!(
        "{}: {} stored, {} skipped, {} failed",
        report.name, report.references_stored, report.references_skipped, report.references_failed
    );
    Ok(if report.references_failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check(config: Config, json: bool) -> Result<ExitCode, AppError> {
    let resolved = config.resolve(false)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("{} ({} repositories)", resolved.www.name, resolved.repositories.len());
    println!("  database:  {}", resolved.sqlite.display());
    println!("  mark dir:  {}", resolved.mark_dir.display());
    if resolved.sqlite.exists() {
        let db = IndexDb::open(&resolved.sqlite, resolved.write_timeout)?;
        for stored in db.list_repositories()? {
            let stats = db.repository_stats(stored.id)?;
            println!(
                "  indexed:   {} ({} commits, {} references, {} files)",
                stored.repository.name, stats.commits, stats.references, stats.files
            );
        }
    }
    for target in &resolved.repositories {
        println!(
            "  {:<20} {} (head {})",
            target.repository.name,
            target.repository.path.display(),
            target.repository.head
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &IngestReport, json: bool) -> Result<(), AppError> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for repo in &report.repositories {
        let status = match &repo.outcome {
            Outcome::Ok => "ok".to_string(),
            Outcome::Failed { message } => format!("failed: {message}"),
            Outcome::Skipped => "skipped".to_string(),
        };
        println!(
            "{:<20} {:>8} commits {:>6} refs ({} skipped, {} failed, {} pruned) {:>7}ms  {}",
            repo.name,
            repo.commits,
            repo.references_stored,
            repo.references_skipped,
            repo.references_failed,
            repo.references_pruned,
            repo.elapsed_ms,
            status
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_flag_reads_environment() {
        let cli = Cli::command();
        let arg = cli
            .get_arguments()
            .find(|arg| arg.get_id() == "config")
            .unwrap();
        assert_eq!(arg.get_env(), Some(std::ffi::OsStr::new(config::CONFIG_ENV)));
    }

    #[test]
    fn test_sync_flags() {
        let cli = Cli::try_parse_from([
            "bushi",
            "-c",
            "/etc/bushi.toml",
            "sync",
            "--repo",
            "linux",
            "--full",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/bushi.toml")));
        match cli.command {
            Command::Sync { repos, full, json } => {
                assert_eq!(repos, vec!["linux".to_string()]);
                assert!(full);
                assert!(!json);
            }
            _ => panic!("expected sync"),
        }
    }
}
