pub mod aggregate;
pub mod api;
pub mod connection;
pub mod db;
pub mod errors;
pub mod executor;
pub mod insight_tree;
pub mod models;
pub mod payload;
pub mod prompt;
pub mod schedule;
pub mod tools;
pub mod worker;

use crate::api::ApiState;
use crate::db::Database;
use crate::executor::JobExecutor;
use crate::tools::http::HttpToolProvider;
use crate::worker::{Worker, DEFAULT_POLL_INTERVAL};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Run the claim loop until Ctrl-C.
    Worker,
    /// Serve the HTTP trigger surface.
    Api,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "insight-worker", about = "Computes scheduled KPI windows for insight hierarchies")]
pub struct Cli {
    #[arg(long, value_enum, env = "MODE", default_value = "worker")]
    pub mode: Mode,

    /// SQLite database holding insights, KPIs and the job queue
    #[arg(long, env = "INSIGHT_DB_PATH", default_value = "data/insights.sqlite")]
    pub database: PathBuf,

    /// Base URL of the tool provider
    #[arg(long, env = "TENANTS_CREATE_API", default_value = "http://localhost:4111")]
    pub tools_url: String,

    #[arg(long, env = "PORT", default_value_t = 4001)]
    pub port: u16,

    /// Directory for rolling JSON logs; stdout when unset
    #[arg(long, env = "INSIGHT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "INSIGHT_TOOL_TIMEOUT_SECS", default_value_t = 120)]
    pub tool_timeout_secs: u64,

    /// Start the worker loop with the API; without it `/worker/start` is unavailable
    #[arg(long, env = "INSIGHT_API_WORKER", default_value_t = true, action = clap::ArgAction::Set)]
    pub api_worker: bool,
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_dir.as_deref())?;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_with(cli))
}

pub async fn run_with(cli: Cli) -> anyhow::Result<()> {
    let db = Arc::new(Database::new(&cli.database)?);
    let tools = Arc::new(HttpToolProvider::new(
        cli.tools_url.clone(),
        Duration::from_secs(cli.tool_timeout_secs),
    )?);
    let executor = JobExecutor::new(db.clone(), tools);
    tracing::info!(
        mode = ?cli.mode,
        database = %db.path().display(),
        tools_url = %cli.tools_url,
        "insight worker starting"
    );

    match cli.mode {
        Mode::Worker => {
            let handle = Worker::new(db, executor, DEFAULT_POLL_INTERVAL).start();
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown requested");
            handle.stop().await;
        }
        Mode::Api => {
            let worker = cli
                .api_worker
                .then(|| Worker::new(db.clone(), executor.clone(), DEFAULT_POLL_INTERVAL));
            api::serve(Arc::new(ApiState::new(executor, worker)), cli.port).await?;
        }
    }
    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let Some(log_dir) = log_dir else {
        return tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .json()
            .try_init()
            .map_err(|error| anyhow::anyhow!(error));
    };

    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "worker.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error))
}

#[cfg(test)]
mod tests {
    use super::{Cli, Mode};
    use clap::Parser;

    #[test]
    fn cli_defaults_to_worker_mode() {
        let cli = Cli::try_parse_from(["insight-worker"]).expect("defaults");
        assert_eq!(cli.mode, Mode::Worker);
        assert_eq!(cli.port, 4001);
        assert_eq!(cli.tools_url, "http://localhost:4111");
        assert!(cli.api_worker);
    }

    #[test]
    fn cli_accepts_api_mode_without_worker() {
        let cli = Cli::try_parse_from([
            "insight-worker",
            "--mode",
            "api",
            "--port",
            "8080",
            "--api-worker",
            "false",
            "--database",
            "/tmp/x.sqlite",
        ])
        .expect("flags");
        assert_eq!(cli.mode, Mode::Api);
        assert_eq!(cli.port, 8080);
        assert!(!cli.api_worker);
        assert_eq!(cli.database.to_str(), Some("/tmp/x.sqlite"));
    }
}
