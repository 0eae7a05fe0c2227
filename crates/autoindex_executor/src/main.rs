//! autoindex executor
//!
//! Usage:
//!     autoindex-executor --config executor.toml
//!     autoindex-executor --store-url sqlite:/var/lib/autoindex.sqlite --backend firecracker

use anyhow::Context;
use autoindex_executor::{
    build_backend, BackendKind, DirectoryArtifactSink, ExecutorConfig, GitWorkspaceFetcher,
    SystemHost, Worker, METRICS,
};
use autoindex_executor::sandbox::ProcessRunner;
use autoindex_logging::{init_logging, LogConfig};
use autoindex_scheduler::Store;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "autoindex-executor", about = "Run sandboxed index jobs from the autoindex queue")]
struct Args {
    /// Executor configuration file (TOML). Defaults apply when omitted.
    #[arg(long, env = "AUTOINDEX_EXECUTOR_CONFIG")]
    config: Option<PathBuf>,

    /// State store URL, overrides the configuration file
    #[arg(long, env = "AUTOINDEX_STORE_URL")]
    store_url: Option<String>,

    /// Sandbox backend, overrides the configuration file
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Mirror the full log filter on stderr
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "autoindex-executor",
        verbose: args.verbose,
        log_dir: None,
    })?;

    let mut config = match &args.config {
        Some(path) => ExecutorConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ExecutorConfig::default(),
    };
    if let Some(url) = args.store_url {
        config.store_url = url;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    config.validate()?;

    let worker_id = args.worker_id.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("executor-{}", &id[..8])
    });

    tracing::info!("Starting autoindex executor");
    tracing::info!("  Worker ID: {}", worker_id);
    tracing::info!("  Backend: {}", config.backend);
    tracing::info!("  Store: {}", config.store_url);

    let store = Store::open(&config.store_url, 4)
        .await
        .with_context(|| format!("Failed to open state store {}", config.store_url))?;
    let queue = Arc::new(store.queue().with_max_retries(config.max_retries));

    let runner = Arc::new(ProcessRunner);
    let backend = build_backend(&config, runner.clone())?;
    let fetcher = Arc::new(GitWorkspaceFetcher::new(runner, config.clone_base_url.clone()));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            on_signal.cancel();
        }
    });

    let artifacts = Arc::new(DirectoryArtifactSink::new(config.artifact_dir.clone()));
    let worker = Worker::new(worker_id, config, queue, backend, fetcher, artifacts);
    worker.run_checked(&SystemHost, shutdown).await?;

    tracing::info!("{}", METRICS.snapshot().summary());
    Ok(())
}
