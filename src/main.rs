#![forbid(unsafe_code)]

//! `blockdefer` binary: loopback endpoint, sweeper, worker entry point, and
//! maintenance commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use blockdefer::config::GlobalConfig;
use blockdefer::orchestrator::async_manager::AsyncManager;
use blockdefer::orchestrator::discovery::LoopbackDiscovery;
use blockdefer::orchestrator::fork_manager::{ExecutionContext, ForkManager, EXECUTION_KEY};
use blockdefer::orchestrator::spawner::METADATA_ENV;
use blockdefer::orchestrator::wrapper::LoggingWrapper;
use blockdefer::orchestrator::{builtin_registry, sweeper};
use blockdefer::persistence::block_repo::BlockRepo;
use blockdefer::persistence::config_repo::ConfigRepo;
use blockdefer::persistence::db;
use blockdefer::server::endpoint::{self, EndpointState};
use blockdefer::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "blockdefer", about = "Deferred block execution scheduler", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the loopback endpoint and run the periodic sweeper.
    Serve,
    /// Run one pass over a session (worker entry point).
    RunSession {
        /// Session token.
        #[arg(long)]
        token: String,
        /// Launch metadata as a JSON object; defaults to the worker env var.
        #[arg(long)]
        metadata: Option<String>,
    },
    /// Requeue due replays, launch ready sessions, and purge old ones once.
    Sweep,
    /// Test loopback candidates and store the first one that works.
    Discover {
        /// Candidate base URLs, tried in order.
        #[arg(long = "url", required = true)]
        urls: Vec<String>,
    },
    /// Delete every stored block.
    DropAll,
    /// Forget the discovered loopback address.
    ResetConfig,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

struct Runtime {
    config: GlobalConfig,
    store: ConfigRepo,
    blocks: BlockRepo,
    fork: Arc<ForkManager>,
    manager: Arc<AsyncManager>,
}

async fn bootstrap(args: &Cli) -> Result<Runtime> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(config = %args.config.display(), "configuration loaded");

    let db = Arc::new(db::connect(&config.db_path).await?);
    let store = ConfigRepo::new(Arc::clone(&db));
    let registry = Arc::new(builtin_registry(store.clone()));
    let fork = Arc::new(
        ForkManager::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            &config,
            ExecutionContext::Cli,
        )?
        .with_wrapper(Arc::new(LoggingWrapper)),
    );
    let manager = Arc::new(AsyncManager::new(
        Arc::clone(&db),
        registry,
        Arc::clone(&fork),
    ));

    Ok(Runtime {
        config,
        store,
        blocks: BlockRepo::new(db),
        fork,
        manager,
    })
}

async fn run(args: Cli) -> Result<()> {
    let rt = bootstrap(&args).await?;

    match args.command {
        Command::Serve => serve(rt).await,
        Command::RunSession { token, metadata } => {
            let metadata = worker_metadata(metadata)?;
            let report = rt.fork.run_session(&token, metadata).await?;
            info!(
                session = %report.token,
                executed = report.executed.len(),
                deferred = report.deferred.len(),
                status = ?report.status,
                "worker finished"
            );
            Ok(())
        }
        Command::Sweep => {
            sweeper::sweep_once(&rt.fork, &rt.blocks, &rt.config.sweep).await?;
            Ok(())
        }
        Command::Discover { urls } => {
            let discovery =
                LoopbackDiscovery::new(Arc::clone(&rt.manager), rt.store, rt.config.loopback);
            let reports = discovery.discover(&urls).await?;
            match reports.iter().find(|r| r.accepted) {
                Some(found) => {
                    info!(address = %found.address, "loopback address discovered");
                    Ok(())
                }
                None => Err(AppError::Loopback(
                    "no candidate passed the ping and probe checks".into(),
                )),
            }
        }
        Command::DropAll => {
            rt.manager.drop_all_blocks().await?;
            Ok(())
        }
        Command::ResetConfig => rt.manager.reset_config().await,
    }
}

async fn serve(rt: Runtime) -> Result<()> {
    let ct = CancellationToken::new();

    let state = Arc::new(EndpointState {
        fork: Arc::clone(&rt.fork),
        store: rt.store.clone(),
    });
    let path = rt.config.loopback.path.clone();
    let port = rt.config.http_port;
    let endpoint_ct = ct.clone();
    let endpoint_handle = tokio::spawn(async move {
        if let Err(err) = endpoint::serve(state, &path, port, endpoint_ct).await {
            error!(%err, "loopback endpoint failed");
        }
    });

    let sweeper_handle = sweeper::spawn_sweeper(
        Arc::clone(&rt.fork),
        rt.blocks.clone(),
        rt.config.sweep.clone(),
        ct.clone(),
    );

    info!(port, "blockdefer serving");
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let _ = tokio::join!(endpoint_handle, sweeper_handle);
    info!("blockdefer shut down");
    Ok(())
}

fn worker_metadata(raw: Option<String>) -> Result<Map<String, Value>> {
    let raw = raw.or_else(|| std::env::var(METADATA_ENV).ok());
    let mut metadata = match raw.as_deref() {
        Some(text) => match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => map,
            other => {
                warn!(%other, "ignoring non-object worker metadata");
                Map::new()
            }
        },
        None => Map::new(),
    };
    metadata
        .entry(EXECUTION_KEY)
        .or_insert_with(|| json!("worker"));
    metadata.insert("pid".into(), json!(std::process::id()));
    Ok(metadata)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
