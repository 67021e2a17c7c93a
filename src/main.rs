//! Nebula CLI entry point.
//!
//! Provides `start` and `check` subcommands for running the node or
//! validating its configuration. This is the only place that maps fatal
//! node errors to process exit codes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Instrument};

use nebula::config::{load_node_config, NodeConfiguration};
use nebula::credentials::{load_env_file, CoreSecrets};
use nebula::supervisor::{exit_code, NodeError, NodeSupervisor, ShutdownReport};
use nebula::telemetry::TelemetryEmitter;
use nebula::vault::free::FreeVaultProvider;

/// Queue depth between ingress and the operational loop.
const REQUEST_QUEUE_DEPTH: usize = 32;

/// Time given to ingress to flush its last response before exit.
const INGRESS_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Supervisory node guarding a sealed vault core.
#[derive(Parser)]
#[command(name = "nebula", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the node until interrupted or locked.
    Start(StartArgs),
    /// Validate the configuration and exit.
    Check {
        /// Path to the node configuration (TOML or JSON).
        #[arg(long, short)]
        config: PathBuf,

        /// Optional dotenv file, read the same way `start` reads it.
        #[arg(long)]
        env_file: Option<PathBuf>,
    },
}

/// Options for `start`.
#[derive(Args)]
struct StartArgs {
    /// Path to the node configuration (TOML or JSON).
    #[arg(long, short)]
    config: PathBuf,

    /// Optional dotenv file with vault secrets. Process environment wins.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Directory for rotated JSON logs.
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,

    /// Accept fallback secrets in release builds.
    #[arg(long)]
    allow_insecure_defaults: bool,

    /// Do not read vault requests from stdin.
    #[arg(long)]
    no_ingress: bool,
}

fn main() {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("FATAL: failed to start async runtime: {e}");
            std::process::exit(i32::from(exit_code::FAILURE));
        }
    };

    let code = runtime.block_on(async move {
        match cli.command {
            Command::Start(args) => handle_start(args).await,
            Command::Check { config, env_file } => handle_check(&config, env_file.as_deref()),
        }
    });

    // Stdin reads run on a blocking thread that cannot be cancelled.
    runtime.shutdown_background();
    std::process::exit(i32::from(code));
}

/// Map an error chain to an exit code, preferring the node taxonomy.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<NodeError>()
        .map_or(exit_code::FAILURE, NodeError::exit_code)
}

/// Resolve an environment key: process environment first, then the env file.
fn env_resolver(file_vars: BTreeMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |key| std::env::var(key).ok().or_else(|| file_vars.get(key).cloned())
}

/// Run the node daemon.
async fn handle_start(args: StartArgs) -> u8 {
    let _logging_guard = match nebula::logging::init_node(&args.logs_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("FATAL: {e:#}");
            return exit_code::FAILURE;
        }
    };

    match start_node(&args).await {
        Ok(report) => {
            info!(
                heartbeats = report.heartbeats,
                anomalies = report.anomaly_count,
                "node stopped cleanly"
            );
            exit_code::SHUTDOWN
        }
        Err(e) => {
            let code = exit_code_for(&e);
            let detail = format!("{e:#}");
            if code == exit_code::LOCKOUT {
                error!(error = %detail, exit_code = code, "NODE_LOCKED");
            } else {
                error!(error = %detail, exit_code = code, "FATAL");
            }
            code
        }
    }
}

async fn start_node(args: &StartArgs) -> anyhow::Result<ShutdownReport> {
    let file_vars = match &args.env_file {
        Some(path) => load_env_file(path)?,
        None => BTreeMap::new(),
    };
    let env = env_resolver(file_vars);

    let config = load_node_config(&args.config, &env).map_err(NodeError::from)?;

    let span = tracing::info_span!("node", node_id = %config.node_id());
    run_node(config, args, env).instrument(span).await
}

async fn run_node(
    config: NodeConfiguration,
    args: &StartArgs,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<ShutdownReport> {
    let secrets = CoreSecrets::resolve(&env);
    let allow_insecure = args.allow_insecure_defaults || config.allow_insecure_defaults();
    secrets
        .enforce(allow_insecure, !cfg!(debug_assertions))
        .map_err(NodeError::from)?;

    let emitter = TelemetryEmitter::from_config(&config)?;
    let supervisor = NodeSupervisor::start(config, &secrets, &FreeVaultProvider)?;

    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let ingress = if args.no_ingress {
        drop(request_tx);
        None
    } else {
        let reader = tokio::io::BufReader::new(tokio::io::stdin());
        let writer = tokio::io::stdout();
        Some(tokio::spawn(
            async move {
                if let Err(e) = nebula::ingress::serve(reader, writer, request_tx).await {
                    warn!(error = %e, "ingress stopped");
                }
            }
            .in_current_span(),
        ))
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = supervisor.run(&emitter, request_rx, shutdown_rx).await;

    if let Some(mut handle) = ingress {
        if tokio::time::timeout(INGRESS_DRAIN_GRACE, &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
    }

    Ok(result?)
}

/// Resolve when SIGINT (or SIGTERM on Unix) arrives.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl-C only"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
}

/// Validate the configuration and log the resolved record.
fn handle_check(path: &Path, env_file: Option<&Path>) -> u8 {
    nebula::logging::init_cli();

    let file_vars = match env_file.map(load_env_file).transpose() {
        Ok(vars) => vars.unwrap_or_default(),
        Err(e) => {
            let detail = format!("{e:#}");
            error!(error = %detail, "FATAL: env file unreadable");
            return exit_code::CONFIGURATION;
        }
    };

    match load_node_config(path, env_resolver(file_vars)) {
        Ok(config) => {
            info!(
                node_id = %config.node_id(),
                hw_id = %config.hw_id(),
                audit_log = %config.audit_log_path().display(),
                heartbeat_target = %config.heartbeat_target(),
                heartbeat_interval_secs = config.heartbeat_interval().as_secs(),
                heartbeat_timeout_secs = config.heartbeat_timeout().as_secs(),
                max_anomaly_score = config.max_anomaly_score(),
                "configuration valid"
            );
            exit_code::SHUTDOWN
        }
        Err(e) => {
            error!(config = %path.display(), error = %e, "FATAL: configuration invalid");
            exit_code::CONFIGURATION
        }
    }
}
