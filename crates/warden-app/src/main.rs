//! Warden - control plane for a local proxy engine.
//!
//! Runs the panel listener, supervises the engine process and keeps the
//! recurring jobs (watchdog, traffic accounting, quota enforcement, stats
//! report) ticking until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use warden_core::APP_NAME;
use warden_engine::config::DEFAULT_API_PORT;
use warden_engine::{Supervisor, SupervisorConfig, XrayEngine};
use warden_server::{ControlPlane, ServerConfig};
use warden_storage::{Database, PanelSettings};

/// Warden - control plane for a local proxy engine
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Args {
    /// Database file (default: platform data directory)
    #[arg(long, env = "WARDEN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Engine binary (default: bin/xray-<os>-<arch>)
    #[arg(long, env = "WARDEN_ENGINE_BIN")]
    engine_bin: Option<PathBuf>,

    /// Port of the engine's local stats API
    #[arg(long, env = "WARDEN_ENGINE_API_PORT", default_value_t = DEFAULT_API_PORT)]
    engine_api_port: u16,

    /// Panel listen address, overrides the stored setting
    #[arg(long, env = "WARDEN_LISTEN")]
    listen: Option<String>,

    /// Panel port, overrides the stored setting
    #[arg(long, env = "WARDEN_PORT")]
    port: Option<u16>,

    /// PEM certificate for the panel, overrides the stored setting
    #[arg(long, env = "WARDEN_CERT_FILE")]
    cert_file: Option<PathBuf>,

    /// PEM private key for the panel, overrides the stored setting
    #[arg(long, env = "WARDEN_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, env = "WARDEN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable debug logging
    #[arg(long, env = "WARDEN_DEBUG")]
    debug: bool,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", APP_NAME, APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warden={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix(APP_NAME)
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Engine binary shipped next to the panel, named after the platform.
fn default_engine_bin() -> PathBuf {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    PathBuf::from("bin").join(format!("xray-{}-{}", std::env::consts::OS, arch))
}

/// Stored listener settings with command-line overrides applied.
fn server_config(args: &Args, settings: &PanelSettings) -> ServerConfig {
    let mut config = ServerConfig::from_settings(settings);
    if let Some(listen) = &args.listen {
        config.listen = listen.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(cert_file) = &args.cert_file {
        config.cert_file = Some(cert_file.clone());
    }
    if let Some(key_file) = &args.key_file {
        config.key_file = Some(key_file.clone());
    }
    config
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Warden v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Args: {:?}", args);

    let db = match &args.db_path {
        Some(path) => Database::with_path(path),
        None => Database::new(),
    }
    .context("Failed to open database")?;
    let settings = db.panel_settings().context("Failed to read settings")?;

    let engine_bin = args.engine_bin.clone().unwrap_or_else(default_engine_bin);
    tracing::info!("Using engine binary {:?}", engine_bin);
    let engine = Arc::new(XrayEngine::new(engine_bin).with_api_port(args.engine_api_port));
    let supervisor = Arc::new(Supervisor::with_config(
        engine,
        db.clone(),
        SupervisorConfig {
            api_port: args.engine_api_port,
            ..Default::default()
        },
    ));

    let plane = ControlPlane::start(server_config(&args, &settings), supervisor, db)
        .await
        .context("Failed to start control plane")?;

    shutdown_signal().await;
    tracing::info!("Shutting down...");

    plane.stop().await.context("Shutdown finished with errors")?;
    Ok(())
}
