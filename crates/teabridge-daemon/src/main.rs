//! Teabridge daemon entry point.
//!
//! This binary starts the WebSocket bridge that presentation clients connect to.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use teabridge_daemon::BridgeServer;
use teabridge_rpc::{BridgeConfig, default_config_path};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Teabridge daemon - WebSocket bridge server
#[derive(Parser, Debug)]
#[command(name = "teabridge-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (defaults to `~/.config/teabridge/config.json`)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Token clients must present
    #[arg(long)]
    token: Option<String>,
}

/// Set up logging with file output for debugging.
/// In debug builds, defaults to debug level and logs to timestamped file.
/// In release builds, defaults to info level and logs to stderr.
fn setup_logging() {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("teabridge={default_level}")));

    if cfg!(debug_assertions) {
        let temp_dir = std::env::temp_dir();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("teabridge-daemon-{timestamp}.log");
        let log_path = temp_dir.join(&log_filename);

        #[cfg(unix)]
        {
            let symlink_path = temp_dir.join("teabridge-daemon.log");
            let _ = std::fs::remove_file(&symlink_path);
            let _ = std::os::unix::fs::symlink(&log_path, &symlink_path);
        }

        let file_appender = tracing_appender::rolling::never(&temp_dir, &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        std::mem::forget(guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true);

        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .with(filter)
            .init();

        eprintln!("Logging to: {} (and stderr)", log_path.display());
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn load_config(args: Args) -> Result<BridgeConfig> {
    let path = args.config.or_else(default_config_path);
    let config = match &path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    let mut config = config.apply_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(token) = args.token {
        config.token = token;
        config.ui_token.clear();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging();

    let config = load_config(args)?;
    info!("Starting teabridge daemon...");

    let server = BridgeServer::new(config.server());
    let listener = server
        .bind()
        .await
        .context("Failed to bind bridge address")?;

    let serve = Arc::clone(&server).serve(listener);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            server.shutdown();
            serve.await?;
        }
    }

    info!("Teabridge daemon stopped");
    Ok(())
}
