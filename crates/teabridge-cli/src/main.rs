//! Teabridge control CLI
//!
//! Talks to a running daemon over the bridge socket. Provides:
//! - `call`: invoke any registered method
//! - `emit`: broadcast an event to connected clients
//! - `watch`: print events as they arrive
//! - `ping` / `status`: connectivity checks

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use teabridge_rpc::{
    BridgeClient, BridgeConfig, ClientConfig, Payload, default_config_path, payload_from_value,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Parser)]
#[command(name = "teabridge")]
#[command(about = "Control a running teabridge daemon")]
#[command(version)]
#[command(after_help = "Examples:
  teabridge ping                                 Check the daemon answers
  teabridge call methods                         List registered methods
  teabridge call get_plugins --params '{}'       Call a method with parameters
  teabridge emit message --payload '{\"n\": 1}'    Broadcast a 'message' event
  teabridge watch '*'                            Print every broadcast event
  teabridge --port 9000 --token secret status    Connect with explicit settings")]
struct Cli {
    /// Config file (defaults to `~/.config/teabridge/config.json`)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Daemon host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Daemon port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Token presented on connect
    #[arg(long, global = true)]
    token: Option<String>,

    /// Seconds to wait for the connection to come up
    #[arg(long, global = true, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a method and print its result
    Call {
        /// Method name
        method: String,

        /// Parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Seconds to wait for the response (defaults to the configured request timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Broadcast an event through the daemon
    Emit {
        /// Event type
        #[arg(value_name = "TYPE")]
        topic: String,

        /// Event payload as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Print events as JSON lines until interrupted
    Watch {
        /// Event types to watch (`*` for all)
        #[arg(required = true)]
        topics: Vec<String>,
    },

    /// Check the daemon answers and report round-trip time
    Ping,

    /// Show connection settings and daemon reachability
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?.client();
    let connect_timeout = Duration::from_secs(cli.connect_timeout);

    match cli.command {
        Commands::Call {
            method,
            params,
            timeout,
        } => run_call(config, connect_timeout, &method, &params, timeout).await,
        Commands::Emit { topic, payload } => {
            run_emit(config, connect_timeout, &topic, &payload).await
        }
        Commands::Watch { topics } => run_watch(config, connect_timeout, &topics).await,
        Commands::Ping => run_ping(config, connect_timeout).await,
        Commands::Status => run_status(config, connect_timeout).await,
    }
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let path = cli.config.clone().or_else(default_config_path);
    let config = match &path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    let mut config = config.apply_env();
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(token) = &cli.token {
        config.ui_token.clone_from(token);
    }
    Ok(config)
}

fn parse_object(raw: &str, what: &str) -> Result<Payload> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON in {what}"))?;
    payload_from_value(value).map_err(|v| anyhow::anyhow!("{what} must be a JSON object, got {v}"))
}

/// Start a client and wait for it to connect
async fn connect(config: ClientConfig, timeout: Duration) -> Result<BridgeClient> {
    let endpoint = format!("{}:{}{}", config.host, config.port, config.path);
    debug!("Connecting to {}", endpoint);
    let client = BridgeClient::new(config);
    client.start();

    if !client.wait_connected(timeout).await {
        client.shutdown().await;
        bail!("Could not connect to daemon at {endpoint}. Is it running?");
    }
    Ok(client)
}

async fn run_call(
    config: ClientConfig,
    connect_timeout: Duration,
    method: &str,
    params: &str,
    timeout: Option<u64>,
) -> Result<()> {
    let params = parse_object(params, "--params")?;
    let timeout = timeout.map_or(config.request_timeout, Duration::from_secs);
    let client = connect(config, connect_timeout).await?;

    let result = client.call(method, params, timeout).await;
    client.shutdown().await;
    let response = result.with_context(|| format!("Call to '{method}' failed"))?;

    if !response.is_success() {
        bail!(
            "{} ({})",
            response.error.as_deref().unwrap_or("Request failed"),
            response.code
        );
    }
    let output = response.result().cloned().unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_emit(
    config: ClientConfig,
    connect_timeout: Duration,
    topic: &str,
    payload: &str,
) -> Result<()> {
    let payload = parse_object(payload, "--payload")?;
    let client = connect(config, connect_timeout).await?;

    let params = payload_from_value(json!({ "type": topic, "payload": payload }))
        .map_err(|_| anyhow::anyhow!("Failed to build emit parameters"))?;
    let result: Result<Value, _> = client.request("emit", params).await;
    client.shutdown().await;
    let result = result.context("Emit failed")?;

    if result.get("buffered").and_then(Value::as_bool) == Some(true) {
        println!("Buffered '{topic}' (no clients connected yet)");
    } else {
        let delivered = result.get("delivered").and_then(Value::as_u64).unwrap_or(0);
        println!("Delivered '{topic}' to {delivered} client(s)");
    }
    Ok(())
}

async fn run_watch(config: ClientConfig, connect_timeout: Duration, topics: &[String]) -> Result<()> {
    let client = connect(config, connect_timeout).await?;
    let subscription = client.subscribe(topics)?;
    eprintln!("Watching {} (Ctrl+C to stop)", topics.join(", "));

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let line = json!({ "type": event.topic, "payload": event.payload });
                println!("{line}");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn run_ping(config: ClientConfig, connect_timeout: Duration) -> Result<()> {
    let client = connect(config, connect_timeout).await?;
    let started = Instant::now();
    let result: Result<Value, _> = client.request("ping", Payload::new()).await;
    let elapsed = started.elapsed();
    client.shutdown().await;

    result.context("Ping failed")?;
    println!("pong ({:.1} ms)", elapsed.as_secs_f64() * 1000.0);
    Ok(())
}

async fn run_status(config: ClientConfig, connect_timeout: Duration) -> Result<()> {
    println!("Endpoint: ws://{}:{}{}", config.host, config.port, config.path);

    match connect(config, connect_timeout).await {
        Ok(client) => {
            let methods: Result<Vec<String>, _> = client.request("methods", Payload::new()).await;
            client.shutdown().await;

            println!("Status: Connected");
            match methods {
                Ok(methods) => println!("Methods: {}", methods.join(", ")),
                Err(e) => println!("Methods: unavailable ({e})"),
            }
        }
        Err(e) => {
            println!("Status: Not reachable");
            println!("Error: {e}");
        }
    }
    Ok(())
}
