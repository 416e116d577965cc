//! amqp-guard - main entry point
//!
//! `send`, `receive` and `monitor` each run one scoped session against the
//! configured broker. SIGINT/SIGTERM fire the shared shutdown signal so loops
//! wind down and the connection is closed before the process exits.

use amqp_guard::client::MonitorReport;
use amqp_guard::error::{ConnectionError, HandlerError};
use amqp_guard::observability::{init_logging, LogSettings};
use amqp_guard::{
    shutdown_channel, AmqpTransport, ClientConfig, ClientError, Lifecycle, Message,
    MessageHandler, ShutdownTrigger,
};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, Level};

/// Resilient durable-queue client
#[derive(Parser)]
#[command(name = "amqp-guard")]
#[command(about = "Publish, consume and monitor a durable AMQP queue with bounded retry")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AMQP_GUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured queue name
    #[arg(short, long, value_name = "NAME")]
    queue: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish `{"id": .., "content": ..}` messages and exit
    Send {
        /// Message id (ignored when --count is above 1)
        #[arg(long, default_value_t = 1)]
        id: u64,

        /// Message content
        #[arg(long, default_value = "Hello")]
        content: String,

        /// Publish this many messages concurrently, with ids 0..count
        #[arg(long, default_value_t = 1)]
        count: u64,
    },
    /// Consume until interrupted, with the queue monitor alongside
    Receive {
        /// Do not run the queue monitor
        #[arg(long)]
        no_monitor: bool,
    },
    /// Only report queue depth and consumer count until interrupted
    Monitor,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_settings = LogSettings::from_env();
    match cli.verbose {
        0 => {}
        1 => log_settings.level = Level::DEBUG,
        _ => log_settings.level = Level::TRACE,
    }
    init_logging(&log_settings);

    info!("Starting amqp-guard v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config, cli.queue) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Send { id, content, count } => send(config, id, content, count).await,
        Commands::Receive { no_monitor } => receive(config, !no_monitor).await,
        Commands::Monitor => monitor(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    match result {
        Ok(()) => info!("Shutdown complete"),
        // Interrupted while still trying to connect
        Err(ClientError::Connection(ConnectionError::Cancelled { .. })) => {
            info!("Shutdown before the connection was established");
        }
        Err(e) => {
            error!("Command failed: {}", e);
            process::exit(1);
        }
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
    queue: Option<String>,
) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ClientConfig::load_from_file(path)?
        }
        None => {
            let default_paths = ["amqp-guard.toml", "config/amqp-guard.toml"];
            match default_paths
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists())
            {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    ClientConfig::load_from_file(&path)?
                }
                None => {
                    info!("No configuration file found, using defaults");
                    ClientConfig::default()
                }
            }
        }
    };

    if let Some(queue) = queue {
        config.queue.name = queue;
    }
    config.validate()?;
    Ok(config)
}

/// Fire `trigger` on SIGINT or SIGTERM
fn spawn_signal_listener(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
            signal::unix::signal(signal::unix::SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                error!("Cannot install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
        trigger.trigger();
    });
}

fn lifecycle(config: ClientConfig) -> (Lifecycle, amqp_guard::ShutdownSignal) {
    let (trigger, shutdown) = shutdown_channel();
    spawn_signal_listener(trigger);
    (Lifecycle::new(config, Arc::new(AmqpTransport::new())), shutdown)
}

async fn send(config: ClientConfig, id: u64, content: String, count: u64) -> Result<(), ClientError> {
    let (lifecycle, shutdown) = lifecycle(config);

    let payloads: Vec<_> = if count > 1 {
        (0..count)
            .map(|i| json!({ "id": i, "content": content }))
            .collect()
    } else {
        vec![json!({ "id": id, "content": content })]
    };

    let sent = lifecycle
        .run(&shutdown, |session| async move {
            Ok(session.publish_all(payloads).await?)
        })
        .await?;

    info!("Published {} message(s)", sent);
    Ok(())
}

/// Logs each message's id and acks it; bodies that are not JSON are nacked
struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let body: serde_json::Value = message.json()?;
        debug!("Processed message id={}", body["id"]);
        Ok(())
    }
}

async fn receive(config: ClientConfig, with_monitor: bool) -> Result<(), ClientError> {
    let (lifecycle, shutdown) = lifecycle(config);
    info!("Waiting for messages. Press Ctrl+C to stop");

    let report = lifecycle
        .run(&shutdown, |session| async move {
            session.consume_and_monitor(&LoggingHandler, with_monitor).await
        })
        .await?;

    info!(
        "Received {} message(s): {} acked, {} nacked",
        report.received, report.acked, report.nacked
    );
    Ok(())
}

async fn monitor(config: ClientConfig) -> Result<(), ClientError> {
    let (lifecycle, shutdown) = lifecycle(config);

    let MonitorReport { ticks, failures } = lifecycle
        .run(&shutdown, |session| async move {
            session.monitor_until_shutdown().await
        })
        .await?;

    info!("Monitor ran {} tick(s), {} failed", ticks, failures);
    Ok(())
}

fn handle_config_command(config: &ClientConfig, show: bool) -> Result<(), ClientError> {
    if show {
        println!("Current configuration:");
        match toml::to_string_pretty(config) {
            Ok(rendered) => println!("{}", redact_passwords(&rendered)),
            Err(e) => error!("Cannot render configuration: {}", e),
        }
    }

    info!("Configuration validation complete");
    Ok(())
}

fn redact_passwords(rendered: &str) -> String {
    rendered
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("password =") {
                "password = \"***\"".to_string()
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
