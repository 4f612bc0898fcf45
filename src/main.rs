use color_eyre::{eyre::eyre, Result};
use fireplacectl::config::AgentConfig;
use fireplacectl::mqtt::mqtt_handler::MqttTransport;
use fireplacectl::{relay, session};
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AgentConfig::load().map_err(|e| eyre!("Invalid configuration: {}", e))?;
    info!("Starting fireplacectl: {:?}", config);

    // Claiming the pin already drives it to the de-energized level
    let relay = relay::open(&config.relay)
        .map_err(|e| eyre!("Failed to initialize relay on pin {}: {}", config.relay.pin, e))?;

    let shutdown = CancellationToken::new();
    let terminate = signal(SignalKind::terminate())
        .map_err(|e| eyre!("Failed to install SIGTERM handler: {}", e))?;
    tokio::spawn(forward_termination(terminate, shutdown.clone()));

    let (transport, events) = MqttTransport::connect(&config.mqtt, config.session.reconnect_delay);

    session::run(relay, Arc::new(transport), events, config.session, shutdown)
        .await
        .map_err(|e| eyre!("Session failed: {}", e))?;

    info!("Shut down cleanly");
    Ok(())
}

/// Turns the first SIGINT or SIGTERM into a shutdown request.
async fn forward_termination(mut terminate: Signal, shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                terminate.recv().await;
                info!("Received SIGTERM");
            }
        },
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    FmtSubscriber::builder()
        .with_env_filter(log_filter(&directives))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// `RUST_LOG` directives (`info`, `fireplacectl=debug,rumqttc=warn`, ...);
/// falls back to `info` when they do not parse.
fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|e| {
        eprintln!("Ignoring RUST_LOG '{}': {}", directives, e);
        EnvFilter::new("info")
    })
}
