use tokio::sync::mpsc;
use tracing::{error, info};

use coreiot_device_sim::agent::{Agent, AgentEvent, OperatorCommand};
use coreiot_device_sim::device::telemetry::TelemetryScheduler;
use coreiot_device_sim::mqtt::client::ConnectionManager;
use coreiot_device_sim::{config, console};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting {} device simulator (profile={}, mqtt={}:{}, telemetry every {:?})",
        config.device.kind,
        config.device.profile.name,
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.device.telemetry_interval,
    );

    // Channels
    let (session_tx, session_rx) = mpsc::channel(100);
    let (readings_tx, readings_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(100);

    let connection =
        ConnectionManager::new(config.mqtt.clone(), config.device.profile.clone(), session_tx);
    let publisher = connection.publisher();

    let agent = Agent::new(config.device.kind.initial_state(), connection, publisher.clone());
    let handle = agent.device_handle(event_tx);

    let mut scheduler = TelemetryScheduler::new(publisher, agent.snapshots(), readings_tx);
    scheduler.start(config.device.telemetry_interval);

    let mut agent_handle = tokio::spawn(agent.run(session_rx, readings_rx, event_rx));
    let observer_handle = tokio::spawn(console::observe(handle.clone()));
    let console_handle = tokio::spawn(console::read_commands(handle.clone()));

    if config.mqtt.auto_connect {
        handle.operator(OperatorCommand::Connect).await;
    }

    tokio::select! {
        _ = &mut agent_handle => {
            info!("Agent finished");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to register SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        } => {
            info!("Received SIGTERM, shutting down");
        }
    }

    // Cleanup
    scheduler.stop();
    if !agent_handle.is_finished() {
        handle.operator(OperatorCommand::Shutdown).await;
        let _ = agent_handle.await;
    }
    console_handle.abort();
    observer_handle.abort();
    info!("Device simulator stopped");
}
