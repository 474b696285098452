//! API Server for the folder-serialized agent orchestrator
//!
//! Starts the completion monitor and recovery sweeper, then serves the REST
//! control surface (default port 8081).

mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_runner::{
    AgentManager, CompletionMonitor, LogSink, NotificationSink, OrchestratorConfig,
    RecoverySweeper, WebhookSink,
};

use crate::state::AppState;

const DEFAULT_LISTEN_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8081);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_server=debug,agent_runner=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OrchestratorConfig::from_env();
    tracing::info!(
        program = %config.agent_command.program,
        monitor_interval = ?config.monitor_interval,
        recovery_interval = ?config.recovery_interval,
        "Loaded orchestrator config"
    );

    // Notification sink: webhook if configured, otherwise the log
    let (sink, target): (Arc<dyn NotificationSink>, String) =
        match std::env::var("ORCH_WEBHOOK_URL") {
            Ok(url) if !url.trim().is_empty() => {
                let sink = WebhookSink::new(url.trim().to_string());
                let target = sink.url().to_string();
                (Arc::new(sink), target)
            }
            _ => (Arc::new(LogSink), "log".to_string()),
        };
    tracing::info!("Notifications go to {}", target);

    let manager = AgentManager::new(config);

    // Background loops stop when the token is cancelled
    let shutdown = CancellationToken::new();
    let monitor = tokio::spawn(
        CompletionMonitor::new(manager.clone(), Arc::clone(&sink)).run(shutdown.clone()),
    );
    let sweeper =
        tokio::spawn(RecoverySweeper::new(manager.clone(), sink).run(shutdown.clone()));

    let app = routes::app(AppState::new(manager, target));

    let addr = match std::env::var("ORCH_LISTEN_ADDR") {
        Ok(raw) => raw
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid ORCH_LISTEN_ADDR {:?}", raw))?,
        Err(_) => SocketAddr::from(DEFAULT_LISTEN_ADDR),
    };
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("REST API listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
                _ = signal.cancelled() => {}
            }
        })
        .await
        .context("REST server failed")?;

    shutdown.cancel();
    let _ = tokio::join!(monitor, sweeper);
    tracing::info!("Orchestrator stopped");
    Ok(())
}
