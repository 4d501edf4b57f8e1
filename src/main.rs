use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use session_gateway::config::Settings;
use session_gateway::readiness::StaticHandle;
use session_gateway::server::{create_app, AppState};
use session_gateway::shutdown::GracefulShutdown;
use session_gateway::startup::StartupPhase;
use session_gateway::tasks::RecoveryTask;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Create application state
    let state = AppState::new(settings.clone());
    tracing::info!("Application state initialized");

    // Drive the ordered startup sequence. Connection-critical services
    // come up during the Services phase; the readiness gate rejects
    // connections until then.
    let startup = state.startup.clone();

    startup.begin_phase(StartupPhase::Init);
    startup.complete_phase(StartupPhase::Init);

    startup.begin_phase(StartupPhase::Dependencies);
    startup.complete_phase(StartupPhase::Dependencies);

    // The gateway's backing services are wired here as in-process handles;
    // a deployment integrating real clients swaps these for handles that
    // probe the actual systems.
    startup.begin_phase(StartupPhase::Database);
    state.directory.set_database(Arc::new(StaticHandle));
    startup.complete_phase(StartupPhase::Database);

    startup.begin_phase(StartupPhase::Cache);
    state.directory.set_cache(Arc::new(StaticHandle));
    startup.complete_phase(StartupPhase::Cache);

    startup.begin_phase(StartupPhase::Services);
    state.directory.set_auth_system(Arc::new(StaticHandle));
    state.directory.set_agent_supervisor(Arc::new(StaticHandle));
    state.directory.set_thread_service(Arc::new(StaticHandle));
    state.directory.set_event_bridge(Arc::new(StaticHandle));
    startup.complete_phase(StartupPhase::Services);

    // Shutdown fan-out for background tasks
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    startup.begin_phase(StartupPhase::WebSocket);
    let recovery_handle = if settings.recovery.enabled {
        let task = RecoveryTask::new(
            Duration::from_secs(settings.recovery.interval_secs),
            state.registry.clone(),
            shutdown_tx.subscribe(),
        );
        Some(tokio::spawn(async move {
            task.run().await;
        }))
    } else {
        None
    };

    // Create Axum app
    let app = create_app(state.clone());

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);
    startup.complete_phase(StartupPhase::WebSocket);

    startup.begin_phase(StartupPhase::Finalize);
    startup.complete_phase(StartupPhase::Finalize);
    startup.mark_complete();

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler())
        .await?;

    // Coordinated teardown: notify clients, stop tasks, clear the registry
    let shutdown = GracefulShutdown::new(state.registry.clone(), shutdown_tx);
    shutdown.execute("server shutting down").await;

    if let Some(handle) = recovery_handle {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
