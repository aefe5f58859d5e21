//! Karmada Dashboard Terminal Server
//!
//! Serves personal web terminals: provisions per-user terminal pods,
//! delivers the caller's credentials into them, and bridges browser
//! websockets to container exec streams.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod domain;
mod error;
mod infra;
mod service;

pub use config::Config;
pub use error::{Error, Result};

use infra::kube::{ClusterClients, KubeExecBackend, KubePodApi};
use infra::session_registry::SessionRegistry;
use service::bridge::ExecStreamBridge;
use service::injector::CredentialInjector;
use service::provisioner::{TerminalPodProvisioner, TerminalPodSettings};
use service::terminal::TerminalService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub terminal_service: Arc<TerminalService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;
    let config = Arc::new(config);

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let http_addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;

    info!("Starting Terminal Server");
    info!("HTTP listening on {}", http_addr);
    info!("Terminal pods in namespace {}", config.terminal_namespace);

    // Initialize infrastructure
    let clients = ClusterClients::load(&config).await?;
    let pods = Arc::new(KubePodApi::new(clients.host()));
    let exec = Arc::new(KubeExecBackend::new(clients.host()));
    let sessions = Arc::new(SessionRegistry::new());

    // Initialize services
    let bridge = Arc::new(ExecStreamBridge::new(
        sessions.clone(),
        exec.clone(),
        config.attach_timeout(),
    ));

    let terminal_service = Arc::new(TerminalService::new(
        clients,
        TerminalPodProvisioner::new(pods, TerminalPodSettings::from(config.as_ref())),
        CredentialInjector::new(exec),
        bridge,
        sessions.clone(),
        config.shells.clone(),
    ));

    // Create application state
    let state = AppState {
        sessions,
        terminal_service,
    };

    let app = api::http::create_router(state);

    axum::serve(
        tokio::net::TcpListener::bind(http_addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    info!("Received shutdown signal");
}
