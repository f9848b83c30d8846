use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use authguard::config::GuardSettings;
use authguard::http::{login_router, LoginProtection, LoginState, StaticAccounts};

/// Login endpoint protected by rate limiting and account lockout.
#[derive(Parser, Debug)]
#[command(name = "authguard", version)]
struct Args {
    /// YAML settings file, layered under AUTHGUARD_* environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from the settings
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Authguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut settings = GuardSettings::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        settings.server.listen_addr = listen;
    }
    info!(
        listen_addr = %settings.server.listen_addr,
        backend = ?settings.rate_limit_backend,
        "Configuration loaded"
    );

    let accounts = StaticAccounts::new(&settings.accounts)?;
    if accounts.is_empty() {
        warn!("No accounts configured, every login attempt will fail");
    }

    let protection = Arc::new(LoginProtection::from_settings(&settings).await);

    let app = Router::new()
        .route("/health", get(health))
        .merge(login_router(LoginState {
            protection: protection.clone(),
            verifier: Arc::new(accounts),
        }));

    let listener = tokio::net::TcpListener::bind(settings.server.listen_addr).await?;
    info!("Listening on {}", settings.server.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    protection.stop().await;

    info!("Authguard stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
