//! Cloud-Workstation-Companion server
//!
//! Entry point: parse CLI flags, load configuration, initialize tracing,
//! build the `axum::Router`, optionally start mDNS advertisement, and serve
//! until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cwc_server::cli::Cli;
use cwc_server::codec::{MessageValidator, NoopValidator, SchemaValidator};
use cwc_server::config::Config;
use cwc_server::service::{self, AvahiPublisher, NullPublisher, Publisher, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = Config::load(cli.config.as_deref(), &cli)?;
    config.validate_config()?;

    init_tracing(&config.log_level);

    tracing::info!(host = %config.host, port = config.port, validate = config.validate, "starting cwc-server");

    let validator: Arc<dyn MessageValidator> = if config.validate {
        Arc::new(SchemaValidator)
    } else {
        Arc::new(NoopValidator)
    };

    let registry = SessionRegistry::new();
    let router = service::router(validator, registry.clone());

    let mut publisher: Box<dyn Publisher> = if config.mdns_name.is_empty() {
        Box::new(NullPublisher)
    } else {
        Box::new(AvahiPublisher::default())
    };
    if !config.mdns_name.is_empty() {
        if let Err(e) = publisher.start(&config.mdns_name, config.port).await {
            tracing::warn!(error = %e, "mDNS advertisement failed to start");
        }
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(registry.clone()))
        .await?;

    if let Err(e) = publisher.stop().await {
        tracing::warn!(error = %e, "mDNS advertisement failed to stop cleanly");
    }

    tracing::info!("cwc-server shut down cleanly");
    Ok(())
}

/// Wait for SIGINT/SIGTERM, then cascade cancellation to every live session
/// before letting `axum::serve` return.
async fn shutdown_signal(registry: SessionRegistry) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    registry.shutdown_all().await;
}

/// Initialize the `tracing` subscriber. `RUST_LOG` overrides `level` when
/// set, the way the teacher's `init_tracing` defers to the environment
/// first.
fn init_tracing(level: &str) {
    let default_filter = format!("cwc_server={level}");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
