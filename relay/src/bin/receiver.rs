//! Claims Receiver - HTTP intake for claim update events.
//!
//! This binary provides a thin web server that:
//! - Accepts `{ "body": ..., "number": ... }` events on `POST /claims`
//! - Validates them before any side effect
//! - Enqueues each valid claim once, with a 10 second delivery delay
//!
//! The CRM upsert happens later, in `claims-sender`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use claims_relay::web::{router, AppState};
use claims_relay::{AmqpQueue, Config, FileConfigSource, Receiver};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("receiver_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        receiver_config_path = %config.receiver_config_path,
        max_receive_count = config.max_receive_count,
        "config_loaded"
    );

    // Connects lazily on the first send
    let queue = AmqpQueue::new(config.cloudamqp_url.clone(), config.max_receive_count);
    let settings = FileConfigSource::new(&config.receiver_config_path, &config.sender_config_path);
    let receiver = Receiver::new(Arc::new(queue.clone()), Arc::new(settings));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(receiver)).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "receiver_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    queue.close().await;

    info!("receiver_shutdown_complete");

    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "sigint_handler_unavailable");
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
                warn!(error = %e, "sigterm_handler_unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("receiver_shutting_down");
}
