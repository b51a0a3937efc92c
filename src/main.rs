//! # Transcript Relay - Main Application Entry Point
//!
//! A per-connection streaming relay between browsers and a realtime
//! speech-to-text provider. Browsers stream microphone audio over a WebSocket;
//! each connection gets its own provider session, and transcripts flow back on
//! the same socket.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **error**: HTTP errors and relay session errors
//! - **state**: shared configuration, upstream connector and session counters
//! - **health**: health check endpoint
//! - **websocket**: `/ws` endpoint and the per-connection socket actor
//! - **relay**: everything inside a single relay session

mod config;
mod error;
mod health;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use relay::upstream::WsConnector;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup Order:
/// 1. `.env`, logging, configuration (any failure here aborts before binding)
/// 2. Shared state with the real provider connector
/// 3. HTTP server with CORS, request tracing and the relay routes
/// 4. Wait for the server to exit or for a shutdown signal
///
/// On a shutdown signal every session is told to drain before the server
/// stops. Workers get enough time for a full teardown, then stop regardless.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcript-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        variant = config.provider.variant.as_str(),
        max_sessions = config.session.max_concurrent_sessions,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    // A teardown may spend one grace period each on the transcoder flush, the
    // provider terminate, the transcoder stop and the client close.
    let shutdown_timeout = (config.session.drain_grace() * 4).as_secs() + 1;
    let app_state = AppState::new(config, Arc::new(WsConnector));
    let sessions = app_state.clone();

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(web::scope("/api/v1").route("/health", web::get().to(health::health_check)))
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::relay_websocket))
    })
    .shutdown_timeout(shutdown_timeout)
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = wait_for_shutdown() => {
            info!(
                active_sessions = sessions.metrics.snapshot().active,
                "Shutdown signal received, draining sessions and stopping server..."
            );
            sessions.begin_shutdown();
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped");
    Ok(())
}

/// `RUST_LOG` wins; otherwise debug for this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcript_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Flip [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
///
/// If the SIGTERM handler cannot be installed, Ctrl+C still works.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for SIGINT: {}", e);
                    return;
                }
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
