//! # Wilbur Signaling Server - Main Application Entry Point
//!
//! HTTP signaling front end for the idiom translator. Browsers post an SDP
//! offer, get an answer back, and every negotiated connection is paired with a
//! translation worker that lives exactly as long as the connection does.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment, CLI)
//! - **connection**: peer connection contract and its WebRTC implementation
//! - **worker**: per-session translation pipeline and its cancellation handle
//! - **session**: the session registry, idle sweeper and teardown protocol
//! - **state / handlers / health / middleware / error**: the actix-web surface
//!
//! ## Lifecycle:
//! 1. Load configuration and set up tracing
//! 2. Build the session registry and start its idle sweeper
//! 3. Serve HTTP until SIGINT/SIGTERM
//! 4. Stop the HTTP server, then tear down every remaining session

mod config;
mod connection;
mod error;
mod handlers;
mod health;
mod middleware;
mod session;
mod state;
mod worker;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::{ArgAction, Parser};
use config::AppConfig;
use connection::SignalingConnectionFactory;
use session::{RegistryConfig, SessionRegistry};
use state::AppState;
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worker::IdiomTranslator;

/// Command line flags. These override every other configuration source.
#[derive(Debug, Parser)]
#[command(name = "wilbur-signaling", version, about = "WebRTC signaling server for the idiom translator")]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Log everything down to trace level
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.verbose > 0 {
            config.logging.level = "trace".to_string();
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    cli.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging.level)?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    // Every session task (workers, watchers, the sweeper) runs on this runtime,
    // not on the per-thread runtimes of the HTTP workers.
    let registry = SessionRegistry::new(RegistryConfig::from(&config.sessions));
    registry.start_sweeper();

    let connections = Arc::new(SignalingConnectionFactory::new(&config.webrtc)?);
    let app_state = AppState::new(
        config.clone(),
        registry.clone(),
        connections,
        Arc::new(IdiomTranslator),
    );
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

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
            .wrap(middleware::RequestMetrics)
            .wrap(TracingLogger::default())
            .route("/", web::get().to(handlers::index))
            .service(
                web::scope("/api")
                    .route("/offer", web::post().to(handlers::offer))
                    .route("/status", web::get().to(handlers::status))
                    .route("/sessions/{pc_id}", web::delete().to(handlers::remove_session))
                    .service(
                        web::scope("/v1")
                            .route("/health", web::get().to(health::health_check))
                            .route("/metrics", web::get().to(health::detailed_metrics)),
                    ),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
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
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    registry.shutdown_all().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins when set; otherwise this crate logs at `level` and actix at `info`.
fn init_tracing(level: &str) -> Result<()> {
    let default_filter = format!(
        "{}={},actix_web=info",
        env!("CARGO_CRATE_NAME"),
        level.to_ascii_lowercase()
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
