mod auth;
mod cli;
mod config;
mod handlers;
mod ice;
mod metrics;
mod storage;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use tether_core::{RelayStore, SessionRegistry, Sweeper};

use crate::{
    cli::{Cli, Commands},
    config::Config,
    handlers::{
        claim_device, claim_support_session, create_session, create_support_session, end_session,
        health_check, heartbeat, ice_config_handler, list_devices, metrics_handler, poll_signals,
        publish_signal, register_device, remove_device, AppState,
    },
    storage::RedisStore,
    websocket::signal_feed_handler,
};

#[tokio::main]
async fn main() {
    // Default to INFO unless the environment says otherwise.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env();

    if let Some(Commands::Sweep) = cli.command {
        if let Err(err) = cli::run_sweep(&config).await {
            error!("sweep failed: {err}");
            std::process::exit(1);
        }
        return;
    }

    info!("starting tether relay on port {}", config.port);
    info!("redis url: {}", config.redis_url);
    info!("session ttl: {} minutes", config.session_ttl_minutes);

    let store = match RedisStore::new(&config.redis_url, config.store_key_ttl_seconds).await {
        Ok(store) => Arc::new(store) as Arc<dyn RelayStore>,
        Err(err) => {
            error!("failed to connect to redis: {err}");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(SessionRegistry::with_config(
        Arc::clone(&store),
        config.registry_config(),
    ));
    let sweeper = Arc::new(Sweeper::with_config(
        Arc::clone(&store),
        config.sweeper_config(),
    ));

    let sweep_interval = Duration::from_secs(config.sweep_interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let summary = sweeper.sweep_once().await;
            metrics::SIGNALS_PRUNED.inc_by(summary.signals_pruned);
            metrics::SESSIONS_EXPIRED.inc_by(summary.sessions_expired);
            metrics::DEVICES_MARKED_OFFLINE.inc_by(summary.devices_marked_offline);
            info!(
                signals_pruned = summary.signals_pruned,
                sessions_expired = summary.sessions_expired,
                sessions_deleted = summary.sessions_deleted,
                devices_marked_offline = summary.devices_marked_offline,
                "sweep complete"
            );
        }
    });

    let state = AppState {
        store,
        registry,
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/devices", post(register_device).get(list_devices))
        .route("/devices/:id", delete(remove_device))
        .route("/devices/:id/heartbeat", post(heartbeat))
        .route("/devices/:id/claim", post(claim_device))
        .route("/sessions", post(create_session))
        .route("/sessions/:id/end", post(end_session))
        .route("/sessions/:id/signals", post(publish_signal).get(poll_signals))
        .route("/support/sessions", post(create_support_session))
        .route("/support/claim", post(claim_support_session))
        .route("/ice-config", get(ice_config_handler))
        .route("/ws/:session_id", get(signal_feed_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");

    info!("tether relay listening on {addr}");

    axum::serve(listener, app)
        .await
        .expect("server terminated unexpectedly");
}
