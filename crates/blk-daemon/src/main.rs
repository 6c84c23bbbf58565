//! blk-daemon entry point.
//!
//! Sets up tracing, loads config, picks the reservation store, starts the
//! sweeper and serves HTTP. Route handlers live in `routes.rs` and `ws.rs`;
//! shared state in `state.rs`.
//!
//! Usage: `blk-daemon [config.yaml ...]`. Files are merged left to right.

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use blk_config::{report_unused_keys, ConfigConsumer, LoadedConfig, UnusedKeyPolicy};
use blk_daemon::{routes, state::AppState};
use blk_reservation::{MemoryReservationStore, SystemClock};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience).
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    let loaded = if paths.is_empty() {
        LoadedConfig::empty()?
    } else {
        let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
        blk_config::load_layered_yaml(&refs)?
    };
    report_unused_keys(ConfigConsumer::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)?;
    let cfg = loaded.settings()?;
    info!(config_hash = %loaded.config_hash, "config loaded");

    let shared = match std::env::var(blk_db::ENV_DB_URL) {
        Ok(url) => {
            let pool = blk_db::connect(&url).await?;
            blk_db::migrate(&pool).await?;
            Arc::new(AppState::postgres(pool, &cfg)?)
        }
        Err(_) => {
            warn!(
                "{} not set; serving from the in-memory store. State is lost on exit",
                blk_db::ENV_DB_URL
            );
            Arc::new(AppState::in_memory(
                Arc::new(MemoryReservationStore::new()),
                Arc::new(SystemClock),
                &cfg,
            )?)
        }
    };

    let _sweeper = shared.sweeper.clone().spawn(cfg.sweep_interval());

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = cfg.bind_addr()?;
    info!("blk-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
