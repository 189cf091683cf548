//! ctr-daemon entry point.
//!
//! Thin: sets up tracing, loads config, wires the back ends into the engine,
//! starts the background tasks and serves the router. Handlers live in
//! `routes.rs`; shared state and tasks in `state.rs`.

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use ctr_daemon::{bootstrap, routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

/// Comma-separated YAML paths, merged in order.
const ENV_CONFIG_PATHS: &str = "CTR_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let loaded = load_config()?;
    let cfg = loaded.service()?;
    let secrets = ctr_config::secrets::resolve_secrets(&cfg)?;
    info!(config_hash = %loaded.config_hash, ?secrets, "config loaded");

    let engine = bootstrap::build_engine(&cfg, &secrets).await?;
    let shared = Arc::new(state::AppState::new(engine.clone()));

    state::spawn_heartbeat(shared.bus.clone(), cfg.daemon.heartbeat_interval());
    state::spawn_event_forwarder(Arc::clone(&shared));
    state::spawn_pending_resumer(engine, cfg.engine.resume_interval());
    state::spawn_drift_tick(Arc::clone(&shared), cfg.engine.drift_check_interval());

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = cfg.daemon.bind;
    info!("ctr-daemon listening on http://{}", addr);

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

fn load_config() -> anyhow::Result<ctr_config::LoadedConfig> {
    match std::env::var(ENV_CONFIG_PATHS) {
        Ok(raw) if !raw.trim().is_empty() => {
            let paths: Vec<&str> = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect();
            ctr_config::load_layered_yaml(&paths)
        }
        _ => {
            info!("{ENV_CONFIG_PATHS} not set; using built-in defaults (sim ledger, memory index)");
            ctr_config::load_layered_yaml_from_strings(&["{}"])
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
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
