//! # hubbub-server
//!
//! Gateway server binary — constructs one [`Gateway`] with HTTP-backed
//! collaborators and serves the realtime endpoint next to health, metrics and
//! the rate-limited magic-link proxy.
//!
//! The gateway instance is built here and passed by reference to everything
//! that needs it; there is no global accessor.

#![deny(unsafe_code)]

mod collaborators;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{FromRef, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use hubbub_core::events::ServerEvent;
use hubbub_core::ids::WorkspaceId;
use hubbub_gateway::auth::{JwtCredentialVerifier, MagicLinkIssuer};
use hubbub_gateway::config::GatewayConfig;
use hubbub_gateway::gateway::Gateway;
use hubbub_gateway::metrics;
use hubbub_gateway::rate_limit::{RateLimiterConfig, SlidingWindow, preauth_rate_limit};
use hubbub_gateway::websocket::ws_handler;

use crate::collaborators::BackendClient;

/// hubbub realtime gateway server.
#[derive(Parser, Debug)]
#[command(name = "hubbub-server", about = "hubbub realtime gateway")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, default_value_t = 4000)]
    port: u16,

    /// Base URL of the CRUD backend's internal API.
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    backend_url: String,

    /// HS256 secret for verifying bearer tokens (falls back to $JWT_SECRET).
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// Optional gateway config file (JSON, partial keys allowed).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shared secret for the backend's publish ingress; the route stays off
    /// without it.
    #[arg(long, env = "INTERNAL_TOKEN", hide_env_values = true)]
    internal_token: Option<String>,
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    metrics: PrometheusHandle,
    issuer: Arc<dyn MagicLinkIssuer>,
    internal_token: Option<String>,
}

impl FromRef<AppState> for Arc<Gateway> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.gateway)
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    match path {
        None => Ok(GatewayConfig::default()),
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct MagicLinkRequest {
    email: String,
}

async fn request_magic_link(
    State(state): State<AppState>,
    Json(request): Json<MagicLinkRequest>,
) -> Response {
    match state.issuer.issue(&request.email).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(error = %e, "magic link issuance failed");
            (StatusCode::BAD_GATEWAY, "magic link issuance failed").into_response()
        }
    }
}

/// Publish ingress for the CRUD backend: hub created, member lifecycle, room
/// presence. Guarded by a shared secret; disabled entirely when none is
/// configured.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    workspace_id: u64,
    event: ServerEvent,
}

async fn publish_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Response {
    let Some(expected) = state.internal_token.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let provided = headers
        .get("x-internal-token")
        .and_then(|value| value.to_str().ok());
    if provided != Some(expected) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state
        .gateway
        .publish_to_workspace(WorkspaceId::new(request.workspace_id), &request.event);
    StatusCode::ACCEPTED.into_response()
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    metrics::render(&state.metrics)
}

async fn healthz() -> &'static str {
    "ok"
}

fn build_router(state: AppState, limiter: Arc<SlidingWindow<IpAddr>>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/internal/events", post(publish_event))
        .route(
            "/api/auth/magic-link",
            post(request_magic_link)
                .layer(axum::middleware::from_fn_with_state(limiter, preauth_rate_limit)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hubbub=info,hubbub_server=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let prometheus = metrics::install_recorder();

    let backend = Arc::new(BackendClient::new(cli.backend_url.clone()));
    let verifier = Arc::new(JwtCredentialVerifier::new(cli.jwt_secret.as_bytes()));
    let gateway = Gateway::spawn(
        config,
        verifier,
        Arc::clone(&backend) as Arc<dyn hubbub_gateway::auth::MembershipDirectory>,
        Arc::clone(&backend) as Arc<dyn hubbub_gateway::auth::MessageStore>,
    );

    let magic_link_limiter: Arc<SlidingWindow<IpAddr>> =
        Arc::new(SlidingWindow::new(RateLimiterConfig::magic_link()));
    let state = AppState {
        gateway,
        metrics: prometheus,
        issuer: backend,
        internal_token: cli.internal_token.clone(),
    };
    let app = build_router(state, magic_link_limiter);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, backend = %cli.backend_url, "hubbub gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
