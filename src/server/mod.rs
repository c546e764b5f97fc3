// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `POST /api/chat` - Ask a question about the subject
//! - `POST /api/ask` - Same handler, older path kept for existing widgets
//!
//! # Example
//!
//! ```no_run
//! use askgate::config::GatewayConfig;
//! use askgate::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(GatewayConfig::default()).with_port(8787);
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::GatewayConfig;
use crate::errors::{ApiResult, UserError};
use crate::orchestrator::{CompletionOrchestrator, OriginPolicy};
use crate::upstream::{CompletionBackend, OpenAiClient};

/// Server state shared across handlers.
pub struct AppState<B> {
    orchestrator: CompletionOrchestrator<B>,
    max_body_bytes: usize,
    started: Instant,
}

/// Gateway server.
#[derive(Debug, Clone)]
pub struct Server {
    config: GatewayConfig,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

impl Server {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    /// Set the bind address.
    /// Use "127.0.0.1" for localhost only.
    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.config.server.bind = addr.into();
        self
    }

    pub fn port(&self) -> u16 {
        self.config.server.port
    }

    pub fn bind_address(&self) -> &str {
        &self.config.server.bind
    }

    /// Build the router against the configured OpenAI-compatible upstream.
    pub fn build_router(&self) -> Result<Router> {
        let client = OpenAiClient::new(&self.config.upstream)?;
        if !client.is_configured() {
            tracing::warn!("No upstream API key configured; admitted questions will fail with 502");
        }
        let orchestrator = CompletionOrchestrator::from_config(&self.config, client)?;
        Ok(build_router(orchestrator, self.config.server.max_body_bytes))
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router()?;
        let addr = format!("{}:{}", self.config.server.bind, self.config.server.port);

        self.config.log_summary();
        tracing::info!("Starting server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Stop the other process or pick another port with --port <PORT>",
                    self.config.server.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

/// Router over any completion backend.
pub fn build_router<B: CompletionBackend>(orchestrator: CompletionOrchestrator<B>, max_body_bytes: usize) -> Router {
    let cors = cors_layer(orchestrator.origins());
    let state = Arc::new(AppState {
        orchestrator,
        max_body_bytes,
        started: Instant::now(),
    });

    Router::new()
        .route("/health", get(health_handler::<B>))
        .route("/api/chat", post(ask_handler::<B>))
        .route("/api/ask", post(ask_handler::<B>))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &OriginPolicy) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.is_open() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .origins()
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring unparseable allowed origin for CORS");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health_handler<B: CompletionBackend>(State(state): State<Arc<AppState<B>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn ask_handler<B: CompletionBackend>(
    State(state): State<Arc<AppState<B>>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<Response> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            UserError::payload_too_large(state.max_body_bytes as u64)
        } else {
            UserError::invalid_request(
                "Request body could not be read.",
                Some("malformed_body"),
                None,
                Some(&rejection.body_text()),
            )
        }
    })?;

    let reply = state.orchestrator.handle(&headers, &body).await?;
    Ok(Json(reply.body()).into_response())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
                    }
                }
            }
            _ => {
                tracing::error!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }

    tracing::info!("Shutting down server");
}
