// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP surface: `POST /responses` and `GET /health`.
//!
//! Callers address a session with `agent_kwargs.session_id` or the
//! `X-Session-Id` header.  When `CUA_API_KEY` is configured, requests must
//! carry it in `X-API-Key`.  All failures come back as structured replies;
//! the handler never surfaces an exception.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{Dispatcher, ResponsesReply, ResponsesRequest};

/// Screenshot-bearing requests are large; cap bodies at 32 MiB.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

struct AppState {
    dispatcher: Arc<Dispatcher>,
    api_key: Option<String>,
}

pub fn router(dispatcher: Arc<Dispatcher>, api_key: Option<String>) -> Router {
    let state = Arc::new(AppState { dispatcher, api_key });
    Router::new()
        .route("/responses", post(responses))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shutdown token fires.
pub async fn serve(
    host: &str,
    port: u16,
    dispatcher: Arc<Dispatcher>,
    api_key: Option<String>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "http proxy listening");
    axum::serve(listener, router(dispatcher, api_key))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ResponsesRequest>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    if let Some(expected) = &state.api_key {
        let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ResponsesReply::failed("invalid or missing X-API-Key")),
            );
        }
    }

    let Json(mut request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ResponsesReply::failed(format!("invalid request body: {rejection}"))),
            )
        }
    };

    // Header fallback for the session id.
    if request.agent_kwargs.session_id.is_none() {
        if let Some(id) = headers.get("x-session-id").and_then(|v| v.to_str().ok()) {
            request.agent_kwargs.session_id = Some(id.to_string());
        }
    }

    let reply = state.dispatcher.dispatch(request).await;
    (StatusCode::OK, Json(reply))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.dispatcher.healthy().await {
        (StatusCode::OK, Json(json!({ "status": "healthy" })))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unhealthy" })))
    }
}
