//! Loopback endpoint.
//!
//! `POST <loopback.path>` with `{"token": "<session>"}` replies immediately
//! and runs the session afterwards on a background task. The reserved token
//! `__ping__` echoes the stored ping value instead, which lets discovery
//! confirm that an address reaches this instance.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::orchestrator::fork_manager::{ForkManager, EXECUTION_KEY};
use crate::orchestrator::loopback::{AcceptedResponse, LoopbackRequest, PingResponse, PING_TOKEN};
use crate::persistence::config_repo::{ConfigRepo, KEY_LOOPBACK_PING};
use crate::{AppError, Result};

/// Shared state of the endpoint.
pub struct EndpointState {
    /// Runs accepted sessions.
    pub fork: Arc<ForkManager>,
    /// Source of the ping value.
    pub store: ConfigRepo,
}

type Rejection = (StatusCode, Json<Value>);

fn reject(status: StatusCode, message: impl Into<String>) -> Rejection {
    (status, Json(json!({ "error": message.into() })))
}

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

async fn accept(
    State(state): State<Arc<EndpointState>>,
    Json(request): Json<LoopbackRequest>,
) -> std::result::Result<Response, Rejection> {
    if request.token.is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "token must not be empty"));
    }

    if request.token == PING_TOKEN {
        let ping = state.store.get(KEY_LOOPBACK_PING).await.map_err(|err| {
            warn!(%err, "failed to read ping value");
            reject(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        })?;
        return Ok(Json(PingResponse { ping }).into_response());
    }

    let token = request.token;
    let fork = Arc::clone(&state.fork);
    let session = token.clone();
    tokio::spawn(async move {
        let mut metadata = Map::new();
        metadata.insert(EXECUTION_KEY.into(), json!("loopback"));
        match fork.run_session(&session, metadata).await {
            Ok(report) => info!(session = %session, status = ?report.status, "loopback session finished"),
            Err(AppError::AsyncProcess(reason)) => {
                info!(session = %session, reason = %reason, "loopback session not runnable");
            }
            Err(err) => error!(session = %session, %err, "loopback session failed"),
        }
    });

    Ok(Json(AcceptedResponse {
        token,
        accepted: true,
    })
    .into_response())
}

/// Router serving the loopback route at `path` plus `/health`.
pub fn router(state: Arc<EndpointState>, path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(path, post(accept))
        .with_state(state)
}

/// Serve the endpoint on `127.0.0.1:port` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails to bind.
pub async fn serve(
    state: Arc<EndpointState>,
    path: &str,
    port: u16,
    ct: CancellationToken,
) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind loopback endpoint on {bind}: {err}")))?;

    info!(%bind, path, "starting loopback endpoint");

    axum::serve(listener, router(state, path))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("loopback endpoint error: {err}")))?;

    info!("loopback endpoint shut down");
    Ok(())
}
