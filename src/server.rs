//! HTTP transport for the runner.
//!
//! - `POST /v1/run`: JSON [`RunRequest`]; the response body streams one JSON
//!   [`WireEvent`] per line until the session ends. The request id is also
//!   returned in the `x-request-id` header.
//! - `POST /v1/stop`: JSON [`StopRequest`]; `204` on success, otherwise a
//!   [`Problem`] with `NOT_FOUND` (404) or `INTERNAL` (500).
//! - `GET /healthz`

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::runner::{OutboundEvent, RunRequest, Runner, StopError, StopRequest, WireEvent};

/// Header carrying the request id of a run.
pub(crate) const REQUEST_ID_HEADER: &str = "x-request-id";

const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
struct AppState {
    runner: Runner,
}

/// Error body of a failed stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Problem {
    pub code: String,
    pub message: String,
}

impl IntoResponse for StopError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            StopError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            StopError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        let problem = Problem {
            code: code.to_string(),
            message: self.to_string(),
        };
        (status, Json(problem)).into_response()
    }
}

pub(crate) fn router(runner: Runner) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/run", post(run))
        .route("/v1/stop", post(stop))
        .with_state(AppState { runner })
}

/// Serve until `shutdown` fires, then wait for open streams to finish.
pub(crate) async fn serve(
    listener: TcpListener,
    runner: Runner,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!(%addr, "Listening");

    axum::serve(listener, router(runner))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "activeSessions": state.runner.active_sessions(),
    }))
}

async fn run(State(state): State<AppState>, Json(request): Json<RunRequest>) -> Response {
    let (request_id, events) = state.runner.run(request);
    debug!(request_id = %request_id, "Streaming run events");

    (
        [(header::CONTENT_TYPE, NDJSON)],
        [(REQUEST_ID_HEADER, request_id)],
        Body::from_stream(ndjson(events)),
    )
        .into_response()
}

async fn stop(
    State(state): State<AppState>,
    Json(request): Json<StopRequest>,
) -> Result<StatusCode, StopError> {
    state
        .runner
        .stop(&request.request_id, request.force)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// One JSON document per event, newline-terminated. Dropping the stream
/// drops the receiver, which the session sees as a disconnect.
fn ndjson(
    events: mpsc::Receiver<OutboundEvent>,
) -> impl Stream<Item = Result<Bytes, serde_json::Error>> + Send + 'static {
    ReceiverStream::new(events).map(|event| {
        serde_json::to_vec(&WireEvent::from(event)).map(|mut line| {
            line.push(b'\n');
            Bytes::from(line)
        })
    })
}
