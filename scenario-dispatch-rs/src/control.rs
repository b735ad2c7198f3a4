//! Operator control endpoint
//!
//! Routes:
//! - `POST /admin/reload` rebuilds the snapshot and returns a `ReloadSummary`
//! - `GET /admin/status` reports the snapshot version and breaker states
//! - `GET /health` is ready once a configuration has been loaded
//! - `POST /v1/dispatch` runs a dispatch; streaming responses are NDJSON

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::dispatch::StreamEvent;
use crate::engine::{DispatchOutcome, DispatchRequest, ScenarioEngine};
use crate::error::{DispatchError, ErrorKind};
use crate::reload::{ReloadCoordinator, ReloadSummary};
use crate::resilience::{CircuitBreakerRegistry, CircuitSnapshot};
use crate::snapshot::SnapshotStore;

/// Shared handles for the control routes
#[derive(Clone)]
pub struct ControlState {
    pub reload: Arc<ReloadCoordinator>,
    pub snapshots: SnapshotStore,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub engine: Arc<ScenarioEngine>,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/admin/reload", post(reload))
        .route("/admin/status", get(status))
        .route("/health", get(health))
        .route("/v1/dispatch", post(dispatch))
        .with_state(state)
}

/// Error body returned by every route
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let (status, code) = match kind {
            ErrorKind::ConfigNotFound => (StatusCode::NOT_FOUND, "CONFIG_NOT_FOUND"),
            ErrorKind::FieldResolution => (StatusCode::UNPROCESSABLE_ENTITY, "FIELD_RESOLUTION"),
            ErrorKind::CircuitOpen => (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN"),
            ErrorKind::UpstreamTransient | ErrorKind::Upstream => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            ErrorKind::UpstreamPermanent => (StatusCode::BAD_GATEWAY, "UPSTREAM_REJECTED"),
            ErrorKind::Cancelled => (StatusCode::REQUEST_TIMEOUT, "CANCELLED"),
            ErrorKind::InvalidConfig => (StatusCode::CONFLICT, "INVALID_CONFIG"),
            ErrorKind::Store => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
            ErrorKind::Credential => (StatusCode::INTERNAL_SERVER_ERROR, "CREDENTIAL_ERROR"),
        };

        let context = self.0.context().map(|c| c.to_string());
        if status.is_server_error() {
            error!(code, error = %self.0, context = ?context, "Control request failed");
        }

        let body = json!({
            "error": {
                "code": code,
                "message": self.0.to_string(),
                "context": context,
            }
        });
        (status, Json(body)).into_response()
    }
}

async fn reload(State(state): State<ControlState>) -> Result<Json<ReloadSummary>, ApiError> {
    Ok(Json(state.reload.reload().await?))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    snapshot_version: u64,
    loaded_at: DateTime<Utc>,
    formats: usize,
    providers: usize,
    scenarios: Vec<String>,
    breakers: Vec<CircuitSnapshot>,
}

async fn status(State(state): State<ControlState>) -> Json<StatusResponse> {
    let snapshot = state.snapshots.load();
    Json(StatusResponse {
        snapshot_version: snapshot.version_id,
        loaded_at: snapshot.loaded_at,
        formats: snapshot.format_count(),
        providers: snapshot.provider_count(),
        scenarios: snapshot.scenarios().into_iter().map(str::to_string).collect(),
        breakers: state.breakers.snapshot(),
    })
}

async fn health(State(state): State<ControlState>) -> (StatusCode, Json<Value>) {
    let version = state.snapshots.version();
    if version == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "starting", "snapshot_version": version})),
        );
    }
    (StatusCode::OK, Json(json!({"status": "ok", "snapshot_version": version})))
}

async fn dispatch(
    State(state): State<ControlState>,
    Json(request): Json<DispatchRequest>,
) -> Result<Response, ApiError> {
    let cancel = CancellationToken::new();
    // Dropping the handler (client gone) cancels the dispatch
    let guard = cancel.clone().drop_guard();

    let outcome = state.engine.dispatch(request, cancel).await?;

    match outcome {
        DispatchOutcome::Complete {
            response,
            cache_key,
            snapshot_version,
            provider,
        } => {
            drop(guard.disarm());
            Ok(Json(json!({
                "response": response,
                "cache_key": cache_key,
                "snapshot_version": snapshot_version,
                "provider": provider.to_string(),
            }))
            .into_response())
        }
        DispatchOutcome::Streaming {
            stream: events,
            cache_key,
            snapshot_version,
            provider,
        } => {
            // The guard now lives as long as the response body
            let body = stream::unfold((events, guard), |(mut events, guard)| async move {
                let event = events.recv().await?;
                let line = encode_event(&event);
                Some((Ok::<_, Infallible>(line), (events, guard)))
            });

            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/x-ndjson")
                .header("X-Cache-Key", cache_key)
                .header("X-Snapshot-Version", snapshot_version.to_string())
                .header("X-Provider", provider.to_string())
                .body(Body::from_stream(body))
                .map_err(|e| DispatchError::invalid_config(format!("Failed to build response: {}", e)))?;
            Ok(response)
        }
    }
}

fn encode_event(event: &StreamEvent) -> String {
    let value = match event {
        StreamEvent::Chunk(data) => json!({"type": "chunk", "data": data}),
        StreamEvent::End => json!({"type": "end"}),
        StreamEvent::Error(err) => json!({"type": "error", "message": err.to_string()}),
        StreamEvent::Cancelled => json!({"type": "cancelled"}),
    };
    format!("{}\n", value)
}
