//! HTTP surface: one SSE stream per comparison session.

use crate::error::ArenaError;
use crate::events::{DEFAULT_EVENT_BUFFER, EventEmitter, STREAM_TERMINATOR};
use crate::models::ModelDescriptor;
use crate::orchestrator::Orchestrator;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared by every request; read-only after startup
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

type AppStateArc = Arc<AppState>;

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelDescriptor>,
}

pub fn router(state: AppStateArc) -> Router {
    Router::new()
        .route("/api/compare", post(compare))
        .route("/api/models", get(list_models))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn compare(
    State(state): State<AppStateArc>,
    Json(req): Json<CompareRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, (StatusCode, Json<ErrorResponse>)>
{
    let request = state.orchestrator.request(req.prompt).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    let (emitter, rx) = EventEmitter::channel(DEFAULT_EVENT_BUFFER);
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.run_session(request, emitter).await {
            Ok(report) => info!(
                runs = report.runs.len(),
                total_cost = report.total_cost,
                "session stream finished"
            ),
            Err(ArenaError::Disconnected) => info!("client disconnected; session abandoned"),
            Err(err) => error!(error = %err, "session aborted"),
        }
    });

    let frames = ReceiverStream::new(rx)
        .map(|event| Event::default().json_data(event))
        .chain(stream::once(async {
            Ok(Event::default().data(STREAM_TERMINATOR))
        }));

    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}

async fn list_models(State(state): State<AppStateArc>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.orchestrator.models().to_vec(),
    })
}

async fn health_check() -> &'static str {
    "ok"
}

/// Bind and serve until the process is stopped
pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", bind);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
