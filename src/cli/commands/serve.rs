//! HTTP API server for chat front ends.
//!
//! Exposes chat turns (whole or streamed as server-sent events), feedback,
//! per-session workflow state and the tool catalog.

use crate::agent::{RecordedTurn, TurnFragment, TurnOutcome, TurnStatus};
use crate::cli::Output;
use crate::config::Settings;
use crate::error::ReferatError;
use crate::feedback::{FeedbackDelivery, FeedbackSignal, Rating};
use crate::orchestrator::Orchestrator;
use crate::workflow::WorkflowState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state.
struct AppState {
    orchestrator: Orchestrator,
}

/// Run the HTTP API server.
pub async fn run_serve(host: &str, port: u16, settings: Settings) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(settings).await?;
    let state = Arc::new(AppState { orchestrator });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/tools", get(list_tools))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/sessions/{session_id}", delete(end_session))
        .route("/sessions/{session_id}/feedback", post(feedback))
        .route("/sessions/{session_id}/workflow", get(workflow))
        .layer(cors)
        .with_state(state.clone());

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    Output::header("Referat API Server");
    println!();
    Output::success(&format!("Listening on http://{}", addr));
    println!();
    println!("Endpoints:");
    Output::kv("Health", "GET    /health");
    Output::kv("Tools", "GET    /tools");
    Output::kv("Chat", "POST   /chat");
    Output::kv("Chat (SSE)", "POST   /chat/stream");
    Output::kv("Feedback", "POST   /sessions/:session_id/feedback");
    Output::kv("Workflow", "GET    /sessions/:session_id/workflow");
    Output::kv("End session", "DELETE /sessions/:session_id");
    println!();
    Output::info("Press Ctrl+C to stop the server.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    state.orchestrator.shutdown().await;
    Ok(())
}

// === Request/Response Types ===

#[derive(Deserialize)]
struct ChatRequest {
    /// Omit to start a new session.
    #[serde(default)]
    session_id: Option<String>,
    message: String,
}

#[derive(Serialize)]
struct ChatResponse {
    session_id: String,
    status: TurnStatus,
    answer: String,
    /// Progress lines emitted while the turn ran.
    progress: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn: Option<RecordedTurn>,
}

#[derive(Serialize)]
struct TurnSummary {
    status: TurnStatus,
    iterations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    turn: Option<RecordedTurn>,
}

impl From<&TurnOutcome> for TurnSummary {
    fn from(outcome: &TurnOutcome) -> Self {
        Self {
            status: outcome.status,
            iterations: outcome.iterations,
            turn: outcome.recorded.clone(),
        }
    }
}

#[derive(Deserialize)]
struct FeedbackRequest {
    /// Defaults to the most recent turn.
    #[serde(default)]
    turn_index: Option<usize>,
    rating: String,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Serialize)]
struct FeedbackResponse {
    delivery: &'static str,
    target: String,
}

#[derive(Serialize)]
struct ToolInfo {
    name: String,
    description: String,
    mode: String,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn status_for(error: &ReferatError) -> StatusCode {
    match error {
        ReferatError::NotFound(_) => StatusCode::NOT_FOUND,
        ReferatError::InvalidArguments { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// === Handlers ===

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_tools(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tools: Vec<ToolInfo> = state
        .orchestrator
        .registry()
        .list_all()
        .iter()
        .map(|t| ToolInfo {
            name: t.name.clone(),
            description: t.description.clone(),
            mode: t.mode().to_string(),
            parameters: t.schema.to_json_schema(),
        })
        .collect();
    Json(tools)
}

async fn chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Response {
    if req.message.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "message must not be empty");
    }
    let session = match &req.session_id {
        Some(id) => state.orchestrator.session(id).await,
        None => state.orchestrator.new_session().await,
    };
    info!("Chat turn for session {}", session.id());

    let mut stream = session.send(&req.message);
    let mut progress = Vec::new();
    while let Some(fragment) = stream.next_fragment().await {
        match fragment {
            TurnFragment::Progress(message) => progress.push(message),
            TurnFragment::Answer(_) | TurnFragment::Error(_) => {}
            TurnFragment::Completed(outcome) => {
                return Json(ChatResponse {
                    session_id: session.id().to_string(),
                    status: outcome.status,
                    answer: outcome.answer,
                    progress,
                    turn: outcome.recorded,
                })
                .into_response();
            }
        }
    }
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "turn ended without an outcome")
}

async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = match &req.session_id {
        Some(id) => state.orchestrator.session(id).await,
        None => state.orchestrator.new_session().await,
    };
    let opened = Event::default().event("session").data(session.id());

    let fragments = session.send(&req.message).map(|fragment| {
        let event = match fragment {
            TurnFragment::Progress(message) => Event::default().event("progress").data(message),
            TurnFragment::Answer(text) => Event::default().event("answer").data(text),
            TurnFragment::Error(message) => Event::default().event("error").data(message),
            TurnFragment::Completed(outcome) => {
                let summary = serde_json::to_string(&TurnSummary::from(&outcome)).unwrap_or_default();
                Event::default().event("done").data(summary)
            }
        };
        Ok(event)
    });

    Sse::new(futures::stream::once(async { Ok(opened) }).chain(fragments)).keep_alive(KeepAlive::default())
}

async fn feedback(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<FeedbackRequest>,
) -> Response {
    let Some(session) = state.orchestrator.existing_session(&session_id).await else {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown session: {}", session_id));
    };
    let Some(rating) = Rating::parse(&req.rating) else {
        return error_response(StatusCode::BAD_REQUEST, format!("Unknown rating: {}", req.rating));
    };
    let Some(turn) = req.turn_index.or_else(|| session.last_turn_index()) else {
        return error_response(StatusCode::NOT_FOUND, "This session has no answered turns yet");
    };

    match session.feedback(turn, &FeedbackSignal::new(rating, req.comment)).await {
        Ok(delivery) => {
            let (delivery, target) = match delivery {
                FeedbackDelivery::Direct { run_id } => ("direct", run_id),
                FeedbackDelivery::Correlated { run_id } => ("correlated", run_id),
                FeedbackDelivery::BestEffort { token } => ("best_effort", token),
            };
            Json(FeedbackResponse { delivery, target }).into_response()
        }
        Err(e) => error_response(status_for(&e), e),
    }
}

async fn workflow(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> Response {
    if state.orchestrator.existing_session(&session_id).await.is_none() {
        return Json(WorkflowState::default()).into_response();
    }
    match state
        .orchestrator
        .workflow()
        .handle(&session_id)
        .and_then(|h| h.snapshot())
    {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(status_for(&e), e),
    }
}

async fn end_session(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> impl IntoResponse {
    state.orchestrator.end_session(&session_id).await;
    StatusCode::NO_CONTENT
}
