//! Local HTTP control surface and the websocket viewer endpoint.
//!
//! Routes:
//! - `GET /system?cmd=<int>&taskid=<u32>` applies a control command.
//! - `POST /stdin?taskid=<u32>` with `{"message": ...}` feeds the job's stdin.
//! - `GET /info` returns the task record.
//! - `GET /ws` attaches a live viewer.
//! - `GET /health` liveness probe.

use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant, MissedTickBehavior};

use crate::engine::{CommandOutcome, TaskEngine};
use crate::error::AgentError;
use crate::hub::{ViewerBatch, DEFAULT_VIEWER_QUEUE};
use crate::protocol::MessageKind;

const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-viewer delivery limits.
#[derive(Debug, Clone, Copy)]
pub struct ViewerOptions {
    /// Broadcast rounds a viewer may lag behind before it is dropped.
    pub queue: usize,
    /// Upper bound on a single websocket write.
    pub send_timeout: Duration,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            queue: DEFAULT_VIEWER_QUEUE,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

#[derive(Clone)]
struct ApiState {
    engine: TaskEngine,
    viewer: ViewerOptions,
}

#[derive(Debug, Deserialize)]
struct SystemQuery {
    cmd: i64,
    taskid: u32,
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    taskid: u32,
}

#[derive(Debug, Deserialize)]
struct StdinForm {
    message: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn api_router(engine: TaskEngine, viewer: ViewerOptions) -> Router {
    let state = ApiState { engine, viewer };
    Router::new()
        .route("/health", routing::get(api_health))
        .route("/info", routing::get(api_info))
        .route("/system", routing::get(api_system))
        .route("/stdin", routing::post(api_stdin))
        .route("/ws", routing::get(api_ws))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

fn success() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "success": true })))
}

fn failure(status: StatusCode, error: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
}

fn error_response(error: AgentError) -> (StatusCode, Json<Value>) {
    if let AgentError::WrongTaskId { expected, got } = &error {
        tracing::warn!(
            target = "task_agent::api",
            expected,
            got,
            "request for another task rejected"
        );
    }
    let status = if error.is_request_error() {
        StatusCode::BAD_REQUEST
    } else if matches!(error, AgentError::InterpreterGone) {
        StatusCode::CONFLICT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    failure(status, error)
}

async fn api_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "task-agent",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn api_info(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.engine.task())
}

async fn api_system(
    State(state): State<ApiState>,
    query: Result<Query<SystemQuery>, QueryRejection>,
) -> (StatusCode, Json<Value>) {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return error_response(AgentError::MalformedRequest(rejection.body_text()))
        }
    };
    match state.engine.apply_command(query.taskid, query.cmd).await {
        Ok(outcome) => {
            tracing::debug!(
                target = "task_agent::api",
                cmd = query.cmd,
                outcome = ?outcome,
                "control command handled"
            );
            if let CommandOutcome::Terminating = outcome {
                tracing::info!(target = "task_agent::api", "termination requested");
            }
            success()
        }
        Err(error) => error_response(error),
    }
}

async fn api_stdin(
    State(state): State<ApiState>,
    query: Result<Query<TaskQuery>, QueryRejection>,
    body: Result<Json<StdinForm>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return error_response(AgentError::MalformedRequest(rejection.body_text()))
        }
    };
    // A wrong task id is reported even when the body is also malformed.
    // `inject_stdin` repeats the check for callers outside this handler.
    if let Err(error) = state.engine.check_task_id(query.taskid) {
        return error_response(error);
    }
    let Json(form) = match body {
        Ok(form) => form,
        Err(rejection) => {
            return error_response(AgentError::MalformedRequest(rejection.body_text()))
        }
    };
    match state.engine.inject_stdin(query.taskid, &form.message).await {
        Ok(()) => success(),
        Err(error) => error_response(error),
    }
}

async fn api_ws(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer_ws(socket, state.engine, state.viewer))
}

// ---------------------------------------------------------------------------
// Viewer connection
// ---------------------------------------------------------------------------

async fn handle_viewer_ws(mut socket: WebSocket, engine: TaskEngine, options: ViewerOptions) {
    let (tx, mut rx) = mpsc::channel::<ViewerBatch>(options.queue.max(1));
    let Some(viewer) = engine.attach(tx) else {
        tracing::info!(target = "task_agent::api", "viewer refused, task has ended");
        let _ = timeout(options.send_timeout, socket.send(Message::Close(None))).await;
        return;
    };
    tracing::info!(target = "task_agent::api", viewer, "viewer connected");

    let mut ping_interval = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(batch) = batch else { break };
                let closing = batch.iter().any(|msg| msg.kind == MessageKind::Close);
                if send_batch(&mut socket, &batch, options.send_timeout).await.is_err() || closing {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = ping_interval.tick() => {
                let ping = socket.send(Message::Ping(Vec::new().into()));
                if !matches!(timeout(options.send_timeout, ping).await, Ok(Ok(()))) {
                    break;
                }
            }
        }
    }

    engine.detach(viewer);
    let _ = timeout(options.send_timeout, socket.send(Message::Close(None))).await;
    tracing::info!(target = "task_agent::api", viewer, "viewer disconnected");
}

async fn send_batch(
    socket: &mut WebSocket,
    batch: &ViewerBatch,
    send_timeout: Duration,
) -> Result<(), ()> {
    for message in batch {
        let text = message.to_json().map_err(|_| ())?;
        match timeout(send_timeout, socket.send(Message::Text(text.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::debug!(target = "task_agent::api", error = %error, "viewer send failed");
                return Err(());
            }
            Err(_) => {
                tracing::warn!(
                    target = "task_agent::api",
                    timeout_ms = send_timeout.as_millis() as u64,
                    "viewer send timed out"
                );
                return Err(());
            }
        }
    }
    Ok(())
}
