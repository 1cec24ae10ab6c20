use super::{LoadNumbersRequest, SelectCallerIdRequest, SetBudgetRequest, SetDelayRequest};
use crate::app::AppState;
use crate::sequencer::DialerError;
use crate::validator;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use tracing::debug;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dialer/start", post(start_dialer))
        .route("/dialer/pause", post(pause_dialer))
        .route("/dialer/resume", post(resume_dialer))
        .route("/dialer/stop", post(stop_dialer))
        .route("/dialer/state", get(get_state))
        .route("/dialer/numbers", post(load_numbers).delete(clear_numbers))
        .route("/dialer/numbers/{index}", delete(remove_number))
        .route("/dialer/delay", put(set_delay))
        .route("/dialer/budget", put(set_budget))
        .route("/dialer/caller-id", put(select_caller_id))
        .route("/dialer/events", get(ws_events))
}

impl IntoResponse for DialerError {
    fn into_response(self) -> Response {
        let status = match &self {
            DialerError::CallAlreadyActive
            | DialerError::NumberLocked { .. }
            | DialerError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

async fn start_dialer(State(state): State<AppState>) -> Result<Response, DialerError> {
    state.controller.start().await?;
    Ok(Json(state.controller.view()).into_response())
}

async fn pause_dialer(State(state): State<AppState>) -> Result<Response, DialerError> {
    state.controller.pause()?;
    Ok(Json(state.controller.view()).into_response())
}

async fn resume_dialer(State(state): State<AppState>) -> Result<Response, DialerError> {
    state.controller.resume().await?;
    Ok(Json(state.controller.view()).into_response())
}

async fn stop_dialer(State(state): State<AppState>) -> Response {
    state.controller.stop();
    Json(state.controller.view()).into_response()
}

async fn get_state(State(state): State<AppState>) -> Response {
    Json(state.controller.view()).into_response()
}

async fn load_numbers(
    State(state): State<AppState>,
    Json(params): Json<LoadNumbersRequest>,
) -> Result<Response, DialerError> {
    let submitted = params.phone_numbers.len();
    let accepted = state
        .controller
        .load_numbers(params.phone_numbers, params.file_name)?;
    Ok(Json(serde_json::json!({
        "accepted": accepted,
        "rejected": submitted - accepted,
    }))
    .into_response())
}

async fn clear_numbers(State(state): State<AppState>) -> Response {
    state.controller.clear_numbers();
    Json(state.controller.view()).into_response()
}

async fn remove_number(
    State(state): State<AppState>,
    Path(index): Path<usize>,
) -> Result<Response, DialerError> {
    state.controller.remove_number(index)?;
    Ok(Json(state.controller.view()).into_response())
}

async fn set_delay(
    State(state): State<AppState>,
    Json(params): Json<SetDelayRequest>,
) -> Response {
    state.controller.set_delay(params.delay_seconds);
    Json(state.controller.view()).into_response()
}

async fn set_budget(
    State(state): State<AppState>,
    Json(params): Json<SetBudgetRequest>,
) -> Result<Response, DialerError> {
    state
        .controller
        .set_call_duration_budget(params.call_duration_budget_seconds)?;
    Ok(Json(state.controller.view()).into_response())
}

async fn select_caller_id(
    State(state): State<AppState>,
    Json(params): Json<SelectCallerIdRequest>,
) -> Response {
    let number = match params.phone_number {
        Some(raw) => match validator::validate(&raw) {
            Ok(number) => Some(number),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": e.to_string() })),
                )
                    .into_response()
            }
        },
        None => None,
    };
    match state.controller.select_caller_id(number).await {
        Ok(_) => Json(state.controller.view()).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Stream dialer events to the UI as JSON text frames.
async fn ws_events(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(socket: WebSocket, state: AppState) {
    let mut events = state.event_sender.subscribe();
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            _ = state.token.cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!("events socket error: {}", e);
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(_) => continue,
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "events socket lagged");
                    continue;
                }
                Err(_) => break,
            },
        }
    }
    debug!("events socket closed");
}
