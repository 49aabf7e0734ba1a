use crate::controller::{RunController, Subscription};
use crate::errors::AppError;
use crate::models::{
    ClearLogsFilters, ClearLogsResponse, HealthResponse, RunDetail, SearchFilters, StartRunPayload,
};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;

#[derive(Clone)]
struct AppState {
    controller: RunController,
}

pub fn router(controller: RunController) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route(
            "/api/runs",
            get(search_runs).post(start_run).delete(clear_runs),
        )
        .route("/api/runs/active", get(list_active))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/rerun", post(rerun))
        .route("/ws", get(events_socket))
        .with_state(AppState { controller })
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotRunning(_) => StatusCode::CONFLICT,
            AppError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.code(), "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        active_runs: state.controller.list_active().len(),
        subscribers: state.controller.subscriber_count(),
    })
}

async fn start_run(
    State(state): State<AppState>,
    Json(payload): Json<StartRunPayload>,
) -> (StatusCode, Json<RunDetail>) {
    (StatusCode::CREATED, Json(state.controller.start_run(payload)))
}

async fn search_runs(
    State(state): State<AppState>,
    Query(filters): Query<SearchFilters>,
) -> Json<Vec<RunDetail>> {
    Json(state.controller.search(&filters))
}

async fn list_active(State(state): State<AppState>) -> Json<Vec<RunDetail>> {
    Json(state.controller.list_active())
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, AppError> {
    state.controller.query(&run_id).map(Json)
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, AppError> {
    state.controller.cancel(&run_id).map(Json)
}

async fn rerun(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<(StatusCode, Json<RunDetail>), AppError> {
    let detail = state.controller.rerun(&run_id)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn clear_runs(
    State(state): State<AppState>,
    Query(filters): Query<ClearLogsFilters>,
) -> Json<ClearLogsResponse> {
    Json(ClearLogsResponse {
        removed: state.controller.clear(filters.older_than),
    })
}

async fn events_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state.controller))
}

/// One client's push channel: snapshot first, then live events until either side
/// goes away.
async fn stream_events(socket: WebSocket, controller: RunController) {
    let Subscription { id, mut events } = controller.subscribe();
    let (mut sink, mut incoming) = socket.split();

    let mut forward = tokio::spawn(async move {
        while let Some(envelope) = events.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut forward => break,
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    forward.abort();
    controller.unsubscribe(id);
}
