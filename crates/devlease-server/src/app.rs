use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};

use devlease::{AuthenticationError, Credentials, Hub, Principal, PrincipalResolver};
use devlease_protocol::{BookingRequest, BookingResponse, CalendarEntry, ClientEvent, ServerEvent};

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub resolver: Arc<PrincipalResolver>,
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/bookings", get(list_bookings).post(create_booking))
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

/// GET /api/bookings - Calendar of recent and upcoming reservations. Public.
async fn list_bookings(State(state): State<AppState>) -> Result<Json<Vec<CalendarEntry>>, ApiError> {
    Ok(Json(state.hub.calendar().await?))
}

/// POST /api/bookings - Reserve a slot for the bearer's identity.
async fn create_booking(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<BookingRequest>, JsonRejection>,
) -> Result<Json<BookingResponse>, ApiError> {
    let authorization = authorization(&headers);
    if Credentials::from_authorization(authorization).token.is_none() {
        return Err(AuthenticationError::MissingCredentials.into());
    }
    let principal = state.resolver.resolve_request(authorization).await?;

    let Json(request) = body.map_err(|rejection| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            rejection.body_text(),
        )
    })?;

    let reservation = state.hub.book(&principal, request).await?;
    Ok(Json(BookingResponse {
        success: true,
        id: reservation.id,
    }))
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.hub.broker().session_count(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub api_key: Option<String>,
    pub token: Option<String>,
}

/// GET /ws - Authenticate, then upgrade to the real-time channel.
///
/// The principal is fixed here for the whole life of the connection. A bad
/// token is refused before the upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let creds = Credentials {
        device_key: query.api_key,
        token: query
            .token
            .or_else(|| Credentials::from_authorization(authorization(&headers)).token),
    };

    let principal = match state.resolver.resolve(&creds).await {
        Ok(principal) => principal,
        Err(err) => {
            return ApiError::new(StatusCode::UNAUTHORIZED, "invalid_token", err.to_string())
                .into_response();
        }
    };

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, principal))
}

/// One connection: a write task drains the session queue into the socket
/// while this task feeds inbound events to the hub.
async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, principal: Principal) {
    let (session, mut events) = hub.open_session(principal);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let write_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode server event: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(session = %session.id(), "ws read error: {e}");
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => hub.dispatch(&session, event).await,
                Err(e) => {
                    hub.broker().unicast(
                        session.id(),
                        ServerEvent::Error {
                            message: format!("invalid message: {e}"),
                        },
                    );
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.close_session(&session);
    write_task.abort();
}
