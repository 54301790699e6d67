//! Route handlers.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use serde_json::Value;

use crate::error::GatewayError;
use crate::http::AppState;
use crate::http::wire::{ApiError, GatewayRequest, GatewayResponse, ServerList};
use crate::protocol;
use crate::server::health::HealthReport;

pub const SESSION_HEADER: &str = "mcp-session-id";

/// Interval between keep-alive comments on the event stream.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Log a failed request, count it, and shape it for the client.
fn reject(state: &AppState, error: GatewayError, request_id: Option<Value>) -> ApiError {
    tracing::warn!(
        server = error.server_id().unwrap_or("-"),
        request_id = ?request_id,
        error_code = error.code().as_str(),
        error = %error,
        "request failed"
    );
    state.registry.metrics().record_request_failure(&error);
    ApiError::from(error).with_request_id(request_id)
}

fn check_payload(state: &AppState, payload: &Value) -> Result<(), ApiError> {
    if payload.is_object() || payload.is_array() {
        Ok(())
    } else {
        Err(reject(
            state,
            GatewayError::InvalidRequest("payload must be a JSON object or array".into()),
            None,
        ))
    }
}

fn session_header(session_id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(session_id).ok()
}

pub async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.registry.health().await)
}

pub async fn servers(State(state): State<AppState>) -> Json<ServerList> {
    Json(ServerList {
        servers: state.registry.statuses().await,
    })
}

/// `POST /rpc`: server id and payload in the body.
pub async fn rpc(
    State(state): State<AppState>,
    body: Result<Json<GatewayRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        body.map_err(|e| reject(&state, GatewayError::InvalidRequest(e.body_text()), None))?;
    check_payload(&state, &request.payload)?;

    let request_id = protocol::request_id(&request.payload).cloned();
    match state.registry.dispatch(&request.server_id, request.payload).await {
        Ok(Some(payload)) => Ok(Json(GatewayResponse {
            server_id: request.server_id,
            payload,
        })
        .into_response()),
        Ok(None) => Ok(StatusCode::ACCEPTED.into_response()),
        Err(e) => Err(reject(&state, e, request_id)),
    }
}

/// `POST /<server_id>/rpc`: the body is the protocol message itself.
pub async fn direct_rpc(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) =
        body.map_err(|e| reject(&state, GatewayError::InvalidRequest(e.body_text()), None))?;
    check_payload(&state, &payload)?;

    let request_id = protocol::request_id(&payload).cloned();
    let initialize = protocol::is_initialize(&payload);

    match state.registry.dispatch(&server_id, payload).await {
        Ok(Some(reply)) => {
            let mut response = Json(reply).into_response();
            if initialize {
                let server = state
                    .registry
                    .get(&server_id)
                    .map_err(|e| reject(&state, e, request_id.clone()))?;
                if let Some(value) = session_header(&server.session_id().await) {
                    response.headers_mut().insert(SESSION_HEADER, value);
                }
            }
            Ok(response)
        }
        Ok(None) => Ok(StatusCode::ACCEPTED.into_response()),
        Err(e) => Err(reject(&state, e, request_id)),
    }
}

/// True unless an `Accept` header is present and rules out an event stream.
fn accepts_event_stream(headers: &HeaderMap) -> bool {
    let values: Vec<&str> = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        return true;
    }
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(|range| range.split(';').next().unwrap_or("").trim())
        .any(|range| {
            range.eq_ignore_ascii_case("text/event-stream")
                || range.eq_ignore_ascii_case("text/*")
                || range == "*/*"
        })
}

/// Logs when the client goes away and axum drops the stream.
struct StreamGuard {
    server_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        tracing::info!(server = %self.server_id, "event stream closed");
    }
}

/// One comment right away, then one every `period`.
fn keep_alive_stream(
    server_id: String,
    period: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let guard = StreamGuard { server_id };
    let ticker = tokio::time::interval(period);
    futures::stream::unfold((ticker, guard), |(mut ticker, guard)| async move {
        // the first tick completes immediately
        ticker.tick().await;
        Some((Ok(Event::default().comment("keep-alive")), (ticker, guard)))
    })
}

/// `GET /<server_id>/rpc`: session-signalling event stream.
pub async fn direct_stream(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let server = state
        .registry
        .get(&server_id)
        .map_err(|e| reject(&state, e, None))?;
    if !accepts_event_stream(&headers) {
        return Err(reject(
            &state,
            GatewayError::StreamingNotSupported(format!(
                "client for '{server_id}' does not accept text/event-stream"
            )),
            None,
        ));
    }

    let session_id = server.session_id().await;
    state.registry.metrics().record_stream_opened(&server_id);
    tracing::info!(server = %server_id, session = %session_id, "event stream opened");

    let mut response = Sse::new(keep_alive_stream(server_id, KEEP_ALIVE_INTERVAL)).into_response();
    if let Some(value) = session_header(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}
