//! Request and response bodies of the HTTP surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, GatewayError};
use crate::server::ServerStatus;

/// Body of `POST /rpc`.
#[derive(Debug, Deserialize)]
pub struct GatewayRequest {
    pub server_id: String,
    pub payload: Value,
}

/// Successful reply to `POST /rpc`.
#[derive(Debug, Serialize)]
pub struct GatewayResponse {
    pub server_id: String,
    pub payload: Value,
}

/// Body of `GET /servers`.
#[derive(Debug, Serialize)]
pub struct ServerList {
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
}

/// `{"error": {...}}`, returned for every failure.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

/// A gateway error on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub request_id: Option<Value>,
}

impl ApiError {
    pub fn with_request_id(mut self, request_id: Option<Value>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.error.code())
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                error_code: self.error.code(),
                message: self.error.to_string(),
                server_id: self.error.server_id().map(str::to_string),
                request_id: self.request_id.clone(),
            },
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            request_id: None,
        }
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::AuthFailed => StatusCode::UNAUTHORIZED,
        ErrorCode::AuthDenied => StatusCode::FORBIDDEN,
        ErrorCode::ServerNotFound => StatusCode::NOT_FOUND,
        ErrorCode::ServerError => StatusCode::BAD_GATEWAY,
        ErrorCode::StreamingNotSupported
        | ErrorCode::ConfigError
        | ErrorCode::TelemetryError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}
