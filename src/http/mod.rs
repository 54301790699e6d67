//! HTTP surface of the gateway.
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /health` | aggregate health and per-server status |
//! | `GET /servers` | per-server status |
//! | `POST /rpc` | `{server_id, payload}` wrapper call |
//! | `POST /<server_id>/rpc` | direct call, body is the protocol message |
//! | `GET /<server_id>/rpc` | event stream carrying the session id and keep-alives |
//!
//! Every route, including unknown paths, sits behind [`auth::require_auth`].

pub mod auth;
pub mod handlers;
pub mod wire;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::http::auth::AuthGuard;
use crate::registry::GatewayRegistry;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<GatewayRegistry>,
    pub auth: Arc<AuthGuard>,
}

impl AppState {
    pub fn new(registry: Arc<GatewayRegistry>, auth: AuthGuard) -> Self {
        Self {
            registry,
            auth: Arc::new(auth),
        }
    }
}

/// Build the router. Serve it with `into_make_service_with_connect_info::<SocketAddr>()`
/// so the allowlist can see the caller's address.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/servers", get(handlers::servers))
        .route("/rpc", post(handlers::rpc))
        .route(
            "/:server_id/rpc",
            post(handlers::direct_rpc).get(handlers::direct_stream),
        )
        .fallback(handlers::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    auth::require_auth,
                )),
        )
        .with_state(state)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::telemetry::GatewayMetrics;
    use axum::body::Body;
    use axum::Extension;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode, header};
    use axum::response::Response;
    use futures::StreamExt;
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    /// Replies once with a fixed result, then swallows input.
    const ONE_SHOT_SERVER: &str =
        r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; cat >/dev/null"#;

    async fn gateway(servers: Value) -> (Router, Arc<GatewayRegistry>) {
        let config = GatewayConfig::from_json_str(
            &json!({
                "auth_token": TOKEN,
                "allowed_clients": ["localhost", "192.168.50.0/24"],
                "request_timeout": 5,
                "servers": servers,
            })
            .to_string(),
        )
        .and_then(GatewayConfig::validate)
        .unwrap();

        let metrics = GatewayMetrics::default();
        let registry = Arc::new(GatewayRegistry::from_config(&config, metrics.clone()));
        registry.start_autostart().await;
        let auth = AuthGuard::from_config(&config, metrics).unwrap();
        (router(AppState::new(registry.clone(), auth)), registry)
    }

    fn from(app: Router, addr: [u8; 4]) -> Router {
        app.layer(Extension(ConnectInfo(SocketAddr::from((addr, 40000)))))
    }

    fn local(app: Router) -> Router {
        from(app, [127, 0, 0, 1])
    }

    fn authed(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        authed("POST", uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn cat_server() -> Value {
        json!([{"server_id": "echo", "command": "cat"}])
    }

    #[tokio::test]
    async fn test_health_requires_token() {
        let (app, registry) = gateway(cat_server()).await;

        let response = local(app.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["error_code"], "auth_failed");

        let response = local(app)
            .oneshot(authed("GET", "/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["servers"][0]["server_id"], "echo");
        assert_eq!(body["servers"][0]["status"], "ready");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_with_exited_echo_server() {
        let config = GatewayConfig::from_json_str(
            r#"{"auth_token": "secret", "allowed_clients": ["127.0.0.1"],
                "servers": [{"server_id": "unit", "command": "/bin/echo"}]}"#,
        )
        .and_then(GatewayConfig::validate)
        .unwrap();
        let metrics = GatewayMetrics::default();
        let registry = Arc::new(GatewayRegistry::from_config(&config, metrics.clone()));
        registry.start_autostart().await;
        let app = router(AppState::new(
            registry.clone(),
            AuthGuard::from_config(&config, metrics).unwrap(),
        ));

        let response = local(app.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = local(app)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_disallowed_client_refused_even_with_token() {
        let (app, registry) = gateway(cat_server()).await;
        let response = from(app, [10, 0, 0, 1])
            .oneshot(authed("GET", "/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"]["error_code"], "auth_denied");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_cidr_client_admitted() {
        let (app, registry) = gateway(cat_server()).await;
        let response = from(app, [192, 168, 50, 23])
            .oneshot(authed("GET", "/servers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["servers"].as_array().unwrap().len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_path_still_requires_auth() {
        let (app, registry) = gateway(cat_server()).await;
        let response = from(app, [10, 0, 0, 1])
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_rpc_returns_server_reply() {
        let (app, registry) = gateway(json!([
            {"server_id": "files", "command": "sh", "args": ["-c", ONE_SHOT_SERVER]}
        ]))
        .await;

        let response = local(app)
            .oneshot(post_json(
                "/rpc",
                json!({"server_id": "files", "payload": {"jsonrpc": "2.0", "id": 1, "method": "ping"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"server_id": "files", "payload": {"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}})
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_notification_is_accepted_without_reply() {
        let (app, registry) = gateway(json!([
            {"server_id": "sink", "command": "sh", "args": ["-c", "cat >/dev/null"]}
        ]))
        .await;

        let response = local(app)
            .oneshot(post_json(
                "/rpc",
                json!({"server_id": "sink", "payload": {"jsonrpc": "2.0", "method": "notifications/initialized"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_server_is_404() {
        let (app, registry) = gateway(cat_server()).await;
        let response = local(app)
            .oneshot(post_json(
                "/rpc",
                json!({"server_id": "nope", "payload": {"jsonrpc": "2.0", "id": 4, "method": "ping"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"]["error_code"], "server_not_found");
        assert_eq!(body["error"]["server_id"], "nope");
        assert_eq!(body["error"]["request_id"], 4);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let (app, registry) = gateway(cat_server()).await;

        let response = local(app.clone())
            .oneshot(
                authed("POST", "/rpc")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["error_code"], "invalid_request");

        let response = local(app)
            .oneshot(post_json("/rpc", json!({"server_id": "echo", "payload": "ping"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopped_server_is_502() {
        let (app, registry) = gateway(json!([
            {"server_id": "manual", "command": "cat", "autostart": false}
        ]))
        .await;
        let response = local(app)
            .oneshot(post_json(
                "/rpc",
                json!({"server_id": "manual", "payload": {"id": "a", "method": "ping"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["error_code"], "server_error");
        assert_eq!(body["error"]["request_id"], "a");
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_initialize_sets_session_header() {
        let (app, registry) = gateway(json!([
            {"server_id": "files", "command": "sh", "args": ["-c", ONE_SHOT_SERVER]}
        ]))
        .await;

        let response = local(app)
            .oneshot(post_json(
                "/files/rpc",
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .expect("session header");
        assert_eq!(
            body_json(response).await,
            json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})
        );

        let statuses = registry.statuses().await;
        assert_eq!(statuses[0].session_id.as_deref(), Some(session.as_str()));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_unknown_server_is_404() {
        let (app, registry) = gateway(cat_server()).await;
        let response = local(app.clone())
            .oneshot(post_json("/ghost/rpc", json!({"id": 1, "method": "ping"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = local(app)
            .oneshot(authed("GET", "/ghost/rpc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_stream_sends_session_and_comment() {
        let (app, registry) = gateway(cat_server()).await;

        let response = local(app.clone())
            .oneshot(
                authed("GET", "/echo/rpc")
                    .header(header::ACCEPT, "text/event-stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let first_session = response.headers().get("mcp-session-id").cloned().unwrap();

        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        assert!(first.starts_with(b":"), "expected a comment frame, got {first:?}");

        let response = local(app)
            .oneshot(authed("GET", "/echo/rpc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.headers().get("mcp-session-id"), Some(&first_session));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_stream_refused_without_accept() {
        let (app, registry) = gateway(cat_server()).await;
        let response = local(app)
            .oneshot(
                authed("GET", "/echo/rpc")
                    .header(header::ACCEPT, "application/json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await["error"]["error_code"],
            "streaming_not_supported"
        );
        registry.shutdown().await;
    }
}
