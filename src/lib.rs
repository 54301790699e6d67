//! hostgate: host-side HTTP gateway for stdio MCP servers.
//!
//! Supervises one subprocess per configured server, bridges JSON-RPC lines
//! between HTTP callers and each subprocess's stdin/stdout, and admits callers
//! by source address and bearer token.

pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod telemetry;

pub use config::{GatewayConfig, RestartPolicy, ServerConfig, parse_env_ref, resolve_env_vars};
pub use error::{ErrorCode, GatewayError, Result};
pub use http::auth::{Allowlist, AuthGuard};
pub use http::{AppState, router};
pub use protocol::MessageKind;
pub use registry::GatewayRegistry;
pub use server::health::{HealthReport, HealthState};
pub use server::{ManagedServer, ServerState, ServerStatus};
pub use telemetry::{GatewayMetrics, TelemetryConfig, TelemetryGuard, init_telemetry};
