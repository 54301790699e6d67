//! Managed stdio servers.
//!
//! [`supervisor`] owns the subprocess lifecycle, [`bridge`] moves messages over
//! its stdin/stdout, and [`health`] folds server states into the gateway report.

pub mod bridge;
pub mod health;
pub mod supervisor;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RestartPolicy;

pub use supervisor::ManagedServer;

/// Lifecycle state of a managed server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Ready,
    Error,
}

impl ServerState {
    /// Starting or ready; a start request is a no-op in these states.
    pub fn is_active(&self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Ready)
    }
}

/// Point-in-time view of a managed server, as reported by `/servers` and `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub status: ServerState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_exit_code: Option<i32>,
    pub last_exit_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub autostart: bool,
    pub restart_policy: RestartPolicy,
    pub command: String,
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
