//! Gateway health derived from the states of all managed servers.

use std::time::Duration;

use serde::Serialize;

use crate::server::{ServerState, ServerStatus};

/// Overall gateway health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Every managed server is ready
    Ok,
    /// At least one managed server is not ready
    Degraded,
}

impl HealthState {
    pub fn from_statuses(servers: &[ServerStatus]) -> Self {
        if servers.iter().all(|s| s.status == ServerState::Ready) {
            HealthState::Ok
        } else {
            HealthState::Degraded
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub servers: Vec<ServerStatus>,
}

impl HealthReport {
    pub fn new(servers: Vec<ServerStatus>, uptime: Duration) -> Self {
        Self {
            status: HealthState::from_statuses(&servers),
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: uptime.as_secs(),
            servers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartPolicy;

    fn status(id: &str, state: ServerState) -> ServerStatus {
        ServerStatus {
            server_id: id.into(),
            status: state,
            pid: None,
            restart_count: 0,
            last_exit_code: None,
            last_exit_at: None,
            session_id: None,
            autostart: true,
            restart_policy: RestartPolicy::default(),
            command: "cat".into(),
            working_directory: None,
            last_error: None,
        }
    }

    #[test]
    fn test_all_ready_is_ok() {
        let servers = vec![status("a", ServerState::Ready), status("b", ServerState::Ready)];
        assert_eq!(HealthState::from_statuses(&servers), HealthState::Ok);
    }

    #[test]
    fn test_any_not_ready_is_degraded() {
        for other in [ServerState::Stopped, ServerState::Starting, ServerState::Error] {
            let servers = vec![status("a", ServerState::Ready), status("b", other)];
            assert_eq!(HealthState::from_statuses(&servers), HealthState::Degraded);
        }
    }

    #[test]
    fn test_report_shape() {
        let report = HealthReport::new(
            vec![status("a", ServerState::Stopped)],
            Duration::from_millis(61_500),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["uptime_seconds"], 61);
        assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(value["servers"][0]["server_id"], "a");
    }
}
