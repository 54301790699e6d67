//! GatewayRegistry: the set of managed servers and the routing entry point.
//!
//! Servers are held in configuration order and looked up by id. Dispatch
//! classifies each payload: notifications are written and acknowledged without
//! waiting, everything else waits for exactly one reply line.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::protocol;
use crate::server::health::HealthReport;
use crate::server::{ManagedServer, ServerStatus};
use crate::telemetry::GatewayMetrics;

pub struct GatewayRegistry {
    servers: Vec<Arc<ManagedServer>>,
    index: HashMap<String, usize>,
    metrics: GatewayMetrics,
    started_at: Instant,
    /// Root cancellation token; each server watches a child of it.
    cancel: CancellationToken,
    watchers: TaskTracker,
}

impl GatewayRegistry {
    /// Build one managed server per configured entry. Nothing is spawned yet.
    pub fn from_config(config: &GatewayConfig, metrics: GatewayMetrics) -> Self {
        let cancel = CancellationToken::new();
        let watchers = TaskTracker::new();
        let mut servers = Vec::with_capacity(config.servers.len());
        let mut index = HashMap::with_capacity(config.servers.len());

        for server_config in &config.servers {
            index.insert(server_config.server_id.clone(), servers.len());
            servers.push(ManagedServer::new(
                server_config.clone(),
                config.request_timeout(),
                config.restart_backoff(),
                metrics.clone(),
                cancel.child_token(),
                watchers.clone(),
            ));
        }

        GatewayRegistry {
            servers,
            index,
            metrics,
            started_at: Instant::now(),
            cancel,
            watchers,
        }
    }

    /// Start every server marked `autostart`.
    ///
    /// A server that fails to start is logged and left in `error`; the others
    /// still start. Returns how many reached `ready`.
    pub async fn start_autostart(&self) -> usize {
        let mut started = 0;
        for server in self.servers.iter().filter(|s| s.config().autostart) {
            match server.start().await {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::error!(server = %server.id(), error = %e, "autostart failed");
                }
            }
        }
        tracing::info!(
            started,
            configured = self.servers.len(),
            "autostart complete"
        );
        started
    }

    pub fn get(&self, server_id: &str) -> crate::Result<&Arc<ManagedServer>> {
        self.index
            .get(server_id)
            .map(|&i| &self.servers[i])
            .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))
    }

    /// Server ids in configuration order.
    pub fn server_ids(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.id()).collect()
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Route a payload to a server.
    ///
    /// Returns `Ok(None)` for a notification, which is queued but not awaited,
    /// and `Ok(Some(reply))` otherwise.
    #[tracing::instrument(skip(self, payload), fields(method = tracing::field::Empty))]
    pub async fn dispatch(&self, server_id: &str, payload: Value) -> crate::Result<Option<Value>> {
        let server = self.get(server_id)?;
        let kind = protocol::classify(&payload);
        if let Some(method) = protocol::method(&payload) {
            tracing::Span::current().record("method", method);
        }
        self.metrics.record_request(server_id, kind.as_str());
        tracing::debug!(kind = kind.as_str(), "dispatching to server");

        if kind.expects_reply() {
            server.call(payload).await.map(Some)
        } else {
            server.notify(payload).await.map(|()| None)
        }
    }

    /// Status snapshots in configuration order.
    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            statuses.push(server.status().await);
        }
        statuses
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport::new(self.statuses().await, self.started_at.elapsed())
    }

    /// Cancel every server watcher and wait until each has killed its child
    /// and marked the server stopped. Nothing is restarted.
    pub async fn shutdown(&self) {
        tracing::info!(servers = self.servers.len(), "shutting down managed servers");
        self.cancel.cancel();
        self.watchers.close();
        self.watchers.wait().await;
        tracing::info!("managed servers stopped");
    }
}
