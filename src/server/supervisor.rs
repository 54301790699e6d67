//! Subprocess supervision for a single managed server.
//!
//! A [`ManagedServer`] owns one configured stdio subprocess. All lifecycle
//! fields live behind one async mutex; a background watcher task reacts to
//! process exit and applies the restart policy:
//!
//! - `never`: stay stopped.
//! - `on-failure`: relaunch unless the exit code was 0. A signal exit counts as failure.
//! - `always`: relaunch on every exit.
//!
//! Restarts wait a fixed backoff. A relaunch that fails leaves the server in
//! `error` and ends the watcher; a later explicit start may try again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::{ServerConfig, resolve_env_vars};
use crate::error::GatewayError;
use crate::server::bridge::CallQueue;
use crate::server::{ServerState, ServerStatus};
use crate::telemetry::GatewayMetrics;

/// Mutable lifecycle fields, guarded by one lock per server.
#[derive(Default)]
struct Runtime {
    status: ServerState,
    pid: Option<u32>,
    /// Present iff `status` is `Ready`.
    calls: Option<CallQueue>,
    session_id: Option<String>,
    restart_count: u32,
    last_exit_code: Option<i32>,
    last_exit_at: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
}

/// One configured stdio server plus its runtime state.
pub struct ManagedServer {
    config: ServerConfig,
    request_timeout: Duration,
    restart_backoff: Duration,
    metrics: GatewayMetrics,
    cancel: CancellationToken,
    /// Exit watchers, so shutdown can wait for children to be reaped.
    watchers: TaskTracker,
    state: Mutex<Runtime>,
}

/// Build the command for a server: args, merged environment, working directory, piped stdio.
fn stdio_command(config: &ServerConfig) -> Command {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    if !config.env.is_empty() {
        cmd.envs(resolve_env_vars(&config.env));
    }

    if let Some(ref dir) = config.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Forward each stderr line of the child to the log, tagged with the server id.
///
/// Bytes that are not UTF-8 are logged lossily; the drain only stops at EOF or
/// on a read error, so the child never writes into a closed pipe.
fn start_stderr_drain(child_stderr: tokio::process::ChildStderr, server_id: String) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(child_stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    tracing::info!(server = %server_id, line = %line.trim_end(), "server stderr");
                }
                Err(e) => {
                    tracing::warn!(server = %server_id, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}

impl ManagedServer {
    pub fn new(
        config: ServerConfig,
        request_timeout: Duration,
        restart_backoff: Duration,
        metrics: GatewayMetrics,
        cancel: CancellationToken,
        watchers: TaskTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            request_timeout,
            restart_backoff,
            metrics,
            cancel,
            watchers,
            state: Mutex::new(Runtime::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.server_id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Launch the subprocess and begin watching it.
    ///
    /// Does nothing if the server is already starting or ready.
    pub async fn start(self: &Arc<Self>) -> crate::Result<()> {
        let mut rt = self.state.lock().await;
        if rt.status.is_active() {
            return Ok(());
        }
        let child = self.launch(&mut rt).await?;
        drop(rt);

        self.watchers.spawn(self.clone().watch_exit(child));
        Ok(())
    }

    /// Spawn the child and attach the call bridge, updating `rt` either way.
    async fn launch(&self, rt: &mut Runtime) -> crate::Result<Child> {
        rt.status = ServerState::Starting;
        tracing::info!(
            server = %self.id(),
            command = %self.config.command,
            "spawning stdio server"
        );

        let attached = match self.config.startup_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.attach())
                .await
                .unwrap_or_else(|_| {
                    Err(GatewayError::Spawn(
                        self.id().to_string(),
                        format!("startup did not finish within {:.1}s", limit.as_secs_f64()),
                    ))
                }),
            None => self.attach().await,
        };

        match attached {
            Ok((child, calls)) => {
                rt.status = ServerState::Ready;
                rt.pid = child.id();
                rt.calls = Some(calls);
                rt.last_error = None;
                tracing::info!(server = %self.id(), pid = ?rt.pid, "server ready");
                Ok(child)
            }
            Err(e) => {
                rt.status = ServerState::Error;
                rt.pid = None;
                rt.calls = None;
                rt.last_error = Some(e.to_string());
                tracing::error!(server = %self.id(), error = %e, "server failed to start");
                Err(e)
            }
        }
    }

    async fn attach(&self) -> crate::Result<(Child, CallQueue)> {
        let id = self.id();
        let mut command = stdio_command(&self.config);
        // fork/exec can stall on slow filesystems; keep it off the async workers
        let mut child = tokio::task::spawn_blocking(move || command.spawn())
            .await
            .map_err(|e| GatewayError::Spawn(id.to_string(), e.to_string()))?
            .map_err(|e| GatewayError::Spawn(id.to_string(), e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Spawn(id.to_string(), "failed to open stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Spawn(id.to_string(), "failed to open stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::Spawn(id.to_string(), "failed to open stderr pipe".into()))?;

        start_stderr_drain(stderr, id.to_string());
        let calls = CallQueue::spawn(id.to_string(), stdin, stdout, self.request_timeout);
        Ok((child, calls))
    }

    /// Wait for the child to exit, then restart it per policy until told to stop.
    async fn watch_exit(self: Arc<Self>, mut child: Child) {
        loop {
            let exit_code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        tracing::warn!(server = %self.id(), error = %e, "failed to wait on child");
                        None
                    }
                },
                _ = self.cancel.cancelled() => {
                    let _ = child.kill().await;
                    self.mark_stopped().await;
                    tracing::info!(server = %self.id(), "server stopped on shutdown");
                    return;
                }
            };

            if !self.record_exit(exit_code).await {
                return;
            }

            tracing::info!(
                server = %self.id(),
                backoff_ms = self.restart_backoff.as_millis() as u64,
                "restarting server after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.restart_backoff) => {}
                _ = self.cancel.cancelled() => {
                    tracing::info!(server = %self.id(), "cancelled during restart backoff");
                    return;
                }
            }

            let mut rt = self.state.lock().await;
            if rt.status.is_active() {
                // started by someone else during the backoff; that start owns its watcher
                return;
            }
            match self.launch(&mut rt).await {
                Ok(next) => child = next,
                Err(_) => return,
            }
        }
    }

    /// Record an exit and decide whether to restart.
    async fn record_exit(&self, exit_code: Option<i32>) -> bool {
        let mut rt = self.state.lock().await;
        rt.last_exit_code = exit_code;
        rt.last_exit_at = Some(Utc::now());
        rt.calls = None;
        rt.pid = None;
        rt.status = ServerState::Stopped;

        let restart = self.config.restart_policy.should_restart(exit_code);
        if restart {
            rt.restart_count += 1;
        }
        let restart_count = rt.restart_count;
        drop(rt);

        tracing::warn!(
            server = %self.id(),
            exit_code = ?exit_code,
            policy = self.config.restart_policy.as_str(),
            restart,
            restart_count,
            "server process exited"
        );
        if restart {
            self.metrics.record_restart(self.id());
        }
        restart
    }

    async fn mark_stopped(&self) {
        let mut rt = self.state.lock().await;
        rt.status = ServerState::Stopped;
        rt.calls = None;
        rt.pid = None;
    }

    async fn ready_calls(&self) -> crate::Result<CallQueue> {
        let rt = self.state.lock().await;
        match (&rt.status, &rt.calls) {
            (ServerState::Ready, Some(calls)) => Ok(calls.clone()),
            _ => Err(GatewayError::NotRunning(self.id().to_string())),
        }
    }

    /// Forward a reply-expecting message and return the server's reply.
    pub async fn call(&self, payload: Value) -> crate::Result<Value> {
        let calls = self.ready_calls().await?;
        let started = Instant::now();
        let result = calls.call(payload).await;
        self.metrics
            .record_call_duration(self.id(), started.elapsed().as_secs_f64());
        result
    }

    /// Forward a notification without waiting for a reply.
    pub async fn notify(&self, payload: Value) -> crate::Result<()> {
        self.ready_calls().await?.notify(payload).await
    }

    /// The gateway-side session id, assigned on first use and stable afterwards.
    pub async fn session_id(&self) -> String {
        let mut rt = self.state.lock().await;
        rt.session_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }

    pub async fn status(&self) -> ServerStatus {
        let rt = self.state.lock().await;
        ServerStatus {
            server_id: self.config.server_id.clone(),
            status: rt.status,
            pid: rt.pid,
            restart_count: rt.restart_count,
            last_exit_code: rt.last_exit_code,
            last_exit_at: rt.last_exit_at,
            session_id: rt.session_id.clone(),
            autostart: self.config.autostart,
            restart_policy: self.config.restart_policy,
            command: self.config.command.clone(),
            working_directory: self
                .config
                .working_dir
                .as_ref()
                .map(|dir| dir.display().to_string()),
            last_error: rt.last_error.clone(),
        }
    }
}
