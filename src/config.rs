//! Gateway configuration: deserialization, defaulting and validation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::http::auth::Allowlist;

pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 8787;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 30.0;
pub const DEFAULT_RESTART_BACKOFF_SECS: f64 = 2.0;

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` for literal values.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve configured env pairs against the gateway's own environment.
///
/// `${VAR}` values are replaced by the value of `VAR` (empty when unset);
/// anything else is passed through literally.
pub fn resolve_env_vars(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    resolve_env_vars_with(env, |name| std::env::var(name).ok())
}

/// [`resolve_env_vars`] against an arbitrary variable lookup.
pub fn resolve_env_vars_with<F>(env: &BTreeMap<String, String>, lookup: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => lookup(var_name).unwrap_or_default(),
                None => v.clone(),
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Top-level gateway configuration, parsed from JSON or TOML.
///
/// Fields left out of the file deserialize to zero values; [`GatewayConfig::validate`]
/// replaces those with the documented defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub allowed_clients: Vec<String>,
    /// Per-call timeout in seconds.
    #[serde(default, rename = "request_timeout", alias = "request_timeout_secs")]
    pub request_timeout_secs: f64,
    /// Fixed delay in seconds before an automatic restart.
    #[serde(default, rename = "restart_backoff", alias = "restart_backoff_secs")]
    pub restart_backoff_secs: f64,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Configuration for a single managed stdio server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, alias = "cwd")]
    pub working_dir: Option<PathBuf>,
    /// Merged over the inherited environment. `${VAR}` values are resolved at spawn time.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default, rename = "startup_timeout", alias = "startup_timeout_secs")]
    pub startup_timeout_secs: Option<f64>,
}

/// What the exit watcher does after a subprocess exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    #[default]
    #[serde(alias = "on_failure")]
    OnFailure,
    Never,
}

impl RestartPolicy {
    /// Decide whether an exit with `exit_code` triggers a relaunch.
    ///
    /// A missing exit code (terminated by a signal) counts as a failure.
    pub fn should_restart(&self, exit_code: Option<i32>) -> bool {
        match self {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => exit_code != Some(0),
            RestartPolicy::Never => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::Never => "never",
        }
    }
}

fn default_bind_host() -> String {
    DEFAULT_BIND_HOST.to_string()
}

fn default_bind_port() -> u16 {
    DEFAULT_BIND_PORT
}

fn default_autostart() -> bool {
    true
}

/// Reject negative and non-finite durations; zero means "use the default".
fn checked_secs(name: &str, value: f64, default: f64) -> crate::Result<f64> {
    if !value.is_finite() || value < 0.0 {
        return Err(GatewayError::Config(format!(
            "{name} must be a non-negative number of seconds, got {value}"
        )));
    }
    Ok(if value == 0.0 { default } else { value })
}

fn valid_server_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl GatewayConfig {
    /// Parse a JSON config document. Does not validate.
    pub fn from_json_str(content: &str) -> crate::Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| GatewayError::Config(format!("malformed JSON config: {e}")))
    }

    /// Parse a TOML config document. Does not validate.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("malformed TOML config: {e}")))
    }

    /// Read, parse and validate the config file at `path`.
    ///
    /// The format is TOML when the extension is `.toml`, JSON otherwise.
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let config = if is_toml {
            Self::from_toml_str(&content)?
        } else {
            Self::from_json_str(&content)?
        };
        config.validate()
    }

    /// Validate the config and fill in defaults, failing fast before any server is spawned.
    ///
    /// Returns either a fully-defaulted config or the first problem found.
    pub fn validate(mut self) -> crate::Result<Self> {
        if self.auth_token.is_empty() {
            return Err(GatewayError::Config("auth_token must not be empty".into()));
        }
        if self.allowed_clients.is_empty() {
            return Err(GatewayError::Config(
                "allowed_clients must list at least one address".into(),
            ));
        }
        Allowlist::from_entries(&self.allowed_clients)?;

        if self.servers.is_empty() {
            return Err(GatewayError::Config(
                "servers must define at least one server".into(),
            ));
        }

        self.request_timeout_secs = checked_secs(
            "request_timeout",
            self.request_timeout_secs,
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        self.restart_backoff_secs = checked_secs(
            "restart_backoff",
            self.restart_backoff_secs,
            DEFAULT_RESTART_BACKOFF_SECS,
        )?;
        if self.bind_host.is_empty() {
            self.bind_host = default_bind_host();
        }
        if self.bind_port == 0 {
            self.bind_port = DEFAULT_BIND_PORT;
        }

        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (index, server) in self.servers.iter().enumerate() {
            if server.server_id.is_empty() {
                return Err(GatewayError::Config(format!(
                    "servers[{index}] is missing server_id"
                )));
            }
            if !valid_server_id(&server.server_id) {
                return Err(GatewayError::Config(format!(
                    "server_id '{}' may only contain ASCII letters, digits, '-', '_' or '.'",
                    server.server_id
                )));
            }
            if !seen_ids.insert(server.server_id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate server_id '{}'",
                    server.server_id
                )));
            }
            if server.command.trim().is_empty() {
                return Err(GatewayError::Config(format!(
                    "server '{}' is missing command",
                    server.server_id
                )));
            }
            if let Some(secs) = server.startup_timeout_secs {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(GatewayError::Config(format!(
                        "server '{}': startup_timeout must be a non-negative number of seconds",
                        server.server_id
                    )));
                }
            }
        }

        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.restart_backoff_secs)
    }

    /// `host:port` string suitable for binding a listener.
    pub fn bind_addr(&self) -> String {
        if self.bind_host.contains(':') && !self.bind_host.starts_with('[') {
            format!("[{}]:{}", self.bind_host, self.bind_port)
        } else {
            format!("{}:{}", self.bind_host, self.bind_port)
        }
    }
}

impl ServerConfig {
    /// Startup bound, if configured and non-zero.
    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_secs
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}
