//! Caller admission: source-address allowlist, then bearer token.
//!
//! Both checks run on every route before any handler. A caller outside the
//! allowlist is refused even when its token is correct.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ipnet::IpNet;
use subtle::ConstantTimeEq;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::http::AppState;
use crate::http::wire::ApiError;
use crate::telemetry::GatewayMetrics;

/// Sentinel entry that admits both loopback addresses.
const LOCALHOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientRule {
    Addr(IpAddr),
    Net(IpNet),
}

/// Parsed `allowed_clients` entries.
#[derive(Debug, Clone)]
pub struct Allowlist {
    rules: Vec<ClientRule>,
}

impl Allowlist {
    /// Parse IP addresses, CIDR ranges and the `localhost` sentinel.
    pub fn from_entries(entries: &[String]) -> crate::Result<Self> {
        let mut rules = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.trim();
            if entry.eq_ignore_ascii_case(LOCALHOST) {
                rules.push(ClientRule::Addr(IpAddr::V4(Ipv4Addr::LOCALHOST)));
                rules.push(ClientRule::Addr(IpAddr::V6(Ipv6Addr::LOCALHOST)));
            } else if entry.contains('/') {
                let net = entry.parse::<IpNet>().map_err(|e| {
                    GatewayError::Config(format!("allowed_clients entry '{entry}' is not a valid CIDR range: {e}"))
                })?;
                rules.push(ClientRule::Net(net));
            } else {
                let addr = entry.parse::<IpAddr>().map_err(|_| {
                    GatewayError::Config(format!(
                        "allowed_clients entry '{entry}' is not an IP address, CIDR range or '{LOCALHOST}'"
                    ))
                })?;
                rules.push(ClientRule::Addr(addr.to_canonical()));
            }
        }
        Ok(Self { rules })
    }

    /// IPv4-mapped IPv6 peers are compared as their IPv4 form.
    pub fn allows(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.rules.iter().any(|rule| match rule {
            ClientRule::Addr(addr) => *addr == ip,
            ClientRule::Net(net) => net.contains(&ip),
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// Everything after the single space is the token, so stray whitespace makes
/// it mismatch.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token)
}

pub struct AuthGuard {
    allowlist: Allowlist,
    token: String,
    metrics: GatewayMetrics,
}

impl AuthGuard {
    pub fn new(allowlist: Allowlist, token: impl Into<String>, metrics: GatewayMetrics) -> Self {
        Self {
            allowlist,
            token: token.into(),
            metrics,
        }
    }

    pub fn from_config(config: &GatewayConfig, metrics: GatewayMetrics) -> crate::Result<Self> {
        Ok(Self::new(
            Allowlist::from_entries(&config.allowed_clients)?,
            config.auth_token.clone(),
            metrics,
        ))
    }

    /// Admit or refuse a caller. A missing peer address is refused.
    pub fn check(&self, peer: Option<SocketAddr>, headers: &HeaderMap) -> crate::Result<()> {
        let Some(peer) = peer else {
            tracing::warn!("rejecting request without a peer address");
            self.metrics.record_auth_failure("auth_denied");
            return Err(GatewayError::ClientNotAllowed(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        };

        let ip = peer.ip().to_canonical();
        if !self.allowlist.allows(ip) {
            tracing::warn!(client = %peer, "client not in allowlist");
            self.metrics.record_auth_failure("auth_denied");
            return Err(GatewayError::ClientNotAllowed(ip));
        }

        let presented = bearer_token(headers).unwrap_or_default();
        let matches: bool = presented.as_bytes().ct_eq(self.token.as_bytes()).into();
        if presented.is_empty() || !matches {
            tracing::warn!(client = %peer, "missing or invalid bearer token");
            self.metrics.record_auth_failure("auth_failed");
            return Err(GatewayError::AuthFailed);
        }

        Ok(())
    }
}

/// Middleware applying [`AuthGuard::check`] to every route.
pub async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    match state.auth.check(peer, request.headers()) {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError::from(e).into_response(),
    }
}
