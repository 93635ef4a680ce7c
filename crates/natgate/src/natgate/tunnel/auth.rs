//! Agent authentication and per-tunnel callbacks.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::IpAddr,
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::natgate::{
    telemetry,
    tunnel::protocol::{Endpoint, ListenProto, Token},
};

#[derive(Debug, Error)]
pub enum AuthError {
    /// The token is not accepted. The agent is told so and disconnected.
    #[error("agent authentication failed")]
    Failed,
    /// The lookup itself failed; the agent may retry.
    #[error("auth lookup failed: {0:#}")]
    Lookup(anyhow::Error),
}

/// What a token unlocks.
#[derive(Clone)]
pub struct TunnelConfig {
    pub proto: ListenProto,
    /// 0 binds an ephemeral port.
    pub udp_port: u16,
    pub tcp_port: u16,
    pub hooks: Arc<dyn TunnelHooks>,
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("proto", &self.proto)
            .field("udp_port", &self.udp_port)
            .field("tcp_port", &self.tcp_port)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &Token) -> Result<TunnelConfig, AuthError>;
}

/// Embedder callbacks for one tunnel. Every method has a no-op default.
///
/// Accounting and heartbeat callbacks run off the session's read loop.
#[async_trait]
pub trait TunnelHooks: Send + Sync {
    /// Returning true drops the public client before any byte is relayed.
    async fn blocked_addr(&self, _addr: IpAddr) -> bool {
        false
    }

    async fn agent_ping(&self, _agent_time: SystemTime, _server_time: SystemTime) {}

    async fn agent_shutdown(&self, _at: SystemTime) {}

    /// Bytes received from a public client.
    async fn register_rx(&self, _client: Endpoint, _bytes: usize) {}

    /// Bytes the agent sent toward a public client, counted before delivery.
    async fn register_tx(&self, _client: Endpoint, _bytes: usize) {}
}

pub struct NoopHooks;

impl TunnelHooks for NoopHooks {}

#[derive(Debug, Clone)]
pub struct StaticAgent {
    pub token: Token,
    pub proto: ListenProto,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub blocked: Vec<IpAddr>,
}

/// Authenticator backed by the agents listed in the config file.
pub struct StaticAuthenticator {
    agents: HashMap<Token, TunnelConfig>,
}

impl StaticAuthenticator {
    pub fn new(agents: impl IntoIterator<Item = StaticAgent>) -> Self {
        let agents = agents
            .into_iter()
            .map(|a| {
                let hooks = StaticHooks {
                    token: a.token,
                    blocked: a.blocked.into_iter().map(|ip| ip.to_canonical()).collect(),
                };
                let cfg = TunnelConfig {
                    proto: a.proto,
                    udp_port: a.udp_port,
                    tcp_port: a.tcp_port,
                    hooks: Arc::new(hooks),
                };
                (a.token, cfg)
            })
            .collect();
        Self { agents }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, token: &Token) -> Result<TunnelConfig, AuthError> {
        self.agents.get(token).cloned().ok_or(AuthError::Failed)
    }
}

/// Hooks for config-file agents: a block list, logs and metrics.
pub struct StaticHooks {
    token: Token,
    blocked: HashSet<IpAddr>,
}

#[async_trait]
impl TunnelHooks for StaticHooks {
    async fn blocked_addr(&self, addr: IpAddr) -> bool {
        let hit = self.blocked.contains(&addr.to_canonical());
        if hit {
            metrics::counter!(telemetry::CLIENTS_BLOCKED).increment(1);
        }
        hit
    }

    async fn agent_ping(&self, agent_time: SystemTime, server_time: SystemTime) {
        let skew = match server_time.duration_since(agent_time) {
            Ok(d) => humantime::format_duration(d).to_string(),
            Err(e) => format!("-{}", humantime::format_duration(e.duration())),
        };
        tracing::trace!(token = %self.token, skew = %skew, "tunnel: agent ping");
    }

    async fn agent_shutdown(&self, _at: SystemTime) {
        tracing::info!(token = %self.token, "tunnel: agent disconnected");
    }

    async fn register_rx(&self, client: Endpoint, bytes: usize) {
        metrics::counter!(telemetry::CLIENT_RX_BYTES, "proto" => client.proto.as_str()).increment(bytes as u64);
    }

    async fn register_tx(&self, client: Endpoint, bytes: usize) {
        metrics::counter!(telemetry::CLIENT_TX_BYTES, "proto" => client.proto.as_str()).increment(bytes as u64);
    }
}
