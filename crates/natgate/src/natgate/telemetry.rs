use std::{
    net::SocketAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

pub const SESSIONS_ACTIVE: &str = "natgate_sessions_active";
pub const CLIENT_RX_BYTES: &str = "natgate_client_rx_bytes_total";
pub const CLIENT_TX_BYTES: &str = "natgate_client_tx_bytes_total";
pub const CLIENTS_BLOCKED: &str = "natgate_clients_blocked_total";

/// Installs a Prometheus recorder for the `metrics` crate and serves the
/// exposition format on `addr`.
///
/// Must run inside the Tokio runtime, once per process.
pub fn init_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("metrics: install Prometheus exporter on {addr}"))
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Inverse of [`now_unix_ms`]. Negative values clamp to the epoch.
pub fn system_time_from_ms(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}
