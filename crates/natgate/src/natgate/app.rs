use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::natgate::{
    config::{self, AgentConfig, ControllerConfig},
    logging, telemetry,
    tunnel::{
        auth::StaticAuthenticator,
        client::{Client, serve_local},
        registry::Registry,
        server::{Server, ServerOptions},
        session::SessionOptions,
    },
};

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        controller = cfg.controller.is_some(),
        agent = cfg.agent.is_some(),
        metrics_addr = ?cfg.metrics_addr,
        "natgate: starting"
    );

    if let Some(addr) = cfg.metrics_addr {
        telemetry::init_prometheus(addr)?;
        tracing::info!(addr = %addr, "metrics: serving prometheus");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if let Some(ctl) = &cfg.controller {
        let server = build_server(ctl)?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    if let Some(agent) = cfg.agent.clone() {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(run_agent(agent, shutdown));
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("shutdown: signal"),
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = %humantime::format_duration(DRAIN_TIMEOUT), "shutdown: tasks did not stop in time");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

fn build_server(ctl: &ControllerConfig) -> anyhow::Result<Server> {
    let auth = StaticAuthenticator::new(ctl.agents.iter().cloned());
    tracing::info!(agents = auth.len(), "tunnel: loaded agent tokens");
    Server::new(ServerOptions {
        listen_addr: ctl.listen_addr.clone(),
        transport: ctl.transport.clone(),
        session: SessionOptions {
            bind_ip: ctl.bind_ip,
            initial_chunk_size: ctl.initial_chunk_size,
            udp_idle_timeout: ctl.udp_idle_timeout,
        },
        authenticator: Arc::new(auth),
        registry: Arc::new(Registry::new()),
    })
}

/// Keeps one agent session alive, reconnecting with backoff after transport loss.
///
/// Returns an error only for failures that reconnecting cannot fix.
async fn run_agent(cfg: AgentConfig, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut backoff = RECONNECT_MIN;
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let dialed = tokio::select! {
            res = Client::dial(cfg.client_options()) => res,
            _ = shutdown.changed() => return Ok(()),
        };

        let err = match dialed {
            Ok((client, incoming)) => {
                backoff = RECONNECT_MIN;
                // Unserved protocols drop their receiver so new flows are refused.
                if let Some(target) = cfg.tcp_target.clone() {
                    tokio::spawn(serve_local(incoming.tcp, target));
                }
                if let Some(target) = cfg.udp_target.clone() {
                    tokio::spawn(serve_local(incoming.udp, target));
                }
                match client.run(shutdown.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        if err.is_fatal() {
            tracing::error!(err = %err, "tunnel: agent stopped");
            return Err(err).context("tunnel: agent");
        }

        tracing::warn!(
            err = %err,
            retry_in = %humantime::format_duration(backoff),
            "tunnel: agent disconnected; reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return Ok(()),
        }
        backoff = next_backoff(backoff);
    }
}

fn next_backoff(d: Duration) -> Duration {
    (d * 2).min(RECONNECT_MAX)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: cannot watch SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
