use std::sync::Arc;

use dashmap::DashMap;

use crate::natgate::tunnel::{
    auth::Authenticator,
    registry::Registry,
    session::{SessionOptions, TunnelSession},
    transport::{ControlConn, TransportListener, parse_transport, transport_by_name},
};

#[derive(Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub session: SessionOptions,
    pub authenticator: Arc<dyn Authenticator>,
    pub registry: Arc<Registry>,
}

/// Accepts agent control connections and runs one [`TunnelSession`] per agent.
pub struct Server {
    opts: ServerOptions,
    sessions: Arc<DashMap<u64, Arc<TunnelSession>>>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> anyhow::Result<Self> {
        parse_transport(&opts.transport)?;
        Ok(Self {
            opts,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.opts.registry.clone()
    }

    /// Live control connections, authenticated or not.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn listen(&self) -> anyhow::Result<Box<dyn TransportListener>> {
        let tr = transport_by_name(&self.opts.transport)?;
        let ln = tr.listen(&self.opts.listen_addr).await?;
        tracing::info!(
            addr = %self.opts.listen_addr,
            transport = %tr.name(),
            "tunnel: listening"
        );
        Ok(ln)
    }

    pub async fn listen_and_serve(&self, shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.listen().await?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: Box<dyn TransportListener>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let res = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                conn = ln.accept() => match conn {
                    Ok(c) => self.spawn_session(c),
                    Err(err) => break Err(err),
                },
            }
        };

        ln.close().await?;
        self.opts.registry.close_all().await;
        let pending: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        for s in pending {
            s.close().await;
        }
        res
    }

    fn spawn_session(&self, conn: ControlConn) {
        let id = self.opts.registry.next_session_id();
        let (sess, source) = TunnelSession::new(
            id,
            conn,
            self.opts.session.clone(),
            self.opts.registry.clone(),
            self.opts.authenticator.clone(),
        );
        self.sessions.insert(id, sess.clone());
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            sess.run(source).await;
            sessions.remove(&id);
        });
    }
}
