use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::RwLock;

use crate::natgate::{
    telemetry,
    tunnel::{protocol::Token, session::TunnelSession},
};

/// Active tunnels by token. At most one session owns a token at a time.
pub struct Registry {
    id_seq: AtomicU64,
    sessions: RwLock<HashMap<Token, Arc<TunnelSession>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            id_seq: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.id_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes `sess` the owner of `token`.
    ///
    /// A previous owner is fully closed (listeners released, clients dropped)
    /// before this returns, so the new owner can bind the same ports.
    pub async fn register(&self, token: Token, sess: Arc<TunnelSession>) {
        let mut st = self.sessions.write().await;
        if let Some(old) = st.remove(&token) {
            if old.id() != sess.id() {
                tracing::info!(
                    token = %token,
                    old = old.id(),
                    new = sess.id(),
                    remote = %sess.remote_addr(),
                    "tunnel: token reconnected; closing previous session"
                );
                old.close().await;
            }
        }
        st.insert(token, sess);
        metrics::gauge!(telemetry::SESSIONS_ACTIVE).set(st.len() as f64);
    }

    /// Removes `token` only if it is still owned by session `id`.
    pub async fn unregister(&self, token: &Token, id: u64) -> bool {
        let mut st = self.sessions.write().await;
        let owned = st.get(token).is_some_and(|s| s.id() == id);
        if owned {
            st.remove(token);
            metrics::gauge!(telemetry::SESSIONS_ACTIVE).set(st.len() as f64);
        }
        owned
    }

    pub async fn get(&self, token: &Token) -> Option<Arc<TunnelSession>> {
        self.sessions.read().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Closes every registered session. Used on controller shutdown.
    pub async fn close_all(&self) {
        let all: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        metrics::gauge!(telemetry::SESSIONS_ACTIVE).set(0.0);
        for s in all {
            s.close().await;
        }
    }
}
