//! Controller side of one agent's control channel.
//!
//! A session starts in `AwaitingAuth`. A valid `AgentAuth` registers the token,
//! binds the public listeners and moves it to `Active`, where public clients are
//! accepted and relayed as `ClientData` frames. Any failure of the control
//! channel tears everything down.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

use crate::natgate::{
    telemetry::{now_unix_ms, system_time_from_ms},
    tunnel::{
        auth::{AuthError, Authenticator, TunnelConfig, TunnelHooks},
        channel::{ChannelError, FrameSink, FrameSource, Framing},
        flows::{ChunkSize, DEFAULT_CHUNK_SIZE, FlowTable, Uplink, WriteOutcome, relay},
        protocol::{AgentInfo, ClientData, Endpoint, Proto, Request, Response, Token},
        registry::Registry,
        transport::{BoxedStream, ControlConn},
        udpmux::UdpListener,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingAuth,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Interface the public listeners bind on.
    pub bind_ip: IpAddr,
    pub initial_chunk_size: usize,
    /// Ends a public UDP flow after this long without a datagram from the client.
    pub udp_idle_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            initial_chunk_size: DEFAULT_CHUNK_SIZE,
            udp_idle_timeout: None,
        }
    }
}

#[derive(Clone)]
struct ActiveTunnel {
    token: Token,
    info: AgentInfo,
    hooks: Arc<dyn TunnelHooks>,
}

struct Listeners {
    udp: Option<Arc<UdpListener>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Listeners {
    /// Returns once every public socket is released.
    async fn shutdown(self) {
        if let Some(u) = &self.udp {
            u.close().await;
        }
        for t in &self.tasks {
            t.abort();
        }
        for t in self.tasks {
            let _ = t.await;
        }
    }
}

struct Bound {
    tcp: Option<TcpListener>,
    udp: Option<UdpListener>,
    tcp_port: u16,
    udp_port: u16,
}

enum Step {
    Continue,
    Stop,
}

pub struct TunnelSession {
    id: u64,
    remote: SocketAddr,
    framing: Framing,
    opts: SessionOptions,
    sink: FrameSink,
    registry: Arc<Registry>,
    auth: Arc<dyn Authenticator>,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    flows: FlowTable,
    chunk: ChunkSize,
    active: Mutex<Option<ActiveTunnel>>,
    listeners: Mutex<Option<Listeners>>,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TunnelSession {
    pub fn new(
        id: u64,
        conn: ControlConn,
        opts: SessionOptions,
        registry: Arc<Registry>,
        auth: Arc<dyn Authenticator>,
    ) -> (Arc<Self>, FrameSource) {
        let remote = conn.remote;
        let framing = conn.framing;
        let (source, sink) = conn.into_channel();
        let chunk = ChunkSize::new(opts.initial_chunk_size);
        let sess = Arc::new(Self {
            id,
            remote,
            framing,
            opts,
            sink,
            registry,
            auth,
            state: watch::channel(SessionState::Connecting).0,
            shutdown: watch::channel(false).0,
            flows: FlowTable::new(),
            chunk,
            active: Mutex::new(None),
            listeners: Mutex::new(None),
        });
        (sess, source)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn client_count(&self) -> usize {
        self.flows.len()
    }

    /// Ports and observed address handed to the agent, once active.
    pub fn agent_info(&self) -> Option<AgentInfo> {
        self.active_tunnel().map(|a| a.info)
    }

    fn set_state(&self, s: SessionState) {
        self.state.send_replace(s);
    }

    fn is_closing(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn active_tunnel(&self) -> Option<ActiveTunnel> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stops the session: public listeners are released and every client flow is
    /// dropped before this returns. The read loop exits on its own shortly after.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(l) = listeners {
            l.shutdown().await;
        }
        let n = self.flows.close_all();
        if n > 0 {
            tracing::debug!(session = self.id, clients = n, "tunnel: dropped clients");
        }
    }

    pub async fn run(self: Arc<Self>, mut source: FrameSource) {
        self.set_state(SessionState::AwaitingAuth);
        tracing::debug!(session = self.id, remote = %self.remote, "tunnel: agent connected");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let res = tokio::select! {
                _ = shutdown.changed() => break,
                res = source.recv::<Request>() => res,
            };
            let req = match res {
                Ok(req) => req,
                Err(err) if err.is_malformed() && self.framing == Framing::Datagram => {
                    tracing::debug!(session = self.id, error = %err, "tunnel: dropping malformed frame");
                    continue;
                }
                Err(ChannelError::Closed) => break,
                Err(err) => {
                    tracing::debug!(session = self.id, error = %err, "tunnel: control channel failed");
                    break;
                }
            };
            match self.handle(req).await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Err(err) => {
                    tracing::debug!(session = self.id, error = %err, "tunnel: send failed");
                    break;
                }
            }
        }

        self.teardown().await;
    }

    async fn handle(self: &Arc<Self>, req: Request) -> Result<Step, ChannelError> {
        if let Request::AgentAuth(token) = req {
            return self.on_auth(token).await;
        }
        let Some(active) = self.active_tunnel() else {
            tracing::trace!(session = self.id, "tunnel: frame before auth");
            self.sink.send(&Response::SendAuth).await?;
            return Ok(Step::Continue);
        };

        match req {
            Request::AgentAuth(_) => {}
            Request::Ping(agent_ms) => {
                let now = now_unix_ms();
                self.sink.send(&Response::Pong(now)).await?;
                let hooks = active.hooks;
                tokio::spawn(async move {
                    hooks
                        .agent_ping(system_time_from_ms(agent_ms), system_time_from_ms(now))
                        .await
                });
            }
            Request::ClientClose(ep) => {
                if self.flows.close(&ep) {
                    tracing::debug!(session = self.id, client = %ep, "tunnel: agent closed client");
                }
            }
            Request::ClientData(cd) => {
                let ep = cd.endpoint;
                let n = cd.data.len();
                // Counted as sent by the agent, whether or not the client is still there.
                let hooks = active.hooks;
                tokio::spawn(async move { hooks.register_tx(ep, n).await });
                match self.flows.write(&ep, &cd.data).await {
                    WriteOutcome::Written => {}
                    WriteOutcome::Missing => {
                        self.sink.send(&Response::CloseClient(ep)).await?;
                    }
                    WriteOutcome::Failed(err) => {
                        tracing::debug!(session = self.id, client = %ep, error = %err, "tunnel: client write failed");
                        self.flows.close(&ep);
                        self.sink.send(&Response::CloseClient(ep)).await?;
                    }
                }
            }
            Request::ResizeBuffer(n) => {
                let applied = self.chunk.set(n);
                tracing::trace!(session = self.id, chunk = applied, "tunnel: agent resized chunk");
            }
        }
        Ok(Step::Continue)
    }

    async fn on_auth(self: &Arc<Self>, token: Token) -> Result<Step, ChannelError> {
        if let Some(active) = self.active_tunnel() {
            // A retransmitted auth whose reply was lost gets the same answer again.
            let reply = if active.token == token {
                Response::AgentInfo(active.info)
            } else {
                Response::BadRequest
            };
            self.sink.send(&reply).await?;
            return Ok(Step::Continue);
        }

        match self.auth.authenticate(&token).await {
            Ok(cfg) => self.activate(token, cfg).await,
            Err(AuthError::Failed) => {
                tracing::warn!(session = self.id, remote = %self.remote, token = %token, "tunnel: agent rejected");
                self.sink.send(&Response::Unauthorized).await?;
                Ok(Step::Stop)
            }
            Err(err) => {
                tracing::warn!(session = self.id, remote = %self.remote, error = %err, "tunnel: auth lookup failed");
                self.sink.send(&Response::BadRequest).await?;
                Ok(Step::Continue)
            }
        }
    }

    async fn activate(self: &Arc<Self>, token: Token, cfg: TunnelConfig) -> Result<Step, ChannelError> {
        self.registry.register(token, self.clone()).await;

        let bound = match bind_listeners(self.opts.bind_ip, &cfg).await {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(
                    session = self.id,
                    token = %token,
                    proto = %cfg.proto,
                    tcp_port = cfg.tcp_port,
                    udp_port = cfg.udp_port,
                    error = %err,
                    "tunnel: cannot bind public listeners"
                );
                self.registry.unregister(&token, self.id).await;
                self.sink.send(&Response::BadRequest).await?;
                return Ok(Step::Continue);
            }
        };

        let info = AgentInfo {
            proto: cfg.proto,
            udp_port: bound.udp_port,
            tcp_port: bound.tcp_port,
            addr: self.remote,
        };
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveTunnel {
            token,
            info,
            hooks: cfg.hooks.clone(),
        });
        let listeners = self.spawn_accept_loops(bound, cfg.hooks);
        *self.listeners.lock().unwrap_or_else(|e| e.into_inner()) = Some(listeners);

        // Superseded while binding.
        if self.is_closing() {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(l) = listeners {
                l.shutdown().await;
            }
            return Ok(Step::Stop);
        }

        self.set_state(SessionState::Active);
        tracing::info!(
            session = self.id,
            remote = %self.remote,
            token = %token,
            proto = %info.proto,
            tcp_port = info.tcp_port,
            udp_port = info.udp_port,
            "tunnel: agent active"
        );
        self.sink.send(&Response::AgentInfo(info)).await?;
        Ok(Step::Continue)
    }

    fn spawn_accept_loops(self: &Arc<Self>, bound: Bound, hooks: Arc<dyn TunnelHooks>) -> Listeners {
        let mut tasks = Vec::new();
        if let Some(ln) = bound.tcp {
            tasks.push(tokio::spawn(self.clone().accept_tcp(ln, hooks.clone())));
        }
        let udp = bound.udp.map(Arc::new);
        if let Some(ln) = &udp {
            tasks.push(tokio::spawn(self.clone().accept_udp(ln.clone(), hooks)));
        }
        Listeners { udp, tasks }
    }

    async fn accept_tcp(self: Arc<Self>, ln: TcpListener, hooks: Arc<dyn TunnelHooks>) {
        loop {
            match ln.accept().await {
                Ok((c, peer)) => {
                    let _ = c.set_nodelay(true);
                    tokio::spawn(self.clone().serve_client(Endpoint::tcp(peer), Box::new(c), hooks.clone()));
                }
                Err(err) => {
                    tracing::warn!(session = self.id, error = %err, "tunnel: tcp accept failed; listener stopped");
                    return;
                }
            }
        }
    }

    async fn accept_udp(self: Arc<Self>, ln: Arc<UdpListener>, hooks: Arc<dyn TunnelHooks>) {
        loop {
            match ln.accept().await {
                Ok(c) => {
                    let ep = Endpoint::udp(c.peer_addr());
                    tokio::spawn(self.clone().serve_client(ep, Box::new(c), hooks.clone()));
                }
                Err(err) => {
                    tracing::debug!(session = self.id, error = %err, "tunnel: udp listener stopped");
                    return;
                }
            }
        }
    }

    async fn serve_client(self: Arc<Self>, ep: Endpoint, stream: BoxedStream, hooks: Arc<dyn TunnelHooks>) {
        if hooks.blocked_addr(ep.addr.ip()).await {
            tracing::debug!(session = self.id, client = %ep, "tunnel: client blocked");
            return;
        }
        if self.is_closing() {
            return;
        }
        let (rd, wr) = tokio::io::split(stream);
        let flow = self.flows.insert(ep, Box::new(wr));
        if self.is_closing() {
            self.flows.remove_if_current(&ep, flow.id);
            return;
        }
        tracing::debug!(session = self.id, client = %ep, "tunnel: client connected");

        let idle = match ep.proto {
            Proto::Udp => self.opts.udp_idle_timeout,
            Proto::Tcp => None,
        };
        let uplink = SessionUplink {
            sess: self.clone(),
            hooks,
        };
        let end = relay(rd, ep, &self.chunk, flow.stop, idle, &uplink).await;
        self.flows.finish(&ep, flow.id, &end, &uplink).await;
        tracing::debug!(session = self.id, client = %ep, end = ?end, "tunnel: client finished");
    }

    async fn teardown(&self) {
        self.set_state(SessionState::Closing);
        self.close().await;
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(a) = active {
            self.registry.unregister(&a.token, self.id).await;
            let hooks = a.hooks;
            tokio::spawn(async move { hooks.agent_shutdown(SystemTime::now()).await });
        }
        self.sink.close().await;
        self.set_state(SessionState::Closed);
        tracing::debug!(session = self.id, remote = %self.remote, "tunnel: session closed");
    }
}

struct SessionUplink {
    sess: Arc<TunnelSession>,
    hooks: Arc<dyn TunnelHooks>,
}

#[async_trait]
impl Uplink for SessionUplink {
    async fn send_data(&self, ep: Endpoint, chunk: Bytes) -> Result<(), ChannelError> {
        let n = chunk.len();
        self.sess
            .sink
            .send(&Response::ClientData(ClientData::new(ep, chunk)))
            .await?;
        let hooks = self.hooks.clone();
        tokio::spawn(async move { hooks.register_rx(ep, n).await });
        Ok(())
    }

    async fn send_resize(&self, size: usize) -> Result<(), ChannelError> {
        self.sess.sink.send(&Response::ResizeBuffer(size as u64)).await
    }

    async fn send_close(&self, ep: Endpoint) -> Result<(), ChannelError> {
        self.sess.sink.send(&Response::CloseClient(ep)).await
    }
}

/// Binds what `cfg` asks for. On error nothing stays bound.
async fn bind_listeners(ip: IpAddr, cfg: &TunnelConfig) -> io::Result<Bound> {
    let mut b = Bound {
        tcp: None,
        udp: None,
        tcp_port: cfg.tcp_port,
        udp_port: cfg.udp_port,
    };
    if cfg.proto.includes(Proto::Tcp) {
        let ln = TcpListener::bind((ip, cfg.tcp_port)).await?;
        b.tcp_port = ln.local_addr()?.port();
        b.tcp = Some(ln);
    }
    if cfg.proto.includes(Proto::Udp) {
        let ln = UdpListener::bind((ip, cfg.udp_port)).await?;
        b.udp_port = ln.local_addr().port();
        b.udp = Some(ln);
    }
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::natgate::tunnel::{auth::NoopHooks, protocol::ListenProto};

    fn cfg(proto: ListenProto, tcp_port: u16, udp_port: u16) -> TunnelConfig {
        TunnelConfig {
            proto,
            udp_port,
            tcp_port,
            hooks: Arc::new(NoopHooks),
        }
    }

    #[tokio::test]
    async fn ephemeral_ports_report_the_bound_port() {
        let b = bind_listeners(IpAddr::V4(Ipv4Addr::LOCALHOST), &cfg(ListenProto::Both, 0, 0))
            .await
            .unwrap();
        assert_ne!(b.tcp_port, 0);
        assert_ne!(b.udp_port, 0);
        assert!(b.tcp.is_some() && b.udp.is_some());
    }

    #[tokio::test]
    async fn only_requested_protocols_are_bound() {
        let b = bind_listeners(IpAddr::V4(Ipv4Addr::LOCALHOST), &cfg(ListenProto::Udp, 1, 0))
            .await
            .unwrap();
        assert!(b.tcp.is_none());
        assert_eq!(b.tcp_port, 1);
        assert!(b.udp.is_some());
    }

    #[tokio::test]
    async fn failed_udp_bind_releases_tcp() {
        let taken = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_port = taken.local_addr().unwrap().port();
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_port = free.local_addr().unwrap().port();
        drop(free);

        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(bind_listeners(ip, &cfg(ListenProto::Both, tcp_port, udp_port)).await.is_err());
        TcpListener::bind((ip, tcp_port)).await.expect("tcp port released");
    }
}
