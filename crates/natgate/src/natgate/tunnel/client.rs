//! Agent side of the tunnel.
//!
//! [`Client::dial`] connects to the first reachable controller and authenticates.
//! [`Client::run`] then serves the control channel: every public client the
//! controller reports shows up as a [`LocalConn`] on [`Incoming`], and whatever the
//! application writes to it is relayed back.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpStream, UdpSocket},
    sync::{Notify, mpsc, watch},
    time::MissedTickBehavior,
};

use crate::natgate::{
    net::unspecified_for,
    telemetry::now_unix_ms,
    tunnel::{
        channel::{ChannelError, FrameSink, FrameSource, Framing, MAX_DATAGRAM_BYTES},
        flows::{ChunkSize, DEFAULT_CHUNK_SIZE, FlowTable, Uplink, WriteOutcome, relay},
        pipe::{DEFAULT_PIPE_BUFFER, Pipe, pipe},
        protocol::{AgentInfo, ClientData, Endpoint, Proto, Request, Response, Token},
        transport::{transport_by_name, udp::resolve_socket_addr},
    },
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Controller addresses, tried in order.
    pub servers: Vec<String>,
    pub transport: String,
    pub token: Token,
    pub dial_timeout: Duration,
    /// How long to wait for an answer to one `AgentAuth`.
    pub auth_timeout: Duration,
    pub auth_retry_delay: Duration,
    pub auth_max_attempts: u32,
    pub heartbeat_interval: Duration,
    /// Give up on the controller after this long without a `Pong`.
    pub dead_after: Option<Duration>,
    pub initial_chunk_size: usize,
    /// New flows waiting to be picked up, per protocol.
    pub accept_backlog: usize,
}

impl ClientOptions {
    pub fn new(servers: Vec<String>, token: Token) -> Self {
        Self {
            servers,
            transport: "udp".into(),
            token,
            dial_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(5),
            auth_retry_delay: Duration::from_secs(3),
            auth_max_attempts: 25,
            heartbeat_interval: Duration::from_secs(5),
            dead_after: None,
            initial_chunk_size: DEFAULT_CHUNK_SIZE,
            accept_backlog: 128,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client options: {0}")]
    Options(String),
    #[error("cannot connect to any controller")]
    CannotConnect,
    #[error("controller rejected the agent token")]
    Unauthorized,
    #[error("no answer to authentication after {0} attempts")]
    AuthExhausted(u32),
    #[error("controller cannot open the tunnel listeners")]
    NotListened,
    #[error("controller stopped answering heartbeats")]
    ControllerTimeout,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl ClientError {
    /// Errors that will not go away by reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Options(_)
                | ClientError::Unauthorized
                | ClientError::AuthExhausted(_)
                | ClientError::NotListened
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Authenticating,
    Connected,
    Closed,
}

/// One public client, as seen by the local application.
#[derive(Debug)]
pub struct LocalConn {
    pub endpoint: Endpoint,
    pub conn: Pipe,
}

pub struct Incoming {
    pub tcp: mpsc::Receiver<LocalConn>,
    pub udp: mpsc::Receiver<LocalConn>,
}

struct Shared {
    sink: FrameSink,
    flows: FlowTable,
    chunk: ChunkSize,
    last_pong: AtomicI64,
    dead: Notify,
    state: watch::Sender<ClientState>,
    new_tcp: mpsc::Sender<LocalConn>,
    new_udp: mpsc::Sender<LocalConn>,
}

impl Shared {
    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn set_state(&self, s: ClientState) {
        self.state.send_replace(s);
    }

    async fn deliver(self: &Arc<Self>, cd: ClientData) -> Result<(), ChannelError> {
        let ep = cd.endpoint;
        if !self.flows.contains(&ep) && !self.open_local(ep) {
            return self.sink.send(&Request::ClientClose(ep)).await;
        }
        match self.flows.write(&ep, &cd.data).await {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Missing => self.sink.send(&Request::ClientClose(ep)).await,
            WriteOutcome::Failed(err) => {
                tracing::debug!(client = %ep, err = %err, "tunnel: local write failed");
                self.flows.close(&ep);
                self.sink.send(&Request::ClientClose(ep)).await
            }
        }
    }

    /// Starts a flow for a client seen for the first time.
    fn open_local(self: &Arc<Self>, ep: Endpoint) -> bool {
        let tx = match ep.proto {
            Proto::Tcp => &self.new_tcp,
            Proto::Udp => &self.new_udp,
        };
        let (local, app) = pipe(DEFAULT_PIPE_BUFFER);
        let (rd, wr) = tokio::io::split(local);
        let flow = self.flows.insert(ep, Box::new(wr));
        if let Err(err) = tx.try_send(LocalConn { endpoint: ep, conn: app }) {
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "backlog full",
                mpsc::error::TrySendError::Closed(_) => "no consumer",
            };
            tracing::warn!(client = %ep, reason, "tunnel: refusing client");
            self.flows.remove_if_current(&ep, flow.id);
            return false;
        }
        tracing::debug!(client = %ep, "tunnel: client opened");

        let shared = self.clone();
        tokio::spawn(async move {
            let uplink = AgentUplink(shared.clone());
            let end = relay(rd, ep, &shared.chunk, flow.stop, None, &uplink).await;
            shared.flows.finish(&ep, flow.id, &end, &uplink).await;
            tracing::debug!(client = %ep, end = ?end, "tunnel: client finished");
        });
        true
    }
}

pub struct Client {
    opts: ClientOptions,
    server: String,
    info: AgentInfo,
    source: FrameSource,
    shared: Arc<Shared>,
}

impl Client {
    pub async fn dial(opts: ClientOptions) -> Result<(Self, Incoming), ClientError> {
        let tr = transport_by_name(&opts.transport).map_err(|e| ClientError::Options(e.to_string()))?;
        if opts.servers.is_empty() {
            return Err(ClientError::Options("no controller address".into()));
        }

        let mut dialed = None;
        for server in &opts.servers {
            match tokio::time::timeout(opts.dial_timeout, tr.dial(server)).await {
                Ok(Ok(c)) => {
                    dialed = Some((server.clone(), c));
                    break;
                }
                Ok(Err(err)) => tracing::debug!(server = %server, err = %err, "tunnel: dial failed"),
                Err(_) => tracing::debug!(server = %server, "tunnel: dial timed out"),
            }
        }
        let Some((server, conn)) = dialed else {
            return Err(ClientError::CannotConnect);
        };

        let (mut source, sink) = conn.into_channel();
        let info = authenticate(&mut source, &sink, &opts).await?;
        tracing::info!(
            server = %server,
            transport = %tr.name(),
            proto = %info.proto,
            tcp_port = info.tcp_port,
            udp_port = info.udp_port,
            public_addr = %info.addr,
            "tunnel: agent connected"
        );

        let (new_tcp, tcp) = mpsc::channel(opts.accept_backlog.max(1));
        let (new_udp, udp) = mpsc::channel(opts.accept_backlog.max(1));
        let shared = Arc::new(Shared {
            sink,
            flows: FlowTable::new(),
            chunk: ChunkSize::new(opts.initial_chunk_size),
            last_pong: AtomicI64::new(now_unix_ms()),
            dead: Notify::new(),
            state: watch::channel(ClientState::Connected).0,
            new_tcp,
            new_udp,
        });
        let client = Self {
            opts,
            server,
            info,
            source,
            shared,
        };
        Ok((client, Incoming { tcp, udp }))
    }

    pub fn info(&self) -> AgentInfo {
        self.info
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Serves the control channel until shutdown or a channel failure.
    ///
    /// `Ok(())` only on shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let hb = tokio::spawn(heartbeat(
            self.shared.clone(),
            self.opts.heartbeat_interval,
            self.opts.dead_after,
        ));
        let res = self.serve(&mut shutdown).await;
        hb.abort();

        let dropped = self.shared.flows.close_all();
        self.shared.sink.close().await;
        self.shared.set_state(ClientState::Closed);
        match &res {
            Ok(()) => tracing::info!(server = %self.server, "tunnel: agent stopped"),
            Err(err) => tracing::debug!(server = %self.server, err = %err, dropped, "tunnel: agent session ended"),
        }
        res
    }

    async fn serve(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let res = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                _ = self.shared.dead.notified() => return Err(ClientError::ControllerTimeout),
                res = self.source.recv::<Response>() => res,
            };
            match res {
                Ok(frame) => self.handle(frame, shutdown).await?,
                Err(err) if err.is_malformed() && self.source.framing() == Framing::Datagram => {
                    tracing::debug!(err = %err, "tunnel: dropping malformed frame");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn handle(&mut self, frame: Response, shutdown: &mut watch::Receiver<bool>) -> Result<(), ClientError> {
        match frame {
            Response::Pong(_) => self.shared.last_pong.store(now_unix_ms(), Ordering::Relaxed),
            Response::SendAuth => {
                // The controller lost our session, and with it every flow.
                self.shared.set_state(ClientState::Authenticating);
                let dropped = self.shared.flows.close_all();
                tracing::info!(server = %self.server, dropped, "tunnel: controller asked to re-authenticate");
                // On shutdown the caller's loop sees the flag and returns.
                self.info = tokio::select! {
                    res = authenticate(&mut self.source, &self.shared.sink, &self.opts) => res?,
                    _ = shutdown.changed() => return Ok(()),
                };
                self.shared.last_pong.store(now_unix_ms(), Ordering::Relaxed);
                self.shared.set_state(ClientState::Connected);
            }
            Response::Unauthorized => return Err(ClientError::Unauthorized),
            Response::NotListened => return Err(ClientError::NotListened),
            Response::BadRequest => tracing::debug!("tunnel: controller rejected a frame"),
            Response::AgentInfo(info) => self.info = info,
            Response::ResizeBuffer(n) => {
                self.shared.chunk.set(n);
            }
            Response::CloseClient(ep) => {
                if self.shared.flows.close(&ep) {
                    tracing::debug!(client = %ep, "tunnel: controller closed client");
                }
            }
            Response::ClientData(cd) => self.shared.deliver(cd).await?,
        }
        Ok(())
    }
}

struct AgentUplink(Arc<Shared>);

#[async_trait]
impl Uplink for AgentUplink {
    async fn send_data(&self, ep: Endpoint, chunk: Bytes) -> Result<(), ChannelError> {
        self.0.sink.send(&Request::ClientData(ClientData::new(ep, chunk))).await
    }

    async fn send_resize(&self, size: usize) -> Result<(), ChannelError> {
        self.0.sink.send(&Request::ResizeBuffer(size as u64)).await
    }

    async fn send_close(&self, ep: Endpoint) -> Result<(), ChannelError> {
        self.0.sink.send(&Request::ClientClose(ep)).await
    }
}

async fn authenticate(
    source: &mut FrameSource,
    sink: &FrameSink,
    opts: &ClientOptions,
) -> Result<AgentInfo, ClientError> {
    let attempts = opts.auth_max_attempts.max(1);
    for attempt in 1..=attempts {
        sink.send(&Request::AgentAuth(opts.token)).await?;
        match tokio::time::timeout(opts.auth_timeout, await_auth_reply(source)).await {
            Ok(Ok(Some(info))) => return Ok(info),
            Ok(Ok(None)) => tracing::debug!(attempt, "tunnel: controller asked to retry auth"),
            Ok(Err(err)) => return Err(err),
            Err(_) => tracing::debug!(attempt, "tunnel: auth reply timed out"),
        }
        if attempt < attempts {
            tokio::time::sleep(opts.auth_retry_delay).await;
        }
    }
    tracing::warn!(attempts, "tunnel: giving up on authentication");
    Err(ClientError::AuthExhausted(attempts))
}

/// `Ok(None)` means the controller wants another attempt.
async fn await_auth_reply(source: &mut FrameSource) -> Result<Option<AgentInfo>, ClientError> {
    loop {
        match source.recv::<Response>().await {
            Ok(Response::AgentInfo(info)) => return Ok(Some(info)),
            Ok(Response::Unauthorized) => return Err(ClientError::Unauthorized),
            Ok(Response::NotListened) => return Err(ClientError::NotListened),
            Ok(Response::SendAuth | Response::BadRequest) => return Ok(None),
            Ok(other) => tracing::trace!(frame = ?other, "tunnel: ignoring frame while authenticating"),
            Err(err) if err.is_malformed() && source.framing() == Framing::Datagram => {}
            Err(err) => return Err(err.into()),
        }
    }
}

async fn heartbeat(shared: Arc<Shared>, every: Duration, dead_after: Option<Duration>) {
    let mut tick = tokio::time::interval(every.max(Duration::from_millis(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if shared.state() != ClientState::Connected {
            continue;
        }
        let now = now_unix_ms();
        if let Some(limit) = dead_after {
            let silent = now.saturating_sub(shared.last_pong.load(Ordering::Relaxed));
            if silent > limit.as_millis() as i64 {
                tracing::warn!(
                    silent = %humantime::format_duration(Duration::from_millis(silent as u64)),
                    "tunnel: controller stopped answering"
                );
                shared.dead.notify_one();
                return;
            }
        }
        if let Err(err) = shared.sink.send(&Request::Ping(now)).await {
            tracing::debug!(err = %err, "tunnel: ping failed");
            return;
        }
    }
}

/// Connects every flow from `incoming` to `target` on the local network, TCP
/// flows to a TCP socket and UDP flows to a connected UDP socket.
pub async fn serve_local(mut incoming: mpsc::Receiver<LocalConn>, target: String) {
    while let Some(LocalConn { endpoint, conn }) = incoming.recv().await {
        let target = target.clone();
        tokio::spawn(async move {
            let res = match endpoint.proto {
                Proto::Tcp => bridge_tcp(conn, &target).await,
                Proto::Udp => bridge_udp(conn, &target).await,
            };
            if let Err(err) = res {
                tracing::debug!(client = %endpoint, target = %target, err = %err, "tunnel: local bridge ended");
            }
        });
    }
}

async fn bridge_tcp(mut conn: Pipe, target: &str) -> anyhow::Result<()> {
    let mut up = TcpStream::connect(target).await?;
    let _ = up.set_nodelay(true);
    tokio::io::copy_bidirectional(&mut conn, &mut up).await?;
    Ok(())
}

async fn bridge_udp(conn: Pipe, target: &str) -> anyhow::Result<()> {
    let remote: SocketAddr = resolve_socket_addr(target).await?;
    let sock = UdpSocket::bind(unspecified_for(&remote)).await?;
    sock.connect(remote).await?;
    let (mut rd, mut wr) = tokio::io::split(conn);
    tokio::select! {
        r = tunnel_to_local(&mut rd, &sock) => r,
        r = local_to_tunnel(&sock, &mut wr) => r,
    }
}

async fn tunnel_to_local(rd: &mut ReadHalf<Pipe>, sock: &UdpSocket) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sock.send(&buf[..n]).await?;
    }
}

async fn local_to_tunnel(sock: &UdpSocket, wr: &mut WriteHalf<Pipe>) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let n = sock.recv(&mut buf).await?;
        wr.write_all(&buf[..n]).await?;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, Ipv4Addr},
        sync::atomic::AtomicUsize,
    };

    use tokio::net::TcpListener;

    use super::*;
    use crate::natgate::tunnel::{
        auth::{AuthError, Authenticator, StaticAgent, StaticAuthenticator, TunnelConfig},
        protocol::{Frame, ListenProto},
        registry::Registry,
        server::{Server, ServerOptions},
        session::SessionOptions,
    };

    fn token() -> Token {
        "agent-token-000000000000000000000002".parse().unwrap()
    }

    fn fast(servers: Vec<String>, transport: &str) -> ClientOptions {
        let mut o = ClientOptions::new(servers, token());
        o.transport = transport.into();
        o.dial_timeout = Duration::from_secs(1);
        o.auth_timeout = Duration::from_millis(300);
        o.auth_retry_delay = Duration::from_millis(10);
        o.auth_max_attempts = 3;
        o.heartbeat_interval = Duration::from_millis(50);
        o
    }

    struct Counting {
        inner: StaticAuthenticator,
        calls: AtomicUsize,
        flaky: usize,
    }

    #[async_trait]
    impl Authenticator for Counting {
        async fn authenticate(&self, t: &Token) -> Result<TunnelConfig, AuthError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.flaky {
                return Err(AuthError::Lookup(anyhow::anyhow!("try again")));
            }
            self.inner.authenticate(t).await
        }
    }

    fn counting(proto: ListenProto, flaky: usize) -> Arc<Counting> {
        Arc::new(Counting {
            inner: StaticAuthenticator::new([StaticAgent {
                token: token(),
                proto,
                tcp_port: 0,
                udp_port: 0,
                blocked: vec![],
            }]),
            calls: AtomicUsize::new(0),
            flaky,
        })
    }

    async fn controller(transport: &str, auth: Arc<dyn Authenticator>) -> (String, watch::Sender<bool>) {
        let server = Arc::new(
            Server::new(ServerOptions {
                listen_addr: "127.0.0.1:0".into(),
                transport: transport.into(),
                session: SessionOptions {
                    bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    ..SessionOptions::default()
                },
                authenticator: auth,
                registry: Arc::new(Registry::new()),
            })
            .unwrap(),
        );
        let ln = server.listen().await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (stop, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(ln, rx).await });
        (addr, stop)
    }

    async fn tcp_echo() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut c, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn udp_echo() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            while let Ok((n, from)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn unauthorized_is_fatal_without_retry() {
        let auth = counting(ListenProto::Tcp, 0);
        let (addr, _stop) = controller("udp", auth.clone()).await;
        let mut opts = fast(vec![addr], "udp");
        opts.token = "z".repeat(36).parse().unwrap();

        let err = Client::dial(opts).await.err().expect("dial must fail");
        assert!(matches!(err, ClientError::Unauthorized));
        assert!(err.is_fatal());
        assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_auth_failure_is_retried() {
        let auth = counting(ListenProto::Udp, 1);
        let (addr, _stop) = controller("udp", auth.clone()).await;
        let (client, _incoming) = Client::dial(fast(vec![addr], "udp")).await.unwrap();
        assert_eq!(client.info().proto, ListenProto::Udp);
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn silent_controller_exhausts_attempts() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut opts = fast(vec![silent.local_addr().unwrap().to_string()], "udp");
        opts.auth_timeout = Duration::from_millis(30);

        let err = Client::dial(opts).await.err().expect("dial must fail");
        assert!(matches!(err, ClientError::AuthExhausted(3)));

        let mut buf = [0u8; 128];
        for _ in 0..3 {
            let n = silent.recv(&mut buf).await.unwrap();
            assert_eq!(Request::decode_exact(&buf[..n]).unwrap(), Request::AgentAuth(token()));
        }
    }

    #[tokio::test]
    async fn unreachable_controllers_are_skipped() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = closed.local_addr().unwrap().to_string();
        drop(closed);

        let err = Client::dial(fast(vec![dead.clone()], "tcp")).await.err().expect("no controller");
        assert!(matches!(err, ClientError::CannotConnect));

        let (addr, _stop) = controller("tcp", counting(ListenProto::Tcp, 0)).await;
        let (client, _incoming) = Client::dial(fast(vec![dead, addr.clone()], "tcp")).await.unwrap();
        assert_eq!(client.server(), addr);
    }

    #[tokio::test]
    async fn tcp_clients_reach_the_local_service() {
        let (addr, _stop) = controller("tcp", counting(ListenProto::Tcp, 0)).await;
        let (client, incoming) = Client::dial(fast(vec![addr], "tcp")).await.unwrap();
        let port = client.info().tcp_port;
        let (_quit, quit_rx) = watch::channel(false);
        tokio::spawn(client.run(quit_rx));
        tokio::spawn(serve_local(incoming.tcp, tcp_echo().await.to_string()));

        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let (mut r, mut w) = public.split();
        let send = async {
            w.write_all(&payload).await.unwrap();
        };
        let mut echoed = vec![0u8; payload.len()];
        let recv = async {
            tokio::time::timeout(Duration::from_secs(10), r.read_exact(&mut echoed))
                .await
                .expect("echo in time")
                .unwrap();
        };
        tokio::join!(send, recv);
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn full_chunks_cross_a_udp_control_channel() {
        let (addr, _stop) = controller("udp", counting(ListenProto::Tcp, 0)).await;
        let (client, incoming) = Client::dial(fast(vec![addr], "udp")).await.unwrap();
        let port = client.info().tcp_port;
        let (_quit, quit_rx) = watch::channel(false);
        tokio::spawn(client.run(quit_rx));
        tokio::spawn(serve_local(incoming.tcp, tcp_echo().await.to_string()));

        // Several chunks of DEFAULT_CHUNK_SIZE, each frame larger than 8 KiB.
        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let payload: Vec<u8> = (0..3 * DEFAULT_CHUNK_SIZE + 100).map(|i| (i % 241) as u8).collect();
        public.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(5), public.read_exact(&mut echoed))
            .await
            .expect("echo in time")
            .unwrap();
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn udp_clients_reach_the_local_service() {
        let (addr, _stop) = controller("udp", counting(ListenProto::Udp, 0)).await;
        let (client, incoming) = Client::dial(fast(vec![addr], "udp")).await.unwrap();
        let port = client.info().udp_port;
        let (_quit, quit_rx) = watch::channel(false);
        tokio::spawn(client.run(quit_rx));
        tokio::spawn(serve_local(incoming.udp, udp_echo().await.to_string()));

        let public = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        public.connect(("127.0.0.1", port)).await.unwrap();
        public.send(&[1, 9, 9, 1]).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), public.recv(&mut buf))
            .await
            .expect("echo in time")
            .unwrap();
        assert_eq!(&buf[..n], &[1, 9, 9, 1]);
    }

    #[tokio::test]
    async fn shutdown_stops_run_cleanly() {
        let (addr, _stop) = controller("udp", counting(ListenProto::Udp, 0)).await;
        let (client, _incoming) = Client::dial(fast(vec![addr], "udp")).await.unwrap();
        let (quit, quit_rx) = watch::channel(false);
        let run = tokio::spawn(client.run(quit_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        quit.send_replace(true);
        let res = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("stopped in time")
            .unwrap();
        assert!(res.is_ok());
    }

    /// Hand-driven controller for protocol corner cases.
    struct FakeController {
        sock: UdpSocket,
        agent: Option<SocketAddr>,
    }

    impl FakeController {
        async fn new() -> Self {
            Self {
                sock: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                agent: None,
            }
        }

        fn addr(&self) -> String {
            self.sock.local_addr().unwrap().to_string()
        }

        async fn recv(&mut self) -> Request {
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
            let (n, from) = tokio::time::timeout(Duration::from_secs(2), self.sock.recv_from(&mut buf))
                .await
                .expect("agent frame in time")
                .unwrap();
            self.agent = Some(from);
            Request::decode_exact(&buf[..n]).unwrap()
        }

        async fn recv_auth(&mut self) {
            loop {
                if let Request::AgentAuth(_) = self.recv().await {
                    return;
                }
            }
        }

        async fn send(&self, res: Response) {
            let b = res.to_bytes().unwrap();
            self.sock.send_to(&b, self.agent.unwrap()).await.unwrap();
        }

        fn info(&self) -> Response {
            Response::AgentInfo(AgentInfo {
                proto: ListenProto::Both,
                udp_port: 4000,
                tcp_port: 4001,
                addr: "127.0.0.1:5555".parse().unwrap(),
            })
        }
    }

    #[tokio::test]
    async fn send_auth_triggers_inline_reauth() {
        let mut ctl = FakeController::new().await;
        let opts = fast(vec![ctl.addr()], "udp");
        let dial = tokio::spawn(Client::dial(opts));
        ctl.recv_auth().await;
        ctl.send(ctl.info()).await;
        let (client, _incoming) = dial.await.unwrap().unwrap();

        let (_quit, quit_rx) = watch::channel(false);
        let run = tokio::spawn(client.run(quit_rx));
        ctl.send(Response::SendAuth).await;
        ctl.recv_auth().await;
        ctl.send(ctl.info()).await;

        // Still serving: heartbeats keep coming after re-authentication.
        loop {
            if let Request::Ping(_) = ctl.recv().await {
                break;
            }
        }
        assert!(!run.is_finished());
        ctl.send(Response::NotListened).await;
        let res = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert!(matches!(res, Err(ClientError::NotListened)));
    }

    #[tokio::test]
    async fn shutdown_interrupts_reauth() {
        let mut ctl = FakeController::new().await;
        let mut opts = fast(vec![ctl.addr()], "udp");
        opts.auth_timeout = Duration::from_secs(5);
        opts.auth_max_attempts = 10;
        let dial = tokio::spawn(Client::dial(opts));
        ctl.recv_auth().await;
        ctl.send(ctl.info()).await;
        let (client, _incoming) = dial.await.unwrap().unwrap();

        let (quit, quit_rx) = watch::channel(false);
        let run = tokio::spawn(client.run(quit_rx));
        ctl.send(Response::SendAuth).await;
        // Left unanswered: the agent sits in its first re-auth wait.
        ctl.recv_auth().await;
        quit.send_replace(true);
        let res = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("stopped in time")
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn missing_pongs_end_the_session() {
        let mut ctl = FakeController::new().await;
        let mut opts = fast(vec![ctl.addr()], "udp");
        opts.dead_after = Some(Duration::from_millis(150));
        let dial = tokio::spawn(Client::dial(opts));
        ctl.recv_auth().await;
        ctl.send(ctl.info()).await;
        let (client, _incoming) = dial.await.unwrap().unwrap();

        let (_quit, quit_rx) = watch::channel(false);
        let res = tokio::time::timeout(Duration::from_secs(2), client.run(quit_rx))
            .await
            .expect("gave up in time");
        assert!(matches!(res, Err(ClientError::ControllerTimeout)));
    }

    #[tokio::test]
    async fn unknown_close_and_resize_are_harmless() {
        let mut ctl = FakeController::new().await;
        let dial = tokio::spawn(Client::dial(fast(vec![ctl.addr()], "udp")));
        ctl.recv_auth().await;
        ctl.send(ctl.info()).await;
        let (client, mut incoming) = dial.await.unwrap().unwrap();
        let (_quit, quit_rx) = watch::channel(false);
        let run = tokio::spawn(client.run(quit_rx));

        let ep = Endpoint::tcp("198.51.100.7:40000".parse().unwrap());
        ctl.send(Response::CloseClient(ep)).await;
        ctl.send(Response::ResizeBuffer(16 * 1024)).await;
        ctl.send(Response::ClientData(ClientData::new(ep, Bytes::from_static(b"hi"))))
            .await;

        let mut lc = tokio::time::timeout(Duration::from_secs(2), incoming.tcp.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lc.endpoint, ep);
        let mut buf = [0u8; 2];
        lc.conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        lc.conn.write_all(b"yo").await.unwrap();
        loop {
            if let Request::ClientData(cd) = ctl.recv().await {
                assert_eq!(cd.endpoint, ep);
                assert_eq!(&cd.data[..], b"yo");
                break;
            }
        }

        drop(lc);
        loop {
            if let Request::ClientClose(closed) = ctl.recv().await {
                assert_eq!(closed, ep);
                break;
            }
        }
        assert!(!run.is_finished());
    }
}
