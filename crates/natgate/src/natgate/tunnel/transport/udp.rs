use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UdpSocket,
};

use crate::natgate::{
    net::unspecified_for,
    tunnel::{
        channel::Framing,
        transport::{ControlConn, Transport, TransportListener},
        udpmux::{MAX_READ_BUFFER, UdpListener},
    },
};

/// Control channel over plain UDP: one frame per datagram.
///
/// The controller side demultiplexes agents by source address with [`UdpListener`];
/// the agent side uses a connected socket.
pub struct UdpTransport;

impl UdpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn name(&self) -> &'static str {
        "udp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = resolve_socket_addr(addr).await?;
        // A control frame never spans datagrams, so the first one must fit whole.
        let ln = UdpListener::bind_with_read_buffer(bind_addr, MAX_READ_BUFFER).await?;
        Ok(Box::new(UdpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<ControlConn> {
        let remote = resolve_socket_addr(addr).await?;
        let sock = UdpSocket::bind(unspecified_for(&remote)).await?;
        sock.connect(remote).await?;
        let local = sock.local_addr().ok();
        let sock = Arc::new(sock);
        Ok(ControlConn {
            read: Box::new(ConnectedUdp(sock.clone())),
            write: Box::new(ConnectedUdp(sock)),
            framing: Framing::Datagram,
            remote,
            local,
        })
    }
}

pub struct UdpTransportListener {
    ln: UdpListener,
}

#[async_trait]
impl TransportListener for UdpTransportListener {
    async fn accept(&self) -> anyhow::Result<ControlConn> {
        let c = self.ln.accept().await?;
        let remote = c.peer_addr();
        let local = Some(c.local_addr());
        let (rd, wr) = tokio::io::split(c);
        Ok(ControlConn {
            read: Box::new(rd),
            write: Box::new(wr),
            framing: Framing::Datagram,
            remote,
            local,
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.ln.local_addr())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.ln.close().await;
        Ok(())
    }
}

/// Byte-stream face of a connected UDP socket. One read or write is one datagram.
struct ConnectedUdp(Arc<UdpSocket>);

impl AsyncRead for ConnectedUdp {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.0.poll_recv(cx, buf)
    }
}

impl AsyncWrite for ConnectedUdp {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub(crate) async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("tunnel: could not resolve {addr:?}"))
}
