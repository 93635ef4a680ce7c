use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

use crate::natgate::tunnel::channel::{BoxedRead, BoxedWrite, FrameSink, FrameSource, Framing};

/// Anything a public client can be relayed from: a TCP stream or a [`UdpConn`](super::udpmux::UdpConn).
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// One agent's control connection, before it is split into frame halves.
pub struct ControlConn {
    pub read: BoxedRead,
    pub write: BoxedWrite,
    pub framing: Framing,
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

impl ControlConn {
    pub fn into_channel(self) -> (FrameSource, FrameSink) {
        (
            FrameSource::new(self.read, self.framing),
            FrameSink::new(self.write, self.framing),
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str) -> anyhow::Result<ControlConn>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<ControlConn>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "udp".into();
    }
    match n.as_str() {
        "tcp" | "udp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected udp|tcp)"),
    }
}

pub mod tcp;
pub mod udp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        _ => Ok(Arc::new(udp::UdpTransport::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names() {
        assert_eq!(parse_transport("").unwrap(), "udp");
        assert_eq!(parse_transport(" TCP ").unwrap(), "tcp");
        assert!(parse_transport("quic").is_err());
        assert_eq!(transport_by_name("udp").unwrap().name(), "udp");
    }
}
