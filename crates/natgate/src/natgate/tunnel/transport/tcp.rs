use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::natgate::tunnel::{
    channel::Framing,
    transport::{ControlConn, Transport, TransportListener},
};

/// Control channel over a TCP stream; frames are concatenated.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

fn control_conn(c: TcpStream) -> anyhow::Result<ControlConn> {
    let _ = c.set_nodelay(true);
    let remote = c.peer_addr()?;
    let local = c.local_addr().ok();
    let (rd, wr) = c.into_split();
    Ok(ControlConn {
        read: Box::new(rd),
        write: Box::new(wr),
        framing: Framing::Stream,
        remote,
        local,
    })
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let ln = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<ControlConn> {
        let c = TcpStream::connect(addr).await?;
        control_conn(c)
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<ControlConn> {
        let (c, _) = self.ln.accept().await?;
        control_conn(c)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // The socket closes when the listener is dropped.
        Ok(())
    }
}
