//! Connection-oriented view over one UDP socket.
//!
//! A single reader task owns the socket's receive side. Every new source address
//! becomes a [`UdpConn`] handed out by [`UdpListener::accept`]; later datagrams from
//! that address are queued on the same connection. Writing to a connection sends a
//! datagram back to its peer from the shared socket.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    net::{ToSocketAddrs, UdpSocket},
    sync::mpsc,
    task::JoinHandle,
};

use crate::natgate::tunnel::pipe::{DEFAULT_PIPE_BUFFER, Feeder, Pipe, PipeCloser, pipe};

pub const INITIAL_READ_BUFFER: usize = 8 * 1024;
pub const READ_BUFFER_STEP: usize = 1024;
pub const MAX_READ_BUFFER: usize = 64 * 1024;
pub const ACCEPT_BACKLOG: usize = 128;

struct Peer {
    id: u64,
    feeder: Feeder,
    closer: PipeCloser,
}

struct Shared {
    local: SocketAddr,
    peers: DashMap<SocketAddr, Peer>,
    read_buf: AtomicUsize,
    next_id: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn close_peers(&self) {
        for p in self.peers.iter() {
            p.closer.close();
        }
        self.peers.clear();
    }

    fn closed_error(&self) -> io::Error {
        let msg = self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "udp listener closed".to_string());
        io::Error::new(io::ErrorKind::NotConnected, msg)
    }
}

pub struct UdpListener {
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<UdpConn>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl UdpListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::bind_with_read_buffer(addr, INITIAL_READ_BUFFER).await
    }

    /// Like `bind`, but the receive buffer starts at `initial` bytes (clamped to
    /// `MAX_READ_BUFFER`). Used where every datagram must arrive whole from the
    /// first one on.
    pub async fn bind_with_read_buffer<A: ToSocketAddrs>(addr: A, initial: usize) -> io::Result<Self> {
        let sock = UdpSocket::bind(addr).await?;
        Self::from_socket(sock, initial)
    }

    fn from_socket(sock: UdpSocket, initial: usize) -> io::Result<Self> {
        let local = sock.local_addr()?;
        let initial = initial.clamp(1, MAX_READ_BUFFER);
        let shared = Arc::new(Shared {
            local,
            peers: DashMap::new(),
            read_buf: AtomicUsize::new(initial),
            next_id: AtomicU64::new(1),
            last_error: Mutex::new(None),
        });
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let reader = tokio::spawn(read_loop(Arc::new(sock), shared.clone(), tx));
        Ok(Self {
            shared,
            incoming: tokio::sync::Mutex::new(rx),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local
    }

    /// Current receive buffer size. Starts at 8 KiB by default and grows in 1 KiB steps each
    /// time a datagram fills it completely.
    pub fn read_buffer_size(&self) -> usize {
        self.shared.read_buf.load(Ordering::Relaxed)
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    pub async fn accept(&self) -> io::Result<UdpConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.shared.closed_error());
        }
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or_else(|| self.shared.closed_error())
    }

    /// Stops the reader and closes every peer. The socket is released once this
    /// returns.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(h) = reader {
            h.abort();
            let _ = h.await;
        }
        self.shared.close_peers();
        self.incoming.lock().await.close();
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        if let Some(h) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            h.abort();
        }
        self.shared.close_peers();
    }
}

async fn read_loop(sock: Arc<UdpSocket>, shared: Arc<Shared>, accept_tx: mpsc::Sender<UdpConn>) {
    let mut buf = vec![0u8; shared.read_buf.load(Ordering::Relaxed)];
    loop {
        let (n, from) = match sock.recv_from(&mut buf).await {
            Ok(v) => v,
            // ICMP errors for earlier sends surface here on some platforms.
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
            Err(err) => {
                tracing::warn!(local = %shared.local, error = %err, "udpmux: read failed; closing listener");
                *shared.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
                break;
            }
        };
        if n == buf.len() && buf.len() < MAX_READ_BUFFER {
            let next = (buf.len() + READ_BUFFER_STEP).min(MAX_READ_BUFFER);
            tracing::debug!(local = %shared.local, from = buf.len(), to = next, "udpmux: growing read buffer");
            buf.resize(next, 0);
            shared.read_buf.store(next, Ordering::Relaxed);
        }
        if n == 0 {
            continue;
        }
        dispatch(&sock, &shared, from, Bytes::copy_from_slice(&buf[..n]), &accept_tx);
    }
    shared.close_peers();
}

fn dispatch(
    sock: &Arc<UdpSocket>,
    shared: &Arc<Shared>,
    from: SocketAddr,
    payload: Bytes,
    accept_tx: &mpsc::Sender<UdpConn>,
) {
    if let Some(peer) = shared.peers.get(&from) {
        match peer.feeder.push(payload.clone()) {
            Ok(true) => return,
            Ok(false) => {
                tracing::trace!(peer = %from, "udpmux: peer queue full; dropping datagram");
                return;
            }
            Err(_) => {}
        }
        drop(peer);
        // The consumer went away; the next datagram starts a new connection.
        shared.peers.remove_if(&from, |_, p| p.feeder.is_closed());
    }

    let (conn_end, mux_end) = pipe(DEFAULT_PIPE_BUFFER);
    let feeder = mux_end.feeder();
    if feeder.push(payload).is_err() {
        return;
    }
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let conn = UdpConn {
        pipe: conn_end,
        peer: from,
        local: shared.local,
    };
    let closer = conn.pipe.closer();
    if let Err(err) = accept_tx.try_send(conn) {
        match err {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!(local = %shared.local, peer = %from, "udpmux: accept backlog full; dropping peer");
            }
            mpsc::error::TrySendError::Closed(_) => {}
        }
        return;
    }
    shared.peers.insert(from, Peer { id, feeder, closer });
    tokio::spawn(drain(Arc::downgrade(sock), shared.clone(), from, id, mux_end));
}

/// Sends everything the consumer writes back to `peer`.
async fn drain(sock: Weak<UdpSocket>, shared: Arc<Shared>, peer: SocketAddr, id: u64, mut end: Pipe) {
    let mut buf = vec![0u8; MAX_READ_BUFFER];
    loop {
        let n = match end.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let Some(sock) = sock.upgrade() else {
            break;
        };
        if let Err(err) = sock.send_to(&buf[..n], peer).await {
            tracing::debug!(peer = %peer, error = %err, "udpmux: send failed; closing peer");
            break;
        }
    }
    shared.peers.remove_if(&peer, |_, p| p.id == id);
    end.close();
}

/// One remote UDP peer seen by a [`UdpListener`].
///
/// Each read yields exactly one datagram; each write sends exactly one.
#[derive(Debug)]
pub struct UdpConn {
    pipe: Pipe,
    peer: SocketAddr,
    local: SocketAddr,
}

impl UdpConn {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn close(&self) {
        self.pipe.close();
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_read(cx, buf)
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.pipe).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn accept(ln: &UdpListener) -> UdpConn {
        tokio::time::timeout(Duration::from_secs(2), ln.accept())
            .await
            .expect("accept in time")
            .unwrap()
    }

    async fn read_one(c: &mut UdpConn) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_READ_BUFFER];
        let n = tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf))
            .await
            .expect("read in time")
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn peers_get_separate_connections() {
        let ln = UdpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr();
        let a = client().await;
        let b = client().await;

        a.send_to(&[1, 9, 9, 1], addr).await.unwrap();
        let mut ca = accept(&ln).await;
        assert_eq!(ca.peer_addr(), a.local_addr().unwrap());
        assert_eq!(read_one(&mut ca).await, vec![1, 9, 9, 1]);

        b.send_to(b"from-b", addr).await.unwrap();
        let mut cb = accept(&ln).await;
        assert_eq!(cb.peer_addr(), b.local_addr().unwrap());
        assert_eq!(read_one(&mut cb).await, b"from-b");

        a.send_to(b"again", addr).await.unwrap();
        assert_eq!(read_one(&mut ca).await, b"again");
        assert_eq!(ln.peer_count(), 2);
    }

    #[tokio::test]
    async fn datagram_boundaries_are_kept() {
        let ln = UdpListener::bind("127.0.0.1:0").await.unwrap();
        let a = client().await;
        a.send_to(b"one", ln.local_addr()).await.unwrap();
        let mut c = accept(&ln).await;
        a.send_to(b"two", ln.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(read_one(&mut c).await, b"one");
        assert_eq!(read_one(&mut c).await, b"two");
    }

    #[tokio::test]
    async fn writes_go_back_to_the_peer() {
        let ln = UdpListener::bind("127.0.0.1:0").await.unwrap();
        let a = client().await;
        a.send_to(b"hi", ln.local_addr()).await.unwrap();
        let mut c = accept(&ln).await;
        c.write_all(b"reply").await.unwrap();

        let mut buf = [0u8; 32];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), a.recv_from(&mut buf))
            .await
            .expect("reply in time")
            .unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, ln.local_addr());
    }

    #[tokio::test]
    async fn read_buffer_grows_after_full_datagram() {
        let ln = UdpListener::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(ln.read_buffer_size(), INITIAL_READ_BUFFER);
        let a = client().await;

        a.send_to(&vec![7u8; INITIAL_READ_BUFFER], ln.local_addr()).await.unwrap();
        let mut c = accept(&ln).await;
        assert_eq!(read_one(&mut c).await.len(), INITIAL_READ_BUFFER);
        assert_eq!(ln.read_buffer_size(), INITIAL_READ_BUFFER + READ_BUFFER_STEP);

        a.send_to(&vec![8u8; INITIAL_READ_BUFFER + 100], ln.local_addr()).await.unwrap();
        assert_eq!(read_one(&mut c).await.len(), INITIAL_READ_BUFFER + 100);
    }

    #[tokio::test]
    async fn preset_read_buffer_takes_large_first_datagram() {
        let ln = UdpListener::bind_with_read_buffer("127.0.0.1:0", MAX_READ_BUFFER).await.unwrap();
        assert_eq!(ln.read_buffer_size(), MAX_READ_BUFFER);
        let a = client().await;

        let big: Vec<u8> = (0..9000u32).map(|i| i as u8).collect();
        a.send_to(&big, ln.local_addr()).await.unwrap();
        let mut c = accept(&ln).await;
        assert_eq!(read_one(&mut c).await, big);
        assert_eq!(ln.read_buffer_size(), MAX_READ_BUFFER);
    }

    #[tokio::test]
    async fn closed_peer_is_accepted_again() {
        let ln = UdpListener::bind("127.0.0.1:0").await.unwrap();
        let a = client().await;
        a.send_to(b"first", ln.local_addr()).await.unwrap();
        let c = accept(&ln).await;
        c.close();
        drop(c);
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.send_to(b"second", ln.local_addr()).await.unwrap();
        let mut c = accept(&ln).await;
        assert_eq!(read_one(&mut c).await, b"second");
    }

    #[tokio::test]
    async fn accept_fails_after_close() {
        let ln = UdpListener::bind("127.0.0.1:0").await.unwrap();
        ln.close().await;
        assert!(ln.accept().await.is_err());
        assert_eq!(ln.peer_count(), 0);
    }

    #[tokio::test]
    async fn close_releases_the_port_and_ends_peers() {
        let ln = UdpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr();
        let a = client().await;
        a.send_to(b"x", addr).await.unwrap();
        let mut c = accept(&ln).await;
        assert_eq!(read_one(&mut c).await, b"x");

        ln.close().await;
        drop(ln);
        assert_eq!(read_one(&mut c).await, Vec::<u8>::new());
        UdpListener::bind(addr).await.expect("port is free again");
    }
}
