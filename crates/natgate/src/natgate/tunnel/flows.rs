//! Per-endpoint client flows shared by both tunnel ends.
//!
//! Each live flow has a writer (towards the client or the local app) and a relay
//! task reading from it and sending `ClientData` upstream. The table owns the
//! writer and a stop signal; removing the entry ends the relay.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::{Mutex, watch},
};

use crate::natgate::tunnel::{
    channel::{BoxedWrite, ChannelError},
    protocol::Endpoint,
};

pub const MIN_CHUNK_SIZE: usize = 512;
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
/// Keeps a full `ClientData` frame inside one UDP datagram.
pub const MAX_CHUNK_SIZE: usize = 63 * 1024;
pub const CHUNK_GROWTH_STEP: usize = 1024;

/// Read size used when relaying client bytes into frames.
#[derive(Debug)]
pub struct ChunkSize(AtomicUsize);

impl ChunkSize {
    pub fn new(n: usize) -> Self {
        Self(AtomicUsize::new(n.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    /// Applies a size announced by the peer and returns the clamped value.
    pub fn set(&self, n: u64) -> usize {
        let n = usize::try_from(n)
            .unwrap_or(MAX_CHUNK_SIZE)
            .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.0.store(n, Ordering::Relaxed);
        n
    }

    /// Grows the chunk by one step when a read of `read` bytes filled a buffer of
    /// `buffer` bytes. Returns the new size if it changed.
    pub fn grow_if_full(&self, read: usize, buffer: usize) -> Option<usize> {
        if read < buffer {
            return None;
        }
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                (cur < MAX_CHUNK_SIZE).then(|| (cur + CHUNK_GROWTH_STEP).min(MAX_CHUNK_SIZE))
            })
            .ok()
            .map(|prev| (prev + CHUNK_GROWTH_STEP).min(MAX_CHUNK_SIZE))
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

struct Flow {
    id: u64,
    writer: Arc<Mutex<BoxedWrite>>,
    _stop: watch::Sender<bool>,
}

#[derive(Debug)]
pub enum WriteOutcome {
    Written,
    Missing,
    Failed(io::Error),
}

/// Handle given to the relay task of a freshly inserted flow.
pub struct FlowHandle {
    pub id: u64,
    pub stop: watch::Receiver<bool>,
}

#[derive(Default)]
pub struct FlowTable {
    flows: DashMap<Endpoint, Flow>,
    seq: AtomicU64,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `writer` for `ep`, replacing (and stopping) any previous flow.
    pub fn insert(&self, ep: Endpoint, writer: BoxedWrite) -> FlowHandle {
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        self.flows.insert(
            ep,
            Flow {
                id,
                writer: Arc::new(Mutex::new(writer)),
                _stop: stop_tx,
            },
        );
        FlowHandle { id, stop: stop_rx }
    }

    pub fn contains(&self, ep: &Endpoint) -> bool {
        self.flows.contains_key(ep)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub async fn write(&self, ep: &Endpoint, data: &[u8]) -> WriteOutcome {
        let writer = match self.flows.get(ep) {
            Some(f) => f.writer.clone(),
            None => return WriteOutcome::Missing,
        };
        let mut w = writer.lock().await;
        match w.write_all(data).await {
            Ok(()) => WriteOutcome::Written,
            Err(err) => WriteOutcome::Failed(err),
        }
    }

    /// Removes the flow and stops its relay. Returns whether it existed.
    pub fn close(&self, ep: &Endpoint) -> bool {
        self.flows.remove(ep).is_some()
    }

    /// Removes the flow only if it is still the one with `id`.
    pub fn remove_if_current(&self, ep: &Endpoint, id: u64) -> bool {
        self.flows.remove_if(ep, |_, f| f.id == id).is_some()
    }

    pub fn close_all(&self) -> usize {
        let n = self.flows.len();
        self.flows.clear();
        n
    }

    /// Cleans up after a relay returned and tells the peer when it still believes
    /// the flow is open.
    pub async fn finish(&self, ep: &Endpoint, id: u64, end: &RelayEnd, uplink: &dyn Uplink) {
        match end {
            RelayEnd::Stopped => {}
            RelayEnd::Uplink(_) => {
                self.remove_if_current(ep, id);
            }
            _ => {
                if self.remove_if_current(ep, id) {
                    let _ = uplink.send_close(*ep).await;
                }
            }
        }
    }
}

/// Where a relay sends what it reads.
#[async_trait]
pub trait Uplink: Send + Sync {
    async fn send_data(&self, ep: Endpoint, chunk: Bytes) -> Result<(), ChannelError>;
    async fn send_resize(&self, size: usize) -> Result<(), ChannelError>;
    async fn send_close(&self, ep: Endpoint) -> Result<(), ChannelError>;
}

#[derive(Debug)]
pub enum RelayEnd {
    /// The source reached EOF.
    Eof,
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The flow was removed from the table.
    Stopped,
    Read(io::Error),
    Uplink(ChannelError),
}

/// Reads `reader` in chunks and forwards them through `uplink` until the source
/// ends, the flow is stopped, or the uplink fails.
///
/// A read that fills the whole buffer grows the shared chunk size, and the new
/// size is announced before the data that triggered it.
pub async fn relay<R>(
    mut reader: R,
    ep: Endpoint,
    chunk: &ChunkSize,
    mut stop: watch::Receiver<bool>,
    idle: Option<Duration>,
    uplink: &dyn Uplink,
) -> RelayEnd
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    loop {
        let size = chunk.get();
        buf.resize(size, 0);
        let read = async {
            match idle {
                Some(d) => tokio::time::timeout(d, reader.read(&mut buf[..size])).await.ok(),
                None => Some(reader.read(&mut buf[..size]).await),
            }
        };
        let n = tokio::select! {
            res = read => match res {
                None => return RelayEnd::Idle,
                Some(Ok(0)) => return RelayEnd::Eof,
                Some(Ok(n)) => n,
                Some(Err(err)) => return RelayEnd::Read(err),
            },
            _ = stop.changed() => return RelayEnd::Stopped,
        };
        if let Some(next) = chunk.grow_if_full(n, size) {
            if let Err(err) = uplink.send_resize(next).await {
                return RelayEnd::Uplink(err);
            }
        }
        if let Err(err) = uplink.send_data(ep, Bytes::copy_from_slice(&buf[..n])).await {
            return RelayEnd::Uplink(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::natgate::tunnel::pipe::pipe;

    #[derive(Debug, PartialEq, Eq)]
    enum Sent {
        Data(usize),
        Resize(usize),
        Close,
    }

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<Sent>>);

    #[async_trait]
    impl Uplink for Recorder {
        async fn send_data(&self, _ep: Endpoint, chunk: Bytes) -> Result<(), ChannelError> {
            self.0.lock().unwrap().push(Sent::Data(chunk.len()));
            Ok(())
        }

        async fn send_resize(&self, size: usize) -> Result<(), ChannelError> {
            self.0.lock().unwrap().push(Sent::Resize(size));
            Ok(())
        }

        async fn send_close(&self, _ep: Endpoint) -> Result<(), ChannelError> {
            self.0.lock().unwrap().push(Sent::Close);
            Ok(())
        }
    }

    fn ep() -> Endpoint {
        Endpoint::tcp("127.0.0.1:4000".parse().unwrap())
    }

    #[test]
    fn chunk_size_is_clamped_and_grows_by_step() {
        let c = ChunkSize::new(1);
        assert_eq!(c.get(), MIN_CHUNK_SIZE);
        assert_eq!(c.set(u64::MAX), MAX_CHUNK_SIZE);
        assert_eq!(c.grow_if_full(MAX_CHUNK_SIZE, MAX_CHUNK_SIZE), None);

        let c = ChunkSize::new(DEFAULT_CHUNK_SIZE);
        assert_eq!(c.grow_if_full(100, DEFAULT_CHUNK_SIZE), None);
        assert_eq!(
            c.grow_if_full(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_SIZE),
            Some(DEFAULT_CHUNK_SIZE + CHUNK_GROWTH_STEP)
        );
        assert_eq!(c.get(), DEFAULT_CHUNK_SIZE + CHUNK_GROWTH_STEP);
    }

    #[tokio::test]
    async fn full_read_announces_resize_before_data() {
        let (mut app, local) = pipe(1 << 20);
        let chunk = ChunkSize::new(MIN_CHUNK_SIZE);
        let rec = Recorder::default();
        let table = FlowTable::new();
        let (rd, wr) = tokio::io::split(local);
        let h = table.insert(ep(), Box::new(wr));

        app.write_all(&vec![1u8; MIN_CHUNK_SIZE]).await.unwrap();
        app.write_all(b"tail").await.unwrap();
        drop(app);

        let end = relay(rd, ep(), &chunk, h.stop, None, &rec).await;
        assert!(matches!(end, RelayEnd::Eof));
        assert_eq!(
            *rec.0.lock().unwrap(),
            vec![
                Sent::Resize(MIN_CHUNK_SIZE + CHUNK_GROWTH_STEP),
                Sent::Data(MIN_CHUNK_SIZE),
                Sent::Data(4),
            ]
        );
        assert_eq!(chunk.get(), MIN_CHUNK_SIZE + CHUNK_GROWTH_STEP);
    }

    #[tokio::test]
    async fn closing_the_flow_stops_its_relay() {
        let (_app, local) = pipe(1024);
        let table = Arc::new(FlowTable::new());
        let (rd, wr) = tokio::io::split(local);
        let h = table.insert(ep(), Box::new(wr));
        let chunk = ChunkSize::default();
        let rec = Recorder::default();

        let t = table.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.close(&ep());
        });
        let end = tokio::time::timeout(Duration::from_secs(1), relay(rd, ep(), &chunk, h.stop, None, &rec))
            .await
            .expect("relay stopped");
        assert!(matches!(end, RelayEnd::Stopped));
        assert!(table.is_empty());
        table.finish(&ep(), h.id, &end, &rec).await;
        assert!(rec.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_flow_ends() {
        let (_app, local) = pipe(1024);
        let table = FlowTable::new();
        let (rd, wr) = tokio::io::split(local);
        let h = table.insert(ep(), Box::new(wr));
        let chunk = ChunkSize::default();
        let rec = Recorder::default();
        let end = relay(rd, ep(), &chunk, h.stop, Some(Duration::from_millis(20)), &rec).await;
        assert!(matches!(end, RelayEnd::Idle));
        table.finish(&ep(), h.id, &end, &rec).await;
        assert!(table.is_empty());
        assert_eq!(*rec.0.lock().unwrap(), vec![Sent::Close]);
    }

    #[tokio::test]
    async fn write_reaches_flow_and_reports_missing() {
        let (mut app, local) = pipe(1024);
        let table = FlowTable::new();
        let (_rd, wr) = tokio::io::split(local);
        let h = table.insert(ep(), Box::new(wr));

        assert!(matches!(table.write(&ep(), b"hey").await, WriteOutcome::Written));
        let mut buf = [0u8; 3];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hey");

        let other = Endpoint::udp("127.0.0.1:4000".parse().unwrap());
        assert!(matches!(table.write(&other, b"x").await, WriteOutcome::Missing));

        assert!(!table.remove_if_current(&ep(), h.id + 1));
        assert!(table.remove_if_current(&ep(), h.id));
        assert_eq!(table.len(), 0);
    }
}
