//! In-memory full-duplex byte pipe.
//!
//! Each direction is a queue of chunks. Every `write` call enqueues exactly one
//! chunk (when it fits under the buffer limit) and every `read` drains from the
//! head chunk only, so one write is never merged with the next. That keeps
//! datagram boundaries intact when a pipe stands in for a UDP peer.

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub const DEFAULT_PIPE_BUFFER: usize = 256 * 1024;

#[derive(Debug, Error)]
#[error("pipe closed")]
pub struct PipeClosed;

#[derive(Debug, Default)]
struct State {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    /// Abortive close: buffered data is gone, both sides see the end.
    closed: bool,
    /// The writer shut down; the reader drains what is left and then sees EOF.
    write_done: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl State {
    fn wake_reader(&mut self) {
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

#[derive(Debug)]
struct Simplex {
    state: Mutex<State>,
    max: usize,
}

impl Simplex {
    fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            max: max.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut st = self.lock();
        if st.closed {
            return Poll::Ready(Ok(()));
        }
        if let Some(head) = st.chunks.front_mut() {
            let n = head.len().min(buf.remaining());
            buf.put_slice(&head[..n]);
            head.advance(n);
            if head.is_empty() {
                st.chunks.pop_front();
            }
            st.buffered -= n;
            st.wake_writer();
            return Poll::Ready(Ok(()));
        }
        if st.write_done {
            return Poll::Ready(Ok(()));
        }
        st.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_write(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut st = self.lock();
        if st.closed || st.write_done {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe closed",
            )));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        // Writes that fit under the limit are queued whole or not at all.
        let want = data.len().min(self.max);
        let avail = self.max.saturating_sub(st.buffered);
        if avail < want {
            st.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        st.chunks.push_back(Bytes::copy_from_slice(&data[..want]));
        st.buffered += want;
        st.wake_reader();
        Poll::Ready(Ok(want))
    }

    fn push(&self, data: Bytes) -> Result<bool, PipeClosed> {
        let mut st = self.lock();
        if st.closed || st.write_done {
            return Err(PipeClosed);
        }
        if data.is_empty() {
            return Ok(true);
        }
        if st.buffered + data.len() > self.max {
            return Ok(false);
        }
        st.buffered += data.len();
        st.chunks.push_back(data);
        st.wake_reader();
        Ok(true)
    }

    fn shutdown_write(&self) {
        let mut st = self.lock();
        st.write_done = true;
        st.wake_reader();
        st.wake_writer();
    }

    fn close(&self) {
        let mut st = self.lock();
        st.closed = true;
        st.chunks.clear();
        st.buffered = 0;
        st.wake_reader();
        st.wake_writer();
    }

    fn is_closed(&self) -> bool {
        let st = self.lock();
        st.closed || st.write_done
    }
}

/// Creates two connected ends. Bytes written to one are read from the other.
///
/// `max_buffered` bounds each direction; writers wait once it is reached.
pub fn pipe(max_buffered: usize) -> (Pipe, Pipe) {
    let a_to_b = Simplex::new(max_buffered);
    let b_to_a = Simplex::new(max_buffered);
    (
        Pipe {
            rx: b_to_a.clone(),
            tx: a_to_b.clone(),
        },
        Pipe {
            rx: a_to_b,
            tx: b_to_a,
        },
    )
}

/// One end of a [`pipe`].
///
/// Dropping an end behaves like closing a socket: the peer still reads what was
/// already written, then sees EOF, and its writes fail.
#[derive(Debug)]
pub struct Pipe {
    rx: Arc<Simplex>,
    tx: Arc<Simplex>,
}

impl Pipe {
    /// Abortive close of both directions. Pending reads and writes on either end
    /// complete immediately and buffered data is discarded.
    pub fn close(&self) {
        self.rx.close();
        self.tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_closed() && self.tx.is_closed()
    }

    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            rx: self.rx.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Handle that enqueues on this end's outbound direction without waiting.
    pub fn feeder(&self) -> Feeder {
        Feeder {
            tx: self.tx.clone(),
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.tx.shutdown_write();
        self.rx.close();
    }
}

impl AsyncRead for Pipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.rx.poll_read(cx, buf)
    }
}

impl AsyncWrite for Pipe {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.tx.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.shutdown_write();
        Poll::Ready(Ok(()))
    }
}

/// Closes a pipe from outside the task that owns it.
#[derive(Debug, Clone)]
pub struct PipeCloser {
    rx: Arc<Simplex>,
    tx: Arc<Simplex>,
}

impl PipeCloser {
    pub fn close(&self) {
        self.rx.close();
        self.tx.close();
    }
}

/// Non-blocking producer for one pipe direction.
#[derive(Debug, Clone)]
pub struct Feeder {
    tx: Arc<Simplex>,
}

impl Feeder {
    /// Queues `data` as one chunk.
    ///
    /// Returns `Ok(false)` when the direction is full and the chunk was dropped.
    pub fn push(&self, data: Bytes) -> Result<bool, PipeClosed> {
        self.tx.push(data)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
