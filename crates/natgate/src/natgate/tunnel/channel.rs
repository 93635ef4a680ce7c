use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::natgate::tunnel::protocol::{Frame, ProtocolError};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// How frames are laid out on the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Each read returns exactly one frame (UDP).
    Datagram,
    /// Frames are concatenated on a byte stream (TCP).
    Stream,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("control channel closed")]
    Closed,
    #[error("control channel io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, ChannelError::Protocol(e) if e.is_malformed())
    }
}

/// Receiving half of a control channel.
pub struct FrameSource {
    inner: BoxedRead,
    framing: Framing,
    buf: BytesMut,
    packet: Vec<u8>,
}

impl FrameSource {
    pub fn new(inner: BoxedRead, framing: Framing) -> Self {
        let packet = match framing {
            Framing::Datagram => vec![0u8; MAX_DATAGRAM_BYTES],
            Framing::Stream => Vec::new(),
        };
        Self {
            inner,
            framing,
            buf: BytesMut::with_capacity(8 * 1024),
            packet,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Reads the next frame. Cancel safe: a frame is never half consumed.
    ///
    /// On a datagram channel a malformed packet only loses that packet; on a stream
    /// channel the stream position is unknown afterwards and the caller should drop it.
    pub async fn recv<F: Frame>(&mut self) -> Result<F, ChannelError> {
        match self.framing {
            Framing::Datagram => {
                let n = self.inner.read(&mut self.packet).await?;
                if n == 0 {
                    return Err(ChannelError::Closed);
                }
                Ok(F::decode_exact(&self.packet[..n])?)
            }
            Framing::Stream => loop {
                if let Some((frame, used)) = F::decode(&self.buf)? {
                    self.buf.advance(used);
                    return Ok(frame);
                }
                self.buf.reserve(8 * 1024);
                if self.inner.read_buf(&mut self.buf).await? == 0 {
                    if self.buf.is_empty() {
                        return Err(ChannelError::Closed);
                    }
                    return Err(ChannelError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
            },
        }
    }
}

/// Sending half of a control channel. Shared by every task that emits frames.
pub struct FrameSink {
    inner: tokio::sync::Mutex<BoxedWrite>,
    framing: Framing,
}

impl FrameSink {
    pub fn new(inner: BoxedWrite, framing: Framing) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(inner),
            framing,
        }
    }

    /// Writes one whole frame. Concurrent senders never interleave.
    pub async fn send<F: Frame>(&self, frame: &F) -> Result<(), ChannelError> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf)?;
        if self.framing == Framing::Datagram && buf.len() > MAX_DATAGRAM_BYTES {
            return Err(ProtocolError::PayloadTooLarge(buf.len() as u64).into());
        }
        let mut w = self.inner.lock().await;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn close(&self) {
        let mut w = self.inner.lock().await;
        let _ = w.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::natgate::tunnel::{
        pipe::pipe,
        protocol::{ClientData, Endpoint, Request},
    };

    fn channel(framing: Framing) -> (FrameSink, FrameSource) {
        let (a, b) = pipe(1 << 20);
        let (_, a_wr) = tokio::io::split(a);
        let (b_rd, _) = tokio::io::split(b);
        (
            FrameSink::new(Box::new(a_wr), framing),
            FrameSource::new(Box::new(b_rd), framing),
        )
    }

    #[tokio::test]
    async fn stream_frames_are_reassembled() {
        let (a, b) = pipe(1 << 20);
        let (_, mut a_wr) = tokio::io::split(a);
        let (b_rd, _) = tokio::io::split(b);
        let mut src = FrameSource::new(Box::new(b_rd), Framing::Stream);

        let frame = Request::ClientData(ClientData::new(
            Endpoint::tcp("127.0.0.1:9".parse().unwrap()),
            Bytes::from_static(b"split across writes"),
        ));
        let raw = frame.to_bytes().unwrap();
        a_wr.write_all(&raw[..5]).await.unwrap();
        a_wr.write_all(&raw[5..]).await.unwrap();
        a_wr.write_all(&Request::Ping(3).to_bytes().unwrap()).await.unwrap();

        assert_eq!(src.recv::<Request>().await.unwrap(), frame);
        assert_eq!(src.recv::<Request>().await.unwrap(), Request::Ping(3));
    }

    #[tokio::test]
    async fn datagram_garbage_is_malformed_and_not_fatal() {
        let (a, b) = pipe(1 << 20);
        let (_, mut a_wr) = tokio::io::split(a);
        let (b_rd, _) = tokio::io::split(b);
        let mut src = FrameSource::new(Box::new(b_rd), Framing::Datagram);

        a_wr.write_all(&[0xff; 3]).await.unwrap();
        a_wr.write_all(&Request::Ping(1).to_bytes().unwrap()).await.unwrap();

        assert!(src.recv::<Request>().await.unwrap_err().is_malformed());
        assert_eq!(src.recv::<Request>().await.unwrap(), Request::Ping(1));
    }

    #[tokio::test]
    async fn closed_peer_reports_closed() {
        let (sink, mut src) = channel(Framing::Stream);
        sink.send(&Request::Ping(7)).await.unwrap();
        sink.close().await;
        drop(sink);
        assert_eq!(src.recv::<Request>().await.unwrap(), Request::Ping(7));
        assert!(matches!(src.recv::<Request>().await, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn oversized_datagram_frame_is_refused() {
        let (sink, _src) = channel(Framing::Datagram);
        let frame = Request::ClientData(ClientData::new(
            Endpoint::udp("127.0.0.1:9".parse().unwrap()),
            Bytes::from(vec![0u8; MAX_DATAGRAM_BYTES]),
        ));
        let err = sink.send(&frame).await.unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(ProtocolError::PayloadTooLarge(_))));
    }
}
