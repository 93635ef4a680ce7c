//! Control-channel wire format.
//!
//! Every frame is a big-endian `u64` tag followed by a fixed or self-length-prefixed
//! body. Frames are self-delimiting, so the same codec serves datagram transports
//! (one frame per datagram) and stream transports (frames back to back).
//!
//! ```text
//! endpoint   = proto:u8 family:u8 addr:[4|16] port:u16
//! client data = endpoint size:u64 payload:[size]
//! agent info = proto:u8 udp_port:u16 tcp_port:u16 family:u8 addr:[4|16] port:u16
//! ```
//!
//! There is no version byte: both peers must agree on this layout statically.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const TOKEN_LEN: usize = 36;

/// Upper bound for a single `ClientData` payload accepted off the wire.
pub const MAX_PAYLOAD_BYTES: u64 = 1 << 20; // 1 MiB

const REQ_AGENT_AUTH: u64 = 1;
const REQ_PING: u64 = 2;
const REQ_CLIENT_CLOSE: u64 = 3;
const REQ_CLIENT_DATA: u64 = 4;
const REQ_RESIZE_BUFFER: u64 = 5;

const RES_UNAUTHORIZED: u64 = 1;
const RES_BAD_REQUEST: u64 = 2;
const RES_CLOSE_CLIENT: u64 = 3;
const RES_CLIENT_DATA: u64 = 4;
const RES_SEND_AUTH: u64 = 5;
const RES_AGENT_INFO: u64 = 6;
const RES_PONG: u64 = 7;
const RES_NOT_LISTENED: u64 = 8;
const RES_RESIZE_BUFFER: u64 = 9;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("malformed frame: unknown tag {0}")]
    UnknownTag(u64),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u64),
    #[error("client data declares {declared} bytes but carries {actual}")]
    SizeMismatch { declared: u64, actual: usize },
    #[error("token must be exactly {TOKEN_LEN} bytes, got {0}")]
    BadToken(usize),
    #[error("unknown protocol {0:?} (expected tcp|udp|both)")]
    BadProto(String),
}

impl ProtocolError {
    /// True for errors produced while decoding bytes received from a peer.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ProtocolError::Malformed(_)
                | ProtocolError::UnknownTag(_)
                | ProtocolError::PayloadTooLarge(_)
        )
    }
}

/// Fixed-size agent credential.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub const fn new(raw: [u8; TOKEN_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Short label safe to put in logs.
    pub fn redacted(&self) -> String {
        let head: String = self.0[..4]
            .iter()
            .map(|b| {
                if b.is_ascii_graphic() {
                    *b as char
                } else {
                    '?'
                }
            })
            .collect();
        format!("{head}…")
    }
}

impl FromStr for Token {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let b = s.trim().as_bytes();
        let raw: [u8; TOKEN_LEN] = b.try_into().map_err(|_| ProtocolError::BadToken(b.len()))?;
        Ok(Self(raw))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Token").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Transport of a single relayed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn as_u8(self) -> u8 {
        match self {
            Proto::Tcp => 1,
            Proto::Udp => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Proto::Tcp),
            2 => Some(Proto::Udp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which public listeners a tunnel gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenProto {
    Tcp,
    Udp,
    Both,
}

impl ListenProto {
    pub fn as_u8(self) -> u8 {
        match self {
            ListenProto::Tcp => 1,
            ListenProto::Udp => 2,
            ListenProto::Both => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ListenProto::Tcp),
            2 => Some(ListenProto::Udp),
            3 => Some(ListenProto::Both),
            _ => None,
        }
    }

    pub fn includes(self, p: Proto) -> bool {
        matches!(
            (self, p),
            (ListenProto::Both, _) | (ListenProto::Tcp, Proto::Tcp) | (ListenProto::Udp, Proto::Udp)
        )
    }
}

impl FromStr for ListenProto {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(ListenProto::Tcp),
            "udp" => Ok(ListenProto::Udp),
            "both" | "" => Ok(ListenProto::Both),
            _ => Err(ProtocolError::BadProto(s.to_string())),
        }
    }
}

impl fmt::Display for ListenProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenProto::Tcp => f.write_str("tcp"),
            ListenProto::Udp => f.write_str("udp"),
            ListenProto::Both => f.write_str("both"),
        }
    }
}

/// One public client flow.
///
/// The same address can exist once per transport, so the protocol is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub proto: Proto,
}

impl Endpoint {
    pub fn new(addr: SocketAddr, proto: Proto) -> Self {
        Self { addr, proto }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(addr, Proto::Tcp)
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(addr, Proto::Udp)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.proto, self.addr)
    }
}

/// Relayed bytes for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientData {
    pub endpoint: Endpoint,
    pub size: u64,
    pub data: Bytes,
}

impl ClientData {
    pub fn new(endpoint: Endpoint, data: Bytes) -> Self {
        Self {
            endpoint,
            size: data.len() as u64,
            data,
        }
    }
}

/// Sent to the agent once its listeners are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentInfo {
    pub proto: ListenProto,
    pub udp_port: u16,
    pub tcp_port: u16,
    /// The agent's address as observed by the controller.
    pub addr: SocketAddr,
}

/// Agent → controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AgentAuth(Token),
    /// Unix milliseconds on the agent's clock.
    Ping(i64),
    ClientClose(Endpoint),
    ClientData(ClientData),
    ResizeBuffer(u64),
}

/// Controller → agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Unauthorized,
    BadRequest,
    SendAuth,
    NotListened,
    AgentInfo(AgentInfo),
    /// Unix milliseconds on the controller's clock.
    Pong(i64),
    CloseClient(Endpoint),
    ClientData(ClientData),
    ResizeBuffer(u64),
}

/// `Ok(None)` when the input ends early.
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

pub trait Frame: Sized {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Decodes one frame from the front of `src`.
    ///
    /// `Ok(None)` means `src` holds only a prefix of a frame.
    fn decode(src: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError>;

    /// Decodes a frame that must be complete, as received in one datagram.
    fn decode_exact(src: &[u8]) -> Result<Self, ProtocolError> {
        match Self::decode(src)? {
            Some((frame, _)) => Ok(frame),
            None => Err(ProtocolError::Malformed("truncated frame")),
        }
    }

    fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut b = BytesMut::new();
        self.encode(&mut b)?;
        Ok(b.freeze())
    }
}

impl Frame for Request {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Request::AgentAuth(token) => {
                dst.put_u64(REQ_AGENT_AUTH);
                dst.put_slice(token.as_bytes());
            }
            Request::Ping(ms) => {
                dst.put_u64(REQ_PING);
                dst.put_i64(*ms);
            }
            Request::ClientClose(ep) => {
                dst.put_u64(REQ_CLIENT_CLOSE);
                put_endpoint(dst, ep);
            }
            Request::ClientData(cd) => {
                check_client_data(cd)?;
                dst.put_u64(REQ_CLIENT_DATA);
                put_client_data(dst, cd);
            }
            Request::ResizeBuffer(n) => {
                dst.put_u64(REQ_RESIZE_BUFFER);
                dst.put_u64(*n);
            }
        }
        Ok(())
    }

    fn decode(src: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let mut cur = Cursor::new(src);
        let tag = need!(cur.u64());
        let req = match tag {
            REQ_AGENT_AUTH => {
                let raw = need!(cur.take(TOKEN_LEN));
                let mut tok = [0u8; TOKEN_LEN];
                tok.copy_from_slice(raw);
                Request::AgentAuth(Token::new(tok))
            }
            REQ_PING => Request::Ping(need!(cur.i64())),
            REQ_CLIENT_CLOSE => Request::ClientClose(need!(read_endpoint(&mut cur)?)),
            REQ_CLIENT_DATA => Request::ClientData(need!(read_client_data(&mut cur)?)),
            REQ_RESIZE_BUFFER => Request::ResizeBuffer(need!(cur.u64())),
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(Some((req, cur.pos)))
    }
}

impl Frame for Response {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Response::Unauthorized => dst.put_u64(RES_UNAUTHORIZED),
            Response::BadRequest => dst.put_u64(RES_BAD_REQUEST),
            Response::SendAuth => dst.put_u64(RES_SEND_AUTH),
            Response::NotListened => dst.put_u64(RES_NOT_LISTENED),
            Response::AgentInfo(info) => {
                dst.put_u64(RES_AGENT_INFO);
                dst.put_u8(info.proto.as_u8());
                dst.put_u16(info.udp_port);
                dst.put_u16(info.tcp_port);
                put_addr(dst, info.addr);
            }
            Response::Pong(ms) => {
                dst.put_u64(RES_PONG);
                dst.put_i64(*ms);
            }
            Response::CloseClient(ep) => {
                dst.put_u64(RES_CLOSE_CLIENT);
                put_endpoint(dst, ep);
            }
            Response::ClientData(cd) => {
                check_client_data(cd)?;
                dst.put_u64(RES_CLIENT_DATA);
                put_client_data(dst, cd);
            }
            Response::ResizeBuffer(n) => {
                dst.put_u64(RES_RESIZE_BUFFER);
                dst.put_u64(*n);
            }
        }
        Ok(())
    }

    fn decode(src: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let mut cur = Cursor::new(src);
        let tag = need!(cur.u64());
        let res = match tag {
            RES_UNAUTHORIZED => Response::Unauthorized,
            RES_BAD_REQUEST => Response::BadRequest,
            RES_SEND_AUTH => Response::SendAuth,
            RES_NOT_LISTENED => Response::NotListened,
            RES_AGENT_INFO => {
                let proto = need!(cur.u8());
                let proto = ListenProto::from_u8(proto)
                    .ok_or(ProtocolError::Malformed("unknown listen protocol"))?;
                let udp_port = need!(cur.u16());
                let tcp_port = need!(cur.u16());
                let addr = need!(read_addr(&mut cur)?);
                Response::AgentInfo(AgentInfo {
                    proto,
                    udp_port,
                    tcp_port,
                    addr,
                })
            }
            RES_PONG => Response::Pong(need!(cur.i64())),
            RES_CLOSE_CLIENT => Response::CloseClient(need!(read_endpoint(&mut cur)?)),
            RES_CLIENT_DATA => Response::ClientData(need!(read_client_data(&mut cur)?)),
            RES_RESIZE_BUFFER => Response::ResizeBuffer(need!(cur.u64())),
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(Some((res, cur.pos)))
    }
}

fn check_client_data(cd: &ClientData) -> Result<(), ProtocolError> {
    if cd.size != cd.data.len() as u64 {
        return Err(ProtocolError::SizeMismatch {
            declared: cd.size,
            actual: cd.data.len(),
        });
    }
    if cd.size > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(cd.size));
    }
    Ok(())
}

fn put_addr(dst: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            dst.put_u8(FAMILY_V4);
            dst.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            dst.put_u8(FAMILY_V6);
            dst.put_slice(&ip.octets());
        }
    }
    dst.put_u16(addr.port());
}

fn put_endpoint(dst: &mut BytesMut, ep: &Endpoint) {
    dst.put_u8(ep.proto.as_u8());
    put_addr(dst, ep.addr);
}

fn put_client_data(dst: &mut BytesMut, cd: &ClientData) {
    put_endpoint(dst, &cd.endpoint);
    dst.put_u64(cd.size);
    dst.put_slice(&cd.data);
}

fn read_addr(cur: &mut Cursor<'_>) -> Result<Option<SocketAddr>, ProtocolError> {
    let family = need!(cur.u8());
    let ip = match family {
        FAMILY_V4 => {
            let b = need!(cur.take(4));
            IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        }
        FAMILY_V6 => {
            let b = need!(cur.take(16));
            let mut raw = [0u8; 16];
            raw.copy_from_slice(b);
            IpAddr::V6(Ipv6Addr::from(raw))
        }
        _ => return Err(ProtocolError::Malformed("unknown address family")),
    };
    let port = need!(cur.u16());
    Ok(Some(SocketAddr::new(ip, port)))
}

fn read_endpoint(cur: &mut Cursor<'_>) -> Result<Option<Endpoint>, ProtocolError> {
    let proto = need!(cur.u8());
    // `both` only configures listeners; a flow is always one or the other.
    let proto = Proto::from_u8(proto).ok_or(ProtocolError::Malformed("bad endpoint protocol"))?;
    let addr = need!(read_addr(cur)?);
    Ok(Some(Endpoint { addr, proto }))
}

fn read_client_data(cur: &mut Cursor<'_>) -> Result<Option<ClientData>, ProtocolError> {
    let endpoint = need!(read_endpoint(cur)?);
    let size = need!(cur.u64());
    if size > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge(size));
    }
    let data = need!(cur.take(size as usize));
    Ok(Some(ClientData {
        endpoint,
        size,
        data: Bytes::copy_from_slice(data),
    }))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let s = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(s)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_be_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_be_bytes)
    }
}
