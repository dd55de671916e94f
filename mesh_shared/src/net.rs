//! Networking primitives.
//!
//! Every link (registry and peer-to-peer) carries JSON messages in
//! length-prefixed frames:
//!
//! ```text
//! [4 bytes: payload length, big-endian u32] [N bytes: JSON payload]
//! ```
//!
//! One frame is exactly one logical message, independent of how TCP
//! segments or coalesces the stream.

use std::{fmt, net::SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use crate::{
    error::{SyncError, SyncResult},
    protocol::Message,
};

/// Largest payload accepted by the codec.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// `host:port` identity of a node. Compared by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        PeerAddress(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress(addr.to_string())
    }
}

impl From<&str> for PeerAddress {
    fn from(addr: &str) -> Self {
        PeerAddress(addr.to_string())
    }
}

/// Serializes a message into a complete frame (header included).
pub fn encode_frame<T: Serialize>(msg: &T) -> SyncResult<Bytes> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Parses a frame payload.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> SyncResult<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Reads one frame payload.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
/// A close inside the header or payload is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> SyncResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream closed after {filled} of 4 header bytes"),
            )));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Writes a pre-encoded frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> SyncResult<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reliable framed connection over TCP.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Dials `addr`.
    pub async fn connect(addr: &PeerAddress) -> SyncResult<Self> {
        let stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(|source| SyncError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, msg: &Message) -> SyncResult<()> {
        let frame = encode_frame(msg)?;
        write_frame(&mut self.stream, &frame).await
    }

    /// Receives and decodes the next frame as `T`. `Ok(None)` on clean close.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> SyncResult<Option<T>> {
        match self.recv_frame().await? {
            Some(payload) => decode_payload(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Receives the next raw frame payload.
    pub async fn recv_frame(&mut self) -> SyncResult<Option<Vec<u8>>> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into a frame reader and the raw write half.
    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, OwnedWriteHalf) {
        let (read, write) = self.stream.into_split();
        (FrameReader::new(read), write)
    }
}

/// Reads frames from the read half of a link.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub async fn next_frame(&mut self) -> SyncResult<Option<Vec<u8>>> {
        read_frame(&mut self.inner).await
    }
}

/// Binds a TCP listener. Failure here is the one fatal node error.
pub async fn bind_listener(addr: &str) -> SyncResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| SyncError::Bind {
            addr: addr.to_string(),
            source,
        })
}
