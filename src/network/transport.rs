//! Framed message transport bound to one peer
//!
//! A [`Transport`] turns a byte stream into an ordered exchange of typed
//! messages. Every receive is bounded by the per-message timeout.

use crate::network::message::{Message, MAGIC, MAX_MESSAGE_SIZE};
use crate::network::peer::{PeerAddress, PeerError};
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Message codec for length-prefixed framing
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", data.len()),
            ));
        }

        // Magic (4) + Length (4) + Data
        dst.reserve(8 + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < 8 {
            return Ok(None);
        }

        // Check magic
        if src[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        // Get length
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Message too large: {} bytes", len),
            ));
        }

        // Check if we have full message
        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        // Skip header
        src.advance(8);

        // Extract message data
        let data = src.split_to(len);

        // Deserialize
        let msg = Message::from_bytes(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(msg))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Peer closed inside a frame ({} bytes pending)", src.len()),
            )),
        }
    }
}

/// An established link to one peer
pub struct Transport<S = TcpStream> {
    framed: Framed<S, MessageCodec>,
    local: SocketAddr,
    remote: SocketAddr,
    timeout: Duration,
}

impl Transport<TcpStream> {
    /// Wrap an accepted or connected TCP stream
    pub fn from_tcp(stream: TcpStream, timeout: Duration) -> Result<Self, PeerError> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }
        Ok(Self::new(stream, local, remote, timeout))
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, local: SocketAddr, remote: SocketAddr, timeout: Duration) -> Self {
        Self {
            framed: Framed::new(stream, MessageCodec),
            local,
            remote,
            timeout,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// The remote endpoint as observed by this side of the link
    pub fn observed_remote(&self) -> Result<PeerAddress, PeerError> {
        PeerAddress::from_socket(self.remote)
            .ok_or_else(|| PeerError::Protocol(format!("{} is not an IPv4 peer", self.remote)))
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), PeerError> {
        log::debug!("Sending {} to {}", msg.kind(), self.remote);
        self.framed.send(msg).await.map_err(PeerError::Io)
    }

    /// Receive the next message. A closed link is a protocol error here,
    /// since the caller is in the middle of an exchange.
    pub async fn receive(&mut self) -> Result<Message, PeerError> {
        match self.next_message().await? {
            Some(msg) => Ok(msg),
            None => Err(PeerError::Protocol(format!(
                "{} closed the connection",
                self.remote
            ))),
        }
    }

    /// Receive the next message, or `None` if the peer closed the link at
    /// a message boundary.
    pub async fn next_message(&mut self) -> Result<Option<Message>, PeerError> {
        let next = tokio::time::timeout(self.timeout, self.framed.next())
            .await
            .map_err(|_| PeerError::Timeout(format!("message from {}", self.remote)))?;

        match next {
            Some(Ok(msg)) => {
                log::debug!("Received {} from {}", msg.kind(), self.remote);
                Ok(Some(msg))
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => Err(PeerError::Protocol(
                format!("undecodable message from {}: {}", self.remote, e),
            )),
            Some(Err(e)) => Err(PeerError::Io(e)),
            None => Ok(None),
        }
    }
}

/// Open an outbound link, bounded by `connect_timeout`
pub async fn connect(
    addr: PeerAddress,
    connect_timeout: Duration,
    message_timeout: Duration,
) -> Result<Transport, PeerError> {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr.to_socket()))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(PeerError::Connect {
                addr,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(PeerError::Connect {
                addr,
                reason: "timed out".to_string(),
            })
        }
    };

    Transport::from_tcp(stream, message_timeout)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    /// A connected pair of transports over an in-memory pipe
    pub(crate) fn pair(
        a: &str,
        b: &str,
        timeout: Duration,
    ) -> (Transport<DuplexStream>, Transport<DuplexStream>) {
        let a: SocketAddr = a.parse().unwrap();
        let b: SocketAddr = b.parse().unwrap();
        let (left, right) = tokio::io::duplex(1 << 20);
        (
            Transport::new(left, a, b, timeout),
            Transport::new(right, b, a, timeout),
        )
    }

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec;
        let msg = Message::Verack;

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..4], &MAGIC);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let mut codec = MessageCodec;
        let mut full = BytesMut::new();
        codec.encode(Message::GetAddr, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_bad_magic() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&b"NOPE\x00\x00\x00\x02{}"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_send_receive_in_order() {
        let (mut a, mut b) = pair("10.0.0.1:1000", "10.0.0.2:2000", Duration::from_secs(1));

        a.send(Message::Verack).await.unwrap();
        a.send(Message::GetAddr).await.unwrap();

        assert_eq!(b.receive().await.unwrap(), Message::Verack);
        assert_eq!(b.receive().await.unwrap(), Message::GetAddr);
        assert_eq!(
            b.observed_remote().unwrap().to_string(),
            "10.0.0.1:1000"
        );
    }

    #[tokio::test]
    async fn test_receive_timeout() {
        let (_a, mut b) = pair("10.0.0.1:1000", "10.0.0.2:2000", Duration::from_millis(20));
        assert!(matches!(b.receive().await, Err(PeerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_closed_peer_is_protocol_error() {
        let (a, mut b) = pair("10.0.0.1:1000", "10.0.0.2:2000", Duration::from_secs(1));
        drop(a);
        assert!(matches!(b.receive().await, Err(PeerError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_garbage_is_protocol_error() {
        let (mut raw, remote) = tokio::io::duplex(1024);
        let mut b = Transport::new(
            remote,
            "10.0.0.2:2000".parse().unwrap(),
            "10.0.0.1:1000".parse().unwrap(),
            Duration::from_secs(1),
        );

        raw.write_all(b"PEER\x00\x00\x00\x03abc").await.unwrap();
        assert!(matches!(b.receive().await, Err(PeerError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_close_inside_frame_is_protocol_error() {
        let (mut raw, remote) = tokio::io::duplex(1024);
        let mut b = Transport::new(
            remote,
            "10.0.0.2:2000".parse().unwrap(),
            "10.0.0.1:1000".parse().unwrap(),
            Duration::from_secs(1),
        );

        raw.write_all(b"PEER\x00\x00\x00\x10{\"comm").await.unwrap();
        drop(raw);
        assert!(matches!(b.receive().await, Err(PeerError::Protocol(_))));
    }

    #[test]
    fn test_codec_eof_with_partial_frame() {
        let mut codec = MessageCodec;
        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());

        let mut partial = BytesMut::from(&b"PEER\x00\x00"[..]);
        let err = codec.decode_eof(&mut partial).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
