use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Exchanges handshakes on a fresh stream, ours first.
///
/// Each direction runs under `deadline`; any failure (timeout, short
/// read, bad bytes) is a handshake failure.
pub(super) async fn exchange_handshakes(
    stream: &mut TcpStream,
    ours: &Handshake,
    deadline: Duration,
) -> Result<Handshake, PeerError> {
    timeout(deadline, stream.write_all(&ours.encode()))
        .await
        .map_err(|_| PeerError::HandshakeFailed)?
        .map_err(|_| PeerError::HandshakeFailed)?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    timeout(deadline, stream.read_exact(&mut buf))
        .await
        .map_err(|_| PeerError::HandshakeFailed)?
        .map_err(|_| PeerError::HandshakeFailed)?;

    Handshake::decode(&buf)
}

/// The reading half of a peer stream: accumulates bytes and yields one
/// length-prefixed frame at a time.
pub(super) struct MessageReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    read_timeout: Duration,
}

impl MessageReader {
    pub(super) fn new(half: OwnedReadHalf, read_timeout: Duration) -> Self {
        Self {
            half,
            buf: BytesMut::with_capacity(32 * 1024),
            read_timeout,
        }
    }

    async fn fill(&mut self, wanted: usize) -> Result<(), PeerError> {
        while self.buf.len() < wanted {
            let n = timeout(self.read_timeout, self.half.read_buf(&mut self.buf))
                .await
                .map_err(|_| PeerError::ReadTimeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Reads the next complete message off the wire.
    pub(super) async fn next_message(&mut self) -> Result<Message, PeerError> {
        self.fill(4).await?;
        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::Malformed(format!("frame too large: {}", length)));
        }

        self.fill(4 + length).await?;
        let frame = self.buf.split_to(4 + length);
        Message::decode(frame.freeze())
    }
}

/// The writing half of a peer stream.
pub(super) struct MessageWriter {
    half: OwnedWriteHalf,
    write_timeout: Duration,
}

impl MessageWriter {
    pub(super) fn new(half: OwnedWriteHalf, write_timeout: Duration) -> Self {
        Self {
            half,
            write_timeout,
        }
    }

    pub(super) async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        timeout(self.write_timeout, self.half.write_all(&message.encode()))
            .await
            .map_err(|_| PeerError::WriteTimeout)??;
        Ok(())
    }
}
