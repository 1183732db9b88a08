use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use super::peer_id::PeerId;
use crate::info_hash::InfoHash;

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// The 68-byte handshake opening every peer connection.
///
/// Layout: `pstrlen (19)`, `pstr ("BitTorrent protocol")`, 8 reserved
/// bytes (all zero; no extensions are negotiated), the info hash, and
/// the sender's peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    /// Strict decode: anything but a well-formed 68-byte handshake with
    /// the standard protocol string fails the connection.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN {
            return Err(PeerError::HandshakeFailed);
        }
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::HandshakeFailed);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        })
    }
}

/// A peer wire message: a 4-byte big-endian length prefix (0 means
/// keep-alive), then a 1-byte id and an id-specific payload.
///
/// Ids outside the base protocol decode to [`Message::Unknown`] so the
/// connection can skip them; a payload whose length disagrees with its
/// id is a protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Unknown { id: u8, payload: Bytes },
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

impl Message {
    /// Encodes the message, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(ID_CHOKE);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(ID_UNCHOKE);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(ID_INTERESTED);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(ID_NOT_INTERESTED);
            }
            Message::Have { index } => {
                buf.put_u32(5);
                buf.put_u8(ID_HAVE);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(ID_BITFIELD);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(ID_REQUEST);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(ID_PIECE);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(ID_CANCEL);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(ID_PORT);
                buf.put_u16(*port);
            }
            Message::Unknown { id, payload } => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.freeze()
    }

    /// Decodes one message from a complete frame (prefix included).
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::Malformed("frame shorter than prefix".into()));
        }

        let length = data.get_u32() as usize;
        if length == 0 {
            if data.has_remaining() {
                return Err(PeerError::Malformed("data after keep-alive".into()));
            }
            return Ok(Message::KeepAlive);
        }
        if data.remaining() != length {
            return Err(PeerError::Malformed("length prefix mismatch".into()));
        }

        let id = data.get_u8();
        let payload = data.remaining();

        let message = match id {
            ID_CHOKE | ID_UNCHOKE | ID_INTERESTED | ID_NOT_INTERESTED => {
                if payload != 0 {
                    return Err(PeerError::Malformed(format!(
                        "unexpected payload for id {}",
                        id
                    )));
                }
                match id {
                    ID_CHOKE => Message::Choke,
                    ID_UNCHOKE => Message::Unchoke,
                    ID_INTERESTED => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            ID_HAVE => {
                if payload != 4 {
                    return Err(PeerError::Malformed("have payload".into()));
                }
                Message::Have {
                    index: data.get_u32(),
                }
            }
            ID_BITFIELD => Message::Bitfield(data.copy_to_bytes(payload)),
            ID_REQUEST | ID_CANCEL => {
                if payload != 12 {
                    return Err(PeerError::Malformed("request payload".into()));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                let length = data.get_u32();
                if id == ID_REQUEST {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            ID_PIECE => {
                if payload < 8 {
                    return Err(PeerError::Malformed("piece payload".into()));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: data.copy_to_bytes(payload - 8),
                }
            }
            ID_PORT => {
                if payload != 2 {
                    return Err(PeerError::Malformed("port payload".into()));
                }
                Message::Port(data.get_u16())
            }
            id => Message::Unknown {
                id,
                payload: data.copy_to_bytes(payload),
            },
        };

        Ok(message)
    }
}
