//! Peer wire protocol (BEP-3): handshake, message codecs, and the
//! per-peer connection state machine.
//!
//! A [`PeerConnection`] runs two tasks: a socket reader and a command
//! processor that owns all connection state. Downloads are enqueued on
//! the handle; completed blocks and the terminal disconnect arrive on
//! the event stream.

mod bitfield;
mod connection;
mod error;
mod message;
mod peer_id;
mod queue;
mod transport;

pub use bitfield::Bitfield;
pub use connection::{ConnectionConfig, PeerConnection, PeerEvent};
pub use error::PeerError;
pub use message::{Handshake, Message, HANDSHAKE_LEN, PROTOCOL};
pub use peer_id::PeerId;
pub use queue::RequestQueue;

#[cfg(test)]
mod tests;
