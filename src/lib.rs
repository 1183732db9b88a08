//! leech - a download-only BitTorrent peer client core
//!
//! The two halves of a minimal swarm downloader: the peer wire protocol
//! and trackerless peer discovery over the DHT.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`peer`] - BEP-3 peer wire protocol and the per-peer connection
//!   state machine
//! - [`dht`] - BEP-5 Kademlia routing table, query transport, and
//!   iterative peer discovery
//! - [`picker`] - the piece-selection trait connections report into
//!
//! Peers discovered by [`dht::PeerDiscovery`] are handed to
//! [`peer::PeerConnection`], which handshakes, pipelines block requests
//! under a [`picker::PiecePicker`]'s direction, and streams downloaded
//! blocks back as events.

pub mod bencode;
pub mod dht;
mod info_hash;
pub mod peer;
pub mod picker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    DhtClient, DhtConfig, DhtError, DhtMessage, DhtResponse, DiscoveredPeers, Node, NodeId,
    PeerDiscovery, RoutingTable,
};
pub use info_hash::{InfoHash, InvalidInfoHash};
pub use peer::{
    Bitfield, ConnectionConfig, Handshake, Message, PeerConnection, PeerError, PeerEvent, PeerId,
};
pub use picker::{Block, BlockRequest, PiecePicker};
