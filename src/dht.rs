//! Distributed Hash Table (BEP-5).
//!
//! Kademlia-style peer discovery: a [`RoutingTable`] of k-buckets over
//! the 160-bit id space, a [`DhtClient`] speaking the bencoded KRPC
//! protocol over UDP, and [`PeerDiscovery`] walking the DHT toward an
//! info hash to produce a stream of peer addresses.
//!
//! This node participates in the DHT (it answers `ping`, `find_node`
//! and `get_peers` with nodes from its table) but is not a tracker: it
//! never stores announces for others and never returns peers.

mod client;
mod discovery;
mod error;
mod message;
mod node;
mod routing;

pub use client::{DhtClient, DhtConfig};
pub use discovery::{DiscoveredPeers, PeerDiscovery, DEFAULT_BOOTSTRAP};
pub use error::DhtError;
pub use message::{DhtMessage, DhtQuery, DhtResponse, MessageBody, TransactionId};
pub use node::{peer_from_compact, peer_to_compact, Node, NodeId};
pub use routing::{FindNodes, RoutingTable, MAX_NODES};
