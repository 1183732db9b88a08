//! The piece-selection boundary between connections and the swarm layer.
//!
//! Connections do not decide what to download; a [`PiecePicker`] owned by
//! the swarm orchestrator does. The connection layer only reports results
//! back through it and returns unfinished requests on disconnect.

use bytes::Bytes;

use crate::peer::Bitfield;

/// A request for one block of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// The piece index.
    pub index: u32,
    /// Byte offset within the piece.
    pub begin: u32,
    /// Length of the block in bytes.
    pub length: u32,
}

impl BlockRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

/// A downloaded block of piece data.
#[derive(Debug, Clone)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(index: u32, begin: u32, data: Bytes) -> Self {
        Self { index, begin, data }
    }

    /// The request this block answers.
    pub fn request(&self) -> BlockRequest {
        BlockRequest {
            index: self.index,
            begin: self.begin,
            length: self.data.len() as u32,
        }
    }
}

/// Block selection, shared by every connection in a swarm.
///
/// Implementations serialize their own state; all methods take `&self`.
/// `complete` and `unpick` must not be lost: a connection calls `unpick`
/// for every request it still holds when it shuts down so another peer
/// can retake the block.
pub trait PiecePicker: Send + Sync {
    /// Picks the next block to request from a peer with the given
    /// availability, or `None` if the peer has nothing we need.
    fn pick(&self, availability: &Bitfield) -> Option<BlockRequest>;

    /// Records a finished block.
    fn complete(&self, request: BlockRequest, data: Bytes);

    /// Returns an unfinished request to the pool.
    fn unpick(&self, request: BlockRequest);
}
