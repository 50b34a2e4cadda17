//! Best-chain index.
//!
//! The core only needs three questions answered about the chain: how tall the best chain is,
//! whether a block hash is on it (and at which height), and where a locator forks from it. Blocks
//! refer to their predecessor by hash; the index resolves those links by lookup rather than by
//! holding references between blocks.

mod index;

pub use index::{BlockIndex, ChainError, InMemoryChain};

use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};

/// A block header position on the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainedBlock {
    pub hash: BlockHash,
    pub height: u32,
    /// `None` only for the genesis block
    pub previous: Option<BlockHash>,
}

/// Read access to the current best chain.
pub trait ChainIndex: Send + Sync {
    /// Height of the best chain tip.
    fn height(&self) -> u32;

    /// The block with this hash, or `None` if it is unknown or not on the best chain.
    fn get_block(&self, hash: &BlockHash) -> Option<ChainedBlock>;

    /// The first locator entry that is on the best chain, or genesis if none is.
    fn find_fork(&self, locator: &[BlockHash]) -> ChainedBlock;
}
