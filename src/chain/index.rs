use super::{ChainIndex, ChainedBlock};

use bitcoin::BlockHash;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Unknown block {0}")]
    UnknownBlock(BlockHash),

    #[error("Block {hash} refers to unknown parent {previous}")]
    UnknownParent { hash: BlockHash, previous: BlockHash },
}

/// Headers keyed by hash, plus the best chain keyed by height.
///
/// Blocks on side branches stay in `blocks` so a later reorg back onto them only needs a tip
/// change.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    blocks: HashMap<BlockHash, ChainedBlock>,
    best: Vec<BlockHash>,
}

impl BlockIndex {
    pub fn new(genesis: BlockHash) -> Self {
        let block = ChainedBlock {
            hash: genesis,
            height: 0,
            previous: None,
        };
        Self {
            blocks: HashMap::from([(genesis, block)]),
            best: vec![genesis],
        }
    }

    /// Record a header without moving the tip.
    pub fn insert(&mut self, hash: BlockHash, previous: BlockHash) -> Result<ChainedBlock, ChainError> {
        if let Some(existing) = self.blocks.get(&hash) {
            return Ok(*existing);
        }
        let parent = self
            .blocks
            .get(&previous)
            .ok_or(ChainError::UnknownParent { hash, previous })?;
        let block = ChainedBlock {
            hash,
            height: parent.height + 1,
            previous: Some(previous),
        };
        self.blocks.insert(hash, block);
        Ok(block)
    }

    /// Make `hash` the best tip, rewinding to the fork point if it is on another branch.
    pub fn set_tip(&mut self, hash: BlockHash) -> Result<(), ChainError> {
        let mut branch = Vec::new();
        let mut cursor = *self.blocks.get(&hash).ok_or(ChainError::UnknownBlock(hash))?;
        while !self.contains(&cursor.hash) {
            branch.push(cursor.hash);
            let previous = cursor.previous.ok_or(ChainError::UnknownBlock(cursor.hash))?;
            cursor = *self.blocks.get(&previous).ok_or(ChainError::UnknownBlock(previous))?;
        }

        let fork_height = cursor.height as usize;
        if fork_height + 1 < self.best.len() {
            info!(
                "Reorg: rewinding {} blocks to fork at height {}",
                self.best.len() - fork_height - 1,
                fork_height
            );
        }
        self.best.truncate(fork_height + 1);
        self.best.extend(branch.into_iter().rev());
        Ok(())
    }

    /// Extend the best chain by one block.
    pub fn push(&mut self, hash: BlockHash) -> Result<ChainedBlock, ChainError> {
        let tip = self.tip().hash;
        let block = self.insert(hash, tip)?;
        self.set_tip(hash)?;
        Ok(block)
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.blocks
            .get(hash)
            .is_some_and(|b| self.best.get(b.height as usize) == Some(hash))
    }

    pub fn height(&self) -> u32 {
        (self.best.len() - 1) as u32
    }

    pub fn tip(&self) -> ChainedBlock {
        let hash = self.best[self.best.len() - 1];
        self.blocks[&hash]
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<ChainedBlock> {
        self.contains(hash).then(|| self.blocks[hash])
    }

    pub fn find_fork(&self, locator: &[BlockHash]) -> ChainedBlock {
        locator
            .iter()
            .find_map(|hash| self.get_block(hash))
            .unwrap_or_else(|| self.blocks[&self.best[0]])
    }
}

/// Shared, concurrently readable [`BlockIndex`].
pub struct InMemoryChain {
    index: RwLock<BlockIndex>,
}

impl InMemoryChain {
    pub fn new(genesis: BlockHash) -> Self {
        Self {
            index: RwLock::new(BlockIndex::new(genesis)),
        }
    }

    pub fn insert(&self, hash: BlockHash, previous: BlockHash) -> Result<ChainedBlock, ChainError> {
        self.index.write().insert(hash, previous)
    }

    pub fn set_tip(&self, hash: BlockHash) -> Result<(), ChainError> {
        self.index.write().set_tip(hash)
    }

    pub fn push(&self, hash: BlockHash) -> Result<ChainedBlock, ChainError> {
        self.index.write().push(hash)
    }
}

impl ChainIndex for InMemoryChain {
    fn height(&self) -> u32 {
        self.index.read().height()
    }

    fn get_block(&self, hash: &BlockHash) -> Option<ChainedBlock> {
        self.index.read().get_block(hash)
    }

    fn find_fork(&self, locator: &[BlockHash]) -> ChainedBlock {
        self.index.read().find_fork(locator)
    }
}
