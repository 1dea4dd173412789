//! Collaborator interfaces the oracle consumes.

use cinder_download::Shared;
use cinder_primitives::prelude::*;

/// View of the best header chain, maintained elsewhere.
pub trait HeaderOracle: Send + Sync + 'static {
    fn best_position(&self) -> BlockPosition;

    /// Hash of the best-chain block at a height, if one exists.
    fn best_hash(&self, height: Height) -> Option<Buf32>;

    /// Best-chain positions strictly after `from`, up to `limit`.
    fn best_chain(&self, from: &BlockPosition, limit: usize) -> Vec<BlockPosition>;

    /// Nearest ancestor of `position` that is on the best chain.
    fn common_parent(&self, position: &BlockPosition) -> BlockPosition;

    fn position_at(&self, height: Height) -> Option<BlockPosition> {
        self.best_hash(height)
            .map(|hash| BlockPosition::new(height, hash))
    }

    fn is_in_best_chain(&self, position: &BlockPosition) -> bool {
        self.best_hash(position.height())
            .is_some_and(|hash| hash == *position.hash())
    }

    fn genesis_position(&self) -> BlockPosition;
}

/// Source of full blocks, for the indexer pipeline and match
/// confirmation.
pub trait BlockOracle: Send + Sync + 'static {
    /// Handle resolving to the block once it is available.
    fn load_block(&self, hash: &Buf32) -> Shared<bitcoin::Block>;

    fn tip(&self) -> BlockPosition;
}
