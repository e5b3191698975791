//! Interface to the node the wallet runs against.
//!
//! The wallet never validates blocks itself; it consumes an already
//! validated view of the chain and mempool through [`ChainAccess`] and
//! pushes transactions back out through the same handle.

use dashcore::{Block, BlockHash, Transaction, Txid};

use crate::fee::FeeRate;

/// Read access to the node's block index and mempool, plus the two entry
/// points the wallet uses to get transactions out (mempool acceptance and
/// relay).
///
/// Implementations must answer from a consistent snapshot: validation
/// events are delivered to the wallet in chain order on a single dispatch
/// thread, and these queries are made while handling them.
pub trait ChainAccess: Send + Sync {
    /// Height of the current tip.
    fn tip_height(&self) -> u32;

    /// Hash of the current tip.
    fn tip_hash(&self) -> BlockHash;

    /// Height of `hash` if it is in the main chain.
    fn height_of(&self, hash: &BlockHash) -> Option<u32>;

    /// Main-chain block hash at `height`.
    fn hash_at(&self, height: u32) -> Option<BlockHash>;

    /// Median-time-past style timestamp of a block.
    fn block_time(&self, hash: &BlockHash) -> Option<u32>;

    /// Full block body, used by rescan.
    fn block(&self, hash: &BlockHash) -> Option<Block>;

    /// Whether the mempool currently contains `txid`.
    fn mempool_contains(&self, txid: &Txid) -> bool;

    /// Number of in-mempool ancestors of `txid`, counting itself.
    /// Zero when the transaction is not in the mempool.
    fn mempool_ancestor_count(&self, txid: &Txid) -> u64;

    /// Submit a transaction for mempool acceptance.
    fn accept_to_mempool(&self, tx: &Transaction) -> Result<(), String>;

    /// Announce a transaction to peers. Returns whether it was relayed.
    fn relay_transaction(&self, tx: &Transaction) -> bool;

    /// Fee-rate estimate from the node's policy estimator.
    fn estimate_smart_fee(&self, conf_target: u32) -> Option<FeeRate>;
}

/// Block locator: tip-first hashes with logarithmically increasing gaps,
/// enough for the node to find our fork point after a restart.
pub fn build_locator(chain: &dyn ChainAccess) -> Vec<BlockHash> {
    let mut locator = Vec::new();
    let mut step = 1u32;
    let mut height = chain.tip_height() as i64;
    while height >= 0 {
        if let Some(hash) = chain.hash_at(height as u32) {
            locator.push(hash);
        }
        if locator.len() >= 10 {
            step = step.saturating_mul(2);
        }
        height -= step as i64;
    }
    // Always terminate with the genesis hash.
    if let Some(genesis) = chain.hash_at(0) {
        if locator.last() != Some(&genesis) {
            locator.push(genesis);
        }
    }
    locator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;

    #[test]
    fn test_locator_spacing() {
        let chain = MockChain::with_height(200);
        let locator = build_locator(&chain);

        assert_eq!(locator.first(), Some(&chain.tip_hash()));
        assert_eq!(locator.last(), chain.hash_at(0).as_ref());
        // Far fewer entries than blocks.
        assert!(locator.len() < 30, "locator too dense: {}", locator.len());
    }
}
