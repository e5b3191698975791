//! Test fixtures: deterministic transactions, blocks and a mock chain.
//!
//! Used by the crate's own tests and by integration tests; not part of
//! the stable API.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use dashcore::block::{Header as BlockHeader, Version};
use dashcore::hashes::{sha256d, Hash};
use dashcore::pow::CompactTarget;
use dashcore::{
    Block, BlockHash, OutPoint, ScriptBuf, Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::chain::ChainAccess;
use crate::fee::FeeRate;

/// A transaction with a unique fake input per `seed` and one output per
/// entry of `values`, paying to an empty script.
pub fn dummy_transaction(seed: u8, values: &[u64]) -> Transaction {
    dummy_transaction_paying(seed, &values.iter().map(|v| (*v, ScriptBuf::new())).collect::<Vec<_>>())
}

/// Like [`dummy_transaction`] but with explicit output scripts.
pub fn dummy_transaction_paying(seed: u8, outputs: &[(u64, ScriptBuf)]) -> Transaction {
    let fake_parent = Txid::from_raw_hash(sha256d::Hash::from_byte_array([seed; 32]));
    Transaction {
        version: 1,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: fake_parent,
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: u32::MAX,
            witness: Witness::new(),
        }],
        output: outputs
            .iter()
            .map(|(value, script)| TxOut {
                value: *value,
                script_pubkey: script.clone(),
            })
            .collect(),
        special_transaction_payload: None,
    }
}

/// A transaction spending `parent`'s output `vout`, one output per value.
pub fn spending_transaction(parent: &Transaction, vout: u32, values: &[u64]) -> Transaction {
    spending_transaction_paying(
        parent,
        vout,
        &values.iter().map(|v| (*v, ScriptBuf::new())).collect::<Vec<_>>(),
    )
}

/// Like [`spending_transaction`] but with explicit output scripts.
pub fn spending_transaction_paying(
    parent: &Transaction,
    vout: u32,
    outputs: &[(u64, ScriptBuf)],
) -> Transaction {
    Transaction {
        version: 1,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: parent.txid(),
                vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: u32::MAX,
            witness: Witness::new(),
        }],
        output: outputs
            .iter()
            .map(|(value, script)| TxOut {
                value: *value,
                script_pubkey: script.clone(),
            })
            .collect(),
        special_transaction_payload: None,
    }
}

/// Block at the given height containing `transactions`, chained to
/// `prev` by hash.
pub fn make_block(prev: BlockHash, time: u32, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: Version::from_consensus(1),
            prev_blockhash: prev,
            merkle_root: sha256d::Hash::all_zeros().into(),
            time,
            bits: CompactTarget::from_consensus(0x1d00ffff),
            nonce: 0,
        },
        txdata: transactions,
    }
}

#[derive(Default)]
struct MockChainInner {
    /// Main chain, height-indexed.
    blocks: Vec<Block>,
    heights: HashMap<BlockHash, u32>,
    mempool: HashSet<Txid>,
    ancestor_counts: HashMap<Txid, u64>,
    accepted: Vec<Txid>,
    relayed: Vec<Txid>,
    fee_rate: Option<FeeRate>,
    reject_next: Option<String>,
}

/// In-memory [`ChainAccess`] implementation for tests.
#[derive(Default)]
pub struct MockChain {
    inner: Mutex<MockChainInner>,
}

impl MockChain {
    pub fn new() -> Self {
        let chain = Self::default();
        // Genesis.
        chain.push_block(Vec::new(), 1_500_000_000);
        chain
    }

    /// A chain of `height + 1` empty blocks.
    pub fn with_height(height: u32) -> Self {
        let chain = Self::new();
        for _ in 0..height {
            chain.push_block(Vec::new(), 0);
        }
        chain
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockChainInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a block to the tip; time 0 means one minute after the
    /// previous block.
    pub fn push_block(&self, transactions: Vec<Transaction>, time: u32) -> Block {
        let mut inner = self.lock();
        let prev = inner.blocks.last().map(|b| b.block_hash()).unwrap_or_else(BlockHash::all_zeros);
        let time = if time == 0 {
            inner.blocks.last().map(|b| b.header.time + 60).unwrap_or(1_500_000_000)
        } else {
            time
        };
        let block = make_block(prev, time, transactions);
        let height = inner.blocks.len() as u32;
        inner.heights.insert(block.block_hash(), height);
        for tx in &block.txdata {
            inner.mempool.remove(&tx.txid());
        }
        inner.blocks.push(block.clone());
        block
    }

    /// Remove the tip block, returning it.
    pub fn pop_block(&self) -> Option<Block> {
        let mut inner = self.lock();
        let block = inner.blocks.pop()?;
        inner.heights.remove(&block.block_hash());
        Some(block)
    }

    pub fn add_mempool_tx(&self, txid: Txid) {
        self.lock().mempool.insert(txid);
    }

    pub fn remove_mempool_tx(&self, txid: &Txid) {
        self.lock().mempool.remove(txid);
    }

    pub fn set_ancestor_count(&self, txid: Txid, count: u64) {
        self.lock().ancestor_counts.insert(txid, count);
    }

    pub fn set_fee_rate(&self, rate: Option<FeeRate>) {
        self.lock().fee_rate = rate;
    }

    /// Make the next `accept_to_mempool` fail with the given reason.
    pub fn reject_next_acceptance(&self, reason: &str) {
        self.lock().reject_next = Some(reason.to_string());
    }

    pub fn accepted(&self) -> Vec<Txid> {
        self.lock().accepted.clone()
    }

    pub fn relayed(&self) -> Vec<Txid> {
        self.lock().relayed.clone()
    }
}

impl ChainAccess for MockChain {
    fn tip_height(&self) -> u32 {
        (self.lock().blocks.len() as u32).saturating_sub(1)
    }

    fn tip_hash(&self) -> BlockHash {
        self.lock().blocks.last().map(|b| b.block_hash()).unwrap_or_else(BlockHash::all_zeros)
    }

    fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.lock().heights.get(hash).copied()
    }

    fn hash_at(&self, height: u32) -> Option<BlockHash> {
        self.lock().blocks.get(height as usize).map(|b| b.block_hash())
    }

    fn block_time(&self, hash: &BlockHash) -> Option<u32> {
        let inner = self.lock();
        let height = *inner.heights.get(hash)?;
        inner.blocks.get(height as usize).map(|b| b.header.time)
    }

    fn block(&self, hash: &BlockHash) -> Option<Block> {
        let inner = self.lock();
        let height = *inner.heights.get(hash)?;
        inner.blocks.get(height as usize).cloned()
    }

    fn mempool_contains(&self, txid: &Txid) -> bool {
        self.lock().mempool.contains(txid)
    }

    fn mempool_ancestor_count(&self, txid: &Txid) -> u64 {
        let inner = self.lock();
        if !inner.mempool.contains(txid) {
            return 0;
        }
        inner.ancestor_counts.get(txid).copied().unwrap_or(1)
    }

    fn accept_to_mempool(&self, tx: &Transaction) -> Result<(), String> {
        let mut inner = self.lock();
        if let Some(reason) = inner.reject_next.take() {
            return Err(reason);
        }
        let txid = tx.txid();
        inner.mempool.insert(txid);
        inner.accepted.push(txid);
        Ok(())
    }

    fn relay_transaction(&self, tx: &Transaction) -> bool {
        self.lock().relayed.push(tx.txid());
        true
    }

    fn estimate_smart_fee(&self, _conf_target: u32) -> Option<FeeRate> {
        self.lock().fee_rate
    }
}
