//! A transaction with the wallet-only metadata the owner cares about.

use std::collections::BTreeMap;

use dashcore::hashes::{sha256d, Hash};
use dashcore::{BlockHash, Transaction, Txid};

/// Sentinel block hash marking an abandoned transaction on disk
/// (displays as `0000…0001`).
pub fn abandon_hash() -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[0] = 1;
    BlockHash::from_raw_hash(sha256d::Hash::from_byte_array(bytes))
}

/// Where a wallet transaction currently stands relative to the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxState {
    /// Not in any block; possibly in the mempool.
    Unconfirmed,
    /// In the block `block_hash` at position `index`.
    InBlock { block_hash: BlockHash, index: i32 },
    /// A conflicting transaction is in `block_hash`; this one can no
    /// longer confirm while that block stands.
    Conflicted { block_hash: BlockHash },
    /// The owner declared it dead; its inputs may be respent.
    Abandoned,
}

impl TxState {
    /// Legacy on-disk shape: a block hash plus an index, with the
    /// sentinel hash for abandoned and index -1 for anything unconfirmed.
    pub fn to_disk(&self) -> (BlockHash, i32) {
        match self {
            TxState::Unconfirmed => (BlockHash::all_zeros(), -1),
            TxState::InBlock {
                block_hash,
                index,
            } => (*block_hash, *index),
            TxState::Conflicted {
                block_hash,
            } => (*block_hash, -1),
            TxState::Abandoned => (abandon_hash(), -1),
        }
    }

    pub fn from_disk(block_hash: BlockHash, index: i32) -> Self {
        if block_hash == abandon_hash() {
            TxState::Abandoned
        } else if block_hash == BlockHash::all_zeros() {
            TxState::Unconfirmed
        } else if index < 0 {
            TxState::Conflicted {
                block_hash,
            }
        } else {
            TxState::InBlock {
                block_hash,
                index,
            }
        }
    }
}

/// Per-category cached amounts. Each cell is either absent (recompute) or
/// the exact value a recomputation would produce.
#[derive(Debug, Clone, Default)]
pub struct CreditCache {
    pub debit: Option<u64>,
    pub credit: Option<u64>,
    pub immature_credit: Option<u64>,
    pub available_credit: Option<u64>,
    pub anonymized_credit: Option<u64>,
    pub denom_unconf_credit: Option<u64>,
    pub denom_conf_credit: Option<u64>,
    pub watch_debit: Option<u64>,
    pub watch_credit: Option<u64>,
    pub immature_watch_credit: Option<u64>,
    pub available_watch_credit: Option<u64>,
    pub change: Option<u64>,
}

impl CreditCache {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A transaction plus wallet bookkeeping.
#[derive(Debug, Clone)]
pub struct WalletTx {
    pub tx: Transaction,
    pub state: TxState,
    /// Free-form string map ("comment", "to", replacement linkage, …).
    pub map_value: BTreeMap<String, String>,
    /// Order-form pairs recorded at send time.
    pub order_form: Vec<(String, String)>,
    pub time_received_is_tx_time: bool,
    /// Local receive time, unix seconds.
    pub time_received: u64,
    /// Stable display timestamp; see `Wallet::compute_time_smart`.
    pub time_smart: u64,
    /// Whether this wallet created the transaction.
    pub from_me: bool,
    /// Legacy account label ("fromaccount" in the string map on disk).
    pub from_account: String,
    /// Position in the ordered log; -1 until assigned.
    pub order_pos: i64,
    pub cache: CreditCache,
}

impl WalletTx {
    pub fn new(tx: Transaction) -> Self {
        Self {
            tx,
            state: TxState::Unconfirmed,
            map_value: BTreeMap::new(),
            order_form: Vec::new(),
            time_received_is_tx_time: false,
            time_received: 0,
            time_smart: 0,
            from_me: false,
            from_account: String::new(),
            order_pos: -1,
            cache: CreditCache::default(),
        }
    }

    pub fn txid(&self) -> Txid {
        self.tx.txid()
    }

    pub fn block_hash(&self) -> Option<BlockHash> {
        match &self.state {
            TxState::InBlock {
                block_hash, ..
            }
            | TxState::Conflicted {
                block_hash,
            } => Some(*block_hash),
            _ => None,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.state, TxState::Abandoned)
    }

    pub fn is_conflicted(&self) -> bool {
        matches!(self.state, TxState::Conflicted { .. })
    }

    pub fn is_in_block(&self) -> bool {
        matches!(self.state, TxState::InBlock { .. })
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx.is_coin_base()
    }

    /// Best-known timestamp for display and resend decisions.
    pub fn tx_time(&self) -> u64 {
        if self.time_smart > 0 {
            self.time_smart
        } else {
            self.time_received
        }
    }

    /// True if only the scriptSigs differ between `self.tx` and `other`
    /// (a mutated copy of the same payment).
    pub fn is_equivalent_to(&self, other: &Transaction) -> bool {
        let mut a = self.tx.clone();
        let mut b = other.clone();
        for input in a.input.iter_mut().chain(b.input.iter_mut()) {
            input.script_sig = dashcore::ScriptBuf::new();
        }
        a.txid() == b.txid()
    }

    pub fn mark_dirty(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::dummy_transaction;

    #[test]
    fn test_abandon_hash_display() {
        let hash = abandon_hash();
        assert_eq!(
            hash.to_string(),
            "0000000000000000000000000000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn test_state_disk_round_trip() {
        let block = BlockHash::from_raw_hash(sha256d::Hash::from_byte_array([7u8; 32]));
        let states = [
            TxState::Unconfirmed,
            TxState::InBlock {
                block_hash: block,
                index: 3,
            },
            TxState::Conflicted {
                block_hash: block,
            },
            TxState::Abandoned,
        ];
        for state in states {
            let (hash, index) = state.to_disk();
            assert_eq!(TxState::from_disk(hash, index), state);
        }
    }

    #[test]
    fn test_equivalence_ignores_script_sigs() {
        let tx = dummy_transaction(1, &[10_000]);
        let mut wtx = WalletTx::new(tx.clone());
        wtx.from_me = true;

        let mut mutated = tx.clone();
        mutated.input[0].script_sig =
            dashcore::blockdata::script::Builder::new().push_int(1).into_script();
        assert_ne!(tx.txid(), mutated.txid());
        assert!(wtx.is_equivalent_to(&mutated));

        let mut different = tx;
        different.output[0].value += 1;
        assert!(!wtx.is_equivalent_to(&different));
    }

    #[test]
    fn test_cache_clear() {
        let mut wtx = WalletTx::new(dummy_transaction(1, &[1]));
        wtx.cache.credit = Some(5);
        wtx.cache.change = Some(1);
        wtx.mark_dirty();
        assert!(wtx.cache.credit.is_none());
        assert!(wtx.cache.change.is_none());
    }
}
