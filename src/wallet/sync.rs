//! Chain synchronization: validation-event handling, rescans, conflict
//! marking, abandonment and the periodic resend of unconfirmed
//! transactions.
//!
//! The node delivers events in chain order on a single dispatch thread;
//! every entry point here runs under the wallet lock.

use std::collections::VecDeque;

use dashcore::{Block, BlockHash, Transaction, Txid};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{Result, WalletError};
use crate::events::{ChangeType, WalletEvent};
use crate::wallet_tx::{TxState, WalletTx};

use super::{unix_time, RescanReserver, Wallet};

/// Rescans look this far behind a requested timestamp to absorb clock
/// skew between blocks.
pub const TIMESTAMP_WINDOW: u64 = 2 * 60 * 60;

/// Only transactions received at least this long ago are re-announced.
const RESEND_MIN_AGE: u64 = 5 * 60;

/// Upper bound of the randomized resend interval.
const RESEND_JITTER: u64 = 30 * 60;

impl Wallet {
    // --- validation events ------------------------------------------------

    pub fn transaction_added_to_mempool(&mut self, tx: &Transaction) {
        self.add_to_wallet_if_involving_me(tx, None, true);
    }

    /// The mempool dropped `tx` (expiry, replacement, block inclusion is
    /// reported separately). Balances that depended on mempool presence
    /// must be recomputed.
    pub fn transaction_removed_from_mempool(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        if let Some(wtx) = self.store.get_mut(&txid) {
            wtx.mark_dirty();
        }
    }

    /// A block joined the main chain. `conflicted` lists mempool
    /// transactions the block displaced by double spend.
    pub fn block_connected(&mut self, block: &Block, height: u32, conflicted: &[Transaction]) {
        let block_hash = block.block_hash();
        for tx in conflicted {
            self.mark_conflicted(&block_hash, &tx.txid());
        }
        for (pos, tx) in block.txdata.iter().enumerate() {
            self.add_to_wallet_if_involving_me(tx, Some((&block_hash, pos as i32)), true);
        }
        self.best_block = Some(block_hash);
        if let Err(e) = self.persist_best_block() {
            warn!(error = %e, "failed to persist best block");
        }
        debug!(height, %block_hash, "block connected");
    }

    /// A block left the main chain: every transaction confirmed by it
    /// returns to the unconfirmed state.
    pub fn block_disconnected(&mut self, block: &Block) {
        let block_hash = block.block_hash();
        let txids = self.store.txids();
        for txid in txids {
            let in_this_block = matches!(
                self.store.get(&txid).map(|w| &w.state),
                Some(TxState::InBlock { block_hash: h, .. }) if *h == block_hash
            );
            if in_this_block {
                if let Some(wtx) = self.store.get_mut(&txid) {
                    wtx.state = TxState::Unconfirmed;
                    wtx.mark_dirty();
                }
                self.store.mark_dirty_dependents(&txid);
                self.rounds_cache.clear();
                if let Some(wtx) = self.store.get(&txid).cloned() {
                    if let Err(e) = self.persist_wallet_tx(&wtx) {
                        warn!(error = %e, %txid, "failed to persist disconnected tx");
                    }
                }
                self.events.emit(WalletEvent::TransactionChanged {
                    txid,
                    status: ChangeType::Updated,
                });
            }
        }
        debug!(%block_hash, "block disconnected");
    }

    /// Persist the locator for the current chain tip.
    pub fn set_best_chain(&mut self) -> Result<()> {
        self.best_block = Some(self.chain.tip_hash());
        self.persist_best_block()
    }

    pub fn best_block(&self) -> Option<BlockHash> {
        self.best_block
    }

    // --- transaction intake ----------------------------------------------

    /// Add or update a wallet transaction if it involves us: any output
    /// script is ours, or any input spends one of our outputs. Returns
    /// whether the transaction is tracked.
    pub fn add_to_wallet_if_involving_me(
        &mut self,
        tx: &Transaction,
        block: Option<(&BlockHash, i32)>,
        update: bool,
    ) -> bool {
        let txid = tx.txid();
        let existed = self.store.contains(&txid);
        if existed && !update {
            return false;
        }

        let relevant = existed
            || self.tx_is_mine(tx)
            || tx.input.iter().any(|i| self.is_mine_input(i) != crate::keystore::IsMine::No);
        if !relevant {
            return false;
        }

        let new_state = match block {
            Some((hash, index)) => TxState::InBlock {
                block_hash: *hash,
                index,
            },
            None => TxState::Unconfirmed,
        };

        if existed {
            let changed = self
                .store
                .get(&txid)
                .map(|w| w.state != new_state)
                .unwrap_or(false);
            if changed {
                if let Some(wtx) = self.store.get_mut(&txid) {
                    // An abandoned or conflicted transaction that shows
                    // up in a block resumes confirming.
                    wtx.state = new_state;
                    wtx.mark_dirty();
                }
                self.store.mark_dirty_dependents(&txid);
                self.mark_input_parents_dirty(&txid);
                self.rounds_cache.clear();
                if let Some(wtx) = self.store.get(&txid).cloned() {
                    if let Err(e) = self.persist_wallet_tx(&wtx) {
                        warn!(error = %e, %txid, "failed to persist updated tx");
                    }
                }
                self.events.emit(WalletEvent::TransactionChanged {
                    txid,
                    status: ChangeType::Updated,
                });
            }
            self.sync_conflicts(&txid);
            return true;
        }

        let mut wtx = WalletTx::new(tx.clone());
        wtx.state = new_state;
        wtx.time_received = unix_time();
        wtx.time_received_is_tx_time = block.is_none();
        wtx.from_me = self.tx_is_from_me(tx);
        wtx.time_smart = self.compute_time_smart(&wtx);

        self.store.insert(wtx);
        self.mark_input_parents_dirty(&txid);
        self.rounds_cache.clear();
        if let Some(wtx) = self.store.get(&txid).cloned() {
            if let Err(e) = self.persist_wallet_tx(&wtx) {
                warn!(error = %e, %txid, "failed to persist new wallet tx");
            }
        }
        if let Err(e) = self.persist_order_pos_next() {
            warn!(error = %e, "failed to persist order counter");
        }
        self.events.emit(WalletEvent::TransactionChanged {
            txid,
            status: ChangeType::Added,
        });
        info!(%txid, in_block = block.is_some(), "transaction added to wallet");

        self.sync_conflicts(&txid);
        true
    }

    /// Load-time insertion: no persistence, no events, no conflict scan.
    pub fn load_wallet_tx(&mut self, wtx: WalletTx) {
        self.store.insert(wtx);
    }

    /// A state change on `txid` changes the spendability of the outputs
    /// it consumes; the parents' cached available credit must go.
    fn mark_input_parents_dirty(&mut self, txid: &Txid) {
        let parents: Vec<Txid> = match self.store.get(txid) {
            Some(wtx) => wtx.tx.input.iter().map(|i| i.previous_output.txid).collect(),
            None => return,
        };
        for parent in parents {
            if let Some(parent_tx) = self.store.get_mut(&parent) {
                parent_tx.mark_dirty();
            }
        }
    }

    /// Stable display timestamp: the received time clamped between the
    /// neighboring wallet entries and the block time, so wallet order
    /// survives local clock skew.
    pub fn compute_time_smart(&self, wtx: &WalletTx) -> u64 {
        let block_time = wtx.block_hash().and_then(|h| self.chain.block_time(&h));
        match block_time {
            Some(block_time) => {
                let latest_now = wtx.time_received;
                let latest_tolerated = latest_now + 300;

                // Newest wallet entry not later than the tolerated skew.
                let mut latest_entry = 0;
                let entries: Vec<(i64, crate::tx_store::OrderedEntry)> = self
                    .store
                    .ordered_entries()
                    .map(|(pos, e)| (pos, e.clone()))
                    .collect();
                for (_, entry) in entries.iter().rev() {
                    let entry_time = match entry {
                        crate::tx_store::OrderedEntry::Tx(txid) => {
                            self.store.get(txid).map(|w| w.tx_time()).unwrap_or(0)
                        }
                        crate::tx_store::OrderedEntry::Accounting(no) => self
                            .store
                            .accounting_entries()
                            .find(|e| e.entry_no == *no)
                            .map(|e| e.time)
                            .unwrap_or(0),
                    };
                    if entry_time <= latest_tolerated {
                        latest_entry = entry_time;
                        break;
                    }
                }

                latest_entry.max((block_time as u64).min(latest_now))
            }
            None => wtx.time_received,
        }
    }

    // --- conflicts --------------------------------------------------------

    /// After an insert or update, resolve any double spends visible in
    /// the spend index: the spender confirmed in the main chain wins and
    /// the rest are marked conflicted against its block.
    fn sync_conflicts(&mut self, txid: &Txid) {
        for outpoint in self.store.conflicted_outpoints(txid) {
            let spenders: Vec<Txid> = self.store.spenders(&outpoint).copied().collect();
            let winner_block = spenders.iter().find_map(|t| {
                match self.store.get(t).map(|w| &w.state) {
                    Some(TxState::InBlock {
                        block_hash, ..
                    }) if self.chain.height_of(block_hash).is_some() => Some(*block_hash),
                    _ => None,
                }
            });
            if let Some(block_hash) = winner_block {
                for spender in spenders {
                    self.mark_conflicted(&block_hash, &spender);
                }
            }
        }
    }

    /// Mark `txid` and its in-wallet descendants as conflicting with
    /// `block_hash`. Confirmed transactions (the winner included) are
    /// left alone.
    pub fn mark_conflicted(&mut self, block_hash: &BlockHash, txid: &Txid) {
        if self.chain.height_of(block_hash).is_none() {
            return;
        }

        let mut queue = VecDeque::from([*txid]);
        while let Some(current) = queue.pop_front() {
            let Some(wtx) = self.store.get(&current) else {
                continue;
            };
            if self.depth(&current) > 0 {
                continue;
            }
            let already = matches!(
                &wtx.state,
                TxState::Conflicted { block_hash: h } if h == block_hash
            );
            if !already {
                if let Some(wtx) = self.store.get_mut(&current) {
                    wtx.state = TxState::Conflicted {
                        block_hash: *block_hash,
                    };
                    wtx.mark_dirty();
                }
                self.store.mark_dirty_dependents(&current);
                self.mark_input_parents_dirty(&current);
                self.rounds_cache.clear();
                if let Some(wtx) = self.store.get(&current).cloned() {
                    if let Err(e) = self.persist_wallet_tx(&wtx) {
                        warn!(error = %e, txid = %current, "failed to persist conflict");
                    }
                }
                self.events.emit(WalletEvent::TransactionChanged {
                    txid: current,
                    status: ChangeType::Updated,
                });
                warn!(txid = %current, %block_hash, "transaction marked conflicted");
            }
            for spender in self.store.tx_spenders(&current) {
                queue.push_back(spender);
            }
        }
    }

    // --- abandonment ------------------------------------------------------

    /// Whether `txid` may be abandoned: known, unconfirmed, not in the
    /// mempool, not already abandoned.
    pub fn transaction_can_be_abandoned(&self, txid: &Txid) -> bool {
        match self.store.get(txid) {
            Some(wtx) => {
                !wtx.is_abandoned() && self.depth(txid) == 0 && !self.chain.mempool_contains(txid)
            }
            None => false,
        }
    }

    /// Declare a transaction dead so its inputs can be respent. The
    /// transaction and all in-wallet descendants must be out of every
    /// block and out of the mempool.
    pub fn abandon_transaction(&mut self, txid: &Txid) -> Result<()> {
        if !self.transaction_can_be_abandoned(txid) {
            return Err(WalletError::InvalidInput(
                "transaction is confirmed, in the mempool, or unknown".into(),
            ));
        }

        // Descendants must be eligible too before anything mutates.
        let mut queue = VecDeque::from([*txid]);
        let mut doomed = Vec::new();
        while let Some(current) = queue.pop_front() {
            if doomed.contains(&current) {
                continue;
            }
            if let Some(wtx) = self.store.get(&current) {
                if !wtx.is_abandoned() {
                    if self.depth(&current) > 0 || self.chain.mempool_contains(&current) {
                        return Err(WalletError::InvalidInput(
                            "a descendant is confirmed or in the mempool".into(),
                        ));
                    }
                    doomed.push(current);
                }
            }
            for spender in self.store.tx_spenders(&current) {
                queue.push_back(spender);
            }
        }

        for current in doomed {
            if let Some(wtx) = self.store.get_mut(&current) {
                wtx.state = TxState::Abandoned;
                wtx.mark_dirty();
            }
            self.store.mark_dirty_dependents(&current);
            self.mark_input_parents_dirty(&current);
            self.rounds_cache.clear();
            if let Some(wtx) = self.store.get(&current).cloned() {
                self.persist_wallet_tx(&wtx)?;
            }
            self.events.emit(WalletEvent::TransactionChanged {
                txid: current,
                status: ChangeType::Updated,
            });
            info!(txid = %current, "transaction abandoned");
        }
        Ok(())
    }

    /// Record BIP125 replacement linkage between two wallet
    /// transactions.
    pub fn mark_replaced(&mut self, old_txid: &Txid, new_txid: &Txid) -> Result<()> {
        if let Some(wtx) = self.store.get_mut(old_txid) {
            wtx.map_value.insert("replaced_by_txid".into(), new_txid.to_string());
            wtx.mark_dirty();
        } else {
            return Err(WalletError::InvalidInput("unknown transaction".into()));
        }
        if let Some(wtx) = self.store.get_mut(new_txid) {
            wtx.map_value.insert("replaces_txid".into(), old_txid.to_string());
        }
        if let Some(wtx) = self.store.get(old_txid).cloned() {
            self.persist_wallet_tx(&wtx)?;
        }
        if let Some(wtx) = self.store.get(new_txid).cloned() {
            self.persist_wallet_tx(&wtx)?;
        }
        self.events.emit(WalletEvent::TransactionChanged {
            txid: *old_txid,
            status: ChangeType::Updated,
        });
        Ok(())
    }

    // --- rescan -----------------------------------------------------------

    /// Walk the chain from `start_height` and feed every transaction that
    /// involves us into the wallet. Requires a held [`RescanReserver`];
    /// honors the abort flag within one block of work. Returns the last
    /// height scanned.
    pub fn rescan_blocks(
        &mut self,
        start_height: u32,
        stop_height: Option<u32>,
        reserver: &RescanReserver,
        update: bool,
    ) -> Result<u32> {
        if !reserver.is_reserved() {
            return Err(WalletError::General("rescan requires a reservation".into()));
        }
        self.scan_state().clear_abort();

        let stop = stop_height.unwrap_or_else(|| self.chain.tip_height());
        let total = (stop.saturating_sub(start_height)).max(1) as f64;
        info!(start_height, stop, "rescan started");
        self.events.emit(WalletEvent::ShowProgress {
            title: "Rescanning…".into(),
            progress: 0,
        });

        let mut height = start_height;
        while height <= stop {
            if self.scan_state().is_aborting() {
                warn!(height, "rescan aborted");
                self.events.emit(WalletEvent::ShowProgress {
                    title: "Rescanning…".into(),
                    progress: 100,
                });
                return Err(WalletError::AbortedByUser);
            }

            let Some(hash) = self.chain.hash_at(height) else {
                break;
            };
            let Some(block) = self.chain.block(&hash) else {
                break;
            };
            for (pos, tx) in block.txdata.iter().enumerate() {
                self.add_to_wallet_if_involving_me(tx, Some((&hash, pos as i32)), update);
            }

            if height % 100 == 0 {
                let progress = (((height - start_height) as f64 / total) * 100.0) as i32;
                self.events.emit(WalletEvent::ShowProgress {
                    title: "Rescanning…".into(),
                    progress: progress.clamp(0, 99),
                });
            }
            height += 1;
        }

        self.events.emit(WalletEvent::ShowProgress {
            title: "Rescanning…".into(),
            progress: 100,
        });
        info!(stop, "rescan finished");
        Ok(stop)
    }

    /// Rescan starting from the first block whose timestamp is within
    /// the skew window of `time`.
    pub fn rescan_from_time(
        &mut self,
        time: u64,
        reserver: &RescanReserver,
        update: bool,
    ) -> Result<u32> {
        let cutoff = time.saturating_sub(TIMESTAMP_WINDOW);
        let tip = self.chain.tip_height();
        let mut start = tip;
        for height in 0..=tip {
            let Some(hash) = self.chain.hash_at(height) else {
                break;
            };
            if self.chain.block_time(&hash).map(|t| t as u64).unwrap_or(0) >= cutoff {
                start = height;
                break;
            }
        }
        self.rescan_blocks(start, None, reserver, update)
    }

    // --- resend & reaccept ------------------------------------------------

    /// Push still-unconfirmed wallet transactions back into the mempool
    /// (e.g. after a restart).
    pub fn reaccept_wallet_transactions(&mut self) {
        let mut candidates: Vec<(i64, Txid)> = self
            .store
            .iter()
            .filter(|(txid, wtx)| {
                !wtx.is_coinbase() && !wtx.is_abandoned() && self.depth(txid) == 0
            })
            .map(|(txid, wtx)| (wtx.order_pos, *txid))
            .collect();
        candidates.sort();

        for (_, txid) in candidates {
            if self.chain.mempool_contains(&txid) {
                continue;
            }
            let Some(tx) = self.store.get(&txid).map(|w| w.tx.clone()) else {
                continue;
            };
            if let Err(reason) = self.chain.accept_to_mempool(&tx) {
                debug!(%txid, reason, "reaccept rejected");
            }
        }
    }

    /// Periodically re-announce unconfirmed transactions. The interval
    /// is randomized so the resend pattern does not fingerprint the
    /// wallet; nothing happens until a block arrived since the last
    /// pass. Returns the relayed txids.
    pub fn resend_wallet_transactions(&mut self, now: u64, best_block_time: u64) -> Vec<Txid> {
        if !self.broadcast_transactions() {
            return Vec::new();
        }
        if self.next_resend == 0 {
            self.next_resend = now + rand::thread_rng().gen_range(0..RESEND_JITTER);
            return Vec::new();
        }
        if now < self.next_resend {
            return Vec::new();
        }
        self.next_resend = now + rand::thread_rng().gen_range(0..RESEND_JITTER);

        // Only bother when a block arrived since the last pass.
        if best_block_time < self.last_resend {
            return Vec::new();
        }
        self.last_resend = now;

        self.resend_wallet_transactions_before(best_block_time.saturating_sub(RESEND_MIN_AGE))
    }

    /// Relay every eligible unconfirmed transaction received before
    /// `before_time`, oldest first.
    pub fn resend_wallet_transactions_before(&mut self, before_time: u64) -> Vec<Txid> {
        let mut candidates: Vec<(u64, Txid)> = self
            .store
            .iter()
            .filter(|(txid, wtx)| {
                !wtx.is_coinbase()
                    && !wtx.is_abandoned()
                    && !wtx.is_conflicted()
                    && self.depth(txid) == 0
                    && wtx.time_received < before_time
            })
            .map(|(txid, wtx)| (wtx.time_received, *txid))
            .collect();
        candidates.sort();

        let mut relayed = Vec::new();
        for (_, txid) in candidates {
            let Some(tx) = self.store.get(&txid).map(|w| w.tx.clone()) else {
                continue;
            };
            if !self.chain.mempool_contains(&txid) {
                if self.chain.accept_to_mempool(&tx).is_err() {
                    continue;
                }
            }
            if self.chain.relay_transaction(&tx) {
                relayed.push(txid);
            }
        }
        if !relayed.is_empty() {
            info!(count = relayed.len(), "resent wallet transactions");
        }
        relayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::test_utils::{
        dummy_transaction_paying, spending_transaction, spending_transaction_paying, MockChain,
    };
    use crate::wallet::config::WalletConfig;
    use dashcore::{Address, Network, ScriptBuf};
    use std::sync::Arc;

    fn wallet_with_chain() -> (Wallet, Arc<MockChain>) {
        let chain = Arc::new(MockChain::with_height(10));
        let mut config = WalletConfig::default();
        config.keypool_size = 3;
        let wallet = Wallet::create_new(
            "test",
            Network::Testnet,
            config,
            Box::new(MemoryStorage::new()),
            Arc::clone(&chain) as Arc<dyn crate::chain::ChainAccess>,
        )
        .unwrap();
        (wallet, chain)
    }

    fn own_script(wallet: &mut Wallet) -> ScriptBuf {
        let pubkey = wallet.get_key_from_pool(false).unwrap();
        Address::p2pkh(&pubkey, Network::Testnet).script_pubkey()
    }

    #[test]
    fn test_irrelevant_tx_ignored() {
        let (mut wallet, _) = wallet_with_chain();
        let foreign = dummy_transaction_paying(1, &[(1000, ScriptBuf::new())]);
        assert!(!wallet.add_to_wallet_if_involving_me(&foreign, None, true));
        assert_eq!(wallet.store().len(), 0);
    }

    #[test]
    fn test_rescan_is_idempotent_without_update() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let tx = dummy_transaction_paying(1, &[(10_000, script)]);
        let block = chain.push_block(vec![tx], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);
        let order_pos_before = wallet.store().next_order_pos();

        let mut reserver = RescanReserver::new(wallet.scan_state());
        reserver.reserve().unwrap();
        wallet.rescan_blocks(0, None, &reserver, false).unwrap();
        // Nothing changed on the second pass.
        assert_eq!(wallet.store().next_order_pos(), order_pos_before);
        assert_eq!(wallet.store().len(), 1);
    }

    #[test]
    fn test_rescan_finds_missed_transactions() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        // The block lands while the wallet is not watching.
        let tx = dummy_transaction_paying(1, &[(10_000, script)]);
        let txid = tx.txid();
        chain.push_block(vec![tx], 0);
        assert!(!wallet.store().contains(&txid));

        let mut reserver = RescanReserver::new(wallet.scan_state());
        reserver.reserve().unwrap();
        let stop = wallet.rescan_blocks(0, None, &reserver, false).unwrap();
        assert_eq!(stop, chain.tip_height());
        assert!(wallet.store().contains(&txid));
        assert_eq!(wallet.depth(&txid), 1);
    }

    #[test]
    fn test_rescan_abort() {
        let (mut wallet, chain) = wallet_with_chain();
        let _ = chain;
        wallet.scan_state().abort_rescan();
        let mut reserver = RescanReserver::new(wallet.scan_state());
        reserver.reserve().unwrap();
        // clear_abort runs at entry, so this must complete.
        assert!(wallet.rescan_blocks(0, None, &reserver, false).is_ok());
    }

    #[test]
    fn test_reorg_depth_cycle() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let tx = dummy_transaction_paying(1, &[(10_000, script)]);
        let txid = tx.txid();

        let block = chain.push_block(vec![tx.clone()], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);
        assert_eq!(wallet.depth(&txid), 1);

        // Disconnect: back to unconfirmed.
        chain.pop_block();
        wallet.block_disconnected(&block);
        assert_eq!(wallet.depth(&txid), 0);

        // A sibling block confirms it again.
        let sibling = chain.push_block(vec![tx], 1_700_000_123);
        wallet.block_connected(&sibling, chain.tip_height(), &[]);
        assert_eq!(wallet.depth(&txid), 1);
    }

    #[test]
    fn test_conflict_marking() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let funding = dummy_transaction_paying(1, &[(50_000, script.clone())]);
        let block = chain.push_block(vec![funding.clone()], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        // Our pending spend sits in the mempool.
        let pending = spending_transaction_paying(&funding, 0, &[(40_000, script.clone())]);
        let pending_txid = pending.txid();
        chain.add_mempool_tx(pending_txid);
        wallet.transaction_added_to_mempool(&pending);
        assert_eq!(wallet.depth(&pending_txid), 0);

        // A double spend of the same outpoint confirms instead.
        let winner = spending_transaction_paying(&funding, 0, &[(39_000, script)]);
        let winner_txid = winner.txid();
        let block = chain.push_block(vec![winner.clone()], 0);
        wallet.block_connected(&block, chain.tip_height(), &[pending.clone()]);

        assert_eq!(wallet.depth(&winner_txid), 1);
        assert!(wallet.depth(&pending_txid) < 0);
        assert!(wallet.get_conflicts(&pending_txid).contains(&winner_txid));
    }

    #[test]
    fn test_abandon_and_respend() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let funding = dummy_transaction_paying(1, &[(50_000, script.clone())]);
        let funding_txid = funding.txid();
        let block = chain.push_block(vec![funding.clone()], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        let pending = spending_transaction(&funding, 0, &[40_000]);
        let pending_txid = pending.txid();
        wallet.add_to_wallet_if_involving_me(&pending, None, true);

        let outpoint = dashcore::OutPoint {
            txid: funding_txid,
            vout: 0,
        };
        assert!(wallet.is_spent(&outpoint));

        // Not in the mempool, unconfirmed: abandonable.
        assert!(wallet.transaction_can_be_abandoned(&pending_txid));
        wallet.abandon_transaction(&pending_txid).unwrap();
        assert_eq!(wallet.depth(&pending_txid), -1);
        // Inputs are released for new spends.
        assert!(!wallet.is_spent(&outpoint));

        // Re-mined later: the abandon flag clears and it confirms.
        let block = chain.push_block(vec![pending], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);
        assert_eq!(wallet.depth(&pending_txid), 1);
        assert!(wallet.is_spent(&outpoint));
    }

    #[test]
    fn test_abandon_rejects_confirmed() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let tx = dummy_transaction_paying(1, &[(10_000, script)]);
        let txid = tx.txid();
        let block = chain.push_block(vec![tx], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        assert!(!wallet.transaction_can_be_abandoned(&txid));
        assert!(wallet.abandon_transaction(&txid).is_err());
    }

    #[test]
    fn test_resend_policy() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let funding = dummy_transaction_paying(1, &[(50_000, script)]);
        let block = chain.push_block(vec![funding.clone()], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        let pending = spending_transaction(&funding, 0, &[40_000]);
        let pending_txid = pending.txid();
        wallet.add_to_wallet_if_involving_me(&pending, None, true);
        if let Some(wtx) = wallet.store.get_mut(&pending_txid) {
            wtx.time_received = 1000;
        }

        // Old enough and unconfirmed: gets relayed.
        let relayed = wallet.resend_wallet_transactions_before(2000);
        assert_eq!(relayed, vec![pending_txid]);
        assert!(chain.relayed().contains(&pending_txid));

        // The first timed pass only schedules the next one.
        assert!(wallet.resend_wallet_transactions(10_000, 9_000).is_empty());
        assert!(wallet.next_resend > 0);
    }

    #[test]
    fn test_time_smart_uses_block_time_when_older() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let tx = dummy_transaction_paying(1, &[(10_000, script)]);
        let txid = tx.txid();
        let block_time = 1_600_000_000;
        let block = chain.push_block(vec![tx], block_time);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        // Received "now", mined with an old timestamp: smart time clamps
        // to the block time.
        let wtx = wallet.store().get(&txid).unwrap();
        assert_eq!(wtx.time_smart, block_time as u64);
    }
}
