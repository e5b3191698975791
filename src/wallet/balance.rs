//! Credit/debit computation and wallet balances.
//!
//! Per-transaction amounts are cached in each [`WalletTx`]'s cache cells;
//! a cell holds exactly the value a recomputation would produce and is
//! cleared whenever anything that feeds it changes.

use dashcore::{OutPoint, Transaction, TxIn, TxOut, Txid};

use crate::denominations::{is_denominated_amount, DEFAULT_MAX_ROUNDS};
use crate::keystore::IsMine;
use crate::wallet_tx::WalletTx;

use super::Wallet;

/// Which ownership classes count toward an amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsMineFilter {
    pub spendable: bool,
    pub watch_only: bool,
}

impl IsMineFilter {
    pub const SPENDABLE: Self = Self {
        spendable: true,
        watch_only: false,
    };
    pub const WATCH_ONLY: Self = Self {
        spendable: false,
        watch_only: true,
    };
    pub const ALL: Self = Self {
        spendable: true,
        watch_only: true,
    };

    pub fn matches(&self, is_mine: IsMine) -> bool {
        match is_mine {
            IsMine::No => false,
            IsMine::WatchOnly => self.watch_only,
            IsMine::Spendable => self.spendable,
        }
    }
}

/// Number of confirmations a coinbase needs before its outputs spend.
pub const COINBASE_MATURITY: i32 = 100;

impl Wallet {
    // --- ownership --------------------------------------------------------

    pub fn is_mine_output(&self, txout: &TxOut) -> IsMine {
        self.keystore.is_mine(&txout.script_pubkey)
    }

    /// Ownership of the output an input spends; `No` when the parent is
    /// not a wallet transaction.
    pub fn is_mine_input(&self, txin: &TxIn) -> IsMine {
        match self.store.get(&txin.previous_output.txid) {
            Some(prev) => match prev.tx.output.get(txin.previous_output.vout as usize) {
                Some(txout) => self.is_mine_output(txout),
                None => IsMine::No,
            },
            None => IsMine::No,
        }
    }

    /// Whether any output of `tx` pays the wallet.
    pub fn tx_is_mine(&self, tx: &Transaction) -> bool {
        tx.output.iter().any(|o| self.is_mine_output(o) != IsMine::No)
    }

    /// Value an input takes from the wallet (0 if not ours).
    pub fn input_debit(&self, txin: &TxIn, filter: IsMineFilter) -> u64 {
        match self.store.get(&txin.previous_output.txid) {
            Some(prev) => match prev.tx.output.get(txin.previous_output.vout as usize) {
                Some(txout) if filter.matches(self.is_mine_output(txout)) => txout.value,
                _ => 0,
            },
            None => 0,
        }
    }

    pub fn output_credit(&self, txout: &TxOut, filter: IsMineFilter) -> u64 {
        if filter.matches(self.is_mine_output(txout)) {
            txout.value
        } else {
            0
        }
    }

    fn raw_debit(&self, tx: &Transaction, filter: IsMineFilter) -> u64 {
        tx.input.iter().map(|i| self.input_debit(i, filter)).sum()
    }

    fn raw_credit(&self, tx: &Transaction, filter: IsMineFilter) -> u64 {
        tx.output.iter().map(|o| self.output_credit(o, filter)).sum()
    }

    /// Whether every input of `tx` is ours under `filter`.
    pub fn tx_is_all_from_me(&self, tx: &Transaction, filter: IsMineFilter) -> bool {
        tx.input.iter().all(|i| filter.matches(self.is_mine_input(i)))
    }

    /// Whether the wallet funded `tx` (any debit).
    pub fn tx_is_from_me(&self, tx: &Transaction) -> bool {
        self.raw_debit(tx, IsMineFilter::ALL) > 0
    }

    /// An output is change when the script is ours but the destination
    /// was never entered into the address book.
    pub fn output_is_change(&self, txout: &TxOut) -> bool {
        if self.is_mine_output(txout) != IsMine::Spendable {
            return false;
        }
        match dashcore::Address::from_script(&txout.script_pubkey, self.network()) {
            Ok(address) => !self.address_book().contains_key(&address),
            Err(_) => true,
        }
    }

    // --- cached per-transaction amounts ----------------------------------

    pub fn tx_debit(&mut self, txid: &Txid, filter: IsMineFilter) -> u64 {
        let mut total = 0;
        if filter.spendable {
            total += self.cached_amount(
                txid,
                |wtx| wtx.cache.debit,
                |wallet, tx| wallet.raw_debit(tx, IsMineFilter::SPENDABLE),
                |wtx, v| wtx.cache.debit = Some(v),
            );
        }
        if filter.watch_only {
            total += self.cached_amount(
                txid,
                |wtx| wtx.cache.watch_debit,
                |wallet, tx| wallet.raw_debit(tx, IsMineFilter::WATCH_ONLY),
                |wtx, v| wtx.cache.watch_debit = Some(v),
            );
        }
        total
    }

    pub fn tx_credit(&mut self, txid: &Txid, filter: IsMineFilter) -> u64 {
        let mut total = 0;
        if filter.spendable {
            total += self.cached_amount(
                txid,
                |wtx| wtx.cache.credit,
                |wallet, tx| wallet.raw_credit(tx, IsMineFilter::SPENDABLE),
                |wtx, v| wtx.cache.credit = Some(v),
            );
        }
        if filter.watch_only {
            total += self.cached_amount(
                txid,
                |wtx| wtx.cache.watch_credit,
                |wallet, tx| wallet.raw_credit(tx, IsMineFilter::WATCH_ONLY),
                |wtx, v| wtx.cache.watch_credit = Some(v),
            );
        }
        total
    }

    pub fn tx_change(&mut self, txid: &Txid) -> u64 {
        self.cached_amount(
            txid,
            |wtx| wtx.cache.change,
            |wallet, tx| {
                tx.output
                    .iter()
                    .filter(|o| wallet.output_is_change(o))
                    .map(|o| o.value)
                    .sum()
            },
            |wtx, v| wtx.cache.change = Some(v),
        )
    }

    /// Credit from outputs not yet seen spent, zero while immature.
    pub fn tx_available_credit(&mut self, txid: &Txid, filter: IsMineFilter) -> u64 {
        if self.blocks_to_maturity(txid) > 0 {
            return 0;
        }
        // Two cells exist (spendable / watch-only); combined filters sum
        // both halves.
        let mut total = 0;
        if filter.spendable {
            total += self.available_credit_half(txid, IsMineFilter::SPENDABLE);
        }
        if filter.watch_only {
            total += self.available_credit_half(txid, IsMineFilter::WATCH_ONLY);
        }
        total
    }

    fn available_credit_half(&mut self, txid: &Txid, half: IsMineFilter) -> u64 {
        let read = |wtx: &WalletTx| {
            if half.spendable {
                wtx.cache.available_credit
            } else {
                wtx.cache.available_watch_credit
            }
        };
        if let Some(cached) = self.store.get(txid).and_then(read) {
            return cached;
        }

        let Some(tx) = self.store.get(txid).map(|w| w.tx.clone()) else {
            return 0;
        };
        let mut credit = 0;
        for (vout, txout) in tx.output.iter().enumerate() {
            let outpoint = OutPoint {
                txid: *txid,
                vout: vout as u32,
            };
            if !self.is_spent(&outpoint) {
                credit += self.output_credit(txout, half);
            }
        }
        if let Some(wtx) = self.store.get_mut(txid) {
            if half.spendable {
                wtx.cache.available_credit = Some(credit);
            } else {
                wtx.cache.available_watch_credit = Some(credit);
            }
        }
        credit
    }

    /// Credit still locked up in coinbase maturity.
    pub fn tx_immature_credit(&mut self, txid: &Txid, filter: IsMineFilter) -> u64 {
        if self.blocks_to_maturity(txid) == 0 {
            return 0;
        }
        let mut total = 0;
        if filter.spendable {
            total += self.cached_amount(
                txid,
                |wtx| wtx.cache.immature_credit,
                |wallet, tx| wallet.raw_credit(tx, IsMineFilter::SPENDABLE),
                |wtx, v| wtx.cache.immature_credit = Some(v),
            );
        }
        if filter.watch_only {
            // Never pre-populated anywhere upstream; recomputed on
            // demand and cached like the others.
            total += self.cached_amount(
                txid,
                |wtx| wtx.cache.immature_watch_credit,
                |wallet, tx| wallet.raw_credit(tx, IsMineFilter::WATCH_ONLY),
                |wtx, v| wtx.cache.immature_watch_credit = Some(v),
            );
        }
        total
    }

    /// Credit from unspent denominated outputs that reached the
    /// configured number of mixing rounds.
    pub fn tx_anonymized_credit(&mut self, txid: &Txid) -> u64 {
        if let Some(cached) = self.store.get(txid).and_then(|w| w.cache.anonymized_credit) {
            return cached;
        }
        if self.depth(txid) < 0 {
            return 0;
        }

        let Some(tx) = self.store.get(txid).map(|w| w.tx.clone()) else {
            return 0;
        };
        let target_rounds = self.config.mixing_rounds;
        let mut credit = 0;
        for (vout, txout) in tx.output.iter().enumerate() {
            let outpoint = OutPoint {
                txid: *txid,
                vout: vout as u32,
            };
            if !is_denominated_amount(txout.value) || self.is_spent(&outpoint) {
                continue;
            }
            if self.outpoint_rounds(&outpoint) >= target_rounds {
                credit += self.output_credit(txout, IsMineFilter::SPENDABLE);
            }
        }
        if let Some(wtx) = self.store.get_mut(txid) {
            wtx.cache.anonymized_credit = Some(credit);
        }
        credit
    }

    /// Credit from unspent denominated outputs, split by confirmation.
    pub fn tx_denominated_credit(&mut self, txid: &Txid, unconfirmed: bool) -> u64 {
        let depth = self.depth(txid);
        if depth < 0 || unconfirmed != (depth == 0) {
            return 0;
        }
        let read = |wtx: &WalletTx| {
            if unconfirmed {
                wtx.cache.denom_unconf_credit
            } else {
                wtx.cache.denom_conf_credit
            }
        };
        if let Some(cached) = self.store.get(txid).and_then(read) {
            return cached;
        }

        let Some(tx) = self.store.get(txid).map(|w| w.tx.clone()) else {
            return 0;
        };
        let mut credit = 0;
        for (vout, txout) in tx.output.iter().enumerate() {
            let outpoint = OutPoint {
                txid: *txid,
                vout: vout as u32,
            };
            if is_denominated_amount(txout.value) && !self.is_spent(&outpoint) {
                credit += self.output_credit(txout, IsMineFilter::SPENDABLE);
            }
        }
        if let Some(wtx) = self.store.get_mut(txid) {
            if unconfirmed {
                wtx.cache.denom_unconf_credit = Some(credit);
            } else {
                wtx.cache.denom_conf_credit = Some(credit);
            }
        }
        credit
    }

    fn cached_amount(
        &mut self,
        txid: &Txid,
        read: impl Fn(&WalletTx) -> Option<u64>,
        compute: impl Fn(&Self, &Transaction) -> u64,
        write: impl Fn(&mut WalletTx, u64),
    ) -> u64 {
        if let Some(cached) = self.store.get(txid).and_then(&read) {
            return cached;
        }
        let Some(tx) = self.store.get(txid).map(|w| w.tx.clone()) else {
            return 0;
        };
        let value = compute(self, &tx);
        if let Some(wtx) = self.store.get_mut(txid) {
            write(wtx, value);
        }
        value
    }

    /// Clear every cached amount in the wallet.
    pub fn mark_dirty(&mut self) {
        self.store.mark_dirty_all();
        self.rounds_cache.clear();
    }

    // --- trust ------------------------------------------------------------

    /// A transaction is trusted when confirmed, or when it is our own
    /// pending spend built purely from our own coins.
    pub fn tx_is_trusted(&mut self, txid: &Txid) -> bool {
        let depth = self.depth(txid);
        if depth >= 1 {
            return true;
        }
        if depth < 0 {
            return false;
        }
        if !self.config.spend_zero_conf_change {
            return false;
        }
        let Some(wtx) = self.store.get(txid) else {
            return false;
        };
        if wtx.is_abandoned() {
            return false;
        }
        let tx = wtx.tx.clone();
        if !self.tx_is_from_me(&tx) {
            return false;
        }
        if !self.chain.mempool_contains(txid) {
            return false;
        }
        // Every input must be an output we could spend ourselves.
        self.tx_is_all_from_me(&tx, IsMineFilter::SPENDABLE)
    }

    // --- wallet-wide balances --------------------------------------------

    pub fn balance(&mut self) -> u64 {
        let txids = self.store.txids();
        let mut total = 0;
        for txid in txids {
            if self.tx_is_trusted(&txid) {
                total += self.tx_available_credit(&txid, IsMineFilter::SPENDABLE);
            }
        }
        total
    }

    pub fn unconfirmed_balance(&mut self) -> u64 {
        let txids = self.store.txids();
        let mut total = 0;
        for txid in txids {
            if !self.tx_is_trusted(&txid)
                && self.depth(&txid) == 0
                && self.chain.mempool_contains(&txid)
            {
                total += self.tx_available_credit(&txid, IsMineFilter::SPENDABLE);
            }
        }
        total
    }

    pub fn immature_balance(&mut self) -> u64 {
        let txids = self.store.txids();
        let mut total = 0;
        for txid in txids {
            total += self.tx_immature_credit(&txid, IsMineFilter::SPENDABLE);
        }
        total
    }

    pub fn watch_only_balance(&mut self) -> u64 {
        let txids = self.store.txids();
        let mut total = 0;
        for txid in txids {
            if self.tx_is_trusted(&txid) {
                total += self.tx_available_credit(&txid, IsMineFilter::WATCH_ONLY);
            }
        }
        total
    }

    pub fn unconfirmed_watch_only_balance(&mut self) -> u64 {
        let txids = self.store.txids();
        let mut total = 0;
        for txid in txids {
            if !self.tx_is_trusted(&txid)
                && self.depth(&txid) == 0
                && self.chain.mempool_contains(&txid)
            {
                total += self.tx_available_credit(&txid, IsMineFilter::WATCH_ONLY);
            }
        }
        total
    }

    pub fn immature_watch_only_balance(&mut self) -> u64 {
        let txids = self.store.txids();
        let mut total = 0;
        for txid in txids {
            total += self.tx_immature_credit(&txid, IsMineFilter::WATCH_ONLY);
        }
        total
    }

    pub fn anonymized_balance(&mut self) -> u64 {
        let txids = self.store.txids();
        let mut total = 0;
        for txid in txids {
            if self.tx_is_trusted(&txid) {
                total += self.tx_anonymized_credit(&txid);
            }
        }
        total
    }

    pub fn denominated_balance(&mut self, unconfirmed: bool) -> u64 {
        let txids = self.store.txids();
        let mut total = 0;
        for txid in txids {
            total += self.tx_denominated_credit(&txid, unconfirmed);
        }
        total
    }

    /// Mean mixing-round depth over unspent denominated outputs, weighted
    /// by value.
    pub fn average_anonymized_rounds(&mut self) -> f64 {
        let txids = self.store.txids();
        let mut weighted = 0u64;
        let mut total = 0u64;
        for txid in txids {
            let Some(tx) = self.store.get(&txid).map(|w| w.tx.clone()) else {
                continue;
            };
            for (vout, txout) in tx.output.iter().enumerate() {
                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };
                if !is_denominated_amount(txout.value) || self.is_spent(&outpoint) {
                    continue;
                }
                if self.is_mine_output(txout) != IsMine::Spendable {
                    continue;
                }
                weighted += txout.value * self.outpoint_rounds(&outpoint).max(0) as u64;
                total += txout.value;
            }
        }
        if total == 0 {
            0.0
        } else {
            weighted as f64 / total as f64
        }
    }

    // --- mixing rounds ----------------------------------------------------

    /// Whether an outpoint is an unspent wallet output with a
    /// denomination amount.
    pub fn is_denominated(&self, outpoint: &OutPoint) -> bool {
        self.store
            .get(&outpoint.txid)
            .and_then(|w| w.tx.output.get(outpoint.vout as usize))
            .map(|o| is_denominated_amount(o.value))
            .unwrap_or(false)
    }

    /// Mixing-round depth of an outpoint, capped by the recursion bound.
    pub fn outpoint_rounds(&mut self, outpoint: &OutPoint) -> i32 {
        self.real_outpoint_rounds(outpoint, 0)
    }

    fn real_outpoint_rounds(&mut self, outpoint: &OutPoint, depth: i32) -> i32 {
        if depth >= DEFAULT_MAX_ROUNDS {
            return DEFAULT_MAX_ROUNDS;
        }
        if let Some(cached) = self.rounds_cache.get(outpoint) {
            return *cached;
        }

        let rounds = self.compute_outpoint_rounds(outpoint, depth);
        self.rounds_cache.insert(*outpoint, rounds);
        rounds
    }

    fn compute_outpoint_rounds(&mut self, outpoint: &OutPoint, depth: i32) -> i32 {
        let Some(wtx) = self.store.get(&outpoint.txid) else {
            return 0;
        };
        let Some(txout) = wtx.tx.output.get(outpoint.vout as usize) else {
            return 0;
        };
        if !is_denominated_amount(txout.value) {
            return 0;
        }
        if self.is_mine_output(txout) != IsMine::Spendable {
            return 0;
        }

        // A transaction counts as a mixing round only when every output
        // is a denomination and every input is a wallet-owned
        // denomination; anything else starts the chain at zero.
        let tx = wtx.tx.clone();
        if !tx.output.iter().all(|o| is_denominated_amount(o.value)) {
            return 0;
        }

        let mut input_outpoints = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let Some(prev) = self.store.get(&input.previous_output.txid) else {
                return 0;
            };
            let Some(prev_out) = prev.tx.output.get(input.previous_output.vout as usize)
            else {
                return 0;
            };
            if !is_denominated_amount(prev_out.value) {
                return 0;
            }
            if self.is_mine_output(prev_out) != IsMine::Spendable {
                return 0;
            }
            input_outpoints.push(input.previous_output);
        }

        let mut min_rounds = i32::MAX;
        for input_outpoint in input_outpoints {
            let rounds = self.real_outpoint_rounds(&input_outpoint, depth + 1);
            min_rounds = min_rounds.min(rounds);
        }
        if min_rounds == i32::MAX {
            // No inputs at all (coinbase); not a mixing round.
            return 0;
        }
        (min_rounds + 1).min(DEFAULT_MAX_ROUNDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denominations::STANDARD_DENOMINATIONS;
    use crate::storage::memory::MemoryStorage;
    use crate::test_utils::{dummy_transaction_paying, spending_transaction_paying, MockChain};
    use crate::wallet::config::WalletConfig;
    use crate::wallet::Wallet;
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
    fn test_credit_and_cache_validity() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let tx = dummy_transaction_paying(1, &[(50_000, script)]);
        let txid = tx.txid();
        let block = chain.push_block(vec![tx.clone()], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        let credit = wallet.tx_credit(&txid, IsMineFilter::SPENDABLE);
        assert_eq!(credit, 50_000);
        // Cache now holds exactly the recomputed value.
        assert_eq!(
            wallet.store().get(&txid).unwrap().cache.credit,
            Some(50_000)
        );
        wallet.mark_dirty();
        assert_eq!(wallet.store().get(&txid).unwrap().cache.credit, None);
        assert_eq!(wallet.tx_credit(&txid, IsMineFilter::SPENDABLE), 50_000);
    }

    #[test]
    fn test_balance_counts_trusted_only() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let confirmed = dummy_transaction_paying(1, &[(70_000, script.clone())]);
        let block = chain.push_block(vec![confirmed.clone()], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        // A foreign unconfirmed payment is not trusted.
        let unconfirmed = dummy_transaction_paying(2, &[(30_000, script)]);
        chain.add_mempool_tx(unconfirmed.txid());
        wallet.transaction_added_to_mempool(&unconfirmed);

        assert_eq!(wallet.balance(), 70_000);
        assert_eq!(wallet.unconfirmed_balance(), 30_000);
    }

    #[test]
    fn test_watch_only_credit() {
        let (mut wallet, chain) = wallet_with_chain();
        let foreign = crate::keystore::KeyStore::new().generate_key_pair().pubkey;
        let script = Address::p2pkh(&foreign, Network::Testnet).script_pubkey();
        wallet.add_watch_only(script.clone(), 0).unwrap();

        let tx = dummy_transaction_paying(1, &[(40_000, script)]);
        let txid = tx.txid();
        let block = chain.push_block(vec![tx], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        assert_eq!(wallet.tx_credit(&txid, IsMineFilter::WATCH_ONLY), 40_000);
        assert_eq!(wallet.tx_credit(&txid, IsMineFilter::SPENDABLE), 0);
        assert_eq!(wallet.watch_only_balance(), 40_000);
    }

    #[test]
    fn test_mixing_rounds_recursion() {
        let (mut wallet, chain) = wallet_with_chain();
        let denom = STANDARD_DENOMINATIONS[1];
        let script_a = own_script(&mut wallet);
        let script_b = own_script(&mut wallet);
        let script_c = own_script(&mut wallet);

        // Denomination created from a non-denominated input: rounds 0.
        let base = dummy_transaction_paying(1, &[(denom, script_a)]);
        // One mixing hop: all inputs and outputs denominated.
        let mix1 = spending_transaction_paying(&base, 0, &[(denom, script_b)]);
        // Second hop.
        let mix2 = spending_transaction_paying(&mix1, 0, &[(denom, script_c)]);

        let block = chain.push_block(vec![base.clone(), mix1.clone(), mix2.clone()], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        let rounds = |wallet: &mut Wallet, tx: &dashcore::Transaction| {
            let outpoint = OutPoint {
                txid: tx.txid(),
                vout: 0,
            };
            wallet.outpoint_rounds(&outpoint)
        };
        assert_eq!(rounds(&mut wallet, &base), 0);
        assert_eq!(rounds(&mut wallet, &mix1), 1);
        assert_eq!(rounds(&mut wallet, &mix2), 2);
    }

    #[test]
    fn test_denominated_credit() {
        let (mut wallet, chain) = wallet_with_chain();
        let denom = STANDARD_DENOMINATIONS[2];
        let script = own_script(&mut wallet);
        let tx = dummy_transaction_paying(1, &[(denom, script)]);
        let txid = tx.txid();
        let block = chain.push_block(vec![tx], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        assert_eq!(wallet.tx_denominated_credit(&txid, false), denom);
        assert_eq!(wallet.tx_denominated_credit(&txid, true), 0);
        assert_eq!(wallet.denominated_balance(false), denom);
    }
}
