//! In-memory ledger of wallet-relevant transactions.
//!
//! Holds the transaction map, the spend index used for double-spend
//! detection, the ordered display log, the legacy accounting entries and
//! the set of manually locked coins. Chain-dependent logic (depth,
//! conflict resolution, abandonment legality) lives on the wallet, which
//! owns both this store and the chain handle.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use dashcore::{OutPoint, Txid};

use crate::wallet_tx::WalletTx;

/// One entry of the ordered log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderedEntry {
    Tx(Txid),
    Accounting(u64),
}

/// Internal bookkeeping transfer between named accounts. Deprecated;
/// carried for on-disk compatibility only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingEntry {
    pub account: String,
    pub credit_debit: i64,
    pub time: u64,
    pub other_account: String,
    pub comment: String,
    pub map_value: BTreeMap<String, String>,
    pub order_pos: i64,
    pub entry_no: u64,
}

/// Transaction map, spend index and ordered log.
#[derive(Default)]
pub struct TxStore {
    txs: HashMap<Txid, WalletTx>,
    /// outpoint → txids of wallet transactions spending it. More than
    /// one spender means a conflict.
    spends: BTreeMap<OutPoint, BTreeSet<Txid>>,
    ordered: BTreeMap<i64, Vec<OrderedEntry>>,
    next_order_pos: i64,
    accounting: BTreeMap<u64, AccountingEntry>,
    accounting_entry_number: u64,
    locked_coins: BTreeSet<OutPoint>,
}

impl TxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, txid: &Txid) -> Option<&WalletTx> {
        self.txs.get(txid)
    }

    pub fn get_mut(&mut self, txid: &Txid) -> Option<&mut WalletTx> {
        self.txs.get_mut(txid)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Txid, &WalletTx)> {
        self.txs.iter()
    }

    pub fn txids(&self) -> Vec<Txid> {
        self.txs.keys().copied().collect()
    }

    pub fn next_order_pos(&self) -> i64 {
        self.next_order_pos
    }

    /// Allocate the next ordered-log position.
    pub fn inc_order_pos(&mut self) -> i64 {
        let pos = self.next_order_pos;
        self.next_order_pos += 1;
        pos
    }

    /// Raise the counter after loading entries from disk.
    pub fn observe_order_pos(&mut self, pos: i64) {
        if pos >= self.next_order_pos {
            self.next_order_pos = pos + 1;
        }
    }

    /// Insert a wallet transaction, assigning an order position if it has
    /// none, and index its inputs in the spend index.
    pub fn insert(&mut self, mut wtx: WalletTx) -> &mut WalletTx {
        let txid = wtx.txid();
        if wtx.order_pos < 0 {
            wtx.order_pos = self.inc_order_pos();
        } else {
            self.observe_order_pos(wtx.order_pos);
        }
        self.ordered.entry(wtx.order_pos).or_default().push(OrderedEntry::Tx(txid));

        for input in &wtx.tx.input {
            self.spends.entry(input.previous_output).or_default().insert(txid);
        }

        self.txs.insert(txid, wtx);
        self.mark_dirty_dependents(&txid);
        self.txs.get_mut(&txid).expect("just inserted")
    }

    /// Remove a transaction entirely (zap). Clears its spend-index
    /// entries and ordered-log reference.
    pub fn remove(&mut self, txid: &Txid) -> Option<WalletTx> {
        let wtx = self.txs.remove(txid)?;
        for input in &wtx.tx.input {
            if let Some(spenders) = self.spends.get_mut(&input.previous_output) {
                spenders.remove(txid);
                if spenders.is_empty() {
                    self.spends.remove(&input.previous_output);
                }
            }
        }
        if let Some(entries) = self.ordered.get_mut(&wtx.order_pos) {
            entries.retain(|e| e != &OrderedEntry::Tx(*txid));
            if entries.is_empty() {
                self.ordered.remove(&wtx.order_pos);
            }
        }
        Some(wtx)
    }

    /// Wallet txids spending `outpoint`.
    pub fn spenders(&self, outpoint: &OutPoint) -> impl Iterator<Item = &Txid> {
        self.spends.get(outpoint).into_iter().flatten()
    }

    /// Transactions spending any output of `txid` (one hop).
    pub fn has_wallet_spend(&self, txid: &Txid) -> bool {
        let range_start = OutPoint {
            txid: *txid,
            vout: 0,
        };
        self.spends
            .range(range_start..)
            .take_while(|(op, _)| op.txid == *txid)
            .any(|(_, spenders)| !spenders.is_empty())
    }

    /// All wallet transactions spending any output of `txid`.
    pub fn tx_spenders(&self, txid: &Txid) -> Vec<Txid> {
        let range_start = OutPoint {
            txid: *txid,
            vout: 0,
        };
        self.spends
            .range(range_start..)
            .take_while(|(op, _)| op.txid == *txid)
            .flat_map(|(_, spenders)| spenders.iter().copied())
            .collect()
    }

    /// Wallet transactions that conflict with `txid`: other spenders of
    /// any of its inputs.
    pub fn conflicts(&self, txid: &Txid) -> BTreeSet<Txid> {
        let mut result = BTreeSet::new();
        let Some(wtx) = self.txs.get(txid) else {
            return result;
        };
        for input in &wtx.tx.input {
            if let Some(spenders) = self.spends.get(&input.previous_output) {
                if spenders.len() > 1 {
                    result.extend(spenders.iter().filter(|t| *t != txid).copied());
                }
            }
        }
        result
    }

    /// Outpoints whose spend-index entry holds more than one txid.
    pub fn conflicted_outpoints(&self, txid: &Txid) -> Vec<OutPoint> {
        let Some(wtx) = self.txs.get(txid) else {
            return Vec::new();
        };
        wtx.tx
            .input
            .iter()
            .map(|i| i.previous_output)
            .filter(|op| self.spends.get(op).map(|s| s.len() > 1).unwrap_or(false))
            .collect()
    }

    /// Whether some live spender of `outpoint` exists, where `is_live`
    /// decides if a spender still counts (not abandoned or conflicted).
    pub fn is_spent_by(&self, outpoint: &OutPoint, is_live: impl Fn(&Txid) -> bool) -> bool {
        self.spenders(outpoint).any(is_live)
    }

    /// Clear every cached amount, store wide, plus the one-hop dependents
    /// rule is subsumed by clearing everything.
    pub fn mark_dirty_all(&mut self) {
        for wtx in self.txs.values_mut() {
            wtx.mark_dirty();
        }
    }

    /// Invalidate caches on every wallet tx spending an output of `txid`.
    /// Conservative one-hop invalidation; the tx itself is handled by the
    /// caller that mutated it.
    pub fn mark_dirty_dependents(&mut self, txid: &Txid) {
        let range_start = OutPoint {
            txid: *txid,
            vout: 0,
        };
        let dependents: Vec<Txid> = self
            .spends
            .range(range_start..)
            .take_while(|(op, _)| op.txid == *txid)
            .flat_map(|(_, spenders)| spenders.iter().copied())
            .collect();
        for dep in dependents {
            if let Some(wtx) = self.txs.get_mut(&dep) {
                wtx.mark_dirty();
            }
        }
    }

    /// Ordered-log iteration, oldest position first.
    pub fn ordered_entries(&self) -> impl Iterator<Item = (i64, &OrderedEntry)> {
        self.ordered.iter().flat_map(|(pos, entries)| entries.iter().map(move |e| (*pos, e)))
    }

    /// Rebuild order positions from scratch, sorted by transaction time.
    /// Used on load when stored positions are missing or collide.
    pub fn reorder_transactions(&mut self) {
        let mut items: Vec<(u64, OrderedEntry)> = Vec::new();
        for (txid, wtx) in &self.txs {
            items.push((wtx.tx_time(), OrderedEntry::Tx(*txid)));
        }
        for entry in self.accounting.values() {
            items.push((entry.time, OrderedEntry::Accounting(entry.entry_no)));
        }
        items.sort_by_key(|(time, _)| *time);

        self.ordered.clear();
        self.next_order_pos = 0;
        for (_, entry) in items {
            let pos = self.inc_order_pos();
            match &entry {
                OrderedEntry::Tx(txid) => {
                    if let Some(wtx) = self.txs.get_mut(txid) {
                        wtx.order_pos = pos;
                    }
                }
                OrderedEntry::Accounting(no) => {
                    if let Some(acc) = self.accounting.get_mut(no) {
                        acc.order_pos = pos;
                    }
                }
            }
            self.ordered.entry(pos).or_default().push(entry);
        }
    }

    /// Whether any stored order position collides or is unassigned.
    pub fn needs_reorder(&self) -> bool {
        self.ordered.values().any(|entries| entries.len() > 1)
            || self.txs.values().any(|wtx| wtx.order_pos < 0)
    }

    pub fn add_accounting(&mut self, mut entry: AccountingEntry) -> u64 {
        if entry.order_pos < 0 {
            entry.order_pos = self.inc_order_pos();
        } else {
            self.observe_order_pos(entry.order_pos);
        }
        self.accounting_entry_number = self.accounting_entry_number.max(entry.entry_no + 1);
        self.ordered
            .entry(entry.order_pos)
            .or_default()
            .push(OrderedEntry::Accounting(entry.entry_no));
        let no = entry.entry_no;
        self.accounting.insert(no, entry);
        no
    }

    pub fn next_accounting_entry_number(&self) -> u64 {
        self.accounting_entry_number
    }

    pub fn accounting_entries(&self) -> impl Iterator<Item = &AccountingEntry> {
        self.accounting.values()
    }

    // Manually locked coins, excluded from coin selection.

    pub fn lock_coin(&mut self, outpoint: OutPoint) {
        self.locked_coins.insert(outpoint);
    }

    pub fn unlock_coin(&mut self, outpoint: &OutPoint) {
        self.locked_coins.remove(outpoint);
    }

    pub fn unlock_all_coins(&mut self) {
        self.locked_coins.clear();
    }

    pub fn is_locked_coin(&self, outpoint: &OutPoint) -> bool {
        self.locked_coins.contains(outpoint)
    }

    pub fn locked_coins(&self) -> impl Iterator<Item = &OutPoint> {
        self.locked_coins.iter()
    }
}
