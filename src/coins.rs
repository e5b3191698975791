//! Spendable-output enumeration types.
//!
//! `Wallet::available_coins` walks the transaction store and yields
//! [`Output`]s matching an [`AvailableCoinsFilter`]; manual input choices
//! and change overrides ride along in a [`CoinControl`].

use std::collections::BTreeSet;

use dashcore::{Address, OutPoint, TxOut};

use crate::denominations::MAX_MONEY;
use crate::fee::FeeRate;

/// Which category of coins an enumeration should yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoinType {
    #[default]
    All,
    /// Outputs whose amount is on the denomination ladder.
    OnlyDenominated,
    /// Everything except denominated outputs and masternode collaterals.
    OnlyNonDenominated,
    /// Exactly the masternode collateral amount (1000), including
    /// locked coins; used to fund masternodes.
    OnlyMasternodeCollateral,
    /// Amounts acceptable as mixing collateral.
    OnlyMixingCollateral,
}

/// Caller overrides for coin selection and change handling.
#[derive(Debug, Clone, Default)]
pub struct CoinControl {
    /// Outpoints that must be part of the selection.
    selected: BTreeSet<OutPoint>,
    /// Whether inputs beyond `selected` may be added.
    pub allow_other_inputs: bool,
    /// Whether watch-only (unsignable) outputs may be considered.
    pub allow_watch_only: bool,
    /// Send change here instead of reserving a fresh change key.
    pub change_address: Option<Address>,
    /// Fixed change output position; random when unset.
    pub change_position: Option<usize>,
    /// Keep inputs in selection order instead of sorting them.
    pub preserve_order: bool,
    /// Manual fee rate overriding the estimator.
    pub fee_rate: Option<FeeRate>,
    /// Confirmation target overriding the wallet default.
    pub confirm_target: Option<u32>,
    /// Override for the wallet's RBF signaling default.
    pub signal_rbf: Option<bool>,
    /// Minimum depth of considered outputs.
    pub min_depth: i32,
}

impl CoinControl {
    pub fn select(&mut self, outpoint: OutPoint) {
        self.selected.insert(outpoint);
    }

    pub fn unselect(&mut self, outpoint: &OutPoint) {
        self.selected.remove(outpoint);
    }

    pub fn is_selected(&self, outpoint: &OutPoint) -> bool {
        self.selected.contains(outpoint)
    }

    pub fn has_selected(&self) -> bool {
        !self.selected.is_empty()
    }

    pub fn selected(&self) -> impl Iterator<Item = &OutPoint> {
        self.selected.iter()
    }
}

/// Filter for `Wallet::available_coins`.
#[derive(Debug, Clone)]
pub struct AvailableCoinsFilter {
    /// Exclude unconfirmed outputs that did not originate from this
    /// wallet, and unconfirmed replacements.
    pub only_safe: bool,
    pub coin_type: CoinType,
    pub min_amount: u64,
    pub max_amount: u64,
    /// Stop enumerating once this much value was collected; `MAX_MONEY`
    /// disables the bound.
    pub min_sum: u64,
    /// Stop after this many outputs; 0 disables the bound.
    pub max_count: usize,
    pub min_depth: i32,
    pub max_depth: i32,
}

impl Default for AvailableCoinsFilter {
    fn default() -> Self {
        Self {
            only_safe: true,
            coin_type: CoinType::All,
            min_amount: 1,
            max_amount: MAX_MONEY,
            min_sum: MAX_MONEY,
            max_count: 0,
            min_depth: 0,
            max_depth: 9_999_999,
        }
    }
}

/// One spendable (or watchable) output of a wallet transaction.
#[derive(Debug, Clone)]
pub struct Output {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    /// Confirmations; 0 = unconfirmed, negative = conflicted.
    pub depth: i32,
    /// We hold the private keys to spend it.
    pub spendable: bool,
    /// We understand the scripts involved even without the keys.
    pub solvable: bool,
    /// Safe to fund new transactions with (see `only_safe`).
    pub safe: bool,
    /// Worst-case size of this output as a signed input; `None` when it
    /// cannot be signed by us.
    pub input_bytes: Option<usize>,
}

impl Output {
    pub fn value(&self) -> u64 {
        self.txout.value
    }
}

/// Available coins and their total grouped by destination; used by the
/// mixing subsystem to pick whole addresses at a time.
#[derive(Debug, Clone)]
pub struct CompactTallyItem {
    pub address: Address,
    pub amount: u64,
    pub outpoints: Vec<OutPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcore::hashes::{sha256d, Hash};
    use dashcore::Txid;

    #[test]
    fn test_coin_control_selection() {
        let mut cc = CoinControl::default();
        let outpoint = OutPoint {
            txid: Txid::from_raw_hash(sha256d::Hash::from_byte_array([1u8; 32])),
            vout: 0,
        };
        assert!(!cc.has_selected());
        cc.select(outpoint);
        assert!(cc.is_selected(&outpoint));
        cc.unselect(&outpoint);
        assert!(!cc.has_selected());
    }

    #[test]
    fn test_filter_defaults() {
        let filter = AvailableCoinsFilter::default();
        assert!(filter.only_safe);
        assert_eq!(filter.coin_type, CoinType::All);
        assert_eq!(filter.min_amount, 1);
        assert_eq!(filter.max_count, 0);
    }
}
