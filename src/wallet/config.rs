//! Wallet configuration.

use serde::{Deserialize, Serialize};

use crate::denominations::COIN;
use crate::fee::FeeRate;

/// Tunables for keypool sizing, fees and transaction policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Target number of pre-generated keys per lane.
    pub keypool_size: usize,
    /// Fee rate applied when the estimator has no answer and fallback is
    /// allowed.
    pub fallback_fee: FeeRate,
    /// Whether the fallback fee may be used at all.
    pub allow_fallback_fee: bool,
    /// Change below this rate's dust bound is discarded as extra fee.
    pub discard_rate: FeeRate,
    /// Lower bound applied to every computed fee.
    pub min_tx_fee: FeeRate,
    /// Absolute ceiling on a single transaction's fee.
    pub max_tx_fee: u64,
    /// Confirmation target handed to the fee estimator.
    pub tx_confirm_target: u32,
    /// Whether unconfirmed change may fund new transactions.
    pub spend_zero_conf_change: bool,
    /// Signal BIP125 replaceability on created transactions.
    pub wallet_rbf: bool,
    /// Refuse to build on long chains of unconfirmed ancestors.
    pub reject_long_chains: bool,
    /// Ancestor-chain bound applied when `reject_long_chains` is set.
    pub max_ancestors: u64,
    /// Mixing rounds an output needs before counting as anonymized.
    pub mixing_rounds: i32,
    /// Trigger an automatic backup when fewer keys than this remain
    /// since the last one; 0 disables.
    pub auto_backup_threshold: i64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            keypool_size: 1000,
            fallback_fee: FeeRate::per_kb(20_000),
            allow_fallback_fee: true,
            discard_rate: FeeRate::per_kb(10_000),
            min_tx_fee: FeeRate::per_kb(1_000),
            max_tx_fee: COIN / 10,
            tx_confirm_target: 6,
            spend_zero_conf_change: true,
            wallet_rbf: false,
            reject_long_chains: false,
            max_ancestors: 25,
            mixing_rounds: 4,
            auto_backup_threshold: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy() {
        let config = WalletConfig::default();
        assert_eq!(config.keypool_size, 1000);
        assert_eq!(config.fallback_fee, FeeRate::per_kb(20_000));
        assert_eq!(config.tx_confirm_target, 6);
        assert!(config.spend_zero_conf_change);
        assert!(!config.wallet_rbf);
    }
}
