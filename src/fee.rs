//! Fee rates and transaction size estimation.

use serde::{Deserialize, Serialize};

/// Satoshis (duffs) per kilobyte fee rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(u64);

impl FeeRate {
    /// Create a fee rate from duffs per 1000 bytes.
    pub const fn per_kb(duffs_per_kb: u64) -> Self {
        Self(duffs_per_kb)
    }

    /// The underlying duffs-per-kB value.
    pub const fn as_per_kb(&self) -> u64 {
        self.0
    }

    /// Fee for a transaction of the given size, rounded up so a nonzero
    /// rate never produces a zero fee.
    pub fn fee_for_size(&self, size: usize) -> u64 {
        let fee = self.0.saturating_mul(size as u64) / 1000;
        if fee == 0 && self.0 > 0 {
            self.0
        } else {
            fee
        }
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// External fee estimator, implemented by the node's policy estimator.
pub trait FeeEstimator: Send + Sync {
    /// Estimated fee rate to confirm within `conf_target` blocks, if the
    /// estimator has enough data.
    fn estimate_smart_fee(&self, conf_target: u32) -> Option<FeeRate>;
}

/// Size in bytes of a fully signed P2PKH input
/// (outpoint 36 + script len 1 + sig ~72 + pubkey 33 + push opcodes 2 + sequence 4).
pub const P2PKH_INPUT_SIZE: usize = 148;

/// Size in bytes of a P2PKH output (value 8 + script len 1 + script 25).
pub const P2PKH_OUTPUT_SIZE: usize = 34;

/// Version + locktime + in/out counts for small transactions.
pub const TX_OVERHEAD_SIZE: usize = 10;

/// Rough size of a transaction made of P2PKH inputs and outputs.
pub fn estimate_tx_size(input_count: usize, output_count: usize) -> usize {
    TX_OVERHEAD_SIZE + P2PKH_INPUT_SIZE * input_count + P2PKH_OUTPUT_SIZE * output_count
}

/// Dust limit for an output: an output is dust when spending it at the
/// given rate would cost more than a third of its value.
pub fn dust_threshold(rate: FeeRate) -> u64 {
    let total = (P2PKH_OUTPUT_SIZE + P2PKH_INPUT_SIZE) * 3;
    rate.fee_for_size(total).max(DEFAULT_DUST_THRESHOLD)
}

/// Hard floor used when the discard rate is zero.
pub const DEFAULT_DUST_THRESHOLD: u64 = 546;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_for_size() {
        let rate = FeeRate::per_kb(1000);
        assert_eq!(rate.fee_for_size(1000), 1000);
        assert_eq!(rate.fee_for_size(250), 250);
        // Rounds up to one unit of the rate rather than zero.
        assert_eq!(FeeRate::per_kb(10).fee_for_size(50), 10);
        assert_eq!(FeeRate::per_kb(0).fee_for_size(1000), 0);
    }

    #[test]
    fn test_tx_size_estimate() {
        assert_eq!(estimate_tx_size(1, 2), 10 + 148 + 68);
    }

    #[test]
    fn test_dust_floor() {
        assert_eq!(dust_threshold(FeeRate::per_kb(0)), DEFAULT_DUST_THRESHOLD);
        assert!(dust_threshold(FeeRate::per_kb(10000)) > DEFAULT_DUST_THRESHOLD);
    }
}
