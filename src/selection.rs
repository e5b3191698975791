//! Coin selection algorithms.
//!
//! Two general-purpose algorithms run in order: a branch-and-bound search
//! for changeless exact matches over effective values, and a randomized
//! knapsack fallback. The mixing subsystem uses its own denomination- and
//! rounds-aware selector.

use dashcore::{OutPoint, TxOut};
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::denominations::matches_denomination_bits;
use crate::error::SelectionError;
use crate::fee::FeeRate;

/// Upper bound on nodes explored by the branch-and-bound search.
const BNB_MAX_TRIES: usize = 100_000;

/// Number of randomized knapsack passes.
const KNAPSACK_ITERATIONS: usize = 1_000;

/// A coin as the selector sees it.
#[derive(Debug, Clone)]
pub struct InputCoin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    /// Worst-case signed input size in bytes.
    pub input_bytes: usize,
    /// Output value minus the cost of spending it at the effective fee
    /// rate. May be negative for dust at high rates.
    pub effective_value: i64,
}

impl InputCoin {
    pub fn new(outpoint: OutPoint, txout: TxOut, input_bytes: usize, effective_fee: FeeRate) -> Self {
        let spend_cost = effective_fee.fee_for_size(input_bytes) as i64;
        let effective_value = txout.value as i64 - spend_cost;
        Self {
            outpoint,
            txout,
            input_bytes,
            effective_value,
        }
    }

    pub fn value(&self) -> u64 {
        self.txout.value
    }
}

/// Sizing knobs threaded through one `create_transaction` attempt.
#[derive(Debug, Clone)]
pub struct CoinSelectionParams {
    /// Whether the branch-and-bound pass runs at all.
    pub use_bnb: bool,
    /// Serialized size of the would-be change output.
    pub change_output_size: usize,
    /// Worst-case size of spending the would-be change output later.
    pub change_spend_size: usize,
    /// Fee rate used for effective values.
    pub effective_fee: FeeRate,
    /// Size of the transaction without any inputs.
    pub tx_noinputs_size: usize,
}

impl CoinSelectionParams {
    /// Creating the change output now plus spending it later.
    pub fn cost_of_change(&self) -> u64 {
        self.effective_fee.fee_for_size(self.change_output_size)
            + self.effective_fee.fee_for_size(self.change_spend_size)
    }
}

/// One rung of the eligibility ladder.
#[derive(Debug, Clone, Copy)]
pub struct CoinEligibilityFilter {
    /// Minimum confirmations for coins we sent ourselves.
    pub conf_mine: i32,
    /// Minimum confirmations for coins received from others.
    pub conf_theirs: i32,
    /// Maximum in-mempool ancestor chain (counting the coin's tx).
    pub max_ancestors: u64,
}

impl CoinEligibilityFilter {
    pub const fn new(conf_mine: i32, conf_theirs: i32, max_ancestors: u64) -> Self {
        Self {
            conf_mine,
            conf_theirs,
            max_ancestors,
        }
    }
}

/// Eligibility rungs tried in decreasing strictness. The zero-conf rungs
/// only appear when spending unconfirmed change is enabled.
pub fn standard_eligibility_ladder(spend_zero_conf_change: bool) -> Vec<CoinEligibilityFilter> {
    let mut ladder = vec![
        CoinEligibilityFilter::new(6, 1, u64::MAX),
        CoinEligibilityFilter::new(1, 1, u64::MAX),
    ];
    if spend_zero_conf_change {
        ladder.push(CoinEligibilityFilter::new(0, 1, 2));
        ladder.push(CoinEligibilityFilter::new(0, 1, 64));
        ladder.push(CoinEligibilityFilter::new(0, 1, u64::MAX));
    }
    ladder
}

/// A coin plus the facts the eligibility filter needs.
#[derive(Debug, Clone)]
pub struct CandidateCoin {
    pub coin: InputCoin,
    pub depth: i32,
    pub from_me: bool,
    pub ancestors: u64,
}

impl CandidateCoin {
    fn eligible(&self, filter: &CoinEligibilityFilter) -> bool {
        let required = if self.from_me {
            filter.conf_mine
        } else {
            filter.conf_theirs
        };
        self.depth >= required && self.ancestors <= filter.max_ancestors
    }
}

/// Result of a selection: the chosen coins and their summed raw value.
pub type Selection = (Vec<InputCoin>, u64);

/// Filter candidates through one eligibility rung and run the two
/// algorithms. `bnb_used` reports which one produced the result so the
/// caller knows whether a change output is needed.
pub fn select_coins_min_conf(
    target: u64,
    filter: &CoinEligibilityFilter,
    candidates: &[CandidateCoin],
    params: &CoinSelectionParams,
    bnb_used: &mut bool,
) -> Result<Selection, SelectionError> {
    let eligible: Vec<&CandidateCoin> =
        candidates.iter().filter(|c| c.eligible(filter)).collect();
    if eligible.is_empty() {
        return Err(SelectionError::NoUtxosAvailable);
    }

    if params.use_bnb {
        // Effective-value target: the fixed part of the transaction is
        // paid for by the selection itself in the changeless case.
        let not_input_fees = params.effective_fee.fee_for_size(params.tx_noinputs_size);
        let bnb_target = target + not_input_fees;
        let coins: Vec<InputCoin> = eligible
            .iter()
            .filter(|c| c.coin.effective_value > 0)
            .map(|c| c.coin.clone())
            .collect();
        if let Ok(selection) = select_coins_bnb(coins, bnb_target, params.cost_of_change()) {
            *bnb_used = true;
            return Ok(selection);
        }
    }

    *bnb_used = false;
    knapsack_solver(
        eligible.into_iter().map(|c| c.coin.clone()).collect(),
        target,
    )
}

/// Depth-first branch and bound over effective values, looking for a
/// subset summing into `[target, target + cost_of_change]`. Lowest excess
/// wins, fewer inputs breaking ties; bounded by a try limit.
pub fn select_coins_bnb(
    mut coins: Vec<InputCoin>,
    target: u64,
    cost_of_change: u64,
) -> Result<Selection, SelectionError> {
    coins.sort_by(|a, b| b.effective_value.cmp(&a.effective_value));

    let total_available: i64 = coins.iter().map(|c| c.effective_value).sum();
    if total_available < target as i64 {
        return Err(SelectionError::InsufficientFunds {
            available: total_available.max(0) as u64,
            required: target,
        });
    }

    let target = target as i64;
    let upper_bound = target + cost_of_change as i64;

    // Explicit-stack DFS: `selection[i]` says whether coin i is in the
    // current branch. Each iteration either deepens or backtracks.
    let mut selection: Vec<bool> = Vec::with_capacity(coins.len());
    let mut best_selection: Option<Vec<bool>> = None;
    let mut best_excess = i64::MAX;
    let mut curr_value: i64 = 0;
    let mut remaining = total_available;

    let mut tries = 0;
    let mut backtrack;
    while tries < BNB_MAX_TRIES {
        tries += 1;
        backtrack = false;

        if curr_value + remaining < target || curr_value > upper_bound {
            // Cannot reach the target anymore, or overshot the window.
            backtrack = true;
        } else if curr_value >= target {
            let excess = curr_value - target;
            let better = excess < best_excess
                || (excess == best_excess
                    && best_selection
                        .as_ref()
                        .map(|b| count_selected(&selection) < count_selected(b))
                        .unwrap_or(true));
            if better {
                best_selection = Some(selection.clone());
                best_excess = excess;
                if excess == 0 {
                    break;
                }
            }
            backtrack = true;
        } else if selection.len() >= coins.len() {
            backtrack = true;
        }

        if backtrack {
            // Walk back to the last included coin and exclude it.
            while let Some(included) = selection.pop() {
                if included {
                    let idx = selection.len();
                    curr_value -= coins[idx].effective_value;
                    selection.push(false);
                    break;
                }
                remaining += coins[selection.len()].effective_value;
            }
            if selection.is_empty() {
                break;
            }
        } else {
            // Deepen: include the next coin.
            let idx = selection.len();
            selection.push(true);
            curr_value += coins[idx].effective_value;
            remaining -= coins[idx].effective_value;
        }
    }

    let best = best_selection.ok_or_else(|| {
        SelectionError::SelectionFailed("no changeless combination found".into())
    })?;
    let mut selected = Vec::new();
    let mut value = 0;
    for (idx, included) in best.iter().enumerate() {
        if *included {
            value += coins[idx].value();
            selected.push(coins[idx].clone());
        }
    }
    Ok((selected, value))
}

fn count_selected(selection: &[bool]) -> usize {
    selection.iter().filter(|b| **b).count()
}

/// Randomized knapsack: many shuffled greedy passes, keeping the pass
/// with the lowest total at or above the target (fewer inputs breaking
/// ties).
pub fn knapsack_solver(coins: Vec<InputCoin>, target: u64) -> Result<Selection, SelectionError> {
    if coins.is_empty() {
        return Err(SelectionError::NoUtxosAvailable);
    }

    let total: u64 = coins.iter().map(|c| c.value()).sum();
    if total < target {
        return Err(SelectionError::InsufficientFunds {
            available: total,
            required: target,
        });
    }

    // A coin matching the target exactly beats any combination.
    if let Some(exact) = coins.iter().find(|c| c.value() == target) {
        return Ok((vec![exact.clone()], target));
    }

    let mut rng = thread_rng();
    let mut order: Vec<usize> = (0..coins.len()).collect();
    let mut best: Option<(u64, Vec<usize>)> = None;

    for _ in 0..KNAPSACK_ITERATIONS {
        order.shuffle(&mut rng);
        let mut picked = Vec::new();
        let mut value = 0u64;
        for &idx in &order {
            picked.push(idx);
            value += coins[idx].value();
            if value >= target {
                break;
            }
        }
        if value < target {
            continue;
        }

        // Drop coins that the rest of the pass made redundant.
        let mut trimmed = picked.clone();
        let mut trimmed_value = value;
        for idx in picked {
            let coin_value = coins[idx].value();
            if trimmed_value - coin_value >= target {
                trimmed_value -= coin_value;
                trimmed.retain(|&i| i != idx);
            }
        }

        let better = match &best {
            None => true,
            Some((best_value, best_picked)) => {
                trimmed_value < *best_value
                    || (trimmed_value == *best_value && trimmed.len() < best_picked.len())
            }
        };
        if better {
            if trimmed_value == target {
                return Ok(finish_knapsack(&coins, &trimmed, trimmed_value));
            }
            best = Some((trimmed_value, trimmed));
        }
    }

    match best {
        Some((value, picked)) => Ok(finish_knapsack(&coins, &picked, value)),
        None => Err(SelectionError::InsufficientFunds {
            available: total,
            required: target,
        }),
    }
}

fn finish_knapsack(coins: &[InputCoin], picked: &[usize], value: u64) -> Selection {
    (picked.iter().map(|&i| coins[i].clone()).collect(), value)
}

/// A denominated coin with its mixing-round depth.
#[derive(Debug, Clone)]
pub struct DenomCandidate {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub rounds: i32,
}

/// Pick denominated coins for a mixing session: amounts selected by the
/// denomination bitmap, round depth within `[rounds_min, rounds_max]`,
/// total pushed toward `value_max` but valid from `value_min`. Order is
/// randomized so repeated sessions do not leak a stable coin order.
pub fn select_by_denominations(
    mut candidates: Vec<DenomCandidate>,
    denom_bits: u32,
    value_min: u64,
    value_max: u64,
    rounds_min: i32,
    rounds_max: i32,
) -> Result<(Vec<DenomCandidate>, u64), SelectionError> {
    let mut rng = thread_rng();
    candidates.shuffle(&mut rng);

    let mut selected = Vec::new();
    let mut value = 0u64;
    for candidate in candidates {
        if candidate.rounds < rounds_min || candidate.rounds > rounds_max {
            continue;
        }
        if !matches_denomination_bits(denom_bits, candidate.txout.value) {
            continue;
        }
        if value + candidate.txout.value > value_max {
            continue;
        }
        value += candidate.txout.value;
        selected.push(candidate);
    }

    if value >= value_min {
        Ok((selected, value))
    } else {
        Err(SelectionError::InsufficientFunds {
            available: value,
            required: value_min,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denominations::{COIN, STANDARD_DENOMINATIONS};
    use dashcore::hashes::{sha256d, Hash};
    use dashcore::{ScriptBuf, Txid};

    fn coin(n: u8, value: u64) -> InputCoin {
        InputCoin {
            outpoint: OutPoint {
                txid: Txid::from_raw_hash(sha256d::Hash::from_byte_array([n; 32])),
                vout: 0,
            },
            txout: TxOut {
                value,
                script_pubkey: ScriptBuf::new(),
            },
            input_bytes: 148,
            effective_value: value as i64,
        }
    }

    #[test]
    fn test_bnb_exact_match_without_change() {
        // 1.0, 0.5, 0.3 with target 0.8 at zero fee: picks {0.5, 0.3}.
        let coins = vec![coin(1, COIN), coin(2, COIN / 2), coin(3, 3 * COIN / 10)];
        let (selected, value) = select_coins_bnb(coins, 8 * COIN / 10, 0).unwrap();
        let mut values: Vec<u64> = selected.iter().map(|c| c.value()).collect();
        values.sort();
        assert_eq!(values, vec![3 * COIN / 10, COIN / 2]);
        assert_eq!(value, 8 * COIN / 10);
    }

    #[test]
    fn test_bnb_fails_without_exact_window() {
        // Ten 0.1 coins cannot sum into [0.37, 0.37] exactly.
        let coins: Vec<InputCoin> = (0..10).map(|i| coin(i, COIN / 10)).collect();
        assert!(select_coins_bnb(coins, 37 * COIN / 100, 0).is_err());
    }

    #[test]
    fn test_bnb_accepts_within_cost_of_change() {
        // 0.4 is within [0.37, 0.37 + 0.05].
        let coins: Vec<InputCoin> = (0..10).map(|i| coin(i, COIN / 10)).collect();
        let (selected, value) =
            select_coins_bnb(coins, 37 * COIN / 100, 5 * COIN / 100).unwrap();
        assert_eq!(selected.len(), 4);
        assert_eq!(value, 4 * COIN / 10);
    }

    #[test]
    fn test_bnb_insufficient() {
        let coins = vec![coin(1, 1000)];
        assert!(matches!(
            select_coins_bnb(coins, 2000, 0),
            Err(SelectionError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_knapsack_reaches_target_with_overshoot() {
        let coins: Vec<InputCoin> = (0..10).map(|i| coin(i, COIN / 10)).collect();
        let (selected, value) = knapsack_solver(coins, 37 * COIN / 100).unwrap();
        assert_eq!(selected.len(), 4);
        assert_eq!(value, 4 * COIN / 10);
    }

    #[test]
    fn test_knapsack_prefers_exact_single() {
        let coins = vec![coin(1, 5000), coin(2, 3000), coin(3, 2000)];
        let (selected, value) = knapsack_solver(coins, 3000).unwrap();
        assert_eq!(value, 3000);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_knapsack_insufficient() {
        let coins = vec![coin(1, 100), coin(2, 100)];
        assert!(matches!(
            knapsack_solver(coins, 1000),
            Err(SelectionError::InsufficientFunds { .. })
        ));
    }

    fn candidate(n: u8, value: u64, depth: i32, from_me: bool, ancestors: u64) -> CandidateCoin {
        CandidateCoin {
            coin: coin(n, value),
            depth,
            from_me,
            ancestors,
        }
    }

    #[test]
    fn test_eligibility_ladder_relaxation() {
        let params = CoinSelectionParams {
            use_bnb: false,
            change_output_size: 34,
            change_spend_size: 148,
            effective_fee: FeeRate::per_kb(0),
            tx_noinputs_size: 44,
        };
        // Only a 2-conf self-sent coin exists: strictest rung (6 confs
        // mine) fails, second rung (1 conf) succeeds.
        let candidates = vec![candidate(1, 10_000, 2, true, 0)];
        let ladder = standard_eligibility_ladder(true);

        let mut bnb_used = false;
        assert!(select_coins_min_conf(5_000, &ladder[0], &candidates, &params, &mut bnb_used)
            .is_err());
        let (selected, _) =
            select_coins_min_conf(5_000, &ladder[1], &candidates, &params, &mut bnb_used)
                .unwrap();
        assert_eq!(selected.len(), 1);
        assert!(!bnb_used);
    }

    #[test]
    fn test_zero_conf_rungs_only_with_flag() {
        assert_eq!(standard_eligibility_ladder(false).len(), 2);
        assert!(standard_eligibility_ladder(true).len() > 2);
    }

    #[test]
    fn test_foreign_unconfirmed_never_eligible() {
        let filter = CoinEligibilityFilter::new(0, 1, u64::MAX);
        let mine = candidate(1, 10_000, 0, true, 1);
        let theirs = candidate(2, 10_000, 0, false, 1);
        assert!(mine.eligible(&filter));
        assert!(!theirs.eligible(&filter));
    }

    fn denom_candidate(n: u8, value: u64, rounds: i32) -> DenomCandidate {
        DenomCandidate {
            outpoint: OutPoint {
                txid: Txid::from_raw_hash(sha256d::Hash::from_byte_array([n; 32])),
                vout: 0,
            },
            txout: TxOut {
                value,
                script_pubkey: ScriptBuf::new(),
            },
            rounds,
        }
    }

    #[test]
    fn test_denomination_selection_respects_bits_and_rounds() {
        let d0 = STANDARD_DENOMINATIONS[0];
        let d1 = STANDARD_DENOMINATIONS[1];
        let candidates = vec![
            denom_candidate(1, d0, 2),
            denom_candidate(2, d1, 2),
            denom_candidate(3, d1, 9), // too many rounds
            denom_candidate(4, COIN, 2), // not a denomination
        ];

        let (selected, value) =
            select_by_denominations(candidates, 0b10, 1, u64::MAX, 0, 4).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(value, d1);
    }

    #[test]
    fn test_denomination_selection_value_min() {
        let d1 = STANDARD_DENOMINATIONS[1];
        let candidates = vec![denom_candidate(1, d1, 1)];
        assert!(select_by_denominations(candidates, 0b10, d1 * 2, u64::MAX, 0, 4).is_err());
    }
}
