//! Transaction assembly: coin selection, fee iteration, change
//! placement, signing and the final commit into wallet + mempool.

use dashcore::blockdata::script::Builder as ScriptBuilder;
use dashcore::hashes::Hash;
use dashcore::sighash::{EcdsaSighashType, SighashCache};
use dashcore::secp256k1::Message;
use dashcore::{
    Address, OutPoint, PubkeyHash, ScriptBuf, Transaction, TxIn, TxOut, Txid, Witness,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::coins::{AvailableCoinsFilter, CoinControl, CoinType, Output};
use crate::denominations::{is_collateral_amount, MAX_MONEY, MIN_MIXING_COLLATERAL};
use crate::error::{Result, SelectionError, WalletError};
use crate::fee::{dust_threshold, P2PKH_INPUT_SIZE, P2PKH_OUTPUT_SIZE, TX_OVERHEAD_SIZE};
use crate::keypool::ReservedKey;
use crate::selection::{
    select_coins_min_conf, standard_eligibility_ladder, CandidateCoin, CoinSelectionParams,
    DenomCandidate, InputCoin,
};
use crate::wallet_tx::WalletTx;

use super::{unix_time, Wallet};

/// A single payment in a transaction under construction.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub script: ScriptBuf,
    pub amount: u64,
    /// Take this recipient's share of the fee out of its amount.
    pub subtract_fee: bool,
}

/// Result of [`Wallet::create_transaction`].
pub struct CreatedTransaction {
    pub tx: Transaction,
    pub fee: u64,
    /// Where the change output ended up, if one exists.
    pub change_pos: Option<usize>,
    /// The change key reservation; commit keeps it, dropping the whole
    /// result returns the key to the pool.
    pub reserved_key: Option<ReservedKey>,
}

/// Hard cap on a standard transaction's serialized size.
const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Non-RBF inputs still leave locktime enforceable.
const SEQUENCE_NON_RBF: u32 = u32::MAX - 1;
/// BIP125-signaling sequence.
const SEQUENCE_RBF: u32 = u32::MAX - 2;

impl Wallet {
    /// Build a transaction paying `recipients`, selecting inputs of the
    /// requested coin type. The change key is reserved from the internal
    /// lane and rides in the result's RAII guard.
    pub fn create_transaction(
        &mut self,
        recipients: &[Recipient],
        coin_control: &CoinControl,
        coin_type: CoinType,
        sign: bool,
    ) -> Result<CreatedTransaction> {
        if recipients.is_empty() {
            return Err(WalletError::InvalidInput("transaction must have recipients".into()));
        }
        let total_value: u64 = recipients.iter().map(|r| r.amount).sum();
        if total_value > MAX_MONEY {
            return Err(WalletError::InvalidInput("transaction amounts too large".into()));
        }
        let subtract_count = recipients.iter().filter(|r| r.subtract_fee).count() as u64;
        let dust = dust_threshold(self.config.discard_rate);
        for recipient in recipients {
            if !recipient.subtract_fee && recipient.amount < dust {
                return Err(WalletError::InvalidInput("transaction amount too small".into()));
            }
        }

        let fee_rate = self.resolve_fee_rate(coin_control)?;

        // Change destination: caller override or a fresh internal key.
        let mut reserved_key = None;
        let change_script = match &coin_control.change_address {
            Some(address) => address.script_pubkey(),
            None => {
                let reserved = self.reserve_key(true)?;
                let pubkey = reserved
                    .pubkey()
                    .ok_or_else(|| WalletError::General("reservation lost its key".into()))?;
                let script = Address::p2pkh(&pubkey, self.network()).script_pubkey();
                reserved_key = Some(reserved);
                script
            }
        };

        let mut filter = AvailableCoinsFilter::default();
        filter.coin_type = coin_type;
        filter.min_depth = coin_control.min_depth;
        let available = self.available_coins(&filter, Some(coin_control));
        let candidates = self.candidates_from_outputs(&available, fee_rate);

        let signal_rbf = coin_control.signal_rbf.unwrap_or(self.config.wallet_rbf);
        let sequence = if signal_rbf {
            SEQUENCE_RBF
        } else {
            SEQUENCE_NON_RBF
        };

        let mut fee_ret: u64 = 0;
        let mut use_bnb = subtract_count == 0;
        let mut result = None;
        for _attempt in 0..16 {
            // Recipient outputs, minus their fee share when subtracting.
            let mut outputs = Vec::with_capacity(recipients.len() + 1);
            let mut first_subtract = true;
            for recipient in recipients {
                let mut value = recipient.amount;
                if recipient.subtract_fee {
                    value = value
                        .checked_sub(fee_ret / subtract_count)
                        .ok_or(WalletError::InsufficientFunds)?;
                    if first_subtract {
                        value = value
                            .checked_sub(fee_ret % subtract_count)
                            .ok_or(WalletError::InsufficientFunds)?;
                        first_subtract = false;
                    }
                    if value < dust {
                        return Err(WalletError::InvalidInput(
                            "transaction amount too small after fee deduction".into(),
                        ));
                    }
                }
                outputs.push(TxOut {
                    value,
                    script_pubkey: recipient.script.clone(),
                });
            }

            let target = if subtract_count == 0 {
                total_value + fee_ret
            } else {
                total_value
            };
            let tx_noinputs_size = TX_OVERHEAD_SIZE
                + outputs.iter().map(|o| o.script_pubkey.len() + 9).sum::<usize>();
            let params = CoinSelectionParams {
                use_bnb,
                change_output_size: P2PKH_OUTPUT_SIZE,
                change_spend_size: P2PKH_INPUT_SIZE,
                effective_fee: fee_rate,
                tx_noinputs_size,
            };

            let (selected, selected_value, bnb_used) =
                self.select_coins(&candidates, &available, target, coin_control, &params)?;

            // Change output, except in the changeless exact-match case.
            let mut change_pos = None;
            if !bnb_used {
                let change_value = selected_value.saturating_sub(target);
                if change_value >= dust {
                    let pos = match coin_control.change_position {
                        Some(pos) if pos <= outputs.len() => pos,
                        Some(_) => {
                            return Err(WalletError::InvalidInput(
                                "change position out of range".into(),
                            ))
                        }
                        None => rand::thread_rng().gen_range(0..=outputs.len()),
                    };
                    outputs.insert(
                        pos,
                        TxOut {
                            value: change_value,
                            script_pubkey: change_script.clone(),
                        },
                    );
                    change_pos = Some(pos);
                }
                // Sub-dust change is silently left to the fee.
            }

            let mut inputs: Vec<(OutPoint, InputCoin)> =
                selected.into_iter().map(|c| (c.outpoint, c)).collect();
            if !coin_control.preserve_order {
                // BIP-69: lexicographic by outpoint.
                inputs.sort_by(|a, b| {
                    let key_a = (a.0.txid.to_byte_array(), a.0.vout);
                    let key_b = (b.0.txid.to_byte_array(), b.0.vout);
                    key_a.cmp(&key_b)
                });
            }

            let tx = Transaction {
                version: 2,
                lock_time: 0,
                input: inputs
                    .iter()
                    .map(|(outpoint, _)| TxIn {
                        previous_output: *outpoint,
                        script_sig: ScriptBuf::new(),
                        sequence,
                        witness: Witness::new(),
                    })
                    .collect(),
                output: outputs,
                special_transaction_payload: None,
            };

            // Worst-case size with placeholder signatures.
            let size = {
                let mut dummy = tx.clone();
                dummy_sign(&mut dummy);
                dummy.size()
            };
            if size > MAX_STANDARD_TX_SIZE {
                return Err(WalletError::TransactionTooLarge);
            }

            let needed_fee = fee_rate
                .fee_for_size(size)
                .max(self.config.min_tx_fee.fee_for_size(size));
            if needed_fee > self.config.max_tx_fee {
                return Err(WalletError::General(
                    "transaction fee exceeds the maximum allowed".into(),
                ));
            }

            if bnb_used {
                // The exact-match selection pays the fee out of the
                // excess effective value. If the real size ended up
                // larger, fall back to the knapsack path.
                let outputs_sum: u64 = tx.output.iter().map(|o| o.value).sum();
                let actual_fee = selected_value.saturating_sub(outputs_sum);
                if actual_fee >= needed_fee {
                    fee_ret = actual_fee;
                    result = Some((tx, change_pos));
                    break;
                }
                use_bnb = false;
                continue;
            }

            if fee_ret >= needed_fee {
                result = Some((tx, change_pos));
                break;
            }
            fee_ret = needed_fee;
        }

        let (mut tx, change_pos) =
            result.ok_or_else(|| WalletError::General("fee iteration did not settle".into()))?;

        if self.config.reject_long_chains {
            for input in &tx.input {
                let ancestors = self.chain.mempool_ancestor_count(&input.previous_output.txid);
                if ancestors + 1 > self.config.max_ancestors {
                    return Err(WalletError::AncestorChainTooLong);
                }
            }
        }

        if sign {
            self.sign_transaction(&mut tx)?;
            let final_size = tx.size();
            if final_size > MAX_STANDARD_TX_SIZE {
                return Err(WalletError::TransactionTooLarge);
            }
        }

        debug!(
            txid = %tx.txid(),
            fee = fee_ret,
            inputs = tx.input.len(),
            outputs = tx.output.len(),
            "transaction created"
        );
        Ok(CreatedTransaction {
            tx,
            fee: fee_ret,
            change_pos,
            reserved_key,
        })
    }

    fn resolve_fee_rate(&self, coin_control: &CoinControl) -> Result<crate::fee::FeeRate> {
        if let Some(rate) = coin_control.fee_rate {
            return Ok(rate.max(self.config.min_tx_fee));
        }
        let target = coin_control.confirm_target.unwrap_or(self.config.tx_confirm_target);
        match self.chain.estimate_smart_fee(target) {
            Some(rate) => Ok(rate.max(self.config.min_tx_fee)),
            None if self.config.allow_fallback_fee => {
                Ok(self.config.fallback_fee.max(self.config.min_tx_fee))
            }
            None => Err(WalletError::FeeEstimationFailed),
        }
    }

    fn candidates_from_outputs(
        &self,
        outputs: &[Output],
        fee_rate: crate::fee::FeeRate,
    ) -> Vec<CandidateCoin> {
        outputs
            .iter()
            .filter(|o| o.spendable)
            .map(|o| {
                let input_bytes = o.input_bytes.unwrap_or(P2PKH_INPUT_SIZE);
                CandidateCoin {
                    coin: InputCoin::new(o.outpoint, o.txout.clone(), input_bytes, fee_rate),
                    depth: o.depth,
                    from_me: self
                        .store
                        .get(&o.outpoint.txid)
                        .map(|w| w.from_me)
                        .unwrap_or(false),
                    ancestors: self.chain.mempool_ancestor_count(&o.outpoint.txid),
                }
            })
            .collect()
    }

    /// Pick inputs for `target`: manual coin-control selections are
    /// honored first, then the eligibility ladder runs strictest-first.
    fn select_coins(
        &mut self,
        candidates: &[CandidateCoin],
        available: &[Output],
        target: u64,
        coin_control: &CoinControl,
        params: &CoinSelectionParams,
    ) -> Result<(Vec<InputCoin>, u64, bool)> {
        if coin_control.has_selected() && !coin_control.allow_other_inputs {
            let mut selected = Vec::new();
            let mut value = 0;
            for output in available {
                if coin_control.is_selected(&output.outpoint) {
                    value += output.value();
                    let input_bytes = output.input_bytes.unwrap_or(P2PKH_INPUT_SIZE);
                    selected.push(InputCoin::new(
                        output.outpoint,
                        output.txout.clone(),
                        input_bytes,
                        params.effective_fee,
                    ));
                }
            }
            if value < target {
                return Err(WalletError::InsufficientFunds);
            }
            return Ok((selected, value, false));
        }

        let mut bnb_used = false;
        for filter in standard_eligibility_ladder(self.config.spend_zero_conf_change) {
            match select_coins_min_conf(target, &filter, candidates, params, &mut bnb_used) {
                Ok((selected, value)) => return Ok((selected, value, bnb_used)),
                Err(SelectionError::NoUtxosAvailable)
                | Err(SelectionError::InsufficientFunds { .. })
                | Err(SelectionError::SelectionFailed(_)) => continue,
            }
        }
        Err(WalletError::InsufficientFunds)
    }

    /// Sign every input we own. Fails with `Locked` when the keystore is
    /// encrypted and locked.
    pub fn sign_transaction(&mut self, tx: &mut Transaction) -> Result<()> {
        let mut signatures = Vec::with_capacity(tx.input.len());
        {
            let cache = SighashCache::new(&*tx);
            for (index, input) in tx.input.iter().enumerate() {
                let prev = self
                    .store
                    .get(&input.previous_output.txid)
                    .and_then(|w| w.tx.output.get(input.previous_output.vout as usize))
                    .cloned()
                    .ok_or_else(|| {
                        WalletError::InvalidInput("input not found in wallet".into())
                    })?;

                let script = &prev.script_pubkey;
                if !script.is_p2pkh() {
                    return Err(WalletError::InvalidInput(
                        "cannot sign non-P2PKH input".into(),
                    ));
                }
                let hash = PubkeyHash::from_slice(&script.as_bytes()[3..23])
                    .map_err(|_| WalletError::InvalidInput("malformed script".into()))?;
                let secret = self.keystore.get_key(&hash, false)?;
                let pubkey = self
                    .keystore
                    .get_pubkey(&hash)
                    .ok_or(crate::error::KeystoreError::KeyNotFound)?;

                let sighash = cache
                    .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
                    .map_err(|e| {
                        WalletError::General(format!("failed to compute sighash: {}", e))
                    })?;
                let message = Message::from_digest(*sighash.as_byte_array());
                let signature = self.keystore.secp().sign_ecdsa(&message, &secret);

                let mut sig_bytes = signature.serialize_der().to_vec();
                sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);
                let script_sig = ScriptBuilder::new()
                    .push_slice(
                        <&dashcore::blockdata::script::PushBytes>::try_from(
                            sig_bytes.as_slice(),
                        )
                        .map_err(|_| WalletError::General("invalid signature length".into()))?,
                    )
                    .push_key(&pubkey)
                    .into_script();
                signatures.push((index, script_sig));
            }
        }
        for (index, script_sig) in signatures {
            tx.input[index].script_sig = script_sig;
        }
        Ok(())
    }

    /// Store a freshly created transaction, push it to the mempool and
    /// relay it. The change-key reservation is kept here; on any earlier
    /// failure dropping the guard returned it.
    pub fn commit_transaction(
        &mut self,
        tx: Transaction,
        map_value: std::collections::BTreeMap<String, String>,
        order_form: Vec<(String, String)>,
        from_account: String,
        reserved_key: Option<ReservedKey>,
    ) -> Result<Txid> {
        let txid = tx.txid();
        if let Some(reserved) = reserved_key {
            self.keep_reserved(reserved)?;
        }

        let mut wtx = WalletTx::new(tx.clone());
        wtx.time_received = unix_time();
        wtx.time_received_is_tx_time = true;
        wtx.from_me = true;
        wtx.map_value = map_value;
        wtx.order_form = order_form;
        wtx.from_account = from_account;
        wtx.time_smart = self.compute_time_smart(&wtx);

        // Spent coins' parents must recompute their available credit.
        let parents: Vec<Txid> = tx.input.iter().map(|i| i.previous_output.txid).collect();
        self.store.insert(wtx);
        for parent in parents {
            if let Some(parent_tx) = self.store.get_mut(&parent) {
                parent_tx.mark_dirty();
            }
        }
        self.rounds_cache.clear();

        if let Some(wtx) = self.store.get(&txid).cloned() {
            self.persist_wallet_tx(&wtx)?;
        }
        self.persist_order_pos_next()?;
        self.events.emit(crate::events::WalletEvent::TransactionChanged {
            txid,
            status: crate::events::ChangeType::Added,
        });

        if let Err(reason) = self.chain.accept_to_mempool(&tx) {
            // The transaction stays in the wallet; the resend path will
            // retry once the mempool accepts it.
            warn!(%txid, reason, "mempool rejected committed transaction");
        } else if self.broadcast_transactions() {
            self.chain.relay_transaction(&tx);
        }

        info!(%txid, "transaction committed");
        Ok(txid)
    }

    /// Add inputs (and change) to a caller-assembled set of outputs.
    /// Returns the fee paid and the change position, leaving the output
    /// order intact.
    pub fn fund_transaction(
        &mut self,
        tx: &mut Transaction,
        subtract_fee_outputs: &[usize],
        coin_control: &CoinControl,
        lock_unspents: bool,
    ) -> Result<(u64, Option<usize>)> {
        let recipients: Vec<Recipient> = tx
            .output
            .iter()
            .enumerate()
            .map(|(i, out)| Recipient {
                script: out.script_pubkey.clone(),
                amount: out.value,
                subtract_fee: subtract_fee_outputs.contains(&i),
            })
            .collect();

        let created = self.create_transaction(&recipients, coin_control, CoinType::All, false)?;
        tx.input = created.tx.input.clone();
        tx.output = created.tx.output.clone();

        if lock_unspents {
            for input in &tx.input {
                self.lock_coin(input.previous_output);
            }
        }
        // The reservation drops here: funding only borrows the change
        // script, the key returns to the pool.
        Ok((created.fee, created.change_pos))
    }

    /// Build and sign the small collateral transaction the mixing
    /// protocol requires as an anti-spam bond.
    pub fn create_collateral_transaction(&mut self) -> Result<Transaction> {
        let mut filter = AvailableCoinsFilter::default();
        filter.coin_type = CoinType::OnlyMixingCollateral;
        let outputs = self.available_coins(&filter, None);
        let output = outputs
            .iter()
            .find(|o| o.spendable && is_collateral_amount(o.value()))
            .ok_or(WalletError::InsufficientFunds)?
            .clone();

        let remainder = output.value().saturating_sub(MIN_MIXING_COLLATERAL);
        if remainder < dust_threshold(self.config.discard_rate) {
            return Err(WalletError::InsufficientFunds);
        }

        let reserved = self.reserve_key(true)?;
        let pubkey = reserved
            .pubkey()
            .ok_or_else(|| WalletError::General("reservation lost its key".into()))?;
        let change_script = Address::p2pkh(&pubkey, self.network()).script_pubkey();

        let mut tx = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: output.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: SEQUENCE_NON_RBF,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: remainder,
                script_pubkey: change_script,
            }],
            special_transaction_payload: None,
        };
        self.sign_transaction(&mut tx)?;
        self.keep_reserved(reserved)?;
        Ok(tx)
    }

    /// Denominated coins for a mixing session, with per-coin rounds.
    pub fn select_coins_by_denominations(
        &mut self,
        denom_bits: u32,
        value_min: u64,
        value_max: u64,
        rounds_min: i32,
        rounds_max: i32,
    ) -> Result<(Vec<DenomCandidate>, u64)> {
        let mut filter = AvailableCoinsFilter::default();
        filter.coin_type = CoinType::OnlyDenominated;
        let outputs = self.available_coins(&filter, None);

        let mut candidates = Vec::with_capacity(outputs.len());
        for output in outputs {
            if !output.spendable {
                continue;
            }
            let rounds = self.outpoint_rounds(&output.outpoint);
            candidates.push(DenomCandidate {
                outpoint: output.outpoint,
                txout: output.txout,
                rounds,
            });
        }

        crate::selection::select_by_denominations(
            candidates, denom_bits, value_min, value_max, rounds_min, rounds_max,
        )
        .map_err(WalletError::Selection)
    }
}

/// Fill placeholder signatures so size estimation sees the worst case.
fn dummy_sign(tx: &mut Transaction) {
    let script_sig = ScriptBuilder::new()
        .push_slice(&[0u8; 72])
        .push_slice(&[0u8; 33])
        .into_script();
    for input in tx.input.iter_mut() {
        input.script_sig = script_sig.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denominations::COIN;
    use crate::fee::FeeRate;
    use crate::storage::memory::MemoryStorage;
    use crate::test_utils::{dummy_transaction_paying, MockChain};
    use crate::wallet::config::WalletConfig;
    use dashcore::Network;
    use std::sync::Arc;

    fn wallet_with_chain() -> (Wallet, Arc<MockChain>) {
        let chain = Arc::new(MockChain::with_height(10));
        chain.set_fee_rate(Some(FeeRate::per_kb(1_000)));
        let mut config = WalletConfig::default();
        config.keypool_size = 5;
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

    fn fund(wallet: &mut Wallet, chain: &MockChain, seed: u8, values: &[u64]) {
        let script = own_script(wallet);
        let outputs: Vec<(u64, ScriptBuf)> =
            values.iter().map(|v| (*v, script.clone())).collect();
        let tx = dummy_transaction_paying(seed, &outputs);
        let block = chain.push_block(vec![tx], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);
    }

    fn payee_script() -> ScriptBuf {
        let foreign = crate::keystore::KeyStore::new().generate_key_pair().pubkey;
        Address::p2pkh(&foreign, Network::Testnet).script_pubkey()
    }

    #[test]
    fn test_create_and_commit_transaction() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[COIN]);

        let recipients = vec![Recipient {
            script: payee_script(),
            amount: COIN / 4,
            subtract_fee: false,
        }];
        let created = wallet
            .create_transaction(&recipients, &CoinControl::default(), CoinType::All, true)
            .unwrap();

        assert!(created.fee > 0);
        assert_eq!(created.tx.input.len(), 1);
        // Payment + change.
        assert_eq!(created.tx.output.len(), 2);
        assert!(created.change_pos.is_some());
        // All inputs carry real signatures.
        assert!(created.tx.input.iter().all(|i| !i.script_sig.is_empty()));
        // Value is conserved: inputs = outputs + fee.
        let out_sum: u64 = created.tx.output.iter().map(|o| o.value).sum();
        assert_eq!(out_sum + created.fee, COIN);

        let txid = wallet
            .commit_transaction(
                created.tx.clone(),
                Default::default(),
                Vec::new(),
                String::new(),
                created.reserved_key,
            )
            .unwrap();
        assert!(wallet.store().contains(&txid));
        assert!(chain.accepted().contains(&txid));
        assert!(chain.relayed().contains(&txid));
    }

    #[test]
    fn test_insufficient_funds() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[10_000]);

        let recipients = vec![Recipient {
            script: payee_script(),
            amount: COIN,
            subtract_fee: false,
        }];
        let result =
            wallet.create_transaction(&recipients, &CoinControl::default(), CoinType::All, true);
        assert!(matches!(result, Err(WalletError::InsufficientFunds)));
        // The change-key reservation was returned on failure.
        assert_eq!(wallet.keypool.count(true), wallet.config.keypool_size);
    }

    #[test]
    fn test_subtract_fee_from_recipient() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[COIN]);

        let recipients = vec![Recipient {
            script: payee_script(),
            amount: COIN,
            subtract_fee: true,
        }];
        let created = wallet
            .create_transaction(&recipients, &CoinControl::default(), CoinType::All, true)
            .unwrap();
        // Whole balance spent: recipient got amount - fee, no change.
        assert_eq!(created.tx.output.len(), 1);
        assert_eq!(created.tx.output[0].value, COIN - created.fee);
    }

    #[test]
    fn test_locked_wallet_cannot_sign() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[COIN]);
        wallet.encrypt_wallet("pp").unwrap();

        let recipients = vec![Recipient {
            script: payee_script(),
            amount: COIN / 4,
            subtract_fee: false,
        }];
        let result =
            wallet.create_transaction(&recipients, &CoinControl::default(), CoinType::All, true);
        assert!(matches!(
            result,
            Err(WalletError::Keystore(crate::error::KeystoreError::Locked))
        ));

        wallet.unlock("pp", false).unwrap();
        let created = wallet
            .create_transaction(&recipients, &CoinControl::default(), CoinType::All, true)
            .unwrap();
        assert!(!created.tx.input[0].script_sig.is_empty());

        drop(created);
        wallet.lock();
        let result =
            wallet.create_transaction(&recipients, &CoinControl::default(), CoinType::All, true);
        assert!(result.is_err());
    }

    #[test]
    fn test_fee_estimation_fallback_policy() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[COIN]);
        chain.set_fee_rate(None);
        wallet.config.allow_fallback_fee = false;

        let recipients = vec![Recipient {
            script: payee_script(),
            amount: COIN / 4,
            subtract_fee: false,
        }];
        let result =
            wallet.create_transaction(&recipients, &CoinControl::default(), CoinType::All, true);
        assert!(matches!(result, Err(WalletError::FeeEstimationFailed)));

        wallet.config.allow_fallback_fee = true;
        assert!(wallet
            .create_transaction(&recipients, &CoinControl::default(), CoinType::All, true)
            .is_ok());
    }

    #[test]
    fn test_manual_coin_control_selection() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[COIN / 2, COIN]);

        // Find the COIN-valued outpoint.
        let coins = wallet.available_coins(&AvailableCoinsFilter::default(), None);
        let big = coins.iter().find(|c| c.value() == COIN).unwrap().outpoint;

        let mut cc = CoinControl::default();
        cc.select(big);
        let recipients = vec![Recipient {
            script: payee_script(),
            amount: COIN / 4,
            subtract_fee: false,
        }];
        let created = wallet
            .create_transaction(&recipients, &cc, CoinType::All, true)
            .unwrap();
        assert_eq!(created.tx.input.len(), 1);
        assert_eq!(created.tx.input[0].previous_output, big);
    }

    #[test]
    fn test_change_position_override() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[COIN]);

        let mut cc = CoinControl::default();
        cc.change_position = Some(0);
        let recipients = vec![Recipient {
            script: payee_script(),
            amount: COIN / 4,
            subtract_fee: false,
        }];
        let created =
            wallet.create_transaction(&recipients, &cc, CoinType::All, true).unwrap();
        assert_eq!(created.change_pos, Some(0));
        // The recipient output moved to index 1.
        assert_eq!(created.tx.output[1].value, COIN / 4);
    }

    #[test]
    fn test_fund_transaction_preserves_outputs() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[COIN]);

        let mut tx = Transaction {
            version: 2,
            lock_time: 0,
            input: Vec::new(),
            output: vec![TxOut {
                value: COIN / 5,
                script_pubkey: payee_script(),
            }],
            special_transaction_payload: None,
        };
        let (fee, change_pos) = wallet
            .fund_transaction(&mut tx, &[], &CoinControl::default(), true)
            .unwrap();
        assert!(fee > 0);
        assert!(!tx.input.is_empty());
        assert!(change_pos.is_some());
        // The funded inputs got locked.
        assert!(wallet.is_locked_coin(&tx.input[0].previous_output));
    }

    #[test]
    fn test_collateral_transaction() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[MIN_MIXING_COLLATERAL * 4]);

        let tx = wallet.create_collateral_transaction().unwrap();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, MIN_MIXING_COLLATERAL * 3);
        assert!(!tx.input[0].script_sig.is_empty());
    }

    #[test]
    fn test_long_chain_rejection() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[COIN]);

        // Spend once: the change output now sits unconfirmed in the
        // mempool.
        let recipients = vec![Recipient {
            script: payee_script(),
            amount: COIN / 4,
            subtract_fee: false,
        }];
        let created = wallet
            .create_transaction(&recipients, &CoinControl::default(), CoinType::All, true)
            .unwrap();
        let spend_txid = wallet
            .commit_transaction(
                created.tx,
                Default::default(),
                Vec::new(),
                String::new(),
                created.reserved_key,
            )
            .unwrap();
        // Pretend the mempool sees a deep unconfirmed ancestor chain.
        chain.set_ancestor_count(spend_txid, 30);

        wallet.config.reject_long_chains = true;
        let again = vec![Recipient {
            script: payee_script(),
            amount: COIN / 2,
            subtract_fee: false,
        }];
        let result =
            wallet.create_transaction(&again, &CoinControl::default(), CoinType::All, true);
        assert!(matches!(result, Err(WalletError::AncestorChainTooLong)));
    }
}
