//! Depth queries and spendable-output enumeration.

use std::collections::HashMap;

use dashcore::hashes::Hash;
use dashcore::secp256k1::SecretKey;
use dashcore::{Address, OutPoint, PublicKey, ScriptBuf, TxOut, Txid};
use tracing::debug;

use crate::coins::{AvailableCoinsFilter, CoinControl, CoinType, CompactTallyItem, Output};
use crate::denominations::{
    is_collateral_amount, is_denominated_amount, MASTERNODE_COLLATERAL, MAX_MONEY,
};
use crate::error::{Result, WalletError};
use crate::fee::P2PKH_INPUT_SIZE;
use crate::keystore::IsMine;
use crate::wallet_tx::TxState;

use super::balance::COINBASE_MATURITY;
use super::Wallet;

impl Wallet {
    // --- depth ------------------------------------------------------------

    /// Confirmations of a wallet transaction: positive in the main
    /// chain, 0 for mempool/unconfirmed, negative for conflicted, -1
    /// when abandoned or the conflicting block is unknown.
    pub fn depth(&self, txid: &Txid) -> i32 {
        let Some(wtx) = self.store.get(txid) else {
            return -1;
        };
        match &wtx.state {
            TxState::Unconfirmed => 0,
            TxState::Abandoned => -1,
            TxState::InBlock {
                block_hash, ..
            } => match self.chain.height_of(block_hash) {
                Some(height) => (self.chain.tip_height() as i64 - height as i64 + 1) as i32,
                // Block fell out of the main chain and no disconnect has
                // reached us yet.
                None => 0,
            },
            TxState::Conflicted {
                block_hash,
            } => match self.chain.height_of(block_hash) {
                Some(height) => {
                    -((self.chain.tip_height() as i64 - height as i64 + 1) as i32)
                }
                None => -1,
            },
        }
    }

    /// Blocks left until a coinbase matures; 0 for ordinary transactions.
    pub fn blocks_to_maturity(&self, txid: &Txid) -> i32 {
        let Some(wtx) = self.store.get(txid) else {
            return 0;
        };
        if !wtx.is_coinbase() {
            return 0;
        }
        (COINBASE_MATURITY + 1 - self.depth(txid)).max(0)
    }

    /// Whether a live wallet transaction spends `outpoint`. Abandoned and
    /// conflicted spenders do not count, so their inputs can be respent.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        let spenders: Vec<Txid> = self.store.spenders(outpoint).copied().collect();
        spenders.iter().any(|txid| self.depth(txid) >= 0)
    }

    // --- manual coin locking ----------------------------------------------

    pub fn lock_coin(&mut self, outpoint: OutPoint) {
        self.store.lock_coin(outpoint);
    }

    pub fn unlock_coin(&mut self, outpoint: &OutPoint) {
        self.store.unlock_coin(outpoint);
    }

    pub fn unlock_all_coins(&mut self) {
        self.store.unlock_all_coins();
    }

    pub fn is_locked_coin(&self, outpoint: &OutPoint) -> bool {
        self.store.is_locked_coin(outpoint)
    }

    pub fn list_locked_coins(&self) -> Vec<OutPoint> {
        self.store.locked_coins().copied().collect()
    }

    /// Wallet transactions that double-spend any input of `txid`.
    pub fn get_conflicts(&self, txid: &Txid) -> std::collections::BTreeSet<Txid> {
        self.store.conflicts(txid)
    }

    // --- signing-size estimation -----------------------------------------

    /// Worst-case size of `txout` as a fully signed input, `None` when we
    /// cannot sign it.
    pub fn max_signed_input_size(&self, txout: &TxOut) -> Option<usize> {
        let script = &txout.script_pubkey;
        if self.keystore.is_mine(script) != IsMine::Spendable {
            return None;
        }
        if script.is_p2pkh() {
            return Some(P2PKH_INPUT_SIZE);
        }
        if script.is_p2sh() {
            // Outpoint + sequence + script length, plus one signature
            // and the redeem script push.
            let redeem_len = self
                .keystore
                .get_script(&dashcore::ScriptHash::from_slice(&script.as_bytes()[2..22]).ok()?)
                .map(|s| s.len())?;
            return Some(40 + 1 + 73 + redeem_len + 3);
        }
        // Bare P2PK / multisig: outpoint + sequence + pushed signatures.
        Some(40 + 1 + 73 * script_signature_slots(script))
    }

    // --- enumeration ------------------------------------------------------

    /// Enumerate spendable outputs matching `filter`.
    pub fn available_coins(
        &mut self,
        filter: &AvailableCoinsFilter,
        coin_control: Option<&CoinControl>,
    ) -> Vec<Output> {
        let mut coins = Vec::new();
        let mut total = 0u64;
        let txids = self.store.txids();

        'txs: for txid in txids {
            let depth = self.depth(&txid);
            if depth < 0 {
                continue;
            }
            if depth < filter.min_depth || depth > filter.max_depth {
                continue;
            }
            // Unconfirmed coins must at least sit in the mempool.
            if depth == 0 && !self.chain.mempool_contains(&txid) {
                continue;
            }
            if self.blocks_to_maturity(&txid) > 0 {
                continue;
            }

            let safe = {
                let trusted = self.tx_is_trusted(&txid);
                let wtx = match self.store.get(&txid) {
                    Some(w) => w,
                    None => continue,
                };
                trusted
                    && !wtx.map_value.contains_key("replaced_by_txid")
                    && !wtx.map_value.contains_key("replaces_txid")
            };
            if filter.only_safe && !safe {
                continue;
            }

            let outputs: Vec<TxOut> = match self.store.get(&txid) {
                Some(w) => w.tx.output.clone(),
                None => continue,
            };
            for (vout, txout) in outputs.into_iter().enumerate() {
                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };

                let wanted = match filter.coin_type {
                    CoinType::All => true,
                    CoinType::OnlyDenominated => is_denominated_amount(txout.value),
                    CoinType::OnlyNonDenominated => {
                        !is_denominated_amount(txout.value)
                            && txout.value != MASTERNODE_COLLATERAL
                    }
                    CoinType::OnlyMasternodeCollateral => {
                        txout.value == MASTERNODE_COLLATERAL
                    }
                    CoinType::OnlyMixingCollateral => is_collateral_amount(txout.value),
                };
                if !wanted {
                    continue;
                }
                if txout.value < filter.min_amount || txout.value > filter.max_amount {
                    continue;
                }
                if let Some(cc) = coin_control {
                    if cc.has_selected() && !cc.allow_other_inputs && !cc.is_selected(&outpoint)
                    {
                        continue;
                    }
                }
                // Masternode funding deliberately sees locked coins.
                if filter.coin_type != CoinType::OnlyMasternodeCollateral
                    && self.store.is_locked_coin(&outpoint)
                {
                    continue;
                }
                if self.is_spent(&outpoint) {
                    continue;
                }

                let mine = self.is_mine_output(&txout);
                if mine == IsMine::No {
                    continue;
                }
                let allow_watch =
                    coin_control.map(|cc| cc.allow_watch_only).unwrap_or(false);
                if mine == IsMine::WatchOnly && !allow_watch && filter.coin_type != CoinType::All
                {
                    continue;
                }

                let input_bytes = self.max_signed_input_size(&txout);
                let spendable = mine == IsMine::Spendable && input_bytes.is_some();
                coins.push(Output {
                    outpoint,
                    txout: txout.clone(),
                    depth,
                    spendable,
                    solvable: mine != IsMine::No,
                    safe,
                    input_bytes,
                });
                total += txout.value;

                if filter.min_sum != MAX_MONEY && total >= filter.min_sum {
                    break 'txs;
                }
                if filter.max_count > 0 && coins.len() >= filter.max_count {
                    break 'txs;
                }
            }
        }

        debug!(count = coins.len(), total, "available coins enumerated");
        coins
    }

    /// Available and locked coins grouped by destination address.
    pub fn list_coins(&mut self) -> HashMap<Address, Vec<Output>> {
        let mut filter = AvailableCoinsFilter::default();
        filter.only_safe = false;
        let mut grouped: HashMap<Address, Vec<Output>> = HashMap::new();
        for output in self.available_coins(&filter, None) {
            if let Ok(address) =
                Address::from_script(&output.txout.script_pubkey, self.network())
            {
                grouped.entry(address).or_default().push(output);
            }
        }

        // Locked coins are reported too, even though enumeration skips
        // them.
        let locked: Vec<OutPoint> = self.store.locked_coins().copied().collect();
        for outpoint in locked {
            let Some(wtx) = self.store.get(&outpoint.txid) else {
                continue;
            };
            let Some(txout) = wtx.tx.output.get(outpoint.vout as usize).cloned() else {
                continue;
            };
            let depth = self.depth(&outpoint.txid);
            if depth < 0 || self.is_spent(&outpoint) {
                continue;
            }
            if self.is_mine_output(&txout) != IsMine::Spendable {
                continue;
            }
            if let Ok(address) = Address::from_script(&txout.script_pubkey, self.network()) {
                let input_bytes = self.max_signed_input_size(&txout);
                grouped.entry(address).or_default().push(Output {
                    outpoint,
                    txout,
                    depth,
                    spendable: true,
                    solvable: true,
                    safe: true,
                    input_bytes,
                });
            }
        }
        grouped
    }

    /// Available coins summed per destination, for the mixing subsystem.
    /// `anonymizable` excludes masternode collaterals and fully mixed
    /// outputs; `skip_denominated` excludes denominated outputs.
    pub fn select_coins_grouped_by_addresses(
        &mut self,
        skip_denominated: bool,
        anonymizable: bool,
        skip_unconfirmed: bool,
    ) -> Vec<CompactTallyItem> {
        let mut filter = AvailableCoinsFilter::default();
        filter.only_safe = skip_unconfirmed;
        let outputs = self.available_coins(&filter, None);

        let mixing_rounds = self.config.mixing_rounds;
        let mut tally: HashMap<Address, CompactTallyItem> = HashMap::new();
        for output in outputs {
            if !output.spendable {
                continue;
            }
            if skip_denominated && is_denominated_amount(output.value()) {
                continue;
            }
            if anonymizable {
                if output.value() == MASTERNODE_COLLATERAL {
                    continue;
                }
                if is_denominated_amount(output.value())
                    && self.outpoint_rounds(&output.outpoint) >= mixing_rounds
                {
                    continue;
                }
            }
            let Ok(address) =
                Address::from_script(&output.txout.script_pubkey, self.network())
            else {
                continue;
            };
            let item = tally.entry(address.clone()).or_insert_with(|| CompactTallyItem {
                address,
                amount: 0,
                outpoints: Vec::new(),
            });
            item.amount += output.value();
            item.outpoints.push(output.outpoint);
        }

        let mut items: Vec<CompactTallyItem> = tally.into_values().collect();
        items.sort_by(|a, b| b.amount.cmp(&a.amount));
        items
    }

    /// Number of unspent wallet outputs carrying exactly `amount`.
    pub fn count_inputs_with_amount(&mut self, amount: u64) -> usize {
        let mut filter = AvailableCoinsFilter::default();
        filter.only_safe = false;
        filter.min_amount = amount;
        filter.max_amount = amount;
        self.available_coins(&filter, None).len()
    }

    /// Whether any mixing-collateral-sized input is available.
    pub fn has_collateral_inputs(&mut self, only_confirmed: bool) -> bool {
        let mut filter = AvailableCoinsFilter::default();
        filter.only_safe = only_confirmed;
        filter.coin_type = CoinType::OnlyMixingCollateral;
        if only_confirmed {
            filter.min_depth = 1;
        }
        !self.available_coins(&filter, None).is_empty()
    }

    /// Locate a masternode collateral output and its keys.
    pub fn get_masternode_outpoint_and_keys(
        &mut self,
        wanted: Option<OutPoint>,
    ) -> Result<(OutPoint, PublicKey, SecretKey)> {
        let mut filter = AvailableCoinsFilter::default();
        filter.only_safe = false;
        filter.coin_type = CoinType::OnlyMasternodeCollateral;
        let outputs = self.available_coins(&filter, None);

        for output in outputs {
            if let Some(wanted) = wanted {
                if output.outpoint != wanted {
                    continue;
                }
            }
            let script = &output.txout.script_pubkey;
            if !script.is_p2pkh() {
                continue;
            }
            let hash = dashcore::PubkeyHash::from_slice(&script.as_bytes()[3..23])
                .map_err(|_| WalletError::General("malformed collateral script".into()))?;
            let pubkey = self
                .keystore
                .get_pubkey(&hash)
                .ok_or_else(|| WalletError::General("collateral key missing".into()))?;
            let secret = self.keystore.get_key(&hash, false)?;
            return Ok((output.outpoint, pubkey, secret));
        }
        Err(WalletError::General("no masternode collateral output found".into()))
    }
}

/// Number of signatures a bare script wants (1 for P2PK, `m` for
/// multisig).
fn script_signature_slots(script: &ScriptBuf) -> usize {
    let bytes = script.as_bytes();
    if let Some(first) = bytes.first() {
        if (0x51..=0x60).contains(first) {
            return (first - 0x50) as usize;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denominations::{COIN, STANDARD_DENOMINATIONS};
    use crate::storage::memory::MemoryStorage;
    use crate::test_utils::{dummy_transaction_paying, MockChain};
    use crate::wallet::config::WalletConfig;
    use dashcore::Network;
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

    fn fund(wallet: &mut Wallet, chain: &MockChain, seed: u8, values: &[u64]) -> Txid {
        let script = own_script(wallet);
        let outputs: Vec<(u64, ScriptBuf)> =
            values.iter().map(|v| (*v, script.clone())).collect();
        let tx = dummy_transaction_paying(seed, &outputs);
        let txid = tx.txid();
        let block = chain.push_block(vec![tx], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);
        txid
    }

    #[test]
    fn test_available_coins_basics() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[30_000, 70_000]);

        let coins = wallet.available_coins(&AvailableCoinsFilter::default(), None);
        assert_eq!(coins.len(), 2);
        assert!(coins.iter().all(|c| c.spendable && c.safe));
        assert!(coins.iter().all(|c| c.input_bytes == Some(P2PKH_INPUT_SIZE)));
        assert_eq!(coins.iter().map(|c| c.value()).sum::<u64>(), 100_000);
    }

    #[test]
    fn test_locked_coins_excluded() {
        let (mut wallet, chain) = wallet_with_chain();
        let txid = fund(&mut wallet, &chain, 1, &[30_000]);
        let outpoint = OutPoint {
            txid,
            vout: 0,
        };

        wallet.lock_coin(outpoint);
        assert!(wallet.available_coins(&AvailableCoinsFilter::default(), None).is_empty());
        wallet.unlock_coin(&outpoint);
        assert_eq!(wallet.available_coins(&AvailableCoinsFilter::default(), None).len(), 1);
    }

    #[test]
    fn test_coin_type_filters() {
        let (mut wallet, chain) = wallet_with_chain();
        let denom = STANDARD_DENOMINATIONS[0];
        fund(&mut wallet, &chain, 1, &[denom, MASTERNODE_COLLATERAL, 5 * COIN]);

        let mut filter = AvailableCoinsFilter::default();
        filter.coin_type = CoinType::OnlyDenominated;
        let denoms = wallet.available_coins(&filter, None);
        assert_eq!(denoms.len(), 1);
        assert_eq!(denoms[0].value(), denom);

        filter.coin_type = CoinType::OnlyMasternodeCollateral;
        let collaterals = wallet.available_coins(&filter, None);
        assert_eq!(collaterals.len(), 1);
        assert_eq!(collaterals[0].value(), MASTERNODE_COLLATERAL);

        filter.coin_type = CoinType::OnlyNonDenominated;
        let plain = wallet.available_coins(&filter, None);
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].value(), 5 * COIN);
    }

    #[test]
    fn test_depth_range_filter() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[10_000]);
        // Two more empty blocks: depth becomes 3.
        let b = chain.push_block(vec![], 0);
        wallet.block_connected(&b, chain.tip_height(), &[]);
        let b = chain.push_block(vec![], 0);
        wallet.block_connected(&b, chain.tip_height(), &[]);

        let mut filter = AvailableCoinsFilter::default();
        filter.min_depth = 4;
        assert!(wallet.available_coins(&filter, None).is_empty());
        filter.min_depth = 3;
        assert_eq!(wallet.available_coins(&filter, None).len(), 1);
    }

    #[test]
    fn test_coin_control_restriction() {
        let (mut wallet, chain) = wallet_with_chain();
        let txid = fund(&mut wallet, &chain, 1, &[10_000, 20_000]);

        let mut cc = CoinControl::default();
        cc.select(OutPoint {
            txid,
            vout: 1,
        });
        let coins = wallet.available_coins(&AvailableCoinsFilter::default(), Some(&cc));
        assert_eq!(coins.len(), 1);
        assert_eq!(coins[0].value(), 20_000);
    }

    #[test]
    fn test_tally_groups_by_address() {
        let (mut wallet, chain) = wallet_with_chain();
        let script = own_script(&mut wallet);
        let tx = dummy_transaction_paying(
            1,
            &[(30_000, script.clone()), (40_000, script.clone())],
        );
        let block = chain.push_block(vec![tx], 0);
        wallet.block_connected(&block, chain.tip_height(), &[]);

        let tally = wallet.select_coins_grouped_by_addresses(false, false, true);
        assert_eq!(tally.len(), 1);
        assert_eq!(tally[0].amount, 70_000);
        assert_eq!(tally[0].outpoints.len(), 2);
    }

    #[test]
    fn test_count_inputs_with_amount() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[10_000, 10_000, 20_000]);
        assert_eq!(wallet.count_inputs_with_amount(10_000), 2);
        assert_eq!(wallet.count_inputs_with_amount(99), 0);
    }

    #[test]
    fn test_masternode_outpoint_lookup() {
        let (mut wallet, chain) = wallet_with_chain();
        fund(&mut wallet, &chain, 1, &[MASTERNODE_COLLATERAL]);
        let (outpoint, pubkey, secret) =
            wallet.get_masternode_outpoint_and_keys(None).unwrap();
        assert_eq!(outpoint.vout, 0);
        let secp = dashcore::secp256k1::Secp256k1::new();
        assert_eq!(PublicKey::new(secret.public_key(&secp)), pubkey);
    }
}
