//! The wallet: a keystore extended with transaction tracking, balances
//! and transaction creation.
//!
//! All mutable state lives behind one lock owned by the host
//! (`Arc<Mutex<Wallet>>`); validation events, spend requests and the
//! background schedulers all serialize on it. The rescan flag is the one
//! exception: it sits in a small shared [`ScanState`] so a rescan can be
//! reserved and aborted without the wallet lock.

pub mod balance;
pub mod builder;
pub mod coins;
pub mod config;
pub mod sync;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use dashcore::hashes::Hash;
use dashcore::secp256k1::SecretKey;
use dashcore::{Address, BlockHash, Network, OutPoint, PubkeyHash, PublicKey, ScriptBuf};
use tracing::{debug, info, warn};

use crate::chain::{build_locator, ChainAccess};
use crate::error::{KeystoreError, Result, StorageError, WalletError};
use crate::events::{ChangeType, EventBus, WalletEvent};
use crate::hd_chain::{derive_child, HdChain};
use crate::keypool::{KeyPool, KeyPoolEntry, ReservedKey};
use crate::keystore::{KeyMetadata, KeyStore, StoredKey};
use crate::storage::records::{self, WalletTxRecord};
use crate::storage::{WalletStorage, WriteBatch};
use crate::tx_store::{AccountingEntry, TxStore};
use crate::wallet_tx::WalletTx;
use config::WalletConfig;

// Client version numbers for particular wallet features.
pub const FEATURE_BASE: u32 = 10500;
pub const FEATURE_WALLETCRYPT: u32 = 40000;
pub const FEATURE_COMPRPUBKEY: u32 = 60000;
pub const FEATURE_HD: u32 = 130000;
pub const FEATURE_HD_SPLIT: u32 = 139900;
pub const FEATURE_NO_DEFAULT_KEY: u32 = 159900;
pub const FEATURE_LATEST: u32 = FEATURE_NO_DEFAULT_KEY;

/// Label and purpose attached to a destination.
#[derive(Debug, Clone, Default)]
pub struct AddressBookEntry {
    pub label: String,
    pub purpose: String,
    pub dest_data: BTreeMap<String, String>,
}

/// Rescan coordination shared between the wallet and rescan reservers.
#[derive(Default)]
pub struct ScanState {
    scanning: Mutex<bool>,
    abort: AtomicBool,
}

impl ScanState {
    pub fn is_scanning(&self) -> bool {
        *self.scanning.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn abort_rescan(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborting(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }
}

/// Scoped reservation of the rescan-in-progress flag. Acquiring fails
/// while another rescan is active; dropping releases it.
pub struct RescanReserver {
    state: Arc<ScanState>,
    reserved: bool,
}

impl RescanReserver {
    pub fn new(state: Arc<ScanState>) -> Self {
        Self {
            state,
            reserved: false,
        }
    }

    pub fn reserve(&mut self) -> Result<()> {
        let mut scanning =
            self.state.scanning.lock().unwrap_or_else(PoisonError::into_inner);
        if *scanning {
            return Err(WalletError::ScanInProgress);
        }
        *scanning = true;
        self.reserved = true;
        Ok(())
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }
}

impl Drop for RescanReserver {
    fn drop(&mut self) {
        if self.reserved {
            let mut scanning =
                self.state.scanning.lock().unwrap_or_else(PoisonError::into_inner);
            *scanning = false;
        }
    }
}

pub(crate) fn unix_time() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A keystore plus transaction tracking, balances and the ability to
/// create new transactions.
pub struct Wallet {
    name: String,
    network: Network,
    pub config: WalletConfig,
    pub(crate) keystore: KeyStore,
    pub(crate) keypool: KeyPool,
    pub(crate) hd_chain: Option<HdChain>,
    pub(crate) store: TxStore,
    pub(crate) chain: Arc<dyn ChainAccess>,
    storage: Box<dyn WalletStorage>,
    pub events: EventBus,
    scan: Arc<ScanState>,

    address_book: HashMap<Address, AddressBookEntry>,
    pub(crate) key_metadata: BTreeMap<PubkeyHash, KeyMetadata>,
    /// Creation times for watch-only scripts, for rescans.
    pub(crate) watch_script_times: BTreeMap<ScriptBuf, u64>,

    version: u32,
    max_version: u32,
    pub(crate) time_first_key: Option<u64>,
    pub(crate) best_block: Option<BlockHash>,

    broadcast_transactions: bool,
    pub(crate) next_resend: u64,
    pub(crate) last_resend: u64,

    /// Countdown to the next automatic backup, decremented per handed-out
    /// key.
    pub(crate) keys_left_since_backup: i64,
    /// Memoized mixing-round depths, cleared by `mark_dirty`.
    pub(crate) rounds_cache: HashMap<OutPoint, i32>,
}

impl Wallet {
    /// An empty wallet bound to a node handle and a storage backend.
    pub fn new(
        name: impl Into<String>,
        network: Network,
        config: WalletConfig,
        storage: Box<dyn WalletStorage>,
        chain: Arc<dyn ChainAccess>,
    ) -> Self {
        Self {
            name: name.into(),
            network,
            config,
            keystore: KeyStore::new(),
            keypool: KeyPool::new(),
            hd_chain: None,
            store: TxStore::new(),
            chain,
            storage,
            events: EventBus::default(),
            scan: Arc::new(ScanState::default()),
            address_book: HashMap::new(),
            key_metadata: BTreeMap::new(),
            watch_script_times: BTreeMap::new(),
            version: FEATURE_BASE,
            max_version: FEATURE_LATEST,
            time_first_key: None,
            best_block: None,
            broadcast_transactions: true,
            next_resend: 0,
            last_resend: 0,
            keys_left_since_backup: 0,
            rounds_cache: HashMap::new(),
        }
    }

    /// Create a brand new HD wallet: fresh seed, split chains, keypool
    /// filled to target.
    pub fn create_new(
        name: impl Into<String>,
        network: Network,
        config: WalletConfig,
        storage: Box<dyn WalletStorage>,
        chain: Arc<dyn ChainAccess>,
    ) -> Result<Self> {
        let mut wallet = Self::new(name, network, config, storage, chain);
        wallet.set_min_version(FEATURE_NO_DEFAULT_KEY)?;
        let master_pubkey = wallet.generate_new_hd_master_key()?;
        wallet.set_hd_master_key(master_pubkey)?;
        wallet.top_up_keypool(None)?;
        wallet.keys_left_since_backup = wallet.config.auto_backup_threshold;
        info!(name = %wallet.name, "created new HD wallet");
        Ok(wallet)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn chain(&self) -> &Arc<dyn ChainAccess> {
        &self.chain
    }

    pub fn store(&self) -> &TxStore {
        &self.store
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    pub fn scan_state(&self) -> Arc<ScanState> {
        Arc::clone(&self.scan)
    }

    pub fn broadcast_transactions(&self) -> bool {
        self.broadcast_transactions
    }

    pub fn set_broadcast_transactions(&mut self, broadcast: bool) {
        self.broadcast_transactions = broadcast;
    }

    // --- feature versioning ----------------------------------------------

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn can_support_feature(&self, feature: u32) -> bool {
        self.max_version >= feature
    }

    /// Record that a feature is in use, raising the minimum version a
    /// client needs to read this wallet.
    pub fn set_min_version(&mut self, feature: u32) -> Result<()> {
        if self.version >= feature {
            return Ok(());
        }
        self.version = feature;
        self.max_version = self.max_version.max(feature);
        self.put(
            records::record_key(records::MIN_VERSION, &[]),
            records::serialize_value(&feature),
        )?;
        self.put(
            records::record_key(records::VERSION, &[]),
            records::serialize_value(&feature),
        )?;
        Ok(())
    }

    pub fn set_max_version(&mut self, version: u32) -> bool {
        if self.version > version {
            return false;
        }
        self.max_version = version;
        true
    }

    // --- persistence helpers ---------------------------------------------

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        crate::storage::put_record(self.storage.as_mut(), key, value)?;
        Ok(())
    }

    pub(crate) fn erase(&mut self, key: Vec<u8>) -> Result<()> {
        crate::storage::erase_record(self.storage.as_mut(), key)?;
        Ok(())
    }

    pub(crate) fn commit_batch(&mut self, batch: WriteBatch) -> Result<()> {
        self.storage.write_batch(batch)?;
        Ok(())
    }

    pub fn storage(&self) -> &dyn WalletStorage {
        self.storage.as_ref()
    }

    pub fn storage_mut(&mut self) -> &mut dyn WalletStorage {
        self.storage.as_mut()
    }

    pub(crate) fn persist_wallet_tx(&mut self, wtx: &WalletTx) -> Result<()> {
        let key = records::record_key(records::TX, &records::txid_suffix(&wtx.txid()));
        let value = records::serialize_value(&WalletTxRecord(wtx.clone()));
        self.put(key, value)
    }

    pub(crate) fn persist_order_pos_next(&mut self) -> Result<()> {
        let next = self.store.next_order_pos();
        self.put(
            records::record_key(records::ORDER_POS_NEXT, &[]),
            records::serialize_value(&next),
        )
    }

    pub(crate) fn persist_hd_chain(&mut self) -> Result<()> {
        if let Some(chain) = self.hd_chain.clone() {
            self.put(
                records::record_key(records::HD_CHAIN, &[]),
                records::serialize_value(&records::HdChainRecord(chain)),
            )?;
        }
        Ok(())
    }

    pub(crate) fn persist_best_block(&mut self) -> Result<()> {
        let locator = build_locator(self.chain.as_ref());
        self.put(
            records::record_key(records::BEST_BLOCK, &[]),
            records::serialize_value(&records::BestBlockRecord(locator)),
        )
    }

    /// Serialize the database to `dest`; writes are excluded by the
    /// wallet lock the caller holds.
    pub fn backup(&self, dest: &Path) -> Result<()> {
        self.storage.backup(dest)?;
        info!(dest = %dest.display(), "wallet backed up");
        Ok(())
    }

    // --- key management ---------------------------------------------------

    pub fn is_hd_enabled(&self) -> bool {
        self.hd_chain.is_some()
    }

    pub fn hd_chain(&self) -> Option<&HdChain> {
        self.hd_chain.as_ref()
    }

    /// Generate a new HD seed key and store it (encrypted if the wallet
    /// is). Does not activate it; see [`set_hd_master_key`](Self::set_hd_master_key).
    pub fn generate_new_hd_master_key(&mut self) -> Result<PublicKey> {
        let pair = self.keystore.generate_key_pair();
        let pubkey = pair.pubkey;
        let metadata = KeyMetadata {
            create_time: unix_time(),
            hd_key_path: None,
            internal: false,
        };
        self.add_key_with_metadata(pair.secret, pubkey, metadata)?;
        Ok(pubkey)
    }

    /// Activate `master` as the HD seed, resetting the chain counters.
    /// Requires the seed key to already be in the keystore.
    pub fn set_hd_master_key(&mut self, master: PublicKey) -> Result<()> {
        let id = master.pubkey_hash();
        if !self.keystore.have_key(&id) {
            return Err(KeystoreError::KeyNotFound.into());
        }
        let split = self.can_support_feature(FEATURE_HD_SPLIT);
        self.set_min_version(if split {
            FEATURE_HD_SPLIT
        } else {
            FEATURE_HD
        })?;
        self.hd_chain = Some(HdChain::new(id, split));
        self.persist_hd_chain()?;
        Ok(())
    }

    /// Store a key pair plus metadata, persisting the matching records.
    pub fn add_key_with_metadata(
        &mut self,
        secret: SecretKey,
        pubkey: PublicKey,
        metadata: KeyMetadata,
    ) -> Result<()> {
        let id = pubkey.pubkey_hash();
        self.update_time_first_key(metadata.create_time);

        let stored = self.keystore.add_key(secret, pubkey)?;
        let mut batch = WriteBatch::new();
        match stored {
            StoredKey::Plain => {
                let secret_bytes = secret.secret_bytes().to_vec();
                batch.put(
                    records::record_key(records::KEY, &pubkey.to_bytes()),
                    records::serialize_value(&records::BytesRecord(secret_bytes)),
                );
            }
            StoredKey::Crypted(ciphertext) => {
                batch.put(
                    records::record_key(records::CRYPTED_KEY, &pubkey.to_bytes()),
                    records::serialize_value(&records::BytesRecord(ciphertext)),
                );
            }
        }
        batch.put(
            records::record_key(records::KEY_META, &pubkey.to_bytes()),
            records::serialize_value(&records::KeyMetadataRecord(metadata.clone())),
        );
        self.commit_batch(batch)?;
        self.key_metadata.insert(id, metadata);
        Ok(())
    }

    /// Derive the next child key on the requested lane of the HD chain.
    pub fn derive_new_child_key(&mut self, internal: bool) -> Result<PublicKey> {
        let chain = self.hd_chain.clone().ok_or_else(|| {
            WalletError::General("HD derivation requested on a non-HD wallet".into())
        })?;
        let seed_secret = self.keystore.get_key(&chain.master_key_id, false)?;
        let use_internal = internal && chain.uses_split();

        let mut chain = chain;
        let index = chain.next_child_index(internal);
        let child = derive_child(
            self.keystore.secp(),
            &seed_secret,
            self.network,
            internal,
            index,
            chain.uses_split(),
        )?;

        let metadata = KeyMetadata {
            create_time: unix_time(),
            hd_key_path: Some(child.path.clone()),
            internal: use_internal,
        };
        self.add_key_with_metadata(child.secret, child.pubkey, metadata)?;
        self.hd_chain = Some(chain);
        self.persist_hd_chain()?;
        Ok(child.pubkey)
    }

    /// A new key for the requested lane: HD derivation when enabled,
    /// random otherwise.
    pub fn generate_new_key(&mut self, internal: bool) -> Result<PublicKey> {
        if self.is_hd_enabled() {
            self.derive_new_child_key(internal)
        } else {
            let pair = self.keystore.generate_key_pair();
            let pubkey = pair.pubkey;
            let metadata = KeyMetadata {
                create_time: unix_time(),
                hd_key_path: None,
                internal,
            };
            self.add_key_with_metadata(pair.secret, pubkey, metadata)?;
            Ok(pubkey)
        }
    }

    pub(crate) fn update_time_first_key(&mut self, create_time: u64) {
        let effective = if create_time == 0 {
            1
        } else {
            create_time
        };
        match self.time_first_key {
            Some(current) if current <= effective => {}
            _ => self.time_first_key = Some(effective),
        }
    }

    pub fn time_first_key(&self) -> Option<u64> {
        self.time_first_key
    }

    // --- keypool ---------------------------------------------------------

    /// Fill both lanes up to the target size. Fails with `Locked` on an
    /// encrypted, locked wallet.
    pub fn top_up_keypool(&mut self, target: Option<usize>) -> Result<()> {
        if self.keystore.is_locked(false) {
            return Err(KeystoreError::Locked.into());
        }
        let target = target.unwrap_or(self.config.keypool_size).max(1);
        let split = self.can_support_feature(FEATURE_HD_SPLIT);

        let missing_external = target.saturating_sub(self.keypool.count(false));
        let missing_internal = if split {
            target.saturating_sub(self.keypool.count(true))
        } else {
            0
        };

        for lane_internal in [false, true] {
            let missing = if lane_internal {
                missing_internal
            } else {
                missing_external
            };
            for _ in 0..missing {
                let pubkey = self.generate_new_key(lane_internal)?;
                let index = self.keypool.next_index();
                let entry = KeyPoolEntry {
                    time: unix_time(),
                    pubkey,
                    internal: lane_internal,
                };
                self.put(
                    records::record_key(records::POOL, &records::pool_suffix(index)),
                    records::serialize_value(&records::PoolRecord(entry.clone())),
                )?;
                self.keypool.insert(index, entry);
            }
        }
        if missing_external + missing_internal > 0 {
            debug!(
                external = self.keypool.count(false),
                internal = self.keypool.count(true),
                "keypool topped up"
            );
        }
        Ok(())
    }

    /// Reserve a key from the requested lane, topping up first. Pre-split
    /// wallets serve change reservations from the external lane.
    pub fn reserve_key(&mut self, internal: bool) -> Result<ReservedKey> {
        let lane_internal = internal && self.can_support_feature(FEATURE_HD_SPLIT);
        if self.keypool.count(lane_internal) == 0 {
            self.top_up_keypool(None)?;
        }
        self.keypool
            .reserve(lane_internal)
            .ok_or_else(|| WalletError::General("keypool ran out of keys".into()))
    }

    /// Commit a reservation: erase the pool record and count down to the
    /// next automatic backup.
    pub fn keep_reserved(&mut self, reserved: ReservedKey) -> Result<()> {
        if let Some(index) = reserved.keep() {
            self.erase(records::record_key(records::POOL, &records::pool_suffix(index)))?;
            self.keys_left_since_backup -= 1;
            debug!(index, "keypool key kept");
        }
        Ok(())
    }

    /// Reserve-and-keep in one step; used for receive addresses.
    pub fn get_key_from_pool(&mut self, internal: bool) -> Result<PublicKey> {
        let reserved = self.reserve_key(internal)?;
        let pubkey = reserved
            .pubkey()
            .ok_or_else(|| WalletError::General("reservation lost its key".into()))?;
        self.keep_reserved(reserved)?;
        Ok(pubkey)
    }

    /// Discard every pool entry at or below `through` (both lanes); used
    /// after a rescan discovers the pool was behind a restored backup.
    pub fn mark_reserve_keys_as_used(&mut self, through: i64) -> Result<()> {
        let removed = self.keypool.mark_used_through(through);
        for index in &removed {
            self.erase(records::record_key(records::POOL, &records::pool_suffix(*index)))?;
        }
        if !removed.is_empty() {
            self.keys_left_since_backup -= removed.len() as i64;
            warn!(through, count = removed.len(), "marked keypool entries as used");
        }
        Ok(())
    }

    /// Wipe and refill the pool (e.g. after encryption or a zap).
    pub fn new_keypool(&mut self) -> Result<()> {
        for index in self.keypool.clear() {
            self.erase(records::record_key(records::POOL, &records::pool_suffix(index)))?;
        }
        self.top_up_keypool(None)
    }

    pub fn keypool_size(&self) -> usize {
        self.keypool.size()
    }

    pub fn keypool_count_external(&self) -> usize {
        self.keypool.count_external()
    }

    pub fn oldest_keypool_time(&self) -> Option<u64> {
        self.keypool.oldest_time()
    }

    /// Keypool index assigned to `key`, if it came from the pool.
    pub fn keypool_index_of(&self, key: &PubkeyHash) -> Option<i64> {
        self.keypool.index_of(key)
    }

    /// Whether an automatic backup is due, and reset the countdown if so.
    pub(crate) fn auto_backup_due(&mut self) -> bool {
        if self.config.auto_backup_threshold <= 0 {
            return false;
        }
        if self.keys_left_since_backup <= 0 {
            self.keys_left_since_backup = self.config.auto_backup_threshold;
            return true;
        }
        false
    }

    // --- encryption -------------------------------------------------------

    pub fn is_crypted(&self) -> bool {
        self.keystore.is_crypted()
    }

    pub fn is_locked(&self) -> bool {
        self.keystore.is_locked(false)
    }

    /// Encrypt the wallet under `passphrase`. Ciphertext is persisted
    /// before plaintext records are erased; with HD enabled a fresh seed
    /// replaces the old one for future derivation, and the keypool is
    /// regenerated from it. Leaves the wallet locked.
    pub fn encrypt_wallet(&mut self, passphrase: &str) -> Result<()> {
        let output = self.keystore.encrypt(passphrase)?;

        let mut batch = WriteBatch::new();
        batch.put(
            records::record_key(records::MASTER_KEY, &records::mkey_suffix(output.master_key_id)),
            records::serialize_value(&records::MasterKeyRecord(output.master_key.clone())),
        );
        for (_, pubkey, ciphertext) in &output.crypted_keys {
            batch.put(
                records::record_key(records::CRYPTED_KEY, &pubkey.to_bytes()),
                records::serialize_value(&records::BytesRecord(ciphertext.clone())),
            );
            batch.erase(records::record_key(records::KEY, &pubkey.to_bytes()));
        }
        self.commit_batch(batch)?;
        self.set_min_version(FEATURE_WALLETCRYPT)?;

        if self.is_hd_enabled() {
            // Future derivation moves to a seed that never existed in
            // plaintext on disk; legacy keys stay usable.
            let new_master = self.generate_new_hd_master_key()?;
            self.set_hd_master_key(new_master)?;
        }
        self.new_keypool()?;
        self.keystore.lock();
        info!(name = %self.name, "wallet encrypted");
        Ok(())
    }

    pub fn unlock(&mut self, passphrase: &str, mixing_only: bool) -> Result<()> {
        self.keystore.unlock(passphrase, mixing_only)?;
        debug!(mixing_only, "wallet unlocked");
        Ok(())
    }

    pub fn lock(&mut self) {
        self.keystore.lock();
    }

    /// Schedule (or clear) a timestamp at which the maintenance task
    /// relocks the wallet.
    pub fn set_relock_time(&mut self, at: Option<u64>) {
        self.keystore.set_relock_at(at);
    }

    pub fn relock_time(&self) -> Option<u64> {
        self.keystore.relock_at()
    }

    pub fn change_passphrase(&mut self, old: &str, new: &str) -> Result<()> {
        let updated = self.keystore.change_passphrase(old, new)?;
        let mut batch = WriteBatch::new();
        for (id, mkey) in updated {
            batch.put(
                records::record_key(records::MASTER_KEY, &records::mkey_suffix(id)),
                records::serialize_value(&records::MasterKeyRecord(mkey)),
            );
        }
        self.commit_batch(batch)?;
        Ok(())
    }

    // --- scripts & watch-only --------------------------------------------

    pub fn add_script(&mut self, script: ScriptBuf) -> Result<()> {
        self.put(
            records::record_key(records::SCRIPT, script.script_hash().as_byte_array()),
            records::serialize_value(&records::BytesRecord(script.to_bytes())),
        )?;
        self.keystore.add_script(script);
        Ok(())
    }

    pub fn add_watch_only(&mut self, script: ScriptBuf, create_time: u64) -> Result<()> {
        self.put(
            records::record_key(records::WATCH_ONLY, script.as_bytes()),
            records::serialize_value(&create_time),
        )?;
        self.update_time_first_key(create_time);
        self.watch_script_times.insert(script.clone(), create_time);
        if self.keystore.add_watch_only(script) {
            self.events.emit(WalletEvent::WatchOnlyChanged {
                have_watch_only: true,
            });
        }
        Ok(())
    }

    pub fn remove_watch_only(&mut self, script: &ScriptBuf) -> Result<()> {
        self.erase(records::record_key(records::WATCH_ONLY, script.as_bytes()))?;
        self.watch_script_times.remove(script);
        if self.keystore.remove_watch_only(script) && !self.keystore.have_watch_only() {
            self.events.emit(WalletEvent::WatchOnlyChanged {
                have_watch_only: false,
            });
        }
        Ok(())
    }

    // --- address book -----------------------------------------------------

    pub fn set_address_book(
        &mut self,
        address: &Address,
        label: &str,
        purpose: &str,
    ) -> Result<()> {
        let is_new = !self.address_book.contains_key(address);
        let entry = self.address_book.entry(address.clone()).or_default();
        entry.label = label.to_string();
        if !purpose.is_empty() {
            entry.purpose = purpose.to_string();
        }

        let suffix = records::string_suffix(&address.to_string());
        let mut batch = WriteBatch::new();
        batch.put(
            records::record_key(records::NAME, &suffix),
            records::serialize_value(&records::StringRecord(label.to_string())),
        );
        if !purpose.is_empty() {
            batch.put(
                records::record_key(records::PURPOSE, &suffix),
                records::serialize_value(&records::StringRecord(purpose.to_string())),
            );
        }
        self.commit_batch(batch)?;

        let is_mine = self.keystore.is_mine(&address.script_pubkey())
            != crate::keystore::IsMine::No;
        self.events.emit(WalletEvent::AddressBookChanged {
            address: address.clone(),
            label: label.to_string(),
            purpose: purpose.to_string(),
            is_mine,
            status: if is_new {
                ChangeType::Added
            } else {
                ChangeType::Updated
            },
        });
        Ok(())
    }

    pub fn del_address_book(&mut self, address: &Address) -> Result<()> {
        let removed = self.address_book.remove(address);
        let suffix = records::string_suffix(&address.to_string());
        let mut batch = WriteBatch::new();
        batch.erase(records::record_key(records::NAME, &suffix));
        batch.erase(records::record_key(records::PURPOSE, &suffix));
        if let Some(entry) = &removed {
            for key in entry.dest_data.keys() {
                batch.erase(records::destdata_key(&address.to_string(), key));
            }
        }
        self.commit_batch(batch)?;

        let is_mine = self.keystore.is_mine(&address.script_pubkey())
            != crate::keystore::IsMine::No;
        self.events.emit(WalletEvent::AddressBookChanged {
            address: address.clone(),
            label: removed.map(|e| e.label).unwrap_or_default(),
            purpose: String::new(),
            is_mine,
            status: ChangeType::Removed,
        });
        Ok(())
    }

    pub fn address_book(&self) -> &HashMap<Address, AddressBookEntry> {
        &self.address_book
    }

    pub fn add_dest_data(&mut self, address: &Address, key: &str, value: &str) -> Result<()> {
        self.put(
            records::destdata_key(&address.to_string(), key),
            records::serialize_value(&records::StringRecord(value.to_string())),
        )?;
        self.address_book
            .entry(address.clone())
            .or_default()
            .dest_data
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get_dest_data(&self, address: &Address, key: &str) -> Option<&String> {
        self.address_book.get(address).and_then(|e| e.dest_data.get(key))
    }

    // --- accounting (legacy) ----------------------------------------------

    /// Record an internal transfer pair, debiting `from` and crediting
    /// `to`. Legacy feature, kept for old wallets.
    pub fn account_move(
        &mut self,
        from: &str,
        to: &str,
        amount: u64,
        comment: &str,
    ) -> Result<()> {
        let now = unix_time();
        let debit = AccountingEntry {
            account: from.to_string(),
            credit_debit: -(amount as i64),
            time: now,
            other_account: to.to_string(),
            comment: comment.to_string(),
            map_value: BTreeMap::new(),
            order_pos: -1,
            entry_no: self.store.next_accounting_entry_number(),
        };
        self.add_accounting_entry(debit)?;
        let credit = AccountingEntry {
            account: to.to_string(),
            credit_debit: amount as i64,
            time: now,
            other_account: from.to_string(),
            comment: comment.to_string(),
            map_value: BTreeMap::new(),
            order_pos: -1,
            entry_no: self.store.next_accounting_entry_number(),
        };
        self.add_accounting_entry(credit)?;
        Ok(())
    }

    pub fn add_accounting_entry(&mut self, entry: AccountingEntry) -> Result<()> {
        let account = entry.account.clone();
        let entry_no = entry.entry_no;
        let record = records::AccountingEntryRecord(entry.clone());
        self.put(records::acentry_key(&account, entry_no), records::serialize_value(&record))?;
        self.store.add_accounting(entry);
        self.persist_order_pos_next()?;
        Ok(())
    }

    pub fn account_entries(&self, account: &str) -> Vec<&AccountingEntry> {
        self.store.accounting_entries().filter(|e| e.account == account).collect()
    }

    // --- load -------------------------------------------------------------

    /// Load a wallet from its database. Refuses databases written by
    /// newer software.
    pub fn load(
        name: impl Into<String>,
        network: Network,
        config: WalletConfig,
        storage: Box<dyn WalletStorage>,
        chain: Arc<dyn ChainAccess>,
    ) -> Result<Self> {
        let mut wallet = Self::new(name, network, config, storage, chain);
        wallet.load_records()?;
        info!(
            name = %wallet.name,
            txs = wallet.store.len(),
            keys = wallet.keystore.key_count(),
            "wallet loaded"
        );
        Ok(wallet)
    }

    fn load_records(&mut self) -> Result<()> {
        // Version gate first: refuse anything newer than we understand.
        if let Some(bytes) =
            self.storage.read(&records::record_key(records::MIN_VERSION, &[]))?
        {
            let min_version: u32 = records::deserialize_value(&bytes)?;
            if min_version > FEATURE_LATEST {
                return Err(StorageError::TooNew(min_version).into());
            }
            self.version = min_version.max(FEATURE_BASE);
            self.max_version = self.max_version.max(self.version);
        }

        // Master keys before crypted keys so the keystore flips to the
        // encrypted state before any unlock attempt.
        for (key, value) in
            self.storage.iter_prefix(&records::record_key(records::MASTER_KEY, &[]))?
        {
            let id =
                records::parse_mkey_suffix(records::key_suffix(&key, records::MASTER_KEY))?;
            let record: records::MasterKeyRecord = records::deserialize_value(&value)?;
            self.keystore.load_master_key(id, record.0);
        }

        for (key, value) in self.storage.iter_prefix(&records::record_key(records::KEY, &[]))? {
            let pubkey =
                records::parse_pubkey_suffix(records::key_suffix(&key, records::KEY))?;
            let record: records::BytesRecord = records::deserialize_value(&value)?;
            let secret_bytes: [u8; 32] = record.0.as_slice().try_into().map_err(|_| {
                StorageError::Corruption("private key record has wrong length".into())
            })?;
            let secret = SecretKey::from_byte_array(&secret_bytes)
                .map_err(|_| StorageError::Corruption("invalid private key record".into()))?;
            self.keystore.load_key(secret, pubkey);
        }

        for (key, value) in
            self.storage.iter_prefix(&records::record_key(records::CRYPTED_KEY, &[]))?
        {
            let pubkey =
                records::parse_pubkey_suffix(records::key_suffix(&key, records::CRYPTED_KEY))?;
            let record: records::BytesRecord = records::deserialize_value(&value)?;
            self.keystore.load_crypted_key(pubkey, record.0);
        }

        for (key, value) in
            self.storage.iter_prefix(&records::record_key(records::KEY_META, &[]))?
        {
            let pubkey =
                records::parse_pubkey_suffix(records::key_suffix(&key, records::KEY_META))?;
            let record: records::KeyMetadataRecord = records::deserialize_value(&value)?;
            self.update_time_first_key(record.0.create_time);
            self.key_metadata.insert(pubkey.pubkey_hash(), record.0);
        }

        for (_, value) in self.storage.iter_prefix(&records::record_key(records::SCRIPT, &[]))? {
            let record: records::BytesRecord = records::deserialize_value(&value)?;
            self.keystore.add_script(ScriptBuf::from(record.0));
        }

        for (key, value) in
            self.storage.iter_prefix(&records::record_key(records::WATCH_ONLY, &[]))?
        {
            let script =
                ScriptBuf::from(records::key_suffix(&key, records::WATCH_ONLY).to_vec());
            let create_time: u64 = records::deserialize_value(&value)?;
            self.update_time_first_key(create_time);
            self.watch_script_times.insert(script.clone(), create_time);
            self.keystore.add_watch_only(script);
        }

        if let Some(bytes) = self.storage.read(&records::record_key(records::HD_CHAIN, &[]))? {
            let record: records::HdChainRecord = records::deserialize_value(&bytes)?;
            self.hd_chain = Some(record.0);
        }

        for (key, value) in self.storage.iter_prefix(&records::record_key(records::POOL, &[]))? {
            let index = records::parse_pool_suffix(records::key_suffix(&key, records::POOL))?;
            let record: records::PoolRecord = records::deserialize_value(&value)?;
            self.keypool.load_entry(index, record.0);
        }

        if let Some(bytes) =
            self.storage.read(&records::record_key(records::ORDER_POS_NEXT, &[]))?
        {
            let next: i64 = records::deserialize_value(&bytes)?;
            self.store.observe_order_pos(next - 1);
        }

        for (_, value) in self.storage.iter_prefix(&records::record_key(records::TX, &[]))? {
            let record: WalletTxRecord = records::deserialize_value(&value)?;
            self.store.insert(record.0);
        }

        for (key, value) in
            self.storage.iter_prefix(&records::record_key(records::ACCOUNTING_ENTRY, &[]))?
        {
            let (account, entry_no) = records::parse_acentry_suffix(records::key_suffix(
                &key,
                records::ACCOUNTING_ENTRY,
            ))?;
            let mut record: records::AccountingEntryRecord =
                records::deserialize_value(&value)?;
            record.0.account = account;
            record.0.entry_no = entry_no;
            self.store.add_accounting(record.0);
        }

        for (key, value) in self.storage.iter_prefix(&records::record_key(records::NAME, &[]))? {
            let dest =
                records::parse_string_suffix(records::key_suffix(&key, records::NAME))?;
            let record: records::StringRecord = records::deserialize_value(&value)?;
            if let Some(address) = parse_address(&dest, self.network) {
                self.address_book.entry(address).or_default().label = record.0;
            }
        }

        for (key, value) in
            self.storage.iter_prefix(&records::record_key(records::PURPOSE, &[]))?
        {
            let dest =
                records::parse_string_suffix(records::key_suffix(&key, records::PURPOSE))?;
            let record: records::StringRecord = records::deserialize_value(&value)?;
            if let Some(address) = parse_address(&dest, self.network) {
                self.address_book.entry(address).or_default().purpose = record.0;
            }
        }

        for (key, value) in
            self.storage.iter_prefix(&records::record_key(records::DEST_DATA, &[]))?
        {
            let (dest, data_key) = records::parse_destdata_suffix(records::key_suffix(
                &key,
                records::DEST_DATA,
            ))?;
            let record: records::StringRecord = records::deserialize_value(&value)?;
            if let Some(address) = parse_address(&dest, self.network) {
                self.address_book
                    .entry(address)
                    .or_default()
                    .dest_data
                    .insert(data_key, record.0);
            }
        }

        if let Some(bytes) =
            self.storage.read(&records::record_key(records::BEST_BLOCK, &[]))?
        {
            let record: records::BestBlockRecord = records::deserialize_value(&bytes)?;
            self.best_block = record.0.first().copied();
        }

        if self.store.needs_reorder() {
            warn!("wallet transactions out of order; reordering");
            self.store.reorder_transactions();
            let txids = self.store.txids();
            for txid in txids {
                if let Some(wtx) = self.store.get(&txid).cloned() {
                    self.persist_wallet_tx(&wtx)?;
                }
            }
            self.persist_order_pos_next()?;
        }

        Ok(())
    }

    /// Delete every wallet transaction (keys and metadata stay). Returns
    /// the removed transactions.
    pub fn zap_wallet_txs(&mut self) -> Result<Vec<WalletTx>> {
        let txids = self.store.txids();
        let mut removed = Vec::with_capacity(txids.len());
        let mut batch = WriteBatch::new();
        for txid in txids {
            if let Some(wtx) = self.store.remove(&txid) {
                batch.erase(records::record_key(records::TX, &records::txid_suffix(&txid)));
                removed.push(wtx);
            }
        }
        self.commit_batch(batch)?;
        self.rounds_cache.clear();
        Ok(removed)
    }
}

fn parse_address(s: &str, network: Network) -> Option<Address> {
    s.parse::<dashcore::Address<dashcore::address::NetworkUnchecked>>()
        .ok()
        .and_then(|a| a.require_network(network).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::test_utils::MockChain;

    fn new_wallet() -> Wallet {
        let chain = Arc::new(MockChain::with_height(10));
        let mut config = WalletConfig::default();
        config.keypool_size = 5;
        Wallet::create_new("test", Network::Testnet, config, Box::new(MemoryStorage::new()), chain)
            .unwrap()
    }

    #[test]
    fn test_create_new_fills_keypool() {
        let wallet = new_wallet();
        assert!(wallet.is_hd_enabled());
        assert_eq!(wallet.keypool_count_external(), 5);
        assert_eq!(wallet.keypool_size(), 10);
        assert!(wallet.version() >= FEATURE_HD_SPLIT);
    }

    #[test]
    fn test_keypool_exhaustion_triggers_top_up() {
        let mut wallet = new_wallet();
        // Keep all five external keys.
        let mut last_index = 0;
        for _ in 0..5 {
            let reserved = wallet.reserve_key(false).unwrap();
            last_index = reserved.index().unwrap();
            wallet.keep_reserved(reserved).unwrap();
        }
        assert_eq!(wallet.keypool_count_external(), 0);

        // The next reservation tops the pool up and hands out the next
        // index.
        let reserved = wallet.reserve_key(false).unwrap();
        assert!(reserved.index().unwrap() > last_index);
        assert_eq!(wallet.keypool_count_external(), 4);
    }

    #[test]
    fn test_pool_key_is_spendable() {
        let chain = Arc::new(MockChain::with_height(5));
        let mut config = WalletConfig::default();
        config.keypool_size = 2;
        let mut wallet = Wallet::create_new(
            "w",
            Network::Testnet,
            config.clone(),
            Box::new(MemoryStorage::new()),
            chain,
        )
        .unwrap();
        let pubkey = wallet.get_key_from_pool(false).unwrap();
        let id = pubkey.pubkey_hash();
        assert!(wallet.keystore().have_key(&id));
        assert!(wallet.keystore().get_key(&id, false).is_ok());
    }

    #[test]
    fn test_encrypt_wallet_cycle() {
        let mut wallet = new_wallet();
        let pubkey = wallet.get_key_from_pool(false).unwrap();
        let id = pubkey.pubkey_hash();

        wallet.encrypt_wallet("passphrase").unwrap();
        assert!(wallet.is_crypted());
        assert!(wallet.is_locked());
        assert!(wallet.keystore().get_key(&id, false).is_err());
        assert!(wallet.version() >= FEATURE_WALLETCRYPT);

        wallet.unlock("passphrase", false).unwrap();
        assert!(wallet.keystore().get_key(&id, false).is_ok());
        wallet.lock();
        assert!(wallet.is_locked());
    }

    #[test]
    fn test_encrypted_reload_keeps_keys() {
        let chain = Arc::new(MockChain::with_height(5));
        let mut config = WalletConfig::default();
        config.keypool_size = 2;
        let mut wallet = Wallet::create_new(
            "w",
            Network::Testnet,
            config.clone(),
            Box::new(MemoryStorage::new()),
            Arc::clone(&chain) as Arc<dyn ChainAccess>,
        )
        .unwrap();
        let pubkey = wallet.get_key_from_pool(false).unwrap();
        wallet.encrypt_wallet("pp").unwrap();

        // Move the storage into a freshly loaded wallet.
        let storage = std::mem::replace(&mut wallet.storage, Box::new(MemoryStorage::new()));
        let mut reloaded =
            Wallet::load("w", Network::Testnet, config, storage, chain).unwrap();
        assert!(reloaded.is_crypted());
        assert!(reloaded.is_locked());
        reloaded.unlock("pp", false).unwrap();
        assert!(reloaded.keystore().get_key(&pubkey.pubkey_hash(), false).is_ok());
    }

    #[test]
    fn test_mark_reserve_keys_as_used() {
        let mut wallet = new_wallet();
        let next = wallet.keypool.next_index();
        wallet.mark_reserve_keys_as_used(next - 3).unwrap();
        assert!(wallet.keypool_size() < 10);
    }

    #[test]
    fn test_rescan_reserver_exclusive() {
        let wallet = new_wallet();
        let mut first = RescanReserver::new(wallet.scan_state());
        let mut second = RescanReserver::new(wallet.scan_state());
        first.reserve().unwrap();
        assert!(matches!(second.reserve(), Err(WalletError::ScanInProgress)));
        drop(first);
        second.reserve().unwrap();
    }

    #[test]
    fn test_min_version_gate_on_load() {
        let mut storage = MemoryStorage::new();
        crate::storage::put_record(
            &mut storage,
            records::record_key(records::MIN_VERSION, &[]),
            records::serialize_value(&(FEATURE_LATEST + 1)),
        )
        .unwrap();
        let chain = Arc::new(MockChain::new());
        let result = Wallet::load(
            "w",
            Network::Testnet,
            WalletConfig::default(),
            Box::new(storage),
            chain,
        );
        assert!(matches!(
            result,
            Err(WalletError::Storage(StorageError::TooNew(_)))
        ));
    }
}
