//! Key and script storage with optional passphrase encryption.
//!
//! The store starts out holding plaintext secrets. [`KeyStore::encrypt`]
//! is a one-way transition to the encrypted form, after which secrets are
//! only available while unlocked. An unlock may be scoped to the mixing
//! subsystem, in which case ordinary spending still sees a locked wallet.

pub mod crypter;

use std::collections::{BTreeMap, BTreeSet};

use dashcore::blockdata::script::Script;
use dashcore::hashes::Hash;
use dashcore::secp256k1::{All, Secp256k1, SecretKey};
use dashcore::{PubkeyHash, PublicKey, ScriptBuf, ScriptHash};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{KeystoreError, KeystoreResult};
use crypter::MasterKey;

/// Ownership classification of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsMine {
    No,
    WatchOnly,
    Spendable,
}

/// Metadata attached to a key at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMetadata {
    /// Unix timestamp of key creation; 0 means unknown.
    pub create_time: u64,
    /// BIP32 path for keys derived from the HD seed, e.g. `m/0'/1'/7'`.
    pub hd_key_path: Option<String>,
    /// Whether the key belongs to the internal (change) chain.
    pub internal: bool,
}

/// A plaintext key pair.
#[derive(Clone)]
pub struct KeyPair {
    pub secret: SecretKey,
    pub pubkey: PublicKey,
}

/// What a newly added key looked like when it hit the store; the caller
/// persists the matching record.
pub enum StoredKey {
    Plain,
    Crypted(Vec<u8>),
}

/// Output of [`KeyStore::encrypt`]: everything the wallet must persist
/// before plaintext is dropped.
pub struct EncryptOutput {
    pub master_key_id: u32,
    pub master_key: MasterKey,
    pub crypted_keys: Vec<(PubkeyHash, PublicKey, Vec<u8>)>,
}

enum EncryptionState {
    Plain,
    Locked,
    Unlocked {
        master: Zeroizing<[u8; 32]>,
        mixing_only: bool,
    },
}

/// Key and script store.
pub struct KeyStore {
    secp: Secp256k1<All>,
    keys: BTreeMap<PubkeyHash, KeyPair>,
    crypted_keys: BTreeMap<PubkeyHash, (PublicKey, Vec<u8>)>,
    master_keys: BTreeMap<u32, MasterKey>,
    master_key_max_id: u32,
    scripts: BTreeMap<ScriptHash, ScriptBuf>,
    watch_only: BTreeSet<ScriptBuf>,
    state: EncryptionState,
    /// Unix timestamp at which the host has scheduled a call to `lock()`.
    relock_at: Option<u64>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            keys: BTreeMap::new(),
            crypted_keys: BTreeMap::new(),
            master_keys: BTreeMap::new(),
            master_key_max_id: 0,
            scripts: BTreeMap::new(),
            watch_only: BTreeSet::new(),
            state: EncryptionState::Plain,
            relock_at: None,
        }
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Generate a fresh random key pair (not yet stored).
    pub fn generate_key_pair(&self) -> KeyPair {
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = Zeroizing::new([0u8; 32]);
            rng.fill_bytes(&mut bytes[..]);
            if let Ok(secret) = SecretKey::from_byte_array(&bytes) {
                let pubkey = PublicKey::new(secret.public_key(&self.secp));
                return KeyPair {
                    secret,
                    pubkey,
                };
            }
        }
    }

    /// Add a key pair, encrypting it first when the store is encrypted.
    /// Fails with `Locked` if the store is encrypted but locked.
    pub fn add_key(&mut self, secret: SecretKey, pubkey: PublicKey) -> KeystoreResult<StoredKey> {
        let id = pubkey.pubkey_hash();
        match &self.state {
            EncryptionState::Plain => {
                self.keys.insert(
                    id,
                    KeyPair {
                        secret,
                        pubkey,
                    },
                );
                Ok(StoredKey::Plain)
            }
            EncryptionState::Locked => Err(KeystoreError::Locked),
            EncryptionState::Unlocked {
                master, ..
            } => {
                let plain = Zeroizing::new(secret.secret_bytes());
                let crypted = crypter::encrypt_secret(master, &plain, &pubkey);
                self.crypted_keys.insert(id, (pubkey, crypted.clone()));
                Ok(StoredKey::Crypted(crypted))
            }
        }
    }

    /// Insert a plaintext key at load time, bypassing encryption checks.
    pub fn load_key(&mut self, secret: SecretKey, pubkey: PublicKey) {
        self.keys.insert(
            pubkey.pubkey_hash(),
            KeyPair {
                secret,
                pubkey,
            },
        );
    }

    /// Insert an encrypted key at load time; marks the store encrypted.
    pub fn load_crypted_key(&mut self, pubkey: PublicKey, crypted: Vec<u8>) {
        self.crypted_keys.insert(pubkey.pubkey_hash(), (pubkey, crypted));
        if matches!(self.state, EncryptionState::Plain) {
            self.state = EncryptionState::Locked;
        }
    }

    pub fn load_master_key(&mut self, id: u32, mkey: MasterKey) {
        self.master_key_max_id = self.master_key_max_id.max(id);
        self.master_keys.insert(id, mkey);
        if matches!(self.state, EncryptionState::Plain) {
            self.state = EncryptionState::Locked;
        }
    }

    pub fn have_key(&self, id: &PubkeyHash) -> bool {
        self.keys.contains_key(id) || self.crypted_keys.contains_key(id)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len() + self.crypted_keys.len()
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &PubkeyHash> {
        self.keys.keys().chain(self.crypted_keys.keys())
    }

    pub fn get_pubkey(&self, id: &PubkeyHash) -> Option<PublicKey> {
        if let Some(pair) = self.keys.get(id) {
            return Some(pair.pubkey);
        }
        self.crypted_keys.get(id).map(|(pk, _)| *pk)
    }

    /// Fetch a private key. `for_mixing` marks the caller as the mixing
    /// subsystem, which a mixing-only unlock admits.
    pub fn get_key(&self, id: &PubkeyHash, for_mixing: bool) -> KeystoreResult<SecretKey> {
        match &self.state {
            EncryptionState::Plain => {
                self.keys.get(id).map(|p| p.secret).ok_or(KeystoreError::KeyNotFound)
            }
            EncryptionState::Locked => {
                if self.crypted_keys.contains_key(id) || self.keys.contains_key(id) {
                    Err(KeystoreError::Locked)
                } else {
                    Err(KeystoreError::KeyNotFound)
                }
            }
            EncryptionState::Unlocked {
                master,
                mixing_only,
            } => {
                if *mixing_only && !for_mixing {
                    return Err(KeystoreError::Locked);
                }
                let (pubkey, crypted) =
                    self.crypted_keys.get(id).ok_or(KeystoreError::KeyNotFound)?;
                let secret = crypter::decrypt_secret(master, crypted, pubkey)?;
                Ok(SecretKey::from_byte_array(&secret)?)
            }
        }
    }

    pub fn add_script(&mut self, script: ScriptBuf) {
        self.scripts.insert(script.script_hash(), script);
    }

    pub fn get_script(&self, hash: &ScriptHash) -> Option<&ScriptBuf> {
        self.scripts.get(hash)
    }

    pub fn scripts(&self) -> impl Iterator<Item = &ScriptBuf> {
        self.scripts.values()
    }

    pub fn add_watch_only(&mut self, script: ScriptBuf) -> bool {
        self.watch_only.insert(script)
    }

    pub fn remove_watch_only(&mut self, script: &Script) -> bool {
        self.watch_only.remove(script)
    }

    pub fn have_watch_only(&self) -> bool {
        !self.watch_only.is_empty()
    }

    pub fn watch_only_scripts(&self) -> impl Iterator<Item = &ScriptBuf> {
        self.watch_only.iter()
    }

    pub fn is_crypted(&self) -> bool {
        !matches!(self.state, EncryptionState::Plain)
    }

    /// Locked for the given caller; a mixing-only unlock still counts as
    /// locked for everyone else.
    pub fn is_locked(&self, for_mixing: bool) -> bool {
        match &self.state {
            EncryptionState::Plain => false,
            EncryptionState::Locked => true,
            EncryptionState::Unlocked {
                mixing_only, ..
            } => *mixing_only && !for_mixing,
        }
    }

    pub fn relock_at(&self) -> Option<u64> {
        self.relock_at
    }

    pub fn set_relock_at(&mut self, at: Option<u64>) {
        self.relock_at = at;
    }

    /// One-way transition to the encrypted state. Every plaintext secret
    /// is rewritten as ciphertext under a fresh master key; the caller
    /// must persist the returned records before anything else happens to
    /// the wallet. The store is left unlocked.
    pub fn encrypt(&mut self, passphrase: &str) -> KeystoreResult<EncryptOutput> {
        if self.is_crypted() {
            return Err(KeystoreError::AlreadyEncrypted);
        }

        let mut rng = rand::thread_rng();
        let mut salt = [0u8; 8];
        rng.fill_bytes(&mut salt);
        let mut master = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut master[..]);

        let rounds = crypter::calibrate_rounds(passphrase, &salt);
        let derived =
            crypter::derive_key(passphrase, &salt, rounds, crypter::DERIVATION_METHOD_SHA512)?;
        let master_key = MasterKey {
            crypted_key: crypter::encrypt_master_key(&derived, &master),
            salt,
            derivation_method: crypter::DERIVATION_METHOD_SHA512,
            derive_iterations: rounds,
        };

        let mut crypted_out = Vec::with_capacity(self.keys.len());
        for (id, pair) in std::mem::take(&mut self.keys) {
            let plain = Zeroizing::new(pair.secret.secret_bytes());
            let crypted = crypter::encrypt_secret(&master, &plain, &pair.pubkey);
            crypted_out.push((id, pair.pubkey, crypted.clone()));
            self.crypted_keys.insert(id, (pair.pubkey, crypted));
        }

        self.master_key_max_id += 1;
        let master_key_id = self.master_key_max_id;
        self.master_keys.insert(master_key_id, master_key.clone());
        self.state = EncryptionState::Unlocked {
            master,
            mixing_only: false,
        };

        Ok(EncryptOutput {
            master_key_id,
            master_key,
            crypted_keys: crypted_out,
        })
    }

    /// Unlock with a passphrase, optionally only for the mixing
    /// subsystem. Upgrading a mixing-only unlock to a full unlock with
    /// the same passphrase is allowed.
    pub fn unlock(&mut self, passphrase: &str, mixing_only: bool) -> KeystoreResult<()> {
        if !self.is_crypted() {
            return Err(KeystoreError::NotEncrypted);
        }

        for mkey in self.master_keys.values() {
            let derived = crypter::derive_key(
                passphrase,
                &mkey.salt,
                mkey.derive_iterations,
                mkey.derivation_method,
            )?;
            if let Ok(master) = crypter::decrypt_master_key(&derived, &mkey.crypted_key) {
                if self.verify_master(&master) {
                    self.state = EncryptionState::Unlocked {
                        master,
                        mixing_only,
                    };
                    return Ok(());
                }
            }
        }
        Err(KeystoreError::IncorrectPassphrase)
    }

    /// Drop the decrypted master key. A no-op on unencrypted stores.
    pub fn lock(&mut self) {
        if self.is_crypted() {
            self.state = EncryptionState::Locked;
            self.relock_at = None;
        }
    }

    /// Re-encrypt every master key under a new passphrase. Works from
    /// the locked state as long as the old passphrase is correct.
    pub fn change_passphrase(
        &mut self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> KeystoreResult<Vec<(u32, MasterKey)>> {
        if !self.is_crypted() {
            return Err(KeystoreError::NotEncrypted);
        }

        let was_locked = matches!(self.state, EncryptionState::Locked);
        self.unlock(old_passphrase, false)?;
        let master = match &self.state {
            EncryptionState::Unlocked {
                master, ..
            } => master.clone(),
            _ => unreachable!("unlock just succeeded"),
        };

        let mut rng = rand::thread_rng();
        let mut updated = Vec::with_capacity(self.master_keys.len());
        for (id, mkey) in self.master_keys.iter_mut() {
            let mut salt = [0u8; 8];
            rng.fill_bytes(&mut salt);
            let rounds = crypter::calibrate_rounds(new_passphrase, &salt);
            let derived = crypter::derive_key(
                new_passphrase,
                &salt,
                rounds,
                crypter::DERIVATION_METHOD_SHA512,
            )?;
            *mkey = MasterKey {
                crypted_key: crypter::encrypt_master_key(&derived, &master),
                salt,
                derivation_method: crypter::DERIVATION_METHOD_SHA512,
                derive_iterations: rounds,
            };
            updated.push((*id, mkey.clone()));
        }

        if was_locked {
            self.lock();
        }
        Ok(updated)
    }

    /// Check a candidate master key against one known ciphertext so a
    /// stale master key from a replaced passphrase cannot unlock.
    fn verify_master(&self, master: &Zeroizing<[u8; 32]>) -> bool {
        match self.crypted_keys.values().next() {
            None => true,
            Some((pubkey, crypted)) => {
                match crypter::decrypt_secret(master, crypted, pubkey) {
                    Ok(secret) => SecretKey::from_byte_array(&secret)
                        .map(|sk| PublicKey::new(sk.public_key(&self.secp)) == *pubkey)
                        .unwrap_or(false),
                    Err(_) => false,
                }
            }
        }
    }

    /// Classify a script. P2SH descends one level into a known redeem
    /// script; deeper nesting is not considered ours.
    pub fn is_mine(&self, script: &Script) -> IsMine {
        let mine = self.classify(script, 0);
        if mine == IsMine::No && self.watch_only.contains(script) {
            return IsMine::WatchOnly;
        }
        mine
    }

    fn classify(&self, script: &Script, depth: u32) -> IsMine {
        let bytes = script.as_bytes();

        // P2PKH: OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        if script.is_p2pkh() {
            if let Ok(hash) = PubkeyHash::from_slice(&bytes[3..23]) {
                if self.have_key(&hash) {
                    return IsMine::Spendable;
                }
            }
            return IsMine::No;
        }

        // P2SH: OP_HASH160 <20> OP_EQUAL; recurse into a known redeem
        // script, one level only.
        if script.is_p2sh() {
            if depth > 0 {
                return IsMine::No;
            }
            if let Ok(hash) = ScriptHash::from_slice(&bytes[2..22]) {
                if let Some(redeem) = self.scripts.get(&hash) {
                    return self.classify(redeem, depth + 1);
                }
            }
            return IsMine::No;
        }

        // P2PK: <33|65 byte pubkey> OP_CHECKSIG
        if let Some(pubkey) = parse_p2pk(bytes) {
            if self.have_key(&pubkey.pubkey_hash()) {
                return IsMine::Spendable;
            }
            return IsMine::No;
        }

        // Bare multisig: ours only when every key is ours.
        if let Some(pubkeys) = parse_multisig(bytes) {
            if pubkeys.iter().all(|pk| self.have_key(&pk.pubkey_hash())) {
                return IsMine::Spendable;
            }
            return IsMine::No;
        }

        IsMine::No
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;

fn parse_p2pk(bytes: &[u8]) -> Option<PublicKey> {
    let len = *bytes.first()? as usize;
    if (len == 33 || len == 65)
        && bytes.len() == len + 2
        && bytes[len + 1] == OP_CHECKSIG
    {
        return PublicKey::from_slice(&bytes[1..1 + len]).ok();
    }
    None
}

/// Parse `m <pubkeys...> n OP_CHECKMULTISIG`, returning the keys.
fn parse_multisig(bytes: &[u8]) -> Option<Vec<PublicKey>> {
    if bytes.len() < 4 || *bytes.last()? != OP_CHECKMULTISIG {
        return None;
    }
    let small_num = |b: u8| -> Option<u8> {
        // OP_1..OP_16
        if (0x51..=0x60).contains(&b) {
            Some(b - 0x50)
        } else {
            None
        }
    };

    let required = small_num(bytes[0])?;
    let total = small_num(bytes[bytes.len() - 2])?;
    if required > total {
        return None;
    }

    let mut keys = Vec::with_capacity(total as usize);
    let mut pos = 1;
    while pos < bytes.len() - 2 {
        let len = bytes[pos] as usize;
        if len != 33 && len != 65 {
            return None;
        }
        pos += 1;
        if pos + len > bytes.len() - 2 {
            return None;
        }
        keys.push(PublicKey::from_slice(&bytes[pos..pos + len]).ok()?);
        pos += len;
    }
    if keys.len() != total as usize {
        return None;
    }
    Some(keys)
}
