//! On-disk record formats.
//!
//! Each record key is a short consensus-encoded string prefix followed by
//! a type-specific suffix; values use the legacy consensus encoding so
//! wallets written by older software load unchanged. Quirks preserved on
//! purpose: the empty merkle-branch vector and the `fSpent` byte inside
//! transaction records, and pool entries whose internal flag may be
//! absent (pre-split wallets), which decode as external.

use std::collections::BTreeMap;
use std::io;

use dashcore::consensus::encode::{self, Decodable, Encodable, VarInt};
use dashcore::hashes::Hash;
use dashcore::{BlockHash, PubkeyHash, PublicKey, Transaction, Txid};

use crate::error::{StorageError, StorageResult};
use crate::keypool::KeyPoolEntry;
use crate::keystore::crypter::MasterKey;
use crate::keystore::KeyMetadata;
use crate::hd_chain::HdChain;
use crate::tx_store::AccountingEntry;
use crate::wallet_tx::{TxState, WalletTx};

// Record key prefixes.
pub const KEY: &str = "key";
pub const CRYPTED_KEY: &str = "ckey";
pub const MASTER_KEY: &str = "mkey";
pub const SCRIPT: &str = "cscript";
pub const WATCH_ONLY: &str = "watchs";
pub const KEY_META: &str = "keymeta";
pub const NAME: &str = "name";
pub const PURPOSE: &str = "purpose";
pub const TX: &str = "tx";
pub const ACCOUNT: &str = "acc";
pub const ACCOUNTING_ENTRY: &str = "acentry";
pub const DEFAULT_KEY: &str = "defaultkey";
pub const POOL: &str = "pool";
pub const VERSION: &str = "version";
pub const MIN_VERSION: &str = "minversion";
pub const HD_CHAIN: &str = "hdchain";
pub const DEST_DATA: &str = "destdata";
pub const BEST_BLOCK: &str = "bestblock";
pub const ORDER_POS_NEXT: &str = "orderposnext";
pub const FLAGS: &str = "flags";

fn write_var_bytes<W: io::Write>(w: &mut W, bytes: &[u8]) -> Result<usize, io::Error> {
    let mut written = VarInt(bytes.len() as u64).consensus_encode(w)?;
    w.write_all(bytes)?;
    written += bytes.len();
    Ok(written)
}

fn read_var_bytes<R: io::Read + ?Sized>(r: &mut R) -> Result<Vec<u8>, encode::Error> {
    let len = VarInt::consensus_decode(r)?.0 as usize;
    if len > 0x0200_0000 {
        return Err(encode::Error::ParseFailed("record field too large"));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(encode::Error::Io)?;
    Ok(buf)
}

fn write_string<W: io::Write>(w: &mut W, s: &str) -> Result<usize, io::Error> {
    write_var_bytes(w, s.as_bytes())
}

fn read_string<R: io::Read + ?Sized>(r: &mut R) -> Result<String, encode::Error> {
    let bytes = read_var_bytes(r)?;
    String::from_utf8(bytes).map_err(|_| encode::Error::ParseFailed("invalid utf8 string"))
}

fn write_string_map<W: io::Write>(
    w: &mut W,
    map: &BTreeMap<String, String>,
) -> Result<usize, io::Error> {
    let mut written = VarInt(map.len() as u64).consensus_encode(w)?;
    for (key, value) in map {
        written += write_string(w, key)?;
        written += write_string(w, value)?;
    }
    Ok(written)
}

fn read_string_map<R: io::Read + ?Sized>(
    r: &mut R,
) -> Result<BTreeMap<String, String>, encode::Error> {
    let count = VarInt::consensus_decode(r)?.0;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = read_string(r)?;
        let value = read_string(r)?;
        map.insert(key, value);
    }
    Ok(map)
}

fn write_pair_vec<W: io::Write>(
    w: &mut W,
    pairs: &[(String, String)],
) -> Result<usize, io::Error> {
    let mut written = VarInt(pairs.len() as u64).consensus_encode(w)?;
    for (a, b) in pairs {
        written += write_string(w, a)?;
        written += write_string(w, b)?;
    }
    Ok(written)
}

fn read_pair_vec<R: io::Read + ?Sized>(
    r: &mut R,
) -> Result<Vec<(String, String)>, encode::Error> {
    let count = VarInt::consensus_decode(r)?.0;
    let mut pairs = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        pairs.push((read_string(r)?, read_string(r)?));
    }
    Ok(pairs)
}

/// Build a record key: consensus-encoded prefix string + raw suffix.
pub fn record_key(prefix: &str, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + prefix.len() + suffix.len());
    // Infallible: writing to a Vec.
    let _ = write_string(&mut key, prefix);
    key.extend_from_slice(suffix);
    key
}

/// The raw suffix of a full record key under `prefix`.
pub fn key_suffix<'k>(full_key: &'k [u8], prefix: &str) -> &'k [u8] {
    &full_key[1 + prefix.len()..]
}

/// Consensus-serialize a value that implements [`Encodable`].
pub fn serialize_value<T: Encodable>(value: &T) -> Vec<u8> {
    encode::serialize(value)
}

/// Consensus-deserialize a whole value buffer.
pub fn deserialize_value<T: Decodable>(bytes: &[u8]) -> StorageResult<T> {
    Ok(encode::deserialize(bytes)?)
}

// --- mkey ---------------------------------------------------------------

/// `mkey`, id → salt (8B), rounds, derivation method, ciphertext.
pub struct MasterKeyRecord(pub MasterKey);

impl Encodable for MasterKeyRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut written = write_var_bytes(w, &self.0.salt)?;
        written += self.0.derive_iterations.consensus_encode(w)?;
        written += self.0.derivation_method.consensus_encode(w)?;
        written += write_var_bytes(w, &self.0.crypted_key)?;
        Ok(written)
    }
}

impl Decodable for MasterKeyRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let salt_bytes = read_var_bytes(r)?;
        if salt_bytes.len() != 8 {
            return Err(encode::Error::ParseFailed("master key salt must be 8 bytes"));
        }
        let mut salt = [0u8; 8];
        salt.copy_from_slice(&salt_bytes);
        let derive_iterations = u32::consensus_decode(r)?;
        let derivation_method = u32::consensus_decode(r)?;
        let crypted_key = read_var_bytes(r)?;
        Ok(Self(MasterKey {
            crypted_key,
            salt,
            derivation_method,
            derive_iterations,
        }))
    }
}

// --- keymeta ------------------------------------------------------------

const KEY_META_VERSION: u32 = 1;

pub struct KeyMetadataRecord(pub KeyMetadata);

impl Encodable for KeyMetadataRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut written = KEY_META_VERSION.consensus_encode(w)?;
        written += self.0.create_time.consensus_encode(w)?;
        written += write_string(w, self.0.hd_key_path.as_deref().unwrap_or(""))?;
        written += (self.0.internal as u8).consensus_encode(w)?;
        Ok(written)
    }
}

impl Decodable for KeyMetadataRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let _version = u32::consensus_decode(r)?;
        let create_time = u64::consensus_decode(r)?;
        let path = read_string(r)?;
        let internal = u8::consensus_decode(r)? != 0;
        Ok(Self(KeyMetadata {
            create_time,
            hd_key_path: if path.is_empty() {
                None
            } else {
                Some(path)
            },
            internal,
        }))
    }
}

// --- tx -----------------------------------------------------------------

/// `tx`, txid → transaction + block linkage + wallet metadata, in the
/// legacy shape (empty merkle branch, empty predecessor vector, order
/// position and smart time tunneled through the string map, trailing
/// `fSpent` byte).
pub struct WalletTxRecord(pub WalletTx);

impl Encodable for WalletTxRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let wtx = &self.0;
        let (block_hash, index) = wtx.state.to_disk();

        let mut written = wtx.tx.consensus_encode(w)?;
        written += block_hash.consensus_encode(w)?;
        // Legacy merkle branch, always empty.
        written += VarInt(0).consensus_encode(w)?;
        written += index.consensus_encode(w)?;
        // Legacy predecessor vector, always empty.
        written += VarInt(0).consensus_encode(w)?;

        let mut map = wtx.map_value.clone();
        if !wtx.from_account.is_empty() {
            map.insert("fromaccount".into(), wtx.from_account.clone());
        } else {
            map.insert("fromaccount".into(), String::new());
        }
        if wtx.order_pos >= 0 {
            map.insert("n".into(), wtx.order_pos.to_string());
        }
        if wtx.time_smart > 0 {
            map.insert("timesmart".into(), wtx.time_smart.to_string());
        }
        written += write_string_map(w, &map)?;
        written += write_pair_vec(w, &wtx.order_form)?;
        written += (wtx.time_received_is_tx_time as u32).consensus_encode(w)?;
        written += (wtx.time_received as u32).consensus_encode(w)?;
        written += (wtx.from_me as u8).consensus_encode(w)?;
        // fSpent, discarded on read since 2014, written as false.
        written += 0u8.consensus_encode(w)?;
        Ok(written)
    }
}

impl Decodable for WalletTxRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let tx = Transaction::consensus_decode(r)?;
        let block_hash = BlockHash::consensus_decode(r)?;
        let branch_len = VarInt::consensus_decode(r)?.0;
        for _ in 0..branch_len {
            let _ = BlockHash::consensus_decode(r)?;
        }
        let index = i32::consensus_decode(r)?;
        let unused = VarInt::consensus_decode(r)?.0;
        if unused != 0 {
            return Err(encode::Error::ParseFailed("unexpected predecessor transactions"));
        }

        let mut map = read_string_map(r)?;
        let order_form = read_pair_vec(r)?;
        let time_received_is_tx_time = u32::consensus_decode(r)? != 0;
        let time_received = u32::consensus_decode(r)? as u64;
        let from_me = u8::consensus_decode(r)? != 0;
        let _spent = u8::consensus_decode(r)?;

        let from_account = map.remove("fromaccount").unwrap_or_default();
        let order_pos =
            map.remove("n").and_then(|n| n.parse::<i64>().ok()).unwrap_or(-1);
        let time_smart =
            map.remove("timesmart").and_then(|t| t.parse::<u64>().ok()).unwrap_or(0);
        map.remove("spent");

        let mut wtx = WalletTx::new(tx);
        wtx.state = TxState::from_disk(block_hash, index);
        wtx.map_value = map;
        wtx.order_form = order_form;
        wtx.time_received_is_tx_time = time_received_is_tx_time;
        wtx.time_received = time_received;
        wtx.time_smart = time_smart;
        wtx.from_me = from_me;
        wtx.from_account = from_account;
        wtx.order_pos = order_pos;
        Ok(Self(wtx))
    }
}

// --- pool ---------------------------------------------------------------

/// `pool`, index → time, pubkey, internal flag. Records written before
/// the HD split lack the flag; those decode as external.
pub struct PoolRecord(pub KeyPoolEntry);

impl Encodable for PoolRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut written = (self.0.time as i64).consensus_encode(w)?;
        written += write_var_bytes(w, &self.0.pubkey.to_bytes())?;
        written += (self.0.internal as u8).consensus_encode(w)?;
        Ok(written)
    }
}

impl Decodable for PoolRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let time = i64::consensus_decode(r)?.max(0) as u64;
        let pubkey_bytes = read_var_bytes(r)?;
        let pubkey = PublicKey::from_slice(&pubkey_bytes)
            .map_err(|_| encode::Error::ParseFailed("invalid pool pubkey"))?;
        let internal = match u8::consensus_decode(r) {
            Ok(byte) => byte != 0,
            Err(encode::Error::Io(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(e) => return Err(e),
        };
        Ok(Self(KeyPoolEntry {
            time,
            pubkey,
            internal,
        }))
    }
}

// --- hdchain ------------------------------------------------------------

pub struct HdChainRecord(pub HdChain);

impl Encodable for HdChainRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut written = self.0.version.consensus_encode(w)?;
        written += self.0.external_counter.consensus_encode(w)?;
        written += self.0.internal_counter.consensus_encode(w)?;
        written += write_var_bytes(w, self.0.master_key_id.as_byte_array())?;
        Ok(written)
    }
}

impl Decodable for HdChainRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let version = u32::consensus_decode(r)?;
        let external_counter = u32::consensus_decode(r)?;
        let internal_counter = u32::consensus_decode(r)?;
        let id_bytes = read_var_bytes(r)?;
        let master_key_id = PubkeyHash::from_slice(&id_bytes)
            .map_err(|_| encode::Error::ParseFailed("invalid hd master key id"))?;
        Ok(Self(HdChain {
            version,
            external_counter,
            internal_counter,
            master_key_id,
        }))
    }
}

// --- bestblock ----------------------------------------------------------

const LOCATOR_VERSION: i32 = 1;

/// `bestblock` → block locator.
pub struct BestBlockRecord(pub Vec<BlockHash>);

impl Encodable for BestBlockRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut written = LOCATOR_VERSION.consensus_encode(w)?;
        written += VarInt(self.0.len() as u64).consensus_encode(w)?;
        for hash in &self.0 {
            written += hash.consensus_encode(w)?;
        }
        Ok(written)
    }
}

impl Decodable for BestBlockRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let _version = i32::consensus_decode(r)?;
        let count = VarInt::consensus_decode(r)?.0;
        if count > 10_000 {
            return Err(encode::Error::ParseFailed("locator too long"));
        }
        let mut hashes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            hashes.push(BlockHash::consensus_decode(r)?);
        }
        Ok(Self(hashes))
    }
}

// --- acentry ------------------------------------------------------------

pub struct AccountingEntryRecord(pub AccountingEntry);

impl Encodable for AccountingEntryRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        let entry = &self.0;
        let mut written = entry.credit_debit.consensus_encode(w)?;
        written += (entry.time as i64).consensus_encode(w)?;
        written += write_string(w, &entry.other_account)?;
        written += write_string(w, &entry.comment)?;
        let mut map = entry.map_value.clone();
        if entry.order_pos >= 0 {
            map.insert("n".into(), entry.order_pos.to_string());
        }
        written += write_string_map(w, &map)?;
        Ok(written)
    }
}

impl Decodable for AccountingEntryRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let credit_debit = i64::consensus_decode(r)?;
        let time = i64::consensus_decode(r)?.max(0) as u64;
        let other_account = read_string(r)?;
        let comment = read_string(r)?;
        let mut map = read_string_map(r)?;
        let order_pos = map.remove("n").and_then(|n| n.parse::<i64>().ok()).unwrap_or(-1);
        Ok(Self(AccountingEntry {
            account: String::new(),
            credit_debit,
            time,
            other_account,
            comment,
            map_value: map,
            order_pos,
            entry_no: 0,
        }))
    }
}

/// Key for an accounting entry: account name + entry number.
pub fn acentry_key(account: &str, entry_no: u64) -> Vec<u8> {
    let mut suffix = Vec::new();
    let _ = write_string(&mut suffix, account);
    let _ = entry_no.consensus_encode(&mut suffix);
    record_key(ACCOUNTING_ENTRY, &suffix)
}

/// Parse the suffix of an `acentry` key back into (account, entry_no).
pub fn parse_acentry_suffix(suffix: &[u8]) -> StorageResult<(String, u64)> {
    let mut cursor = suffix;
    let account = read_string(&mut cursor).map_err(StorageError::Serialization)?;
    let entry_no =
        u64::consensus_decode(&mut cursor).map_err(StorageError::Serialization)?;
    Ok((account, entry_no))
}

/// Key for a destination-data record: address string + data key.
pub fn destdata_key(address: &str, data_key: &str) -> Vec<u8> {
    let mut suffix = Vec::new();
    let _ = write_string(&mut suffix, address);
    let _ = write_string(&mut suffix, data_key);
    record_key(DEST_DATA, &suffix)
}

pub fn parse_destdata_suffix(suffix: &[u8]) -> StorageResult<(String, String)> {
    let mut cursor = suffix;
    let address = read_string(&mut cursor).map_err(StorageError::Serialization)?;
    let data_key = read_string(&mut cursor).map_err(StorageError::Serialization)?;
    Ok((address, data_key))
}

/// A string value on its own (used by `name`, `purpose`, `destdata`).
pub struct StringRecord(pub String);

impl Encodable for StringRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        write_string(w, &self.0)
    }
}

impl Decodable for StringRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Self(read_string(r)?))
    }
}

/// A byte blob with a length prefix (private keys, ciphertexts, scripts).
pub struct BytesRecord(pub Vec<u8>);

impl Encodable for BytesRecord {
    fn consensus_encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        write_var_bytes(w, &self.0)
    }
}

impl Decodable for BytesRecord {
    fn consensus_decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        Ok(Self(read_var_bytes(r)?))
    }
}

/// Key suffix for `tx` records.
pub fn txid_suffix(txid: &Txid) -> Vec<u8> {
    txid.to_byte_array().to_vec()
}

pub fn parse_txid_suffix(suffix: &[u8]) -> StorageResult<Txid> {
    Txid::from_slice(suffix)
        .map_err(|_| StorageError::Corruption("bad txid in record key".into()))
}

/// Key suffix for `pool` records.
pub fn pool_suffix(index: i64) -> Vec<u8> {
    index.to_le_bytes().to_vec()
}

pub fn parse_pool_suffix(suffix: &[u8]) -> StorageResult<i64> {
    let bytes: [u8; 8] = suffix
        .try_into()
        .map_err(|_| StorageError::Corruption("bad pool index in record key".into()))?;
    Ok(i64::from_le_bytes(bytes))
}

/// Key suffix for `mkey` records.
pub fn mkey_suffix(id: u32) -> Vec<u8> {
    id.to_le_bytes().to_vec()
}

pub fn parse_mkey_suffix(suffix: &[u8]) -> StorageResult<u32> {
    let bytes: [u8; 4] = suffix
        .try_into()
        .map_err(|_| StorageError::Corruption("bad master key id in record key".into()))?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn parse_pubkey_suffix(suffix: &[u8]) -> StorageResult<PublicKey> {
    PublicKey::from_slice(suffix)
        .map_err(|_| StorageError::Corruption("bad pubkey in record key".into()))
}

pub fn parse_string_suffix(suffix: &[u8]) -> StorageResult<String> {
    let mut cursor = suffix;
    read_string(&mut cursor).map_err(StorageError::Serialization)
}

/// Suffix for `name`/`purpose` keys (the destination string).
pub fn string_suffix(value: &str) -> Vec<u8> {
    let mut suffix = Vec::new();
    let _ = write_string(&mut suffix, value);
    suffix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::dummy_transaction;
    use crate::wallet_tx::abandon_hash;
    use dashcore::hashes::sha256d;

    #[test]
    fn test_record_key_prefixes_do_not_collide() {
        let key = record_key(KEY, &[0xAA]);
        let keymeta = record_key(KEY_META, &[0xAA]);
        assert!(!keymeta.starts_with(&record_key(KEY, &[])));
        assert!(key.starts_with(&record_key(KEY, &[])));
    }

    #[test]
    fn test_master_key_record_round_trip() {
        let mkey = MasterKey {
            crypted_key: vec![1, 2, 3, 4],
            salt: [9u8; 8],
            derivation_method: 0,
            derive_iterations: 25_000,
        };
        let bytes = serialize_value(&MasterKeyRecord(mkey.clone()));
        let decoded: MasterKeyRecord = deserialize_value(&bytes).unwrap();
        assert_eq!(decoded.0, mkey);
    }

    #[test]
    fn test_wallet_tx_record_round_trip() {
        let mut wtx = WalletTx::new(dummy_transaction(3, &[1000, 2000]));
        wtx.state = TxState::InBlock {
            block_hash: BlockHash::from_raw_hash(sha256d::Hash::from_byte_array([5u8; 32])),
            index: 2,
        };
        wtx.map_value.insert("comment".into(), "lunch".into());
        wtx.order_form.push(("Message".into(), "thanks".into()));
        wtx.time_received = 1_600_000_000;
        wtx.time_smart = 1_599_999_999;
        wtx.from_me = true;
        wtx.from_account = "savings".into();
        wtx.order_pos = 42;

        let bytes = serialize_value(&WalletTxRecord(wtx.clone()));
        let decoded: WalletTxRecord = deserialize_value(&bytes).unwrap();
        let got = decoded.0;
        assert_eq!(got.txid(), wtx.txid());
        assert_eq!(got.state, wtx.state);
        assert_eq!(got.map_value, wtx.map_value);
        assert_eq!(got.order_form, wtx.order_form);
        assert_eq!(got.time_received, wtx.time_received);
        assert_eq!(got.time_smart, wtx.time_smart);
        assert_eq!(got.from_me, wtx.from_me);
        assert_eq!(got.from_account, wtx.from_account);
        assert_eq!(got.order_pos, wtx.order_pos);

        // Re-serialization is byte identical.
        let bytes_again = serialize_value(&WalletTxRecord(got));
        assert_eq!(bytes, bytes_again);
    }

    #[test]
    fn test_abandoned_tx_record_round_trip() {
        let mut wtx = WalletTx::new(dummy_transaction(4, &[1000]));
        wtx.state = TxState::Abandoned;
        let bytes = serialize_value(&WalletTxRecord(wtx));
        let decoded: WalletTxRecord = deserialize_value(&bytes).unwrap();
        assert_eq!(decoded.0.state, TxState::Abandoned);
        assert_eq!(decoded.0.block_hash(), None);
        // The sentinel hash is what hit the wire.
        let round = serialize_value(&WalletTxRecord(decoded.0.clone()));
        assert!(round
            .windows(32)
            .any(|w| w == abandon_hash().to_byte_array().as_slice()));
    }

    #[test]
    fn test_pool_record_internal_flag_fallback() {
        let store = crate::keystore::KeyStore::new();
        let entry = KeyPoolEntry {
            time: 1_600_000_000,
            pubkey: store.generate_key_pair().pubkey,
            internal: true,
        };
        let bytes = serialize_value(&PoolRecord(entry.clone()));
        let decoded: PoolRecord = deserialize_value(&bytes).unwrap();
        assert_eq!(decoded.0, entry);

        // Strip the trailing internal byte: decodes as external.
        let truncated = &bytes[..bytes.len() - 1];
        let mut cursor = truncated;
        let legacy = PoolRecord::consensus_decode(&mut cursor).unwrap();
        assert!(!legacy.0.internal);
        assert_eq!(legacy.0.pubkey, entry.pubkey);
    }

    #[test]
    fn test_hdchain_record_round_trip() {
        let chain = HdChain {
            version: 2,
            external_counter: 17,
            internal_counter: 4,
            master_key_id: PubkeyHash::from_slice(&[7u8; 20]).unwrap(),
        };
        let bytes = serialize_value(&HdChainRecord(chain.clone()));
        let decoded: HdChainRecord = deserialize_value(&bytes).unwrap();
        assert_eq!(decoded.0, chain);
    }

    #[test]
    fn test_acentry_key_round_trip() {
        let key = acentry_key("savings", 7);
        let suffix = key_suffix(&key, ACCOUNTING_ENTRY);
        let (account, no) = parse_acentry_suffix(suffix).unwrap();
        assert_eq!(account, "savings");
        assert_eq!(no, 7);
    }

    #[test]
    fn test_bestblock_record_round_trip() {
        let hashes = vec![
            BlockHash::from_raw_hash(sha256d::Hash::from_byte_array([1u8; 32])),
            BlockHash::from_raw_hash(sha256d::Hash::from_byte_array([2u8; 32])),
        ];
        let bytes = serialize_value(&BestBlockRecord(hashes.clone()));
        let decoded: BestBlockRecord = deserialize_value(&bytes).unwrap();
        assert_eq!(decoded.0, hashes);
    }
}
