//! Passphrase key derivation and private-key encryption.
//!
//! The keystore's encrypted form follows the legacy format: a random
//! 32-byte master key is encrypted under a passphrase-derived AES key,
//! and each private key secret is encrypted under the master key with an
//! IV derived from its public key.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use dashcore::hashes::{sha256d, Hash};
use dashcore::PublicKey;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::error::{KeystoreError, KeystoreResult};

/// Key derivation by repeated SHA-512 over passphrase and salt.
pub const DERIVATION_METHOD_SHA512: u32 = 0;

/// Minimum number of derivation rounds ever written to disk.
pub const MIN_DERIVE_ITERATIONS: u32 = 25_000;

const AES_BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;

/// An encrypted master key as stored in the `mkey` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterKey {
    /// AES-256-CBC ciphertext of the 32-byte master key.
    pub crypted_key: Vec<u8>,
    /// KDF salt.
    pub salt: [u8; 8],
    /// KDF algorithm id; only [`DERIVATION_METHOD_SHA512`] is defined.
    pub derivation_method: u32,
    /// KDF iteration count.
    pub derive_iterations: u32,
}

/// Key and IV derived from a passphrase.
pub struct DerivedKey {
    pub key: Zeroizing<[u8; KEY_SIZE]>,
    pub iv: Zeroizing<[u8; IV_SIZE]>,
}

/// Derive an AES key and IV from a passphrase.
pub fn derive_key(
    passphrase: &str,
    salt: &[u8; 8],
    rounds: u32,
    method: u32,
) -> KeystoreResult<DerivedKey> {
    if method != DERIVATION_METHOD_SHA512 {
        return Err(KeystoreError::Derivation(format!(
            "unknown derivation method {}",
            method
        )));
    }

    let mut hasher = Sha512::new();
    hasher.update(passphrase.as_bytes());
    hasher.update(salt);
    let mut buf = Zeroizing::new([0u8; 64]);
    buf.copy_from_slice(&hasher.finalize());

    for _ in 1..rounds.max(1) {
        let digest = Sha512::digest(&buf[..]);
        buf.copy_from_slice(&digest);
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let mut iv = Zeroizing::new([0u8; IV_SIZE]);
    key.copy_from_slice(&buf[..KEY_SIZE]);
    iv.copy_from_slice(&buf[KEY_SIZE..KEY_SIZE + IV_SIZE]);
    Ok(DerivedKey {
        key,
        iv,
    })
}

/// Pick an iteration count so one derivation takes roughly 100 ms on this
/// machine, never below the minimum.
pub fn calibrate_rounds(passphrase: &str, salt: &[u8; 8]) -> u32 {
    use std::time::Instant;

    let probe = MIN_DERIVE_ITERATIONS;
    let start = Instant::now();
    let _ = derive_key(passphrase, salt, probe, DERIVATION_METHOD_SHA512);
    let elapsed_ms = start.elapsed().as_millis().max(1) as u64;

    let target = (probe as u64 * 100 / elapsed_ms) as u32;
    target.max(MIN_DERIVE_ITERATIONS)
}

/// AES-256-CBC with PKCS#7 padding, composed from raw block operations.
fn cbc_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let pad = AES_BLOCK_SIZE - plaintext.len() % AES_BLOCK_SIZE;
    let mut padded = Zeroizing::new(plaintext.to_vec());
    padded.extend(std::iter::repeat(pad as u8).take(pad));

    let mut out = Vec::with_capacity(padded.len());
    let mut chain = *iv;
    for block in padded.chunks(AES_BLOCK_SIZE) {
        let mut b = [0u8; AES_BLOCK_SIZE];
        for (i, byte) in block.iter().enumerate() {
            b[i] = byte ^ chain[i];
        }
        let mut ga = GenericArray::clone_from_slice(&b);
        cipher.encrypt_block(&mut ga);
        chain.copy_from_slice(&ga);
        out.extend_from_slice(&ga);
    }
    out
}

fn cbc_decrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
) -> KeystoreResult<Zeroizing<Vec<u8>>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(KeystoreError::Derivation("bad ciphertext length".into()));
    }

    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut out = Zeroizing::new(Vec::with_capacity(ciphertext.len()));
    let mut chain = *iv;
    for block in ciphertext.chunks(AES_BLOCK_SIZE) {
        let mut ga = GenericArray::clone_from_slice(block);
        cipher.decrypt_block(&mut ga);
        for (i, byte) in ga.iter().enumerate() {
            out.push(byte ^ chain[i]);
        }
        chain.copy_from_slice(block);
    }

    let pad = *out.last().unwrap_or(&0) as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE || pad > out.len() {
        return Err(KeystoreError::IncorrectPassphrase);
    }
    if out[out.len() - pad..].iter().any(|&b| b != pad as u8) {
        return Err(KeystoreError::IncorrectPassphrase);
    }
    let len = out.len() - pad;
    out.truncate(len);
    Ok(out)
}

/// Encrypt the 32-byte master key under a passphrase-derived key.
pub fn encrypt_master_key(derived: &DerivedKey, master: &[u8; KEY_SIZE]) -> Vec<u8> {
    cbc_encrypt(&derived.key, &derived.iv, master)
}

/// Decrypt the master key; a wrong passphrase shows up as a padding error.
pub fn decrypt_master_key(
    derived: &DerivedKey,
    crypted: &[u8],
) -> KeystoreResult<Zeroizing<[u8; KEY_SIZE]>> {
    let plain = cbc_decrypt(&derived.key, &derived.iv, crypted)?;
    if plain.len() != KEY_SIZE {
        return Err(KeystoreError::IncorrectPassphrase);
    }
    let mut master = Zeroizing::new([0u8; KEY_SIZE]);
    master.copy_from_slice(&plain);
    Ok(master)
}

/// IV for a private key's ciphertext: the first 16 bytes of the double
/// SHA-256 of its public key.
fn key_iv(pubkey: &PublicKey) -> [u8; IV_SIZE] {
    let hash = sha256d::Hash::hash(&pubkey.to_bytes());
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&hash.to_byte_array()[..IV_SIZE]);
    iv
}

/// Encrypt a private key secret under the master key.
pub fn encrypt_secret(
    master: &[u8; KEY_SIZE],
    secret: &Zeroizing<[u8; 32]>,
    pubkey: &PublicKey,
) -> Vec<u8> {
    cbc_encrypt(master, &key_iv(pubkey), &secret[..])
}

/// Decrypt a private key secret with the master key.
pub fn decrypt_secret(
    master: &[u8; KEY_SIZE],
    crypted: &[u8],
    pubkey: &PublicKey,
) -> KeystoreResult<Zeroizing<[u8; 32]>> {
    let plain = cbc_decrypt(master, &key_iv(pubkey), crypted)?;
    if plain.len() != 32 {
        return Err(KeystoreError::IncorrectPassphrase);
    }
    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&plain);
    Ok(secret)
}
