//! HD chain child-index counters and child key derivation.
//!
//! The chain derives external (receive) keys at `m/0'/0'/k'` and, once
//! the chain-split feature is active, internal (change) keys at
//! `m/0'/1'/k'`. Pre-split chains have no internal counter and serve
//! change from the external path. Derivation is deterministic: the same
//! seed and counter always yield the same key.

use dashcore::bip32::{ChildNumber, DerivationPath, ExtendedPrivKey};
use dashcore::secp256k1::{All, Secp256k1, SecretKey};
use dashcore::{Network, PubkeyHash, PublicKey};

use crate::error::{KeystoreError, KeystoreResult};

/// Chain without a split internal path.
pub const HD_CHAIN_VERSION_BASE: u32 = 1;
/// Chain deriving change keys on `m/0'/1'`.
pub const HD_CHAIN_VERSION_SPLIT: u32 = 2;

/// The HD chain state: next unused child indices plus the id of the seed
/// key (stored in the keystore, so it is encrypted with everything else).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdChain {
    pub version: u32,
    pub external_counter: u32,
    pub internal_counter: u32,
    pub master_key_id: PubkeyHash,
}

impl HdChain {
    pub fn new(master_key_id: PubkeyHash, split: bool) -> Self {
        Self {
            version: if split {
                HD_CHAIN_VERSION_SPLIT
            } else {
                HD_CHAIN_VERSION_BASE
            },
            external_counter: 0,
            internal_counter: 0,
            master_key_id,
        }
    }

    /// Whether change keys come from the dedicated internal path. The
    /// split is irreversible: version never moves backwards.
    pub fn uses_split(&self) -> bool {
        self.version >= HD_CHAIN_VERSION_SPLIT
    }

    /// Take the next child index for the requested lane. Pre-split
    /// chains only ever advance the external counter.
    pub fn next_child_index(&mut self, internal: bool) -> u32 {
        if internal && self.uses_split() {
            let index = self.internal_counter;
            self.internal_counter += 1;
            index
        } else {
            let index = self.external_counter;
            self.external_counter += 1;
            index
        }
    }
}

/// A child key derived from the seed.
pub struct DerivedChild {
    pub secret: SecretKey,
    pub pubkey: PublicKey,
    /// Human-readable path, recorded in key metadata.
    pub path: String,
}

/// Derive the child key at `index` on the external or internal chain of
/// the given seed secret. Re-deriving at an already used counter yields a
/// bit-identical key.
pub fn derive_child(
    secp: &Secp256k1<All>,
    seed_secret: &SecretKey,
    network: Network,
    internal: bool,
    index: u32,
    split: bool,
) -> KeystoreResult<DerivedChild> {
    let master = ExtendedPrivKey::new_master(network, &seed_secret.secret_bytes())
        .map_err(|e| KeystoreError::Derivation(e.to_string()))?;

    let chain = if internal && split { 1 } else { 0 };
    let path = DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(0).map_err(|e| KeystoreError::Derivation(e.to_string()))?,
        ChildNumber::from_hardened_idx(chain)
            .map_err(|e| KeystoreError::Derivation(e.to_string()))?,
        ChildNumber::from_hardened_idx(index)
            .map_err(|e| KeystoreError::Derivation(e.to_string()))?,
    ]);

    let child = master
        .derive_priv(secp, &path)
        .map_err(|e| KeystoreError::Derivation(e.to_string()))?;
    let secret = child.private_key;
    let pubkey = PublicKey::new(secret.public_key(secp));

    Ok(DerivedChild {
        secret,
        pubkey,
        path: format!("m/0'/{}'/{}'", chain, index),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcore::hashes::Hash;

    fn seed() -> SecretKey {
        SecretKey::from_byte_array(&[0x11; 32]).unwrap()
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let secp = Secp256k1::new();
        let a = derive_child(&secp, &seed(), Network::Testnet, false, 5, true).unwrap();
        let b = derive_child(&secp, &seed(), Network::Testnet, false, 5, true).unwrap();
        assert_eq!(a.secret, b.secret);
        assert_eq!(a.pubkey, b.pubkey);
        assert_eq!(a.path, "m/0'/0'/5'");
    }

    #[test]
    fn test_lanes_diverge_after_split() {
        let secp = Secp256k1::new();
        let ext = derive_child(&secp, &seed(), Network::Testnet, false, 0, true).unwrap();
        let int = derive_child(&secp, &seed(), Network::Testnet, true, 0, true).unwrap();
        assert_ne!(ext.pubkey, int.pubkey);
        assert_eq!(int.path, "m/0'/1'/0'");

        // Pre-split chains serve both lanes from the external path.
        let pre = derive_child(&secp, &seed(), Network::Testnet, true, 0, false).unwrap();
        assert_eq!(pre.pubkey, ext.pubkey);
    }

    #[test]
    fn test_counters() {
        let id = PubkeyHash::all_zeros();
        let mut chain = HdChain::new(id, true);
        assert_eq!(chain.next_child_index(false), 0);
        assert_eq!(chain.next_child_index(false), 1);
        assert_eq!(chain.next_child_index(true), 0);
        assert_eq!(chain.external_counter, 2);
        assert_eq!(chain.internal_counter, 1);

        let mut pre_split = HdChain::new(id, false);
        assert!(!pre_split.uses_split());
        assert_eq!(pre_split.next_child_index(true), 0);
        assert_eq!(pre_split.external_counter, 1);
        assert_eq!(pre_split.internal_counter, 0);
    }
}
