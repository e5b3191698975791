//! Dash Wallet Core
//!
//! This library provides the core of a Dash wallet: hierarchical
//! deterministic key management with an encrypted keystore and keypool,
//! tracking of wallet-relevant transactions through reorgs, conflicts
//! and abandonment, coin selection (branch-and-bound, knapsack and the
//! denomination-aware selectors used by mixing), transaction building
//! and signing, and persistence over an ordered key/value store.
//!
//! The blockchain node is an external collaborator reached through the
//! [`chain::ChainAccess`] trait; the wallet consumes its validation
//! events and pushes transactions back through it.

pub mod chain;
pub mod coins;
pub mod denominations;
pub mod error;
pub mod events;
pub mod fee;
pub mod flush;
pub mod hd_chain;
pub mod keypool;
pub mod keystore;
pub mod selection;
pub mod storage;
pub mod test_utils;
pub mod tx_store;
pub mod wallet;
pub mod wallet_tx;

pub use dashcore;

pub use chain::ChainAccess;
pub use coins::{AvailableCoinsFilter, CoinControl, CoinType, CompactTallyItem, Output};
pub use error::{Result, StorageError, WalletError};
pub use events::{ChangeType, EventBus, WalletEvent};
pub use fee::{FeeEstimator, FeeRate};
pub use keypool::{KeyPool, KeyPoolEntry, ReservedKey};
pub use keystore::{IsMine, KeyMetadata, KeyStore};
pub use selection::{CoinEligibilityFilter, CoinSelectionParams, InputCoin};
pub use storage::memory::MemoryStorage;
pub use storage::{WalletStorage, WriteBatch};
pub use tx_store::TxStore;
pub use wallet::balance::IsMineFilter;
pub use wallet::builder::{CreatedTransaction, Recipient};
pub use wallet::config::WalletConfig;
pub use wallet::{RescanReserver, Wallet};
pub use wallet_tx::{TxState, WalletTx};

/// Re-export commonly used types.
pub mod prelude {
    pub use super::{
        AvailableCoinsFilter, ChainAccess, CoinControl, CoinType, FeeRate, Recipient, Result,
        Wallet, WalletConfig, WalletError, WalletStorage,
    };
    pub use dashcore::{Address, Network, OutPoint, Transaction, TxOut, Txid};
}
