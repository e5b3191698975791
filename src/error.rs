//! Error types for the wallet core.

use std::io;
use thiserror::Error;

/// Main error type for wallet operations.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Coin selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Transaction too large")]
    TransactionTooLarge,

    #[error("Transaction has too long a mempool chain")]
    AncestorChainTooLong,

    #[error("Fee estimation failed and fallback fee is disabled")]
    FeeEstimationFailed,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rescan aborted by user")]
    AbortedByUser,

    #[error("Rescan already in progress")]
    ScanInProgress,

    #[error("Mempool rejected transaction: {0}")]
    MempoolRejected(String),

    #[error("Bip32 error: {0}")]
    Bip32(#[from] dashcore::bip32::Error),

    #[error("{0}")]
    General(String),
}

/// Errors raised by the keystore.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Private keys are present but encrypted and the wallet is locked
    /// (or unlocked for mixing only and the caller is not the mixer).
    #[error("Wallet is locked")]
    Locked,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Incorrect passphrase")]
    IncorrectPassphrase,

    #[error("Wallet is already encrypted")]
    AlreadyEncrypted,

    #[error("Wallet is not encrypted")]
    NotEncrypted,

    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Secp256k1 error: {0}")]
    Secp256k1(#[from] dashcore::secp256k1::Error),
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Wallet requires a newer version of the software (min version {0})")]
    TooNew(u32),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] dashcore::consensus::encode::Error),
}

/// Errors raised during coin selection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No UTXOs available for selection")]
    NoUtxosAvailable,

    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Selection failed: {0}")]
    SelectionFailed(String),
}

/// Type alias for Result with WalletError.
pub type Result<T> = std::result::Result<T, WalletError>;

/// Type alias for keystore operation results.
pub type KeystoreResult<T> = std::result::Result<T, KeystoreError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
