//! Error taxonomy for the ledger, wallet and contract engine.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of a failure, for callers that only need "kind + message".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: the request itself is wrong.
    Validation,
    /// A well-formed request that cannot complete (gas, missing contract, ...).
    Resource,
    /// Mining was aborted or could not be made durable.
    Mining,
    /// Durable storage failed.
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Resource => "resource",
            ErrorKind::Mining => "mining",
            ErrorKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Mining(#[from] MiningError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Wallet(WalletError::InvalidKey(_)) => ErrorKind::Validation,
            Error::Wallet(_) => ErrorKind::Storage,
            Error::Mining(_) => ErrorKind::Mining,
            Error::Contract(_) => ErrorKind::Resource,
            Error::Storage(_) => ErrorKind::Storage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Amount must be greater than zero")]
    InvalidAmount,
    #[error("Fee must not be negative")]
    InvalidFee,
    #[error("Sender and receiver must differ: {0}")]
    SelfTransfer(String),
    #[error("Invalid transaction kind: {0}")]
    InvalidKind(String),
    #[error("Transaction hash mismatch for {0}")]
    HashMismatch(String),
    #[error("Transaction {0} carries no signature")]
    MissingSignature(String),
    #[error("Malformed signature or public key: {0}")]
    MalformedSignature(String),
    #[error("Signature verification failed for {0}")]
    InvalidSignature(String),
    #[error("Public key does not belong to sender {0}")]
    SignerMismatch(String),
    #[error("Timestamp must be positive, got {0}")]
    InvalidTimestamp(i64),
    #[error("Sender {0} is reserved for system transactions")]
    ReservedSender(String),
    #[error("Double spend: {sender} already spent {amount} at {timestamp}")]
    DoubleSpend {
        sender: String,
        amount: u64,
        timestamp: i64,
    },
    #[error("Insufficient funds for {address}: available {available}, required {required}")]
    InsufficientFunds {
        address: String,
        available: i128,
        required: i128,
    },
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("Wallet file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Wallet encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("Mining aborted after {attempts} attempts")]
    Aborted { attempts: u64 },
    #[error("Block {index} was mined but could not be persisted: {source}")]
    PersistFailed {
        index: u64,
        #[source]
        source: StorageError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContractError {
    #[error("Out of gas: used {used}, limit {limit}")]
    OutOfGas { used: u64, limit: u64 },
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Malformed {op} operation: {reason}")]
    MalformedOperation { op: String, reason: String },
    #[error("Value at {0} is not numeric")]
    NotNumeric(String),
    #[error("Contract not found: {0}")]
    ContractNotFound(String),
    #[error("Contract code must be a list of operations")]
    InvalidCode,
    #[error("Gas limit {requested} exceeds the maximum of {max}")]
    GasLimitTooHigh { requested: u64, max: u64 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("Write rejected for {0}")]
    WriteRejected(String),
}
