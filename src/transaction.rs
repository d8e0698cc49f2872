//! Signed value transfers and the typed records the ledger carries.

use crate::crypto::sha256_hex;
use crate::error::ValidationError;
use crate::wallet::{address_from_verifying_key, is_valid_address, ZERO_ADDRESS};
use chrono::Utc;
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// What a transaction records besides the value it moves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransactionKind {
    /// Initial allocation embedded in block 0.
    Genesis,
    /// Block reward paid to the miner.
    Reward,
    Transfer,
    #[serde(rename_all = "camelCase")]
    BatchCreate {
        batch_id: String,
        product: String,
        quantity: u64,
    },
    #[serde(rename_all = "camelCase")]
    DocumentUpload { document_hash: String, title: String },
    /// Deploys a contract once the containing block is appended.
    #[serde(rename_all = "camelCase")]
    ContractDeploy {
        code: Vec<Value>,
        #[serde(default)]
        initial_state: Map<String, Value>,
    },
}

impl TransactionKind {
    pub fn is_system(&self) -> bool {
        matches!(self, TransactionKind::Genesis | TransactionKind::Reward)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactionKind::Genesis => "genesis",
            TransactionKind::Reward => "reward",
            TransactionKind::Transfer => "transfer",
            TransactionKind::BatchCreate { .. } => "batchCreate",
            TransactionKind::DocumentUpload { .. } => "documentUpload",
            TransactionKind::ContractDeploy { .. } => "contractDeploy",
        }
    }

    fn canonical_value(&self) -> Value {
        match self {
            TransactionKind::Genesis | TransactionKind::Reward | TransactionKind::Transfer => {
                json!({ "type": self.name() })
            }
            TransactionKind::BatchCreate {
                batch_id,
                product,
                quantity,
            } => json!({
                "type": self.name(),
                "batchId": batch_id,
                "product": product,
                "quantity": quantity,
            }),
            TransactionKind::DocumentUpload {
                document_hash,
                title,
            } => json!({
                "type": self.name(),
                "documentHash": document_hash,
                "title": title,
            }),
            TransactionKind::ContractDeploy {
                code,
                initial_state,
            } => json!({
                "type": self.name(),
                "code": code,
                "initialState": initial_state,
            }),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            TransactionKind::BatchCreate {
                batch_id, quantity, ..
            } => {
                if batch_id.trim().is_empty() {
                    return Err(ValidationError::InvalidKind("batch id is empty".into()));
                }
                if *quantity == 0 {
                    return Err(ValidationError::InvalidKind("batch quantity is zero".into()));
                }
            }
            TransactionKind::DocumentUpload { document_hash, .. } => {
                let well_formed = document_hash.len() == 64
                    && document_hash
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
                if !well_formed {
                    return Err(ValidationError::InvalidKind(format!(
                        "document hash {document_hash} is not a sha256 hex digest"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    pub amount: u64,
    pub fee: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub kind: TransactionKind,
    pub hash: String,
    pub signature: Option<String>,
    pub public_key: Option<String>,
}

impl Transaction {
    /// Builds an unsigned transaction with its hash already computed.
    pub fn new(
        sender: &str,
        receiver: &str,
        amount: u64,
        fee: u64,
        kind: TransactionKind,
    ) -> Self {
        let mut tx = Transaction {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            amount,
            fee,
            timestamp: Utc::now().timestamp_millis(),
            kind,
            hash: String::new(),
            signature: None,
            public_key: None,
        };
        tx.hash = tx.calculate_hash();
        tx
    }

    /// System-issued transaction from the zero address. Never signed.
    pub fn system(kind: TransactionKind, receiver: &str, amount: u64) -> Self {
        Self::new(ZERO_ADDRESS, receiver, amount, 0, kind)
    }

    pub fn is_system(&self) -> bool {
        self.sender == ZERO_ADDRESS
    }

    /// Hash over the canonical field order; signature and public key excluded.
    pub fn calculate_hash(&self) -> String {
        let canonical = json!([
            self.id,
            self.sender,
            self.receiver,
            self.amount,
            self.fee,
            self.timestamp,
            self.kind.canonical_value(),
        ]);
        sha256_hex(canonical.to_string())
    }

    /// Every field, in a fixed order, as it enters a block hash.
    pub(crate) fn canonical_value(&self) -> Value {
        json!([
            self.id,
            self.sender,
            self.receiver,
            self.amount,
            self.fee,
            self.timestamp,
            self.kind.canonical_value(),
            self.hash,
            self.signature,
            self.public_key,
        ])
    }

    /// Checks the field invariants without touching signatures.
    pub fn validate_fields(&self) -> Result<(), ValidationError> {
        if self.amount == 0 {
            return Err(ValidationError::InvalidAmount);
        }
        if self.timestamp <= 0 {
            return Err(ValidationError::InvalidTimestamp(self.timestamp));
        }
        if !is_valid_address(&self.receiver) {
            return Err(ValidationError::InvalidAddress(self.receiver.clone()));
        }
        if self.is_system() {
            if !self.kind.is_system() {
                return Err(ValidationError::InvalidKind(format!(
                    "{} cannot be issued by the system",
                    self.kind.name()
                )));
            }
            return Ok(());
        }
        if self.kind.is_system() {
            return Err(ValidationError::InvalidKind(format!(
                "{} is reserved for the system",
                self.kind.name()
            )));
        }
        if !is_valid_address(&self.sender) {
            return Err(ValidationError::InvalidAddress(self.sender.clone()));
        }
        if self.sender == self.receiver {
            return Err(ValidationError::SelfTransfer(self.sender.clone()));
        }
        self.kind.validate()
    }

    /// Full check: field invariants, hash, and for user transactions the
    /// signature and the signer's address.
    pub fn verify(&self) -> Result<(), ValidationError> {
        self.validate_fields()?;
        if self.calculate_hash() != self.hash {
            return Err(ValidationError::HashMismatch(self.id.clone()));
        }
        if self.is_system() {
            return Ok(());
        }

        let signature = self
            .signature
            .as_deref()
            .ok_or_else(|| ValidationError::MissingSignature(self.hash.clone()))?;
        let public_key = self
            .public_key
            .as_deref()
            .ok_or_else(|| ValidationError::MissingSignature(self.hash.clone()))?;

        let key_bytes = hex::decode(public_key)
            .map_err(|e| ValidationError::MalformedSignature(e.to_string()))?;
        let verifying_key = VerifyingKey::from_sec1_bytes(&key_bytes)
            .map_err(|e| ValidationError::MalformedSignature(e.to_string()))?;
        if address_from_verifying_key(&verifying_key) != self.sender {
            return Err(ValidationError::SignerMismatch(self.sender.clone()));
        }

        let sig_bytes = hex::decode(signature)
            .map_err(|e| ValidationError::MalformedSignature(e.to_string()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| ValidationError::MalformedSignature(e.to_string()))?;
        let digest = hex::decode(&self.hash)
            .map_err(|_| ValidationError::HashMismatch(self.id.clone()))?;
        verifying_key
            .verify_prehash(&digest, &signature)
            .map_err(|_| ValidationError::InvalidSignature(self.hash.clone()))
    }

    /// Key used for double-spend detection.
    pub fn spend_key(&self) -> (String, u64, i64) {
        (self.sender.clone(), self.amount, self.timestamp)
    }

    /// Total debited from the sender.
    pub fn cost(&self) -> u128 {
        self.amount as u128 + self.fee as u128
    }
}

/// Converts a signed fee from external input.
pub fn checked_fee(fee: i64) -> Result<u64, ValidationError> {
    u64::try_from(fee).map_err(|_| ValidationError::InvalidFee)
}
