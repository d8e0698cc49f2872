use crate::crypto::{meets_difficulty, merkle_root, sha256_hex, ZERO_HASH};
use crate::transaction::{Transaction, TransactionKind};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Compliance envelope. Derived from the transactions; not covered by the hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadata {
    pub transfers: u32,
    pub batches: u32,
    pub documents: u32,
    pub deployments: u32,
    pub system: u32,
    pub total_value: u64,
    pub total_fees: u64,
    pub audit_flags: Vec<AuditFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "flag", rename_all = "camelCase")]
pub enum AuditFlag {
    #[serde(rename_all = "camelCase")]
    HighValueTransfer { tx_hash: String, amount: u64 },
    #[serde(rename_all = "camelCase")]
    ContractDeployment { tx_hash: String },
}

impl BlockMetadata {
    pub fn summarize(transactions: &[Transaction], high_value_threshold: u64) -> Self {
        let mut meta = BlockMetadata::default();
        for tx in transactions {
            match &tx.kind {
                TransactionKind::Genesis | TransactionKind::Reward => meta.system += 1,
                TransactionKind::Transfer => meta.transfers += 1,
                TransactionKind::BatchCreate { .. } => meta.batches += 1,
                TransactionKind::DocumentUpload { .. } => meta.documents += 1,
                TransactionKind::ContractDeploy { .. } => {
                    meta.deployments += 1;
                    meta.audit_flags.push(AuditFlag::ContractDeployment {
                        tx_hash: tx.hash.clone(),
                    });
                }
            }
            meta.total_value = meta.total_value.saturating_add(tx.amount);
            meta.total_fees = meta.total_fees.saturating_add(tx.fee);
            if !tx.is_system() && tx.amount >= high_value_threshold {
                meta.audit_flags.push(AuditFlag::HighValueTransfer {
                    tx_hash: tx.hash.clone(),
                    amount: tx.amount,
                });
            }
        }
        meta
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    /// RFC 3339, UTC, millisecond precision.
    pub timestamp: String,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub nonce: u64,
    pub hash: String,
    pub merkle_root: String,
    pub difficulty: u32,
    pub mining_time_ms: u64,
    pub metadata: BlockMetadata,
}

impl Block {
    /// An unmined block stamped with the current time.
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
        high_value_threshold: u64,
    ) -> Self {
        let merkle_root = Self::merkle_of(&transactions);
        let metadata = BlockMetadata::summarize(&transactions, high_value_threshold);
        let mut block = Block {
            index,
            timestamp: now_rfc3339(),
            transactions,
            previous_hash,
            nonce: 0,
            hash: String::new(),
            merkle_root,
            difficulty,
            mining_time_ms: 0,
            metadata,
        };
        block.hash = block.calculate_hash();
        block
    }

    /// Block 0: one system allocation, fixed nonce, never mined.
    pub fn genesis(allocation: Transaction, difficulty: u32, high_value_threshold: u64) -> Self {
        Self::new(
            0,
            ZERO_HASH.to_string(),
            vec![allocation],
            difficulty,
            high_value_threshold,
        )
    }

    pub fn merkle_of(transactions: &[Transaction]) -> String {
        let leaves: Vec<&str> = transactions.iter().map(|tx| tx.hash.as_str()).collect();
        merkle_root(&leaves)
    }

    pub fn hasher(&self) -> BlockHasher {
        let transactions =
            Value::Array(self.transactions.iter().map(Transaction::canonical_value).collect());
        BlockHasher {
            head: format!("{}{}{}{}", self.index, self.timestamp, transactions, self.previous_hash),
            tail: format!("{}{}", self.merkle_root, self.difficulty),
        }
    }

    pub fn calculate_hash(&self) -> String {
        self.hasher().hash(self.nonce)
    }

    pub fn has_valid_proof(&self) -> bool {
        meets_difficulty(&self.hash, self.difficulty)
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.timestamp_millis())
    }

    /// Re-stamps the block, used when the nonce space is exhausted.
    pub(crate) fn restamp(&mut self) {
        self.timestamp = now_rfc3339();
        self.nonce = 0;
    }
}

/// Pre-serialized block fields so a nonce search only re-hashes.
pub struct BlockHasher {
    head: String,
    tail: String,
}

impl BlockHasher {
    pub fn hash(&self, nonce: u64) -> String {
        sha256_hex(format!("{}{}{}", self.head, nonce, self.tail))
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;
    use pretty_assertions::assert_eq;

    fn sample_block() -> Block {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let transfer = alice.create_transaction(bob.address(), 5_000, 2).unwrap();
        let deploy = alice
            .create_transaction_with_kind(
                TransactionKind::ContractDeploy {
                    code: vec![],
                    initial_state: Default::default(),
                },
                bob.address(),
                1,
                0,
            )
            .unwrap();
        let reward = Transaction::system(TransactionKind::Reward, bob.address(), 50);
        Block::new(1, ZERO_HASH.to_string(), vec![transfer, deploy, reward], 1, 1_000)
    }

    #[test]
    fn hash_covers_transactions() {
        let mut block = sample_block();
        assert_eq!(block.hash, block.calculate_hash());
        block.transactions[0].fee += 1;
        assert_ne!(block.hash, block.calculate_hash());
    }

    #[test]
    fn hash_survives_serialization() {
        let block = sample_block();
        let decoded: Block = serde_json::from_slice(&serde_json::to_vec(&block).unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.calculate_hash(), block.hash);
    }

    #[test]
    fn metadata_counts_kinds_and_flags() {
        let block = sample_block();
        let meta = &block.metadata;
        assert_eq!(meta.transfers, 1);
        assert_eq!(meta.deployments, 1);
        assert_eq!(meta.system, 1);
        assert_eq!(meta.total_value, 5_051);
        assert_eq!(meta.total_fees, 2);
        assert_eq!(meta.audit_flags.len(), 2);
        assert!(matches!(meta.audit_flags[0], AuditFlag::HighValueTransfer { amount: 5_000, .. }));
        assert!(matches!(meta.audit_flags[1], AuditFlag::ContractDeployment { .. }));
    }

    #[test]
    fn genesis_merkle_root_hashes_the_allocation_with_itself() {
        let allocation = Transaction::system(TransactionKind::Genesis, crate::wallet::ZERO_ADDRESS, 10);
        let leaf = allocation.hash.clone();
        let genesis = Block::genesis(allocation, 1, 1_000);
        assert_eq!(genesis.merkle_root, sha256_hex(format!("{leaf}{leaf}")));
        assert_ne!(genesis.merkle_root, leaf);
    }

    #[test]
    fn timestamp_parses_back() {
        let block = sample_block();
        let millis = block.timestamp_millis().unwrap();
        assert!(millis > 0);
        assert!(block.timestamp.ends_with('Z'));
    }
}
