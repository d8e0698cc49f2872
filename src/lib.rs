//! # Provenance Chain
//!
//! A single-node proof-of-work ledger with secp256k1 wallets, and a
//! gas-metered contract engine that keeps per-contract JSON state in the same
//! key/value store as the blocks.

pub mod block;
pub mod blockchain;
pub mod config;
pub mod contract;
pub mod crypto;
pub mod error;
pub mod mempool;
pub mod mining;
pub mod storage;
pub mod transaction;
pub mod vm;
pub mod wallet;

pub use block::{AuditFlag, Block, BlockMetadata};
pub use blockchain::{Blockchain, ChainFault, ChainReport, ChainStats, TransactionRecord};
pub use config::{BalancePolicy, Config, ContractConfig, LedgerConfig};
pub use contract::{CallRequest, CallResponse, Contract, ContractEngine, DeployRequest, DeployResponse};
pub use error::{Error, ErrorKind, Result};
pub use storage::{MemoryStore, SledStore, Store};
pub use transaction::{Transaction, TransactionKind};
pub use wallet::{Wallet, ZERO_ADDRESS};

use std::sync::Arc;

/// Ledger and contract engine opened over one shared store.
pub struct Node {
    pub chain: Arc<Blockchain>,
    pub contracts: Arc<ContractEngine>,
}

impl Node {
    /// Opens both engines and restores any contract whose deploying
    /// transaction is confirmed but whose records never reached the store.
    pub fn open(config: &Config, store: Arc<dyn Store>) -> Result<Self> {
        let contracts = Arc::new(ContractEngine::new(store.clone(), config.contracts.clone()));
        let chain = Blockchain::open(config.ledger.clone(), store)?.with_contracts(contracts.clone());
        chain.restore_contract_deploys()?;
        Ok(Node {
            chain: Arc::new(chain),
            contracts,
        })
    }

    /// Opens the sled database under `config.data_dir`.
    pub fn open_sled(config: &Config) -> Result<Self> {
        let store = SledStore::open(&config.data_dir)?;
        Self::open(config, Arc::new(store))
    }
}
