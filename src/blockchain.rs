use crate::block::Block;
use crate::config::{BalancePolicy, LedgerConfig};
use crate::contract::{contract_address, ContractEngine};
use crate::crypto::{meets_difficulty, ZERO_HASH};
use crate::error::{MiningError, Result, StorageError, ValidationError};
use crate::mempool::{Mempool, SpendKey};
use crate::mining::{adjust_difficulty, mine};
use crate::storage::{block_key, get_json, put_json, Store, LATEST_BLOCK_KEY};
use crate::transaction::{Transaction, TransactionKind};
use crate::wallet::is_valid_address;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionIndex {
    pub block_index: u64,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub transaction: Transaction,
    /// `None` while the transaction waits in the mempool.
    pub block_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStats {
    pub blocks: usize,
    pub transactions: usize,
    pub pending: usize,
    pub difficulty: u32,
    pub average_block_time_ms: u64,
    pub total_minted: u64,
    pub total_fees: u64,
    pub addresses: usize,
}

/// First integrity problem found by [`Blockchain::validate_chain_report`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChainFault {
    Genesis(String),
    HashMismatch { index: u64 },
    BrokenLink { index: u64 },
    InsufficientWork { index: u64 },
    MerkleMismatch { index: u64 },
    InvalidTransaction {
        index: u64,
        tx_hash: String,
        reason: ValidationError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainReport {
    pub blocks_checked: usize,
    pub fault: Option<ChainFault>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.fault.is_none()
    }
}

struct ChainState {
    chain: Vec<Block>,
    mempool: Mempool,
    difficulty: u32,
    balances: HashMap<String, i128>,
    tx_index: HashMap<String, TransactionIndex>,
    spent: HashSet<SpendKey>,
}

impl ChainState {
    fn new(difficulty: u32) -> Self {
        ChainState {
            chain: Vec::new(),
            mempool: Mempool::new(),
            difficulty,
            balances: HashMap::new(),
            tx_index: HashMap::new(),
            spent: HashSet::new(),
        }
    }

    fn tip(&self) -> &Block {
        self.chain.last().expect("chain always holds the genesis block")
    }

    fn balance(&self, address: &str) -> i128 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    /// Indexes the block's transactions and pushes it onto the chain.
    fn append(&mut self, block: Block) {
        for (position, tx) in block.transactions.iter().enumerate() {
            self.tx_index.insert(
                tx.hash.clone(),
                TransactionIndex {
                    block_index: block.index,
                    position,
                },
            );
            self.spent.insert(tx.spend_key());
            *self.balances.entry(tx.receiver.clone()).or_default() += tx.amount as i128;
            if !tx.is_system() {
                *self.balances.entry(tx.sender.clone()).or_default() -= tx.cost() as i128;
            }
        }
        self.chain.push(block);
    }

    fn next_difficulty(&self, config: &LedgerConfig) -> u32 {
        let n = self.chain.len();
        if n < 2 {
            return config.initial_difficulty;
        }
        let (prev, last) = (&self.chain[n - 2], &self.chain[n - 1]);
        let elapsed = match (last.timestamp_millis(), prev.timestamp_millis()) {
            (Some(a), Some(b)) => a - b,
            _ => config.target_block_time_ms as i64,
        };
        adjust_difficulty(
            last.difficulty,
            elapsed,
            config.target_block_time_ms,
            config.min_difficulty,
        )
    }
}

/// Single-node ledger: chain, mempool, difficulty and indices behind one lock,
/// written through to a [`Store`].
pub struct Blockchain {
    config: LedgerConfig,
    store: Arc<dyn Store>,
    contracts: Option<Arc<ContractEngine>>,
    state: Mutex<ChainState>,
}

impl Blockchain {
    /// Reloads the chain from `store`, or writes a genesis block into an empty one.
    pub fn open(config: LedgerConfig, store: Arc<dyn Store>) -> Result<Self> {
        let blockchain = Blockchain {
            state: Mutex::new(ChainState::new(config.initial_difficulty)),
            config,
            store,
            contracts: None,
        };

        match get_json::<u64>(blockchain.store.as_ref(), LATEST_BLOCK_KEY)? {
            Some(latest) => blockchain.reload(latest)?,
            None => blockchain.create_genesis_block()?,
        }
        Ok(blockchain)
    }

    /// Deploys contracts carried by `ContractDeploy` transactions once their block lands.
    pub fn with_contracts(mut self, engine: Arc<ContractEngine>) -> Self {
        self.contracts = Some(engine);
        self
    }

    fn reload(&self, latest: u64) -> Result<()> {
        let mut state = self.state.lock();
        for index in 0..=latest {
            let key = block_key(index);
            let block: Block = get_json(self.store.as_ref(), &key)?.ok_or_else(|| {
                StorageError::Corrupt {
                    key: key.clone(),
                    reason: format!("missing block below latest pointer {latest}"),
                }
            })?;
            if block.index != index {
                return Err(StorageError::Corrupt {
                    key,
                    reason: format!("record holds block {}", block.index),
                }
                .into());
            }
            state.append(block);
        }
        state.difficulty = state.next_difficulty(&self.config);
        info!(
            blocks = state.chain.len(),
            difficulty = state.difficulty,
            "reloaded chain from storage"
        );
        Ok(())
    }

    fn create_genesis_block(&self) -> Result<()> {
        let genesis = &self.config.genesis;
        if !is_valid_address(&genesis.recipient) {
            return Err(ValidationError::InvalidAddress(genesis.recipient.clone()).into());
        }
        let allocation = Transaction::system(TransactionKind::Genesis, &genesis.recipient, genesis.supply);
        allocation.validate_fields()?;
        let block = Block::genesis(
            allocation,
            self.config.initial_difficulty,
            self.config.high_value_threshold,
        );
        self.persist(&block)?;

        let mut state = self.state.lock();
        info!(hash = %block.hash, recipient = %genesis.recipient, "created genesis block");
        state.append(block);
        state.difficulty = self.config.initial_difficulty;
        Ok(())
    }

    /// Block record first, then the latest pointer; the caller only advances
    /// in-memory state once both are durable.
    fn persist(&self, block: &Block) -> std::result::Result<(), StorageError> {
        put_json(self.store.as_ref(), &block_key(block.index), block)?;
        put_json(self.store.as_ref(), LATEST_BLOCK_KEY, &block.index)?;
        self.store.flush()
    }

    /// Verifies `tx` and admits it to the mempool. Returns the transaction hash.
    ///
    /// Duplicate detection compares `(sender, amount, timestamp)` only. Whether
    /// the sender can afford the transfer depends on the configured
    /// [`BalancePolicy`].
    pub fn add_transaction(&self, tx: Transaction) -> Result<String> {
        if let Err(e) = tx.verify() {
            warn!(hash = %tx.hash, error = %e, "rejected transaction");
            return Err(e.into());
        }
        if tx.is_system() {
            return Err(ValidationError::ReservedSender(tx.sender.clone()).into());
        }

        let mut state = self.state.lock();
        let key = tx.spend_key();
        if state.mempool.contains_spend(&key) || state.spent.contains(&key) {
            warn!(hash = %tx.hash, sender = %tx.sender, "double spend");
            return Err(ValidationError::DoubleSpend {
                sender: tx.sender.clone(),
                amount: tx.amount,
                timestamp: tx.timestamp,
            }
            .into());
        }

        if self.config.balance_policy == BalancePolicy::Enforced {
            let available = state.balance(&tx.sender) - state.mempool.pending_spend(&tx.sender) as i128;
            let required = tx.cost() as i128;
            if available < required {
                return Err(ValidationError::InsufficientFunds {
                    address: tx.sender.clone(),
                    available,
                    required,
                }
                .into());
            }
        }

        let hash = tx.hash.clone();
        debug!(%hash, kind = tx.kind.name(), pending = state.mempool.len() + 1, "admitted transaction");
        state.mempool.push(tx);
        Ok(hash)
    }

    pub fn mine_block(&self, reward_address: &str) -> Result<Block> {
        self.mine_block_with_abort(reward_address, &CancellationToken::new())
    }

    /// Mines the whole mempool plus a reward into the next block.
    ///
    /// Holds the chain lock for the whole search, so transactions submitted
    /// meanwhile wait for the next block. `cancel` aborts the search; a store
    /// failure after a proof was found leaves chain and mempool untouched.
    pub fn mine_block_with_abort(
        &self,
        reward_address: &str,
        cancel: &CancellationToken,
    ) -> Result<Block> {
        if !is_valid_address(reward_address) {
            return Err(ValidationError::InvalidAddress(reward_address.to_string()).into());
        }

        let mut state = self.state.lock();
        let (index, previous_hash) = {
            let tip = state.tip();
            (tip.index + 1, tip.hash.clone())
        };
        let mut transactions = state.mempool.snapshot();
        transactions.push(Transaction::system(
            TransactionKind::Reward,
            reward_address,
            self.config.mining_reward,
        ));
        let mut block = Block::new(
            index,
            previous_hash,
            transactions,
            state.difficulty,
            self.config.high_value_threshold,
        );

        let attempts = match mine(&mut block, cancel) {
            Ok(attempts) => attempts,
            Err(e) => {
                warn!(index, error = %e, "mining stopped");
                return Err(e.into());
            }
        };

        if let Err(source) = self.persist(&block) {
            warn!(index, error = %source, "mined block could not be persisted");
            return Err(MiningError::PersistFailed { index, source }.into());
        }

        state.mempool.clear();
        state.append(block.clone());
        state.difficulty = state.next_difficulty(&self.config);
        info!(
            index,
            hash = %block.hash,
            nonce = block.nonce,
            attempts,
            mining_time_ms = block.mining_time_ms,
            transactions = block.transactions.len(),
            next_difficulty = state.difficulty,
            "appended block"
        );
        drop(state);

        self.deploy_contracts(&block);
        Ok(block)
    }

    fn deploy_contracts(&self, block: &Block) {
        let Some(engine) = &self.contracts else {
            return;
        };
        for tx in &block.transactions {
            if let TransactionKind::ContractDeploy {
                code,
                initial_state,
            } = &tx.kind
            {
                match engine.deploy_at(code.clone(), initial_state.clone(), tx.timestamp) {
                    Ok(address) => info!(%address, tx = %tx.hash, "deployed contract from transaction"),
                    Err(e) => warn!(
                        tx = %tx.hash,
                        expected = %contract_address(code, tx.timestamp),
                        error = %e,
                        "contract deployment from transaction failed, restored on next open"
                    ),
                }
            }
        }
    }

    /// Re-runs the deployment of every confirmed `ContractDeploy` whose
    /// contract is missing from the store, e.g. after a write failed once the
    /// block was already durable. Returns how many contracts were restored.
    pub fn restore_contract_deploys(&self) -> Result<usize> {
        let Some(engine) = &self.contracts else {
            return Ok(0);
        };
        let deploys: Vec<(String, Vec<Value>, Map<String, Value>, i64)> = {
            let state = self.state.lock();
            state
                .chain
                .iter()
                .flat_map(|block| block.transactions.iter())
                .filter_map(|tx| match &tx.kind {
                    TransactionKind::ContractDeploy {
                        code,
                        initial_state,
                    } => Some((tx.hash.clone(), code.clone(), initial_state.clone(), tx.timestamp)),
                    _ => None,
                })
                .collect()
        };

        let mut restored = 0;
        for (tx_hash, code, initial_state, timestamp) in deploys {
            if engine.get_contract(&contract_address(&code, timestamp))?.is_some() {
                continue;
            }
            let address = engine.deploy_at(code, initial_state, timestamp)?;
            info!(%address, tx = %tx_hash, "restored contract from confirmed transaction");
            restored += 1;
        }
        Ok(restored)
    }

    pub fn validate_chain(&self) -> bool {
        self.validate_chain_report().is_valid()
    }

    /// Recomputes every hash, link, proof, Merkle root and transaction. Does not repair.
    pub fn validate_chain_report(&self) -> ChainReport {
        let state = self.state.lock();
        let chain = &state.chain;
        let fault = Self::find_fault(chain);
        ChainReport {
            blocks_checked: chain.len(),
            fault,
        }
    }

    fn find_fault(chain: &[Block]) -> Option<ChainFault> {
        let genesis = chain.first()?;
        if genesis.index != 0 || genesis.previous_hash != ZERO_HASH {
            return Some(ChainFault::Genesis("bad index or previous hash".into()));
        }
        if genesis.hash != genesis.calculate_hash() {
            return Some(ChainFault::Genesis("hash mismatch".into()));
        }

        for pair in chain.windows(2) {
            let (prev, block) = (&pair[0], &pair[1]);
            let index = block.index;
            if block.hash != block.calculate_hash() {
                return Some(ChainFault::HashMismatch { index });
            }
            if block.previous_hash != prev.hash || index != prev.index + 1 {
                return Some(ChainFault::BrokenLink { index });
            }
            if !meets_difficulty(&block.hash, block.difficulty) {
                return Some(ChainFault::InsufficientWork { index });
            }
            if block.merkle_root != Block::merkle_of(&block.transactions) {
                return Some(ChainFault::MerkleMismatch { index });
            }
            for tx in &block.transactions {
                if let Err(reason) = tx.verify() {
                    return Some(ChainFault::InvalidTransaction {
                        index,
                        tx_hash: tx.hash.clone(),
                        reason,
                    });
                }
            }
        }
        None
    }

    pub fn latest_block(&self) -> Block {
        self.state.lock().tip().clone()
    }

    pub fn block_by_index(&self, index: u64) -> Option<Block> {
        let state = self.state.lock();
        usize::try_from(index)
            .ok()
            .and_then(|i| state.chain.get(i))
            .cloned()
    }

    pub fn block_by_hash(&self, hash: &str) -> Option<Block> {
        let state = self.state.lock();
        state.chain.iter().find(|b| b.hash == hash).cloned()
    }

    /// Confirmed transactions carry their block index; pending ones do not.
    pub fn transaction(&self, hash: &str) -> Option<TransactionRecord> {
        let state = self.state.lock();
        if let Some(location) = state.tx_index.get(hash) {
            let block = state.chain.get(location.block_index as usize)?;
            let tx = block.transactions.get(location.position)?;
            return Some(TransactionRecord {
                transaction: tx.clone(),
                block_index: Some(location.block_index),
            });
        }
        state.mempool.get(hash).map(|tx| TransactionRecord {
            transaction: tx.clone(),
            block_index: None,
        })
    }

    /// Every confirmed then pending transaction that `address` sent or received.
    pub fn transactions_by_address(&self, address: &str) -> Vec<TransactionRecord> {
        let state = self.state.lock();
        let involves = |tx: &Transaction| tx.sender == address || tx.receiver == address;
        let mut records = Vec::new();
        for block in &state.chain {
            for tx in block.transactions.iter().filter(|tx| involves(tx)) {
                records.push(TransactionRecord {
                    transaction: tx.clone(),
                    block_index: Some(block.index),
                });
            }
        }
        for tx in state.mempool.iter().filter(|tx| involves(tx)) {
            records.push(TransactionRecord {
                transaction: tx.clone(),
                block_index: None,
            });
        }
        records
    }

    /// Confirmed balance from the incremental index.
    pub fn balance(&self, address: &str) -> i128 {
        self.state.lock().balance(address)
    }

    /// Confirmed balance recomputed from every block.
    pub fn replay_balance(&self, address: &str) -> i128 {
        let state = self.state.lock();
        state
            .chain
            .iter()
            .flat_map(|b| b.transactions.iter())
            .fold(0i128, |balance, tx| {
                let mut balance = balance;
                if tx.receiver == address {
                    balance += tx.amount as i128;
                }
                if tx.sender == address && !tx.is_system() {
                    balance -= tx.cost() as i128;
                }
                balance
            })
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.state.lock().mempool.snapshot()
    }

    pub fn chain(&self) -> Vec<Block> {
        self.state.lock().chain.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().chain.is_empty()
    }

    /// Difficulty the next block will be mined at.
    pub fn difficulty(&self) -> u32 {
        self.state.lock().difficulty
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn stats(&self) -> ChainStats {
        let state = self.state.lock();
        let chain = &state.chain;
        let transactions = chain.iter().map(|b| b.transactions.len()).sum();
        let (total_minted, total_fees) = chain
            .iter()
            .flat_map(|b| b.transactions.iter())
            .fold((0u64, 0u64), |(minted, fees), tx| {
                if tx.is_system() {
                    (minted.saturating_add(tx.amount), fees)
                } else {
                    (minted, fees.saturating_add(tx.fee))
                }
            });
        let average_block_time_ms = match (
            chain.first().and_then(Block::timestamp_millis),
            chain.last().and_then(Block::timestamp_millis),
        ) {
            (Some(first), Some(last)) if chain.len() > 1 => {
                ((last - first).max(0) as u64) / (chain.len() as u64 - 1)
            }
            _ => 0,
        };
        ChainStats {
            blocks: chain.len(),
            transactions,
            pending: state.mempool.len(),
            difficulty: state.difficulty,
            average_block_time_ms,
            total_minted,
            total_fees,
            addresses: state.balances.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisConfig;
    use crate::storage::MemoryStore;
    use crate::wallet::Wallet;
    use pretty_assertions::assert_eq;

    fn config_funding(recipient: &Wallet) -> LedgerConfig {
        LedgerConfig {
            initial_difficulty: 1,
            genesis: GenesisConfig {
                recipient: recipient.address().to_string(),
                supply: 1_000,
            },
            ..LedgerConfig::default()
        }
    }

    fn open(config: LedgerConfig) -> (Arc<MemoryStore>, Blockchain) {
        let store = Arc::new(MemoryStore::new());
        let chain = Blockchain::open(config, store.clone()).unwrap();
        (store, chain)
    }

    #[test]
    fn genesis_is_persisted() {
        let alice = Wallet::generate();
        let (store, chain) = open(config_funding(&alice));
        assert_eq!(chain.len(), 1);
        let genesis = chain.latest_block();
        assert_eq!(genesis.previous_hash, ZERO_HASH);
        assert_eq!(genesis.nonce, 0);
        assert_eq!(get_json::<u64>(store.as_ref(), LATEST_BLOCK_KEY).unwrap(), Some(0));
        assert_eq!(chain.balance(alice.address()), 1_000);
        assert!(chain.validate_chain());
    }

    #[test]
    fn persist_failure_keeps_memory_behind_storage() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let (store, chain) = open(config_funding(&alice));
        let tx = alice.create_transaction(bob.address(), 10, 1).unwrap();
        chain.add_transaction(tx).unwrap();

        store.reject_writes(Some(LATEST_BLOCK_KEY));
        let err = chain.mine_block(bob.address()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Mining(MiningError::PersistFailed { index: 1, .. })
        ));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.pending_transactions().len(), 1);
        assert_eq!(get_json::<u64>(store.as_ref(), LATEST_BLOCK_KEY).unwrap(), Some(0));

        store.reject_writes(None);
        let block = chain.mine_block(bob.address()).unwrap();
        assert_eq!(block.index, 1);
        assert!(chain.pending_transactions().is_empty());
        assert_eq!(chain.balance(bob.address()), 10 + 50);
    }

    #[test]
    fn system_sender_cannot_submit() {
        let alice = Wallet::generate();
        let (_, chain) = open(config_funding(&alice));
        let tx = Transaction::system(TransactionKind::Reward, alice.address(), 5);
        let err = chain.add_transaction(tx).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Validation(ValidationError::ReservedSender(_))
        ));
    }

    #[test]
    fn transaction_lookup_covers_pending_and_confirmed() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let (_, chain) = open(config_funding(&alice));
        let hash = chain
            .add_transaction(alice.create_transaction(bob.address(), 10, 0).unwrap())
            .unwrap();
        assert_eq!(chain.transaction(&hash).unwrap().block_index, None);

        chain.mine_block(bob.address()).unwrap();
        let record = chain.transaction(&hash).unwrap();
        assert_eq!(record.block_index, Some(1));
        assert_eq!(record.transaction.hash, hash);
        assert!(chain.transaction("missing").is_none());
    }

    #[test]
    fn tampered_header_is_reported() {
        let alice = Wallet::generate();
        let (_, chain) = open(config_funding(&alice));
        chain.mine_block(alice.address()).unwrap();
        {
            let mut state = chain.state.lock();
            let block = &mut state.chain[1];
            block.merkle_root = ZERO_HASH.to_string();
        }
        assert_eq!(
            chain.validate_chain_report().fault,
            Some(ChainFault::HashMismatch { index: 1 })
        );
    }
}
