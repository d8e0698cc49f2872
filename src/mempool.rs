use crate::transaction::Transaction;
use std::collections::HashSet;

pub type SpendKey = (String, u64, i64);

/// Validated transactions waiting for the next block, in arrival order.
#[derive(Debug, Default)]
pub struct Mempool {
    transactions: Vec<Transaction>,
    spend_keys: HashSet<SpendKey>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tx: Transaction) {
        self.spend_keys.insert(tx.spend_key());
        self.transactions.push(tx);
    }

    pub fn contains_spend(&self, key: &SpendKey) -> bool {
        self.spend_keys.contains(key)
    }

    pub fn get(&self, hash: &str) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.hash == hash)
    }

    /// Amount plus fee of everything `address` has pending.
    pub fn pending_spend(&self, address: &str) -> u128 {
        self.transactions
            .iter()
            .filter(|tx| tx.sender == address)
            .map(Transaction::cost)
            .sum()
    }

    pub fn snapshot(&self) -> Vec<Transaction> {
        self.transactions.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
        self.spend_keys.clear();
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
