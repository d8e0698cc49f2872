//! Node configuration: defaults, an optional TOML file, then `PROVENANCE_*` env vars.

use crate::wallet::{normalize_address, ZERO_ADDRESS};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Whether `add_transaction` checks that the sender can afford a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalancePolicy {
    /// Confirmed balance minus pending spends must cover amount + fee.
    Enforced,
    /// Only signatures and the double-spend triple are checked.
    Unchecked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub recipient: String,
    pub supply: u64,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        GenesisConfig {
            recipient: ZERO_ADDRESS.to_string(),
            supply: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub initial_difficulty: u32,
    pub min_difficulty: u32,
    pub target_block_time_ms: u64,
    pub mining_reward: u64,
    pub balance_policy: BalancePolicy,
    /// User transactions at or above this amount are flagged in block metadata.
    pub high_value_threshold: u64,
    pub genesis: GenesisConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            initial_difficulty: 2,
            min_difficulty: 1,
            target_block_time_ms: 10_000,
            mining_reward: 50,
            balance_policy: BalancePolicy::Enforced,
            high_value_threshold: 1_000_000,
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractConfig {
    pub default_gas_limit: u64,
    pub max_gas_limit: u64,
}

impl Default for ContractConfig {
    fn default() -> Self {
        ContractConfig {
            default_gas_limit: 1_000,
            max_gas_limit: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub wallet_path: PathBuf,
    pub log_level: String,
    pub ledger: LedgerConfig,
    pub contracts: ContractConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("chain_state"),
            wallet_path: PathBuf::from("wallet.json"),
            log_level: "info".to_string(),
            ledger: LedgerConfig::default(),
            contracts: ContractConfig::default(),
        }
    }
}

impl Config {
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("PROVENANCE_").split("__"))
    }

    pub fn load(file: Option<&Path>) -> Result<Self, figment::Error> {
        let config: Config = Self::figment(file).extract()?;
        Ok(config.normalized())
    }

    /// Clamps values that would make mining or metering meaningless.
    pub fn normalized(mut self) -> Self {
        self.ledger.min_difficulty = self.ledger.min_difficulty.max(1);
        self.ledger.initial_difficulty = self
            .ledger
            .initial_difficulty
            .max(self.ledger.min_difficulty);
        self.contracts.default_gas_limit = self
            .contracts
            .default_gas_limit
            .min(self.contracts.max_gas_limit);
        self.ledger.genesis.recipient = normalize_address(&self.ledger.genesis.recipient);
        self
    }
}
