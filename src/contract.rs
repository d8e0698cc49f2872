//! Contract deployment, invocation and state access on top of the VM.

use crate::config::ContractConfig;
use crate::crypto::sha256_hex;
use crate::error::{ContractError, Result};
use crate::storage::{contract_key, get_json, put_json, state_key, Store};
use crate::vm::{self, EventRecord, State};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub address: String,
    pub code: Vec<Value>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub code: Value,
    #[serde(default)]
    pub initial_state: State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResponse {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub address: String,
    /// Runs instead of the stored code when present.
    #[serde(default)]
    pub ops: Option<Vec<Value>>,
    #[serde(default)]
    pub gas_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub state: State,
    pub gas_used: u64,
    pub events: Vec<EventRecord>,
}

/// `0x` + first 40 hex chars of SHA-256(code JSON ++ timestamp).
///
/// Two deployments of the same code in the same millisecond share an address.
pub fn contract_address(code: &[Value], timestamp: i64) -> String {
    let code_json = Value::Array(code.to_vec()).to_string();
    let digest = sha256_hex(format!("{code_json}{timestamp}"));
    format!("0x{}", &digest[..40])
}

pub struct ContractEngine {
    store: Arc<dyn Store>,
    config: ContractConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ContractEngine {
    pub fn new(store: Arc<dyn Store>, config: ContractConfig) -> Self {
        ContractEngine {
            store,
            config,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, address: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn deploy(&self, request: DeployRequest) -> Result<DeployResponse> {
        let code = match request.code {
            Value::Array(ops) => ops,
            _ => return Err(ContractError::InvalidCode.into()),
        };
        let address = self.deploy_at(code, request.initial_state, Utc::now().timestamp_millis())?;
        Ok(DeployResponse { address })
    }

    /// Deploys with an explicit creation time. An existing contract at the
    /// derived address is left untouched and its address returned.
    pub fn deploy_at(&self, code: Vec<Value>, initial_state: State, created_at: i64) -> Result<String> {
        let address = contract_address(&code, created_at);
        let lock = self.lock_for(&address);
        let _guard = lock.lock();

        if self.store.get(&contract_key(&address))?.is_some() {
            warn!(%address, "contract address already in use, keeping existing contract");
            return Ok(address);
        }

        let contract = Contract {
            address: address.clone(),
            code,
            created_at,
        };
        // The contract record goes last: its presence marks a complete deploy.
        put_json(self.store.as_ref(), &state_key(&address), &initial_state)?;
        put_json(self.store.as_ref(), &contract_key(&address), &contract)?;
        self.store.flush()?;
        info!(%address, ops = contract.code.len(), "deployed contract");
        Ok(address)
    }

    /// Executes the stored code, or `ops` when given, and persists the new state.
    pub fn call(&self, request: CallRequest) -> Result<CallResponse> {
        let gas_limit = request.gas_limit.unwrap_or(self.config.default_gas_limit);
        if gas_limit > self.config.max_gas_limit {
            return Err(ContractError::GasLimitTooHigh {
                requested: gas_limit,
                max: self.config.max_gas_limit,
            }
            .into());
        }

        // Contracts are never removed, so a miss here is final and needs no lock.
        if self.store.get(&contract_key(&request.address))?.is_none() {
            return Err(ContractError::ContractNotFound(request.address).into());
        }
        let lock = self.lock_for(&request.address);
        let _guard = lock.lock();

        let contract = self
            .get_contract(&request.address)?
            .ok_or_else(|| ContractError::ContractNotFound(request.address.clone()))?;
        let state = self.read_state(&request.address)?.unwrap_or_default();
        let program = request.ops.unwrap_or(contract.code);

        let outcome = vm::execute(&program, &state, gas_limit, Utc::now().timestamp_millis())
            .map_err(|e| {
                debug!(address = %request.address, error = %e, "contract call failed");
                e
            })?;

        put_json(self.store.as_ref(), &state_key(&request.address), &outcome.state)?;
        self.store.flush()?;
        debug!(
            address = %request.address,
            gas_used = outcome.gas_used,
            events = outcome.events.len(),
            "contract call committed"
        );
        Ok(CallResponse {
            state: outcome.state,
            gas_used: outcome.gas_used,
            events: outcome.events,
        })
    }

    /// State of a deployed contract. A state record without its contract
    /// record is left over from an interrupted deploy and reads as absent.
    pub fn get_state(&self, address: &str) -> Result<Option<State>> {
        if self.store.get(&contract_key(address))?.is_none() {
            return Ok(None);
        }
        self.read_state(address)
    }

    fn read_state(&self, address: &str) -> Result<Option<State>> {
        Ok(get_json(self.store.as_ref(), &state_key(address))?)
    }

    pub fn get_contract(&self, address: &str) -> Result<Option<Contract>> {
        Ok(get_json(self.store.as_ref(), &contract_key(address))?)
    }

    /// Addresses of every deployed contract, in key order.
    pub fn addresses(&self) -> Result<Vec<String>> {
        let entries = self.store.scan_prefix("contract:")?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| key.strip_prefix("contract:").map(str::to_string))
            .collect())
    }
}
