//! Shared fixtures: an in-memory chain and a handful of contract artifacts.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use alloy_core::{
    dyn_abi::DynSolValue,
    primitives::{Address, B256, Bytes, keccak256},
};
use bullrun_deploy::{
    ArtifactStore, ChainClient, ChainError, ContractArtifact, NetworkContext, NetworksConfig,
    TransactionReceipt, TransactionRequest, resolve_network_context,
};
use rand::Rng;

pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// Initialize tracing for tests (idempotent).
pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

struct RevertRule {
    prefix: Vec<u8>,
    reason: String,
}

/// How the receipt of a mined transaction misbehaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptFault {
    /// Mined with status 0.
    Failed,
    /// A contract creation whose receipt carries no address.
    NoContractAddress,
    /// The node errors on every receipt lookup.
    Unavailable(String),
}

struct FaultRule {
    prefix: Vec<u8>,
    fault: ReceiptFault,
}

/// Selector of a function signature.
pub fn selector(signature: &str) -> Vec<u8> {
    keccak256(signature.as_bytes())[..4].to_vec()
}

const QUEUE: &str = "queueTransaction(address,uint256,string,bytes,uint256)";
const EXECUTE: &str = "executeTransaction(address,uint256,string,bytes,uint256)";
const CANCEL: &str = "cancelTransaction(address,uint256,string,bytes,uint256)";
const QUEUED: &str = "queuedTransactions(bytes32)";

#[derive(Default)]
struct ChainState {
    nonces: HashMap<Address, u64>,
    block_number: u64,
    timestamp: u64,
    receipts: HashMap<B256, TransactionReceipt>,
    unavailable: HashMap<B256, String>,
    sent: Vec<TransactionRequest>,
    hashes: Vec<B256>,
    reverts: Vec<RevertRule>,
    faults: Vec<FaultRule>,
    /// Hashes held by any timelock on this chain.
    queued: HashSet<B256>,
}

/// An in-memory chain. Contract addresses follow the CREATE rule, so they are
/// determined by sender and nonce like on a real chain.
pub struct MockChain {
    chain_id: u64,
    accounts: Vec<Address>,
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(chain_id: u64, accounts: Vec<Address>) -> Self {
        Self {
            chain_id,
            accounts,
            state: Mutex::new(ChainState {
                block_number: 1,
                timestamp: GENESIS_TIMESTAMP,
                ..Default::default()
            }),
        }
    }

    /// A chain with the three well-known development accounts.
    pub fn develop() -> Self {
        Self::new(
            1337,
            (1..=3u8).map(Address::repeat_byte).collect(),
        )
    }

    /// A chain whose accounts are random, so two such chains never share a
    /// deployer.
    pub fn with_random_accounts(chain_id: u64, count: usize) -> Self {
        let mut rng = rand::rng();
        let accounts = (0..count)
            .map(|_| Address::from(rng.random::<[u8; 20]>()))
            .collect();
        Self::new(chain_id, accounts)
    }

    pub fn accounts_list(&self) -> Vec<Address> {
        self.accounts.clone()
    }

    /// Revert every transaction whose data starts with `prefix`.
    pub fn revert_when(&self, prefix: impl Into<Vec<u8>>, reason: impl Into<String>) {
        self.state.lock().unwrap().reverts.push(RevertRule {
            prefix: prefix.into(),
            reason: reason.into(),
        });
    }

    /// Mine transactions whose data starts with `prefix`, but with `fault`.
    pub fn receipt_fault_when(&self, prefix: impl Into<Vec<u8>>, fault: ReceiptFault) {
        self.state.lock().unwrap().faults.push(FaultRule {
            prefix: prefix.into(),
            fault,
        });
    }

    /// Hashes of the transactions accepted so far, in order.
    pub fn hashes(&self) -> Vec<B256> {
        self.state.lock().unwrap().hashes.clone()
    }

    /// Whether a timelock holds `hash`.
    pub fn is_queued(&self, hash: B256) -> bool {
        self.state.lock().unwrap().queued.contains(&hash)
    }

    /// Transactions accepted so far, in order.
    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn advance_time(&self, secs: u64) {
        let mut state = self.state.lock().unwrap();
        state.timestamp += secs;
        state.block_number += 1;
    }

    pub fn now(&self) -> u64 {
        self.state.lock().unwrap().timestamp
    }
}

impl ChainClient for MockChain {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().block_number)
    }

    async fn latest_timestamp(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().timestamp)
    }

    async fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        Ok(self.accounts.clone())
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<B256, ChainError> {
        let mut state = self.state.lock().unwrap();

        if let Some(rule) = state
            .reverts
            .iter()
            .find(|rule| tx.data.starts_with(&rule.prefix))
        {
            return Err(ChainError::Reverted {
                reason: rule.reason.clone(),
            });
        }

        let nonce = state.nonces.entry(tx.from).or_default();
        let current = *nonce;
        *nonce += 1;

        let mut preimage = tx.from.to_vec();
        preimage.extend_from_slice(&current.to_be_bytes());
        let hash = keccak256(preimage);

        let fault = state
            .faults
            .iter()
            .find(|rule| tx.data.starts_with(&rule.prefix))
            .map(|rule| rule.fault.clone());

        state.block_number += 1;
        let mut receipt = TransactionReceipt {
            transaction_hash: hash,
            block_number: state.block_number,
            contract_address: tx.is_create().then(|| tx.from.create(current)),
            status: true,
        };
        match fault {
            Some(ReceiptFault::Failed) => receipt.status = false,
            Some(ReceiptFault::NoContractAddress) => receipt.contract_address = None,
            Some(ReceiptFault::Unavailable(message)) => {
                state.unavailable.insert(hash, message);
            }
            None => {}
        }

        if receipt.status && tx.data.len() >= 4 {
            let call_hash = keccak256(&tx.data[4..]);
            let called = tx.data[..4].to_vec();
            if called == selector(QUEUE) {
                state.queued.insert(call_hash);
            } else if called == selector(EXECUTE) || called == selector(CANCEL) {
                state.queued.remove(&call_hash);
            }
        }

        state.receipts.insert(hash, receipt);
        state.hashes.push(hash);
        state.sent.push(tx);
        Ok(hash)
    }

    async fn wait_for_receipt(
        &self,
        hash: B256,
        _confirmations: u64,
    ) -> Result<TransactionReceipt, ChainError> {
        let state = self.state.lock().unwrap();
        if let Some(message) = state.unavailable.get(&hash) {
            return Err(ChainError::rpc(message.clone()));
        }
        let receipt = state
            .receipts
            .get(&hash)
            .cloned()
            .ok_or(ChainError::Timeout { hash, secs: 0 })?;
        if !receipt.status {
            return Err(ChainError::Failed { hash });
        }
        Ok(receipt)
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, ChainError> {
        if tx.data.len() == 36 && tx.data[..4] == selector(QUEUED)[..] {
            let queued = self.is_queued(B256::from_slice(&tx.data[4..]));
            return Ok(DynSolValue::Bool(queued).abi_encode().into());
        }
        Ok(Bytes::new())
    }
}

pub const TOKEN_BYTECODE: [u8; 3] = [0x60, 0x80, 0x01];
pub const VAULT_BYTECODE: [u8; 3] = [0x60, 0x80, 0x02];
pub const MASTERCHEF_BYTECODE: [u8; 3] = [0x60, 0x80, 0x03];
pub const TIMELOCK_BYTECODE: [u8; 3] = [0x60, 0x80, 0x04];

fn artifact(name: &str, abi: &str, bytecode: &[u8]) -> ContractArtifact {
    ContractArtifact::from_json(&format!(
        r#"{{"contractName":"{name}","abi":{abi},"bytecode":"0x{}"}}"#,
        hex::encode(bytecode)
    ))
    .unwrap()
}

const TOKEN_ABI: &str = r#"[
    {"type":"function","name":"mint","inputs":[{"name":"to","type":"address"},{"name":"amount","type":"uint256"}],"outputs":[],"stateMutability":"nonpayable"},
    {"type":"function","name":"transferOwnership","inputs":[{"name":"newOwner","type":"address"}],"outputs":[],"stateMutability":"nonpayable"}
]"#;

const VAULT_ABI: &str = r#"[
    {"type":"constructor","inputs":[{"name":"token","type":"address"},{"name":"owner","type":"address"}],"stateMutability":"nonpayable"},
    {"type":"function","name":"setStartBlock","inputs":[{"name":"startBlock","type":"uint256"}],"outputs":[],"stateMutability":"nonpayable"}
]"#;

const MASTERCHEF_ABI: &str = r#"[
    {"type":"constructor","inputs":[{"name":"bull","type":"address"},{"name":"startBlock","type":"uint256"}],"stateMutability":"nonpayable"},
    {"type":"function","name":"add","inputs":[{"name":"allocPoint","type":"uint256"},{"name":"lpToken","type":"address"},{"name":"depositFeeBP","type":"uint16"},{"name":"harvestInterval","type":"uint256"},{"name":"withUpdate","type":"bool"}],"outputs":[],"stateMutability":"nonpayable"}
]"#;

const TIMELOCK_ABI: &str = r#"[
    {"type":"constructor","inputs":[{"name":"admin","type":"address"},{"name":"delay","type":"uint256"}],"stateMutability":"nonpayable"}
]"#;

/// Artifacts for `TokenA`, `TokenB`, `Vault`, `Masterchef` and `Timelock`.
pub fn artifacts() -> ArtifactStore {
    ArtifactStore::from_artifacts([
        ("TokenA".to_string(), artifact("TokenA", TOKEN_ABI, &TOKEN_BYTECODE)),
        ("TokenB".to_string(), artifact("TokenB", TOKEN_ABI, &TOKEN_BYTECODE)),
        ("Vault".to_string(), artifact("Vault", VAULT_ABI, &VAULT_BYTECODE)),
        (
            "Masterchef".to_string(),
            artifact("Masterchef", MASTERCHEF_ABI, &MASTERCHEF_BYTECODE),
        ),
        (
            "Timelock".to_string(),
            artifact("Timelock", TIMELOCK_ABI, &TIMELOCK_BYTECODE),
        ),
    ])
}

pub const NETWORKS: &str = r#"
    [networks.develop]
    rpc_url = "http://127.0.0.1:8545"
    chain_id = 1337

    [networks.develop.params]
    start_block = "block+100"
    reward_token = "@TokenA"

    [networks.bsc_mainnet]
    rpc_url = "https://bsc-dataseed1.binance.org"

    [networks.bsc_mainnet.accounts]
    source = "node"
    roles = ["owner"]
"#;

pub async fn context(chain: &MockChain, network: &str) -> NetworkContext {
    let config = NetworksConfig::from_toml_str(NETWORKS).unwrap();
    resolve_network_context(&config, network, chain).await.unwrap()
}
