//! Network settings and the resolved context a plan runs against.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::Duration,
};

use alloy_core::primitives::Address;
use alloy_signer_local::{MnemonicBuilder, coins_bip39::English};
use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{ArgExpr, ChainClient, OrchestratorError, ValidationScope, chain::parse_rpc_url};

/// Prefix of environment variables overriding network settings.
pub const ENV_PREFIX: &str = "BULLRUN_";

fn default_confirmations() -> u64 {
    1
}

fn default_receipt_timeout_secs() -> u64 {
    600
}

fn default_sender() -> String {
    "owner".to_string()
}

/// Where role addresses come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum AccountSource {
    /// Role `i` is the node's `i`-th account from `eth_accounts`.
    Node { roles: Vec<String> },
    /// Role `i` is derived at index `i` of a BIP-39 mnemonic.
    Mnemonic { mnemonic: String, roles: Vec<String> },
    /// Fixed addresses.
    Static { addresses: BTreeMap<String, Address> },
}

impl Default for AccountSource {
    fn default() -> Self {
        Self::Node {
            roles: ["owner", "operator", "tester"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl AccountSource {
    pub fn role_names(&self) -> BTreeSet<String> {
        match self {
            Self::Node { roles } | Self::Mnemonic { roles, .. } => roles.iter().cloned().collect(),
            Self::Static { addresses } => addresses.keys().cloned().collect(),
        }
    }
}

/// Derive the first `count` addresses of a mnemonic.
pub fn derive_addresses(mnemonic: &str, count: usize) -> anyhow::Result<Vec<Address>> {
    (0..count)
        .map(|index| {
            let signer = MnemonicBuilder::<English>::default()
                .phrase(mnemonic)
                .index(index as u32)
                .with_context(|| format!("invalid derivation index {index}"))?
                .build()
                .with_context(|| format!("failed to derive account {index} from mnemonic"))?;
            Ok(Address::from(signer.address().0.0))
        })
        .collect()
}

/// Settings of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Expected chain id. Checked against the node when set.
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default)]
    pub gas_price: Option<u64>,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    /// Overrides the name-based guess, see [`NetworkSettings::is_testnet`].
    #[serde(default)]
    pub testnet: Option<bool>,
    /// Role that sends steps without an explicit `from`.
    #[serde(default = "default_sender")]
    pub default_sender: String,
    #[serde(default)]
    pub accounts: AccountSource,
    #[serde(default)]
    pub params: BTreeMap<String, ArgExpr>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            rpc_url: None,
            chain_id: None,
            confirmations: default_confirmations(),
            gas_price: None,
            gas_limit: None,
            receipt_timeout_secs: default_receipt_timeout_secs(),
            testnet: None,
            default_sender: default_sender(),
            accounts: AccountSource::default(),
            params: BTreeMap::new(),
        }
    }
}

impl NetworkSettings {
    /// Whether `when = "testnet"` steps run. Networks whose name contains
    /// `mainnet` are production unless configured otherwise.
    pub fn is_testnet(&self, name: &str) -> bool {
        self.testnet.unwrap_or(!name.contains("mainnet"))
    }

    pub fn rpc_url(&self, name: &str) -> Result<Url, OrchestratorError> {
        let url = self.rpc_url.as_deref().ok_or_else(|| {
            OrchestratorError::configuration(format!("network `{name}` has no rpc_url"))
        })?;
        parse_rpc_url(url)
            .map_err(|e| OrchestratorError::configuration(format!("network `{name}`: {e:#}")))
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

/// All configured networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworksConfig {
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkSettings>,
}

impl NetworksConfig {
    /// Load from a TOML file, overridden by `BULLRUN_*` environment variables
    /// (nested keys separated by `__`).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            anyhow::bail!("Network config does not exist: {}", path.display());
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load network config from {}", path.display()))?;

        tracing::debug!(
            path = %path.display(),
            networks = config.networks.len(),
            "Network config loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Figment::from(Toml::string(content))
            .extract()
            .context("Failed to parse network config")
    }

    pub fn network(&self, name: &str) -> Result<&NetworkSettings, OrchestratorError> {
        self.networks.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.networks.keys().map(String::as_str).collect();
            OrchestratorError::configuration(format!(
                "unknown network `{name}` (configured: {})",
                known.join(", ")
            ))
        })
    }
}

/// Everything a run needs to know about the network it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub network: String,
    pub rpc_url: Url,
    pub chain_id: u64,
    pub roles: BTreeMap<String, Address>,
    /// Parameters, with `block` expressions already replaced by numbers.
    pub params: BTreeMap<String, ArgExpr>,
    pub testnet: bool,
    pub default_sender: String,
    pub confirmations: u64,
    pub gas_price: Option<u64>,
    pub gas_limit: Option<u64>,
}

impl NetworkContext {
    pub fn role(&self, name: &str) -> Option<Address> {
        self.roles.get(name).copied()
    }

    /// Address sending a step, given the step's optional `from` role.
    pub fn sender(&self, from: Option<&str>) -> Result<Address, String> {
        let role = from.unwrap_or(self.default_sender.as_str());
        self.role(role)
            .ok_or_else(|| format!("unknown sender role `{role}`"))
    }
}

impl ValidationScope {
    pub fn from_context(context: &NetworkContext) -> Self {
        Self {
            testnet: context.testnet,
            params: context.params.clone(),
            roles: context.roles.keys().cloned().collect(),
            default_sender: context.default_sender.clone(),
        }
    }

    /// Scope for checking a plan without contacting the network.
    pub fn from_settings(name: &str, settings: &NetworkSettings) -> Self {
        Self {
            testnet: settings.is_testnet(name),
            params: settings.params.clone(),
            roles: settings.accounts.role_names(),
            default_sender: settings.default_sender.clone(),
        }
    }
}

/// Resolve the named network against a live chain.
pub async fn resolve_network_context<C: ChainClient>(
    config: &NetworksConfig,
    name: &str,
    client: &C,
) -> Result<NetworkContext, OrchestratorError> {
    let settings = config.network(name)?;
    let rpc_url = settings.rpc_url(name)?;
    let chain_err =
        |e: crate::ChainError| OrchestratorError::configuration(format!("network `{name}`: {e}"));

    let chain_id = client.chain_id().await.map_err(chain_err)?;
    match settings.chain_id {
        Some(expected) if expected != chain_id => {
            return Err(OrchestratorError::configuration(format!(
                "network `{name}` expects chain id {expected} but the node reports {chain_id}"
            )));
        }
        _ => {}
    }

    let roles: BTreeMap<String, Address> = match &settings.accounts {
        AccountSource::Node { roles } => {
            let accounts = client.accounts().await.map_err(chain_err)?;
            if accounts.len() < roles.len() {
                return Err(OrchestratorError::configuration(format!(
                    "network `{name}` needs {} node accounts for roles [{}], the node has {}",
                    roles.len(),
                    roles.join(", "),
                    accounts.len()
                )));
            }
            roles.iter().cloned().zip(accounts).collect()
        }
        AccountSource::Mnemonic { mnemonic, roles } => {
            let addresses = derive_addresses(mnemonic, roles.len()).map_err(|e| {
                OrchestratorError::configuration(format!("network `{name}`: {e:#}"))
            })?;
            roles.iter().cloned().zip(addresses).collect()
        }
        AccountSource::Static { addresses } => addresses.clone(),
    };

    if !roles.contains_key(&settings.default_sender) {
        return Err(OrchestratorError::configuration(format!(
            "network `{name}`: default sender `{}` is not a configured role",
            settings.default_sender
        )));
    }

    let params = if settings.params.values().any(ArgExpr::needs_block_number) {
        let block_number = client.block_number().await.map_err(chain_err)?;
        tracing::debug!(network = %name, block_number, "Resolving block parameters");
        settings
            .params
            .iter()
            .map(|(key, value)| (key.clone(), value.clone().with_block_number(block_number)))
            .collect()
    } else {
        settings.params.clone()
    };

    let context = NetworkContext {
        network: name.to_string(),
        rpc_url,
        chain_id,
        roles,
        params,
        testnet: settings.is_testnet(name),
        default_sender: settings.default_sender.clone(),
        confirmations: settings.confirmations,
        gas_price: settings.gas_price,
        gas_limit: settings.gas_limit,
    };

    tracing::info!(
        network = %context.network,
        chain_id = context.chain_id,
        testnet = context.testnet,
        roles = context.roles.len(),
        "Network context resolved"
    );
    Ok(context)
}
