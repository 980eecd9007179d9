//! Deployment reports: what a run deployed, and where.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, B256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{DeploymentPlan, timelock::TimelockCall};

/// A contract deployed during a run. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedContractRecord {
    id: String,
    artifact: String,
    address: Address,
    network: String,
    transaction_hash: B256,
    block_number: u64,
}

impl DeployedContractRecord {
    pub fn new(
        id: impl Into<String>,
        artifact: impl Into<String>,
        address: Address,
        network: impl Into<String>,
        transaction_hash: B256,
        block_number: u64,
    ) -> Self {
        Self {
            id: id.into(),
            artifact: artifact.into(),
            address,
            network: network.into(),
            transaction_hash,
            block_number,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn transaction_hash(&self) -> B256 {
        self.transaction_hash
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }
}

/// A configuration call queued on a timelock during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCall {
    /// Label of the step that queued it.
    pub label: String,
    /// Identifier of the timelock contract.
    pub timelock: String,
    pub timelock_address: Address,
    pub call: TimelockCall,
    /// `call.hash()`, as stored by the timelock.
    pub hash: B256,
}

/// The records of one run, in deployment order.
///
/// Displayed as one `<identifier> <address>` line per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    network: String,
    records: Vec<DeployedContractRecord>,
    #[serde(default)]
    queued: Vec<QueuedCall>,
}

impl DeploymentReport {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            records: Vec::new(),
            queued: Vec::new(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn records(&self) -> &[DeployedContractRecord] {
        &self.records
    }

    pub fn queued(&self) -> &[QueuedCall] {
        &self.queued
    }

    pub fn get(&self, id: &str) -> Option<&DeployedContractRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn address(&self, id: &str) -> Option<Address> {
        self.get(id).map(DeployedContractRecord::address)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn push(&mut self, record: DeployedContractRecord) {
        self.records.push(record);
    }

    pub(crate) fn push_queued(&mut self, queued: QueuedCall) {
        self.queued.push(queued);
    }

    /// File name of the address listing, e.g. `bsc_testnet main contracts.txt`.
    pub fn listing_file_name(&self, plan_name: &str, partial: bool) -> String {
        let suffix = if partial { ".partial" } else { "" };
        format!("{} {}{}.txt", self.network, plan_name, suffix)
    }

    /// Write the address listing into `dir`, creating it if needed.
    pub fn save_listing(&self, dir: &Path, plan_name: &str, partial: bool) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
        let path = dir.join(self.listing_file_name(plan_name, partial));
        std::fs::write(&path, self.to_string())
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        tracing::info!(path = %path.display(), records = self.len(), "Address listing saved");
        Ok(path)
    }
}

impl fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{} {}", record.id, record.address.to_checksum(None))?;
        }
        Ok(())
    }
}

/// Everything an operator needs to audit or continue a run, saved as JSON next
/// to the address listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub network: String,
    pub chain_id: u64,
    pub plan: String,
    /// See [`DeploymentPlan::fingerprint`].
    pub plan_fingerprint: String,
    /// Unix timestamp of the run.
    pub deployed_at: i64,
    pub bullrun_version: String,
    /// `false` when the run halted.
    pub complete: bool,
    pub records: Vec<DeployedContractRecord>,
    pub queued: Vec<QueuedCall>,
}

impl DeploymentManifest {
    pub fn new(
        report: &DeploymentReport,
        plan: &DeploymentPlan,
        chain_id: u64,
        complete: bool,
    ) -> Result<Self> {
        Ok(Self {
            network: report.network.clone(),
            chain_id,
            plan: plan.name.clone(),
            plan_fingerprint: plan.fingerprint()?,
            deployed_at: chrono::Utc::now().timestamp(),
            bullrun_version: env!("CARGO_PKG_VERSION").to_string(),
            complete,
            records: report.records.clone(),
            queued: report.queued.clone(),
        })
    }

    /// File name of the manifest, e.g. `bsc_testnet main contracts.json`.
    pub fn file_name(&self) -> String {
        let suffix = if self.complete { "" } else { ".partial" };
        format!("{} {}{}.json", self.network, self.plan, suffix)
    }

    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
        let path = dir.join(self.file_name());
        self.save_to_file(&path)?;
        Ok(path)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize deployment manifest")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write deployment manifest to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Deployment manifest saved");
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Deployment manifest does not exist: {}", path.display());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| {
                format!("Failed to read deployment manifest from {}", path.display())
            })?;
        serde_json::from_str(&content).context("Failed to parse deployment manifest JSON")
    }

    /// Rebuild the report this manifest was written from.
    pub fn into_report(self) -> DeploymentReport {
        DeploymentReport {
            network: self.network,
            records: self.records,
            queued: self.queued,
        }
    }
}
