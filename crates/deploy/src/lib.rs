//! bullrun-deploy - Deployment and configuration orchestration for EVM contracts.
//!
//! A [`DeploymentPlan`] lists contract deployments and configuration calls in
//! order. The [`Orchestrator`] runs it against a [`NetworkContext`] through a
//! [`ChainClient`], one confirmed transaction at a time, and hands back a
//! [`DeploymentReport`] of every deployed address.

pub mod args;
pub use args::ArgExpr;

mod artifacts;
pub use artifacts::{ArtifactStore, ContractArtifact, EncodedCall};

pub mod chain;
pub use chain::{
    ChainClient, ChainError, RpcChainClient, TransactionReceipt, TransactionRequest,
    decode_revert_reason,
};

mod error;
pub use error::{OrchestratorError, RunFailure};

mod network;
pub use network::{
    AccountSource, ENV_PREFIX, NetworkContext, NetworkSettings, NetworksConfig, derive_addresses,
    resolve_network_context,
};

mod orchestrator;
pub use orchestrator::{
    ConfigurationOutcome, Orchestrator, QUEUE_ETA_MARGIN_SECS, QueueExecution,
};

pub mod plan;
pub use plan::{
    ConfigurationStep, ContractSpec, DeploymentPlan, MethodRef, Step, StepCondition,
    TimelockRoute, ValidationScope,
};

mod report;
pub use report::{DeployedContractRecord, DeploymentManifest, DeploymentReport, QueuedCall};

pub mod rpc;
pub mod timelock;
