//! Error kinds surfaced by the deployment orchestrator.

use derive_more::{Display, Error};

use crate::DeploymentReport;

/// Errors raised while resolving a network, deploying a contract or applying a
/// configuration step.
///
/// Every variant is fatal for the run: nothing is retried and nothing is rolled
/// back, since confirmed transactions stay confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum OrchestratorError {
    /// Missing or invalid network settings, or a plan reference that cannot be
    /// satisfied.
    #[display("configuration error: {message}")]
    Configuration { message: String },
    /// A contract-creation transaction could not be built, reverted, or never
    /// confirmed.
    #[display("deployment of {contract} failed: {message}")]
    Deployment { contract: String, message: String },
    /// A configuration call reverted on-chain. The reason is the node's, untouched.
    #[display("transaction reverted: {reason}")]
    Revert { reason: String },
}

impl OrchestratorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn deployment(contract: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Deployment {
            contract: contract.into(),
            message: message.into(),
        }
    }

    /// The on-chain revert reason, if this error is a revert.
    pub fn revert_reason(&self) -> Option<&str> {
        match self {
            Self::Revert { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    pub fn is_deployment(&self) -> bool {
        matches!(self, Self::Deployment { .. })
    }
}

/// A halted plan run.
///
/// Carries the step that failed and the report of everything confirmed strictly
/// before it, so an operator can decide where to resume.
#[derive(Debug, Display, Error)]
#[display("step {step} ({label}) failed: {source}")]
pub struct RunFailure {
    /// 1-based position of the failing step among the steps active on the
    /// network. `0` means the plan was rejected before the first step.
    pub step: usize,
    /// Human-readable label of the failing step.
    pub label: String,
    /// Why the step failed. Already part of the message, so not reported as
    /// the error's source.
    #[error(not(source))]
    pub source: OrchestratorError,
    /// Records and queued calls completed before the failure.
    pub report: DeploymentReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_reason_is_kept_verbatim() {
        let err = OrchestratorError::Revert {
            reason: "Timelock::queueTransaction: Call must come from admin.".to_string(),
        };
        assert_eq!(
            err.revert_reason(),
            Some("Timelock::queueTransaction: Call must come from admin.")
        );
        assert_eq!(
            err.to_string(),
            "transaction reverted: Timelock::queueTransaction: Call must come from admin."
        );
    }

    #[test]
    fn test_run_failure_prints_reason_once() {
        let failure = RunFailure {
            step: 3,
            label: "TokenA.mint".to_string(),
            source: OrchestratorError::Revert {
                reason: "Ownable: caller is not the owner".to_string(),
            },
            report: DeploymentReport::new("develop"),
        };
        assert!(std::error::Error::source(&failure).is_none());

        let chain = format!("{:#}", anyhow::Error::from(failure));
        assert_eq!(
            chain,
            "step 3 (TokenA.mint) failed: transaction reverted: Ownable: caller is not the owner"
        );
    }

    #[test]
    fn test_kind_predicates() {
        assert!(OrchestratorError::configuration("x").is_configuration());
        assert!(OrchestratorError::deployment("Vault", "x").is_deployment());
        assert!(OrchestratorError::configuration("x").revert_reason().is_none());
    }
}
