//! Helpers for Compound-style timelock governance.
//!
//! A timelock holds ownership of a contract and only forwards calls that were
//! queued at least `delay` seconds earlier. A queued call is identified by
//! `keccak256(abi.encode(target, value, signature, data, eta))`.

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, B256, Bytes, U256, keccak256},
};
use serde::{Deserialize, Serialize};

/// Smallest delay a timelock accepts (6 hours).
pub const MINIMUM_DELAY: u64 = 6 * 60 * 60;
/// Largest delay a timelock accepts (30 days).
pub const MAXIMUM_DELAY: u64 = 30 * 24 * 60 * 60;
/// How long after its eta a queued call stays executable (14 days).
pub const GRACE_PERIOD: u64 = 14 * 24 * 60 * 60;

const QUEUE_SIGNATURE: &str = "queueTransaction(address,uint256,string,bytes,uint256)";
const EXECUTE_SIGNATURE: &str = "executeTransaction(address,uint256,string,bytes,uint256)";
const CANCEL_SIGNATURE: &str = "cancelTransaction(address,uint256,string,bytes,uint256)";
const QUEUED_SIGNATURE: &str = "queuedTransactions(bytes32)";

/// Check a delay against the bounds the timelock constructor enforces.
pub fn validate_delay(delay: u64) -> anyhow::Result<()> {
    if delay < MINIMUM_DELAY {
        anyhow::bail!("Timelock::constructor: Delay must exceed minimum delay.");
    }
    if delay > MAXIMUM_DELAY {
        anyhow::bail!("Timelock::setDelay: Delay must not exceed maximum delay.");
    }
    Ok(())
}

/// Calldata for the `queuedTransactions(hash)` getter.
pub fn encode_is_queued(hash: B256) -> Bytes {
    let mut data = keccak256(QUEUED_SIGNATURE.as_bytes())[..4].to_vec();
    data.extend_from_slice(hash.as_slice());
    data.into()
}

/// Decode the answer of `queuedTransactions(hash)`.
pub fn decode_is_queued(data: &[u8]) -> anyhow::Result<bool> {
    match DynSolType::Bool.abi_decode(data)? {
        DynSolValue::Bool(queued) => Ok(queued),
        other => anyhow::bail!("expected a bool, got {other:?}"),
    }
}

/// A call to be queued on, executed by, or cancelled from a timelock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelockCall {
    pub target: Address,
    pub value: U256,
    /// Canonical function signature, e.g. `add(uint256,address,uint16,uint256,uint256)`.
    pub signature: String,
    /// ABI-encoded arguments, without selector.
    pub data: Bytes,
    /// Unix timestamp from which the call may be executed.
    pub eta: u64,
}

impl TimelockCall {
    fn params(&self) -> DynSolValue {
        DynSolValue::Tuple(vec![
            DynSolValue::Address(self.target),
            DynSolValue::Uint(self.value, 256),
            DynSolValue::String(self.signature.clone()),
            DynSolValue::Bytes(self.data.to_vec()),
            DynSolValue::Uint(U256::from(self.eta), 256),
        ])
    }

    /// The identifier the timelock stores the queued call under.
    pub fn hash(&self) -> B256 {
        keccak256(self.params().abi_encode_params())
    }

    pub fn encode_queue(&self) -> Bytes {
        self.encode_with(QUEUE_SIGNATURE)
    }

    pub fn encode_execute(&self) -> Bytes {
        self.encode_with(EXECUTE_SIGNATURE)
    }

    pub fn encode_cancel(&self) -> Bytes {
        self.encode_with(CANCEL_SIGNATURE)
    }

    fn encode_with(&self, signature: &str) -> Bytes {
        let mut data = keccak256(signature.as_bytes())[..4].to_vec();
        data.extend(self.params().abi_encode_params());
        data.into()
    }

    /// Whether the timelock would accept `executeTransaction` at `now`.
    pub fn is_ready(&self, now: u64) -> bool {
        now >= self.eta && !self.is_stale(now)
    }

    /// Whether the grace period has passed and the call can never execute.
    pub fn is_stale(&self, now: u64) -> bool {
        now > self.eta.saturating_add(GRACE_PERIOD)
    }
}
