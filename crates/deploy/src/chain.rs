//! The chain capability the orchestrator drives: submit a transaction, wait for
//! it to be confirmed, read state.

use std::{future::Future, time::Duration};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue},
    primitives::{Address, B256, Bytes, U256},
};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use derive_more::{Display, Error};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::rpc::{self, RpcCallError, deserialize_u64_from_hex};

/// Selector of `Error(string)`, the standard revert payload.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Prefixes nodes put in front of the revert reason in error messages.
const REVERT_MESSAGE_PREFIXES: &[&str] = &[
    "execution reverted: ",
    "VM Exception while processing transaction: revert ",
    "Error: VM Exception while processing transaction: reverted with reason string ",
];

/// Interval between receipt polls.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Headroom added on top of `eth_estimateGas`, in percent.
const GAS_ESTIMATE_MARGIN_PERCENT: u64 = 20;

/// Failures reported by a [`ChainClient`].
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ChainError {
    /// The transaction (or its dry run) reverted with a reason.
    #[display("execution reverted: {reason}")]
    Reverted { reason: String },
    /// The transaction was mined but failed, without a reason.
    #[display("transaction {hash} failed on-chain")]
    Failed { hash: B256 },
    /// The node could not be reached or refused the request.
    #[display("{message}")]
    Rpc { message: String },
    /// The transaction was not confirmed in time.
    #[display("timed out after {secs}s waiting for transaction {hash}")]
    Timeout { hash: B256, secs: u64 },
}

impl ChainError {
    pub fn rpc(message: impl Into<String>) -> Self {
        Self::Rpc {
            message: message.into(),
        }
    }
}

/// A transaction to submit. `to == None` creates a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
    pub gas: Option<u64>,
    pub gas_price: Option<u64>,
}

impl TransactionRequest {
    pub fn create(from: Address, data: Bytes) -> Self {
        Self {
            from,
            to: None,
            data,
            value: U256::ZERO,
            gas: None,
            gas_price: None,
        }
    }

    pub fn call(from: Address, to: Address, data: Bytes) -> Self {
        Self {
            to: Some(to),
            ..Self::create(from, data)
        }
    }

    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    fn to_json(&self) -> Value {
        let mut tx = json!({
            "from": self.from,
            "data": self.data,
        });
        if let Some(to) = self.to {
            tx["to"] = json!(to);
        }
        if !self.value.is_zero() {
            tx["value"] = json!(format!("0x{:x}", self.value));
        }
        if let Some(gas) = self.gas {
            tx["gas"] = json!(format!("0x{gas:x}"));
        }
        if let Some(gas_price) = self.gas_price {
            tx["gasPrice"] = json!(format!("0x{gas_price:x}"));
        }
        tx
    }
}

/// The confirmed outcome of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub block_number: u64,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(deserialize_with = "deserialize_status")]
    pub status: bool,
}

fn deserialize_status<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_u64_from_hex(deserializer).map(|status| status == 1)
}

/// What the orchestrator needs from a chain.
///
/// Implementations never retry a submitted transaction.
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Timestamp of the latest block.
    fn latest_timestamp(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Accounts the node manages, in order.
    fn accounts(&self) -> impl Future<Output = Result<Vec<Address>, ChainError>> + Send;

    /// Submit a transaction, returning its hash.
    fn send_transaction(
        &self,
        tx: TransactionRequest,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Wait until `hash` is mined and `confirmations` blocks deep.
    fn wait_for_receipt(
        &self,
        hash: B256,
        confirmations: u64,
    ) -> impl Future<Output = Result<TransactionReceipt, ChainError>> + Send;

    /// Execute a read-only call against the latest block.
    fn call(
        &self,
        tx: TransactionRequest,
    ) -> impl Future<Output = Result<Bytes, ChainError>> + Send;
}

/// Extract the reason from a revert, or `None` if the failure is not a revert.
///
/// Prefers the ABI-encoded `Error(string)` payload, then the node's message
/// with its boilerplate prefix removed.
pub fn decode_revert_reason(message: &str, data: Option<&Value>) -> Option<String> {
    if let Some(reason) = data
        .and_then(revert_data)
        .and_then(|data| decode_error_string(&data))
    {
        return Some(reason);
    }

    if !message.to_ascii_lowercase().contains("revert") {
        return None;
    }

    let reason = REVERT_MESSAGE_PREFIXES
        .iter()
        .find_map(|prefix| message.strip_prefix(prefix))
        .unwrap_or(message);
    Some(reason.to_string())
}

fn revert_data(data: &Value) -> Option<Vec<u8>> {
    let hex_data = match data {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map.get("data")?.as_str()?,
        _ => return None,
    };
    hex::decode(hex_data.strip_prefix("0x").unwrap_or(hex_data)).ok()
}

/// Decode an `Error(string)` revert payload.
pub fn decode_error_string(data: &[u8]) -> Option<String> {
    let payload = data.strip_prefix(ERROR_STRING_SELECTOR.as_slice())?;
    match DynSolType::Tuple(vec![DynSolType::String]).abi_decode_params(payload) {
        Ok(DynSolValue::Tuple(mut values)) => match values.pop() {
            Some(DynSolValue::String(reason)) => Some(reason),
            _ => None,
        },
        _ => None,
    }
}

impl From<RpcCallError> for ChainError {
    fn from(err: RpcCallError) -> Self {
        match &err {
            RpcCallError::Node { message, data, .. } => {
                match decode_revert_reason(message, data.as_ref()) {
                    Some(reason) => Self::Reverted { reason },
                    None => Self::rpc(err.to_string()),
                }
            }
            RpcCallError::Transport { .. } => Self::rpc(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    timestamp: u64,
}

/// Why one receipt poll did not produce a receipt.
enum ReceiptPoll {
    Pending,
    /// The node did not answer. Polling is a read, so it is repeated.
    Unavailable(ChainError),
}

/// Poll until `poll` yields a receipt or `timeout` runs out.
///
/// Lookup failures do not end the wait: the transaction is already broadcast
/// and will be mined whether or not the node answers this poll.
async fn poll_until_mined<F, Fut>(
    hash: B256,
    timeout: Duration,
    interval: Duration,
    poll: F,
) -> Result<TransactionReceipt, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<TransactionReceipt, ReceiptPoll>>,
{
    let max_polls = (timeout.as_millis() / interval.as_millis().max(1)).max(1);
    let backoff = ConstantBuilder::default()
        .with_delay(interval)
        .with_max_times(max_polls as usize);

    let receipt = poll
        .retry(backoff)
        .notify(|poll: &ReceiptPoll, _| {
            if let ReceiptPoll::Unavailable(err) = poll {
                tracing::warn!(%hash, error = %err, "Receipt lookup failed, polling again");
            }
        })
        .await
        .map_err(|poll| match poll {
            ReceiptPoll::Pending => ChainError::Timeout {
                hash,
                secs: timeout.as_secs(),
            },
            ReceiptPoll::Unavailable(err) => ChainError::rpc(format!(
                "receipt still unavailable after {}s: {err}",
                timeout.as_secs()
            )),
        })?;

    if !receipt.status {
        return Err(ChainError::Failed { hash });
    }
    Ok(receipt)
}

/// [`ChainClient`] over JSON-RPC, with accounts managed by the node.
#[derive(Debug, Clone)]
pub struct RpcChainClient {
    http: reqwest::Client,
    url: Url,
    receipt_timeout: Duration,
}

impl RpcChainClient {
    pub fn new(url: Url, receipt_timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: rpc::create_client(rpc::DEFAULT_TIMEOUT)?,
            url,
            receipt_timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, ChainError> {
        rpc::json_rpc_call(&self.http, self.url.as_str(), method, params)
            .await
            .map_err(ChainError::from)
    }

    async fn quantity(&self, method: &str, params: Vec<Value>) -> Result<u64, ChainError> {
        let hex: String = self.request(method, params).await?;
        rpc::parse_hex_u64(&hex).map_err(|e| ChainError::rpc(format!("{method}: {e:#}")))
    }

    async fn poll_receipt(
        &self,
        hash: B256,
        confirmations: u64,
    ) -> Result<TransactionReceipt, ReceiptPoll> {
        let receipt: Option<TransactionReceipt> = self
            .request("eth_getTransactionReceipt", vec![json!(hash)])
            .await
            .map_err(ReceiptPoll::Unavailable)?;
        let receipt = receipt.ok_or(ReceiptPoll::Pending)?;

        if confirmations > 1 {
            let head = self.block_number().await.map_err(ReceiptPoll::Unavailable)?;
            if head.saturating_sub(receipt.block_number) + 1 < confirmations {
                tracing::trace!(
                    %hash,
                    head,
                    mined = receipt.block_number,
                    "Waiting for confirmations"
                );
                return Err(ReceiptPoll::Pending);
            }
        }

        Ok(receipt)
    }
}

impl ChainClient for RpcChainClient {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.quantity("eth_chainId", vec![]).await
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.quantity("eth_blockNumber", vec![]).await
    }

    async fn latest_timestamp(&self) -> Result<u64, ChainError> {
        let block: BlockInfo = self
            .request("eth_getBlockByNumber", vec![json!("latest"), json!(false)])
            .await?;
        Ok(block.timestamp)
    }

    async fn accounts(&self) -> Result<Vec<Address>, ChainError> {
        self.request("eth_accounts", vec![]).await
    }

    async fn send_transaction(&self, mut tx: TransactionRequest) -> Result<B256, ChainError> {
        // Dry run first: a revert surfaces here, with its reason, before
        // anything is broadcast.
        let estimate = self.quantity("eth_estimateGas", vec![tx.to_json()]).await?;
        if tx.gas.is_none() {
            tx.gas = Some(estimate + estimate * GAS_ESTIMATE_MARGIN_PERCENT / 100);
        }

        tracing::debug!(from = %tx.from, to = ?tx.to, gas = ?tx.gas, "Sending transaction");
        self.request("eth_sendTransaction", vec![tx.to_json()]).await
    }

    async fn wait_for_receipt(
        &self,
        hash: B256,
        confirmations: u64,
    ) -> Result<TransactionReceipt, ChainError> {
        poll_until_mined(hash, self.receipt_timeout, RECEIPT_POLL_INTERVAL, || {
            self.poll_receipt(hash, confirmations)
        })
        .await
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, ChainError> {
        self.request("eth_call", vec![tx.to_json(), json!("latest")])
            .await
    }
}

/// Parse an endpoint URL from settings.
pub fn parse_rpc_url(url: &str) -> anyhow::Result<Url> {
    let parsed = Url::parse(url).with_context(|| format!("invalid RPC URL `{url}`"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("unsupported RPC URL scheme `{}`", parsed.scheme());
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn encoded_reason(reason: &str) -> String {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(
            DynSolValue::Tuple(vec![DynSolValue::String(reason.to_string())]).abi_encode_params(),
        );
        format!("0x{}", hex::encode(data))
    }

    #[test]
    fn test_decode_reason_from_data() {
        let data = json!(encoded_reason(
            "BullToken: transfer amount exceeds the maxTransferAmount"
        ));
        assert_eq!(
            decode_revert_reason("execution reverted", Some(&data)).as_deref(),
            Some("BullToken: transfer amount exceeds the maxTransferAmount")
        );

        let nested = json!({ "data": encoded_reason("Ownable: caller is not the owner") });
        assert_eq!(
            decode_revert_reason("VM Exception", Some(&nested)).as_deref(),
            Some("Ownable: caller is not the owner")
        );
    }

    #[test]
    fn test_decode_reason_from_message() {
        assert_eq!(
            decode_revert_reason("execution reverted: Ownable: caller is not the owner", None)
                .as_deref(),
            Some("Ownable: caller is not the owner")
        );
        assert_eq!(
            decode_revert_reason(
                "VM Exception while processing transaction: revert Timelock::queueTransaction: Call must come from admin.",
                None
            )
            .as_deref(),
            Some("Timelock::queueTransaction: Call must come from admin.")
        );
        assert_eq!(decode_revert_reason("insufficient funds for gas", None), None);
    }

    #[test]
    fn test_rpc_error_maps_to_revert() {
        let err = RpcCallError::Node {
            method: "eth_estimateGas".into(),
            code: 3,
            message: "execution reverted: Masterchef: invalid pool".into(),
            data: None,
        };
        assert_eq!(
            ChainError::from(err),
            ChainError::Reverted {
                reason: "Masterchef: invalid pool".into()
            }
        );

        let err = RpcCallError::Node {
            method: "eth_sendTransaction".into(),
            code: -32000,
            message: "insufficient funds for gas * price + value".into(),
            data: None,
        };
        assert!(matches!(ChainError::from(err), ChainError::Rpc { .. }));
    }

    #[test]
    fn test_receipt_deserialization() {
        let receipt: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash": B256::repeat_byte(1),
            "blockNumber": "0x2a",
            "contractAddress": Address::repeat_byte(2),
            "status": "0x1",
            "gasUsed": "0x5208"
        }))
        .unwrap();
        assert_eq!(receipt.block_number, 42);
        assert_eq!(receipt.contract_address, Some(Address::repeat_byte(2)));
        assert!(receipt.status);

        let receipt: TransactionReceipt = serde_json::from_value(json!({
            "transactionHash": B256::repeat_byte(1),
            "blockNumber": "0x2a",
            "contractAddress": null,
            "status": "0x0"
        }))
        .unwrap();
        assert!(receipt.contract_address.is_none());
        assert!(!receipt.status);
    }

    #[test]
    fn test_transaction_json() {
        let tx = TransactionRequest::create(Address::repeat_byte(1), Bytes::from(vec![0x60, 0x80]));
        let json = tx.to_json();
        assert!(json.get("to").is_none());
        assert_eq!(json["data"], json!("0x6080"));

        let mut tx = TransactionRequest::call(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Bytes::new(),
        );
        tx.gas_price = Some(40_000_000_000);
        let json = tx.to_json();
        assert_eq!(json["to"], json!(Address::repeat_byte(2)));
        assert_eq!(json["gasPrice"], json!("0x9502f9000"));
    }

    const POLL: Duration = Duration::from_millis(5);
    const TIMEOUT: Duration = Duration::from_millis(20);

    fn mined(hash: B256, status: bool) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: hash,
            block_number: 7,
            contract_address: Some(Address::repeat_byte(3)),
            status,
        }
    }

    #[tokio::test]
    async fn test_receipt_polling_outlives_a_failed_lookup() {
        let hash = B256::repeat_byte(7);
        let polls = AtomicUsize::new(0);

        let receipt = poll_until_mined(hash, Duration::from_secs(1), POLL, || {
            let attempt = polls.fetch_add(1, Ordering::SeqCst);
            async move {
                match attempt {
                    0 => Err(ReceiptPoll::Unavailable(ChainError::rpc(
                        "eth_getTransactionReceipt: connection reset",
                    ))),
                    1 => Err(ReceiptPoll::Pending),
                    _ => Ok(mined(hash, true)),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(receipt.contract_address, Some(Address::repeat_byte(3)));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_receipt_polling_gives_up() {
        let hash = B256::repeat_byte(7);

        let err = poll_until_mined(hash, TIMEOUT, POLL, || async {
            Err(ReceiptPoll::Unavailable(ChainError::rpc("connection refused")))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::Rpc { .. }), "{err}");
        assert!(err.to_string().contains("connection refused"), "{err}");

        let err = poll_until_mined(hash, TIMEOUT, POLL, || async {
            Err(ReceiptPoll::Pending)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::Timeout { hash: h, .. } if h == hash));

        let err = poll_until_mined(hash, TIMEOUT, POLL, || async {
            Ok(mined(hash, false))
        })
        .await
        .unwrap_err();
        assert_eq!(err, ChainError::Failed { hash });
    }

    #[test]
    fn test_parse_rpc_url() {
        assert!(parse_rpc_url("https://bsc-dataseed1.binance.org").is_ok());
        assert!(parse_rpc_url("ws://127.0.0.1:8546").is_err());
        assert!(parse_rpc_url("not a url").is_err());
    }
}
