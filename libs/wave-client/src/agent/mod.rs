//! Signing agent surface
//!
//! This module provides:
//! - [`Eip1193Provider`], the `request(method, params)` seam every agent implements
//! - [`SigningAgent`], the typed wrapper the session, guard and contract client use
//! - [`RpcWallet`], an agent reached over a JSON-RPC wallet endpoint
//! - [`SimulatedWallet`], an in-memory agent with its own ledger

mod rpc;
mod simulated;

pub use rpc::{RpcWallet, RpcWalletConfig};
pub use simulated::{Interruption, SimulatedWallet};

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U64};
use common::networks::{ChainId, NetworkRegistration};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// EIP-1193 / EIP-1474 error codes the client reacts to
pub mod error_codes {
    pub const USER_REJECTED_REQUEST: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const DISCONNECTED: i64 = 4900;
    /// Returned by `wallet_switchEthereumChain` for a chain the agent does not know
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Error object returned by an agent request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProviderRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn malformed(method: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            error_codes::PARSE_ERROR,
            format!("Malformed {} response: {}", method, reason),
        )
    }

    pub fn is_user_rejection(&self) -> bool {
        self.code == error_codes::USER_REJECTED_REQUEST
    }

    /// Some wallets wrap 4902 inside an internal error as `data.originalError.code`
    pub fn is_unrecognized_chain(&self) -> bool {
        if self.code == error_codes::UNRECOGNIZED_CHAIN {
            return true;
        }
        self.data
            .as_ref()
            .and_then(|d| d.get("originalError"))
            .and_then(|e| e.get("code"))
            .and_then(Value::as_i64)
            == Some(error_codes::UNRECOGNIZED_CHAIN)
    }
}

impl std::fmt::Display for ProviderRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for ProviderRpcError {}

/// Notification pushed by an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentNotification {
    AccountsChanged(Vec<Address>),
    ChainChanged(ChainId),
    Disconnected,
}

/// Injected-provider request surface.
#[async_trait::async_trait]
pub trait Eip1193Provider: Send + Sync {
    /// Issue one JSON-RPC request; `params` is the positional array
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderRpcError>;

    /// Subscribe to `accountsChanged` / `chainChanged` / `disconnect`
    fn notifications(&self) -> broadcast::Receiver<AgentNotification>;
}

/// Log entry as returned by `eth_getLogs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub log_index: Option<U64>,
    #[serde(default)]
    pub removed: bool,
}

/// Subset of a transaction receipt the client needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub gas_used: Option<U64>,
}

impl RpcReceipt {
    /// Pre-Byzantium receipts carry no status; treat them as successful
    pub fn succeeded(&self) -> bool {
        self.status.map_or(true, |s| s != U64::ZERO)
    }
}

/// Typed handle on a signing agent.
///
/// Cheap to clone; every clone talks to the same agent.
#[derive(Clone)]
pub struct SigningAgent {
    provider: Arc<dyn Eip1193Provider>,
}

impl std::fmt::Debug for SigningAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningAgent").finish_non_exhaustive()
    }
}

impl SigningAgent {
    pub fn new(provider: Arc<dyn Eip1193Provider>) -> Self {
        Self { provider }
    }

    async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<R, ProviderRpcError> {
        let value = self.provider.request(method, params).await?;
        serde_json::from_value(value).map_err(|e| ProviderRpcError::malformed(method, e))
    }

    pub fn notifications(&self) -> broadcast::Receiver<AgentNotification> {
        self.provider.notifications()
    }

    /// `eth_accounts`: accounts already authorized, never prompts
    pub async fn get_authorized_accounts(&self) -> Result<Vec<Address>, ProviderRpcError> {
        self.request("eth_accounts", json!([])).await
    }

    /// `eth_requestAccounts`: may prompt the user
    pub async fn request_accounts(&self) -> Result<Vec<Address>, ProviderRpcError> {
        self.request("eth_requestAccounts", json!([])).await
    }

    pub async fn get_chain_id(&self) -> Result<ChainId, ProviderRpcError> {
        let raw: String = self.request("eth_chainId", json!([])).await?;
        raw.parse()
            .map_err(|e| ProviderRpcError::malformed("eth_chainId", e))
    }

    pub async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ProviderRpcError> {
        self.provider
            .request(
                "wallet_switchEthereumChain",
                json!([{ "chainId": chain_id.to_string() }]),
            )
            .await
            .map(|_| ())
    }

    pub async fn register_chain(
        &self,
        network: &NetworkRegistration,
    ) -> Result<(), ProviderRpcError> {
        let params = json!([{
            "chainId": network.chain_id.to_string(),
            "chainName": network.name,
            "rpcUrls": [network.rpc_url],
            "nativeCurrency": {
                "name": network.native_currency.name,
                "symbol": network.native_currency.symbol,
                "decimals": network.native_currency.decimals,
            },
            "blockExplorerUrls": [network.explorer_url],
        }]);

        self.provider
            .request("wallet_addEthereumChain", params)
            .await
            .map(|_| ())
    }

    /// `eth_call` against the latest block
    pub async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ProviderRpcError> {
        self.request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await
    }

    /// `eth_call` against the state at `block`
    pub async fn call_at(
        &self,
        to: Address,
        data: Bytes,
        block: u64,
    ) -> Result<Bytes, ProviderRpcError> {
        self.request(
            "eth_call",
            json!([{ "to": to, "data": data }, U64::from(block)]),
        )
        .await
    }

    /// `eth_sendTransaction`: the agent signs (may prompt) and broadcasts
    pub async fn send_transaction(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
    ) -> Result<B256, ProviderRpcError> {
        self.request(
            "eth_sendTransaction",
            json!([{ "from": from, "to": to, "data": data }]),
        )
        .await
    }

    pub async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<RpcReceipt>, ProviderRpcError> {
        self.request("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }

    pub async fn block_number(&self) -> Result<u64, ProviderRpcError> {
        let number: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(number.to::<u64>())
    }

    /// `eth_getLogs` with a pre-serialized filter object
    pub async fn get_logs(&self, filter: Value) -> Result<Vec<RpcLog>, ProviderRpcError> {
        self.request("eth_getLogs", json!([filter])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecognized_chain_detection() {
        let direct =
            ProviderRpcError::new(error_codes::UNRECOGNIZED_CHAIN, "Unrecognized chain ID");
        assert!(direct.is_unrecognized_chain());

        let wrapped = ProviderRpcError::new(error_codes::INTERNAL_ERROR, "Internal error")
            .with_data(json!({ "originalError": { "code": 4902 } }));
        assert!(wrapped.is_unrecognized_chain());

        let other = ProviderRpcError::new(error_codes::INTERNAL_ERROR, "Internal error");
        assert!(!other.is_unrecognized_chain());
    }

    #[test]
    fn test_rpc_log_deserialization() {
        let raw = json!({
            "address": "0x8445aaf2475d044ccda690f286d40d296253ec6a",
            "topics": ["0x0000000000000000000000000000000000000000000000000000000000000001"],
            "data": "0x",
            "blockNumber": "0x10",
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "logIndex": "0x2"
        });

        let log: RpcLog = serde_json::from_value(raw).unwrap();
        assert_eq!(log.block_number, Some(U64::from(16)));
        assert_eq!(log.log_index, Some(U64::from(2)));
        assert!(!log.removed);
    }

    #[test]
    fn test_receipt_status() {
        let ok: RpcReceipt = serde_json::from_value(json!({
            "transactionHash": B256::repeat_byte(1),
            "blockNumber": "0x5",
            "status": "0x1"
        }))
        .unwrap();
        assert!(ok.succeeded());

        let reverted = RpcReceipt {
            status: Some(U64::ZERO),
            ..ok.clone()
        };
        assert!(!reverted.succeeded());

        let legacy = RpcReceipt { status: None, ..ok };
        assert!(legacy.succeeded());
    }
}
