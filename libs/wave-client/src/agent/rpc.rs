//! Signing agent reached over a JSON-RPC wallet endpoint.
//!
//! Desktop wallets can expose the same request surface an injected browser
//! provider offers on a local HTTP endpoint. Plain HTTP carries no push
//! notifications, so `accountsChanged` / `chainChanged` are synthesized by
//! polling `eth_accounts` and `eth_chainId`.

use std::sync::Arc;
use std::time::Duration;

use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::transports::http::reqwest::Url;
use alloy::transports::TransportError;
use alloy_primitives::Address;
use common::networks::ChainId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use super::{error_codes, AgentNotification, Eip1193Provider, ProviderRpcError};

/// Configuration for an RPC wallet endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcWalletConfig {
    /// Wallet endpoint URL
    pub url: String,
    /// Interval between account/chain polls for change notifications
    pub notification_poll_ms: u64,
}

impl Default for RpcWalletConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:1248".to_string(),
            notification_poll_ms: 1000,
        }
    }
}

/// Agent backed by an alloy provider pointed at a wallet endpoint
pub struct RpcWallet {
    config: RpcWalletConfig,
    provider: DynProvider,
    notification_tx: broadcast::Sender<AgentNotification>,
    cancel_token: CancellationToken,
}

impl RpcWallet {
    pub fn new(config: RpcWalletConfig) -> Result<Arc<Self>, ProviderRpcError> {
        let url: Url = config.url.parse().map_err(|_| {
            ProviderRpcError::new(
                error_codes::INVALID_PARAMS,
                format!("Invalid wallet URL: {}", config.url),
            )
        })?;

        let provider = ProviderBuilder::new().connect_http(url).erased();
        let (notification_tx, _) = broadcast::channel(64);

        Ok(Arc::new(Self {
            config,
            provider,
            notification_tx,
            cancel_token: CancellationToken::new(),
        }))
    }

    /// Ask the endpoint for its chain id; `None` when nothing answers there.
    ///
    /// An agent that answers with an error object is still present.
    pub async fn detect(config: RpcWalletConfig) -> Option<Arc<Self>> {
        let wallet = match Self::new(config) {
            Ok(wallet) => wallet,
            Err(e) => {
                tracing::error!(error = %e, "Signing agent misconfigured");
                return None;
            }
        };

        match wallet
            .provider
            .raw_request::<Value, Value>("eth_chainId".into(), Value::Array(Vec::new()))
            .await
        {
            Ok(_) => Some(wallet),
            Err(e) if e.as_error_resp().is_some() => Some(wallet),
            Err(e) => {
                tracing::warn!(url = %wallet.config.url, error = %e, "No signing agent found");
                None
            }
        }
    }

    /// Cancellation token stopping the notification watcher
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Spawn the account/chain polling task that feeds `notifications()`
    pub fn spawn_notification_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let wallet = Arc::clone(self);
        tokio::spawn(async move { wallet.watch_notifications().await })
    }

    async fn watch_notifications(&self) {
        let mut ticker = interval(Duration::from_millis(self.config.notification_poll_ms));
        let mut last_accounts: Option<Vec<Address>> = None;
        let mut last_chain: Option<ChainId> = None;
        let mut reachable = true;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    tracing::debug!("Notification watcher stopped");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let accounts = self.poll::<Vec<Address>>("eth_accounts").await;
            let chain = self.poll::<String>("eth_chainId").await;

            let (accounts, chain) = match (accounts, chain) {
                (Ok(accounts), Ok(chain)) => (accounts, chain),
                (Err(e), _) | (_, Err(e)) => {
                    if reachable {
                        tracing::warn!(error = %e, "Signing agent unreachable");
                        self.emit(AgentNotification::Disconnected);
                        reachable = false;
                        last_accounts = None;
                        last_chain = None;
                    }
                    continue;
                }
            };
            reachable = true;

            let chain: ChainId = match chain.parse() {
                Ok(chain) => chain,
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring malformed chain id from agent");
                    continue;
                }
            };

            if let Some(previous) = last_chain {
                if previous != chain {
                    self.emit(AgentNotification::ChainChanged(chain));
                }
            }
            last_chain = Some(chain);

            if let Some(previous) = &last_accounts {
                if *previous != accounts {
                    self.emit(AgentNotification::AccountsChanged(accounts.clone()));
                }
            }
            last_accounts = Some(accounts);
        }
    }

    async fn poll<R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<R, ProviderRpcError> {
        let value = self.request(method, Value::Array(Vec::new())).await?;
        serde_json::from_value(value).map_err(|e| ProviderRpcError::malformed(method, e))
    }

    fn emit(&self, notification: AgentNotification) {
        tracing::debug!(?notification, "Agent notification");
        // No receivers is fine, nobody is listening yet
        let _ = self.notification_tx.send(notification);
    }
}

#[async_trait::async_trait]
impl Eip1193Provider for RpcWallet {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderRpcError> {
        self.provider
            .raw_request::<Value, Value>(method.to_string().into(), params)
            .await
            .map_err(map_transport_error)
    }

    fn notifications(&self) -> broadcast::Receiver<AgentNotification> {
        self.notification_tx.subscribe()
    }
}

/// Keep the agent's error object when there is one
fn map_transport_error(err: TransportError) -> ProviderRpcError {
    match err.as_error_resp() {
        Some(payload) => {
            let data = payload
                .data
                .as_ref()
                .and_then(|raw| serde_json::from_str::<Value>(raw.get()).ok());
            ProviderRpcError {
                code: payload.code,
                message: payload.message.to_string(),
                data,
            }
        }
        None => ProviderRpcError::new(error_codes::DISCONNECTED, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RpcWalletConfig::default();
        assert_eq!(config.url, "http://127.0.0.1:1248");
        assert_eq!(config.notification_poll_ms, 1000);
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let config = RpcWalletConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };

        let err = RpcWallet::new(config).err().unwrap();
        assert_eq!(err.code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_detect_returns_none_when_nothing_listens() {
        let config = RpcWalletConfig {
            // Port 9 (discard) is closed on test machines
            url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        };

        assert!(RpcWallet::detect(config).await.is_none());
    }
}
