//! Wave portal contract binding.
//!
//! A [`ContractClient`] is bound to the account and chain of one session
//! epoch. Every call checks the epoch before it is issued and again after
//! the agent answers; a binding from an older epoch only ever yields
//! [`PortalError::Stale`].
//!
//! Records are keyed by their position in the contract's wave list. History
//! is read at a fixed block and live logs are numbered from where that
//! snapshot ends, see [`LedgerCursor`].

use std::fmt;
use std::time::Duration;

use alloy::rpc::types::Filter;
use alloy_primitives::{Address, Log as PrimitiveLog, B256, U256};
use alloy_sol_types::{SolCall, SolEvent};
use common::feed::{LogOrigin, SourceKey, WaveEvent};
use common::interfaces::wave_portal::IWavePortal;
use common::networks::ChainId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{RpcLog, SigningAgent};
use crate::errors::PortalError;
use crate::session::SessionManager;

/// Polling cadence for receipts and logs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub receipt_poll_ms: u64,
    pub log_poll_ms: u64,
    /// Largest block span requested in one `eth_getLogs`
    pub max_block_range: u64,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            receipt_poll_ms: 1000,
            log_poll_ms: 2000,
            max_block_range: 1000,
        }
    }
}

/// Account, chain and epoch a client was created against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractBinding {
    pub account: Address,
    pub chain_id: ChainId,
    pub contract: Address,
    pub epoch: u64,
}

/// End of a history snapshot and start of live delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerCursor {
    /// First block scanned for `NewWave` logs
    pub next_block: u64,
    /// Wave list position of the first live record
    pub next_index: u64,
}

/// History read at one block, with the cursor that continues it
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySnapshot {
    pub records: Vec<WaveEvent>,
    pub cursor: LedgerCursor,
}

/// A submitted wave awaiting inclusion. Consumed by
/// [`ContractClient::await_confirmation`].
#[derive(Debug)]
pub struct PendingWave {
    tx_hash: B256,
    epoch: u64,
}

impl PendingWave {
    pub fn tx_hash(&self) -> B256 {
        self.tx_hash
    }
}

/// Successful inclusion of a wave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub gas_used: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded record tagged with the subscription that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub event: WaveEvent,
}

/// Live `NewWave` feed from one polling task.
///
/// Dropping the handle stops the poller.
pub struct Subscription {
    id: SubscriptionId,
    binding: ContractBinding,
    sessions: SessionManager,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn binding(&self) -> &ContractBinding {
        &self.binding
    }

    /// False once the session moved past the binding's epoch
    pub fn is_current(&self) -> bool {
        self.sessions.is_current(self.binding.epoch)
    }

    /// Next delivery in transport order; `None` once the poller has stopped
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.receiver.try_recv().ok()
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        tracing::debug!(subscription = %self.id, "Subscription released");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

pub struct ContractClient {
    agent: SigningAgent,
    sessions: SessionManager,
    binding: ContractBinding,
    config: ContractConfig,
}

impl fmt::Debug for ContractClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractClient")
            .field("binding", &self.binding)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContractClient {
    /// Bind to the current session. No I/O.
    pub fn bind(
        agent: SigningAgent,
        sessions: SessionManager,
        contract: Address,
        config: ContractConfig,
    ) -> Result<Self, PortalError> {
        sessions.sync();
        let current = sessions.snapshot();
        let binding = ContractBinding {
            account: current.account().ok_or(PortalError::NotConnected)?,
            chain_id: current.chain_id().ok_or(PortalError::NotConnected)?,
            contract,
            epoch: current.epoch(),
        };

        tracing::debug!(
            account = %binding.account,
            chain = %binding.chain_id,
            epoch = binding.epoch,
            "Contract client bound"
        );

        Ok(Self {
            agent,
            sessions,
            binding,
            config,
        })
    }

    pub fn binding(&self) -> &ContractBinding {
        &self.binding
    }

    /// False once the session moved past the epoch this client was bound in.
    ///
    /// Applies agent notifications received so far before comparing.
    pub fn is_current(&self) -> bool {
        self.sessions.is_current(self.binding.epoch)
    }

    fn ensure_current(&self) -> Result<(), PortalError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(PortalError::Stale)
        }
    }

    /// Full `getAllWaves()` history in ledger order, at the latest block
    pub async fn read_all_records(&self) -> Result<Vec<WaveEvent>, PortalError> {
        self.ensure_current()?;

        let calldata = IWavePortal::getAllWavesCall {}.abi_encode();
        let output = self
            .agent
            .call(self.binding.contract, calldata.into())
            .await
            .map_err(|e| PortalError::RpcError(e.to_string()))?;

        self.ensure_current()?;
        self.decode_history(&output)
    }

    /// `getAllWaves()` as of `block` and the cursor live delivery resumes from
    pub async fn read_history_at(&self, block: u64) -> Result<HistorySnapshot, PortalError> {
        self.ensure_current()?;

        let calldata = IWavePortal::getAllWavesCall {}.abi_encode();
        let output = self
            .agent
            .call_at(self.binding.contract, calldata.into(), block)
            .await
            .map_err(|e| PortalError::RpcError(e.to_string()))?;

        self.ensure_current()?;

        let records = self.decode_history(&output)?;
        let cursor = LedgerCursor {
            next_block: block + 1,
            next_index: records.len() as u64,
        };
        Ok(HistorySnapshot { records, cursor })
    }

    fn decode_history(&self, output: &[u8]) -> Result<Vec<WaveEvent>, PortalError> {
        let waves = IWavePortal::getAllWavesCall::abi_decode_returns(output)?;
        waves
            .into_iter()
            .enumerate()
            .map(|(index, wave)| {
                Ok(WaveEvent::from_history(
                    SourceKey::new(self.binding.contract, index as u64),
                    wave.waver,
                    timestamp_secs(wave.timestamp)?,
                    wave.message,
                ))
            })
            .collect()
    }

    pub async fn total_waves(&self) -> Result<u64, PortalError> {
        self.ensure_current()?;

        let calldata = IWavePortal::getTotalWavesCall {}.abi_encode();
        let output = self
            .agent
            .call(self.binding.contract, calldata.into())
            .await
            .map_err(|e| PortalError::RpcError(e.to_string()))?;

        self.ensure_current()?;

        let total = IWavePortal::getTotalWavesCall::abi_decode_returns(&output)?;
        u64::try_from(total)
            .map_err(|_| PortalError::RpcError(format!("Wave count out of range: {}", total)))
    }

    pub async fn current_block(&self) -> Result<u64, PortalError> {
        self.ensure_current()?;
        let block = self
            .agent
            .block_number()
            .await
            .map_err(|e| PortalError::RpcError(e.to_string()))?;
        self.ensure_current()?;
        Ok(block)
    }

    /// Send `wave(message)` from the bound account; may prompt for a signature
    pub async fn submit(&self, message: &str) -> Result<PendingWave, PortalError> {
        self.ensure_current()?;

        let calldata = IWavePortal::waveCall {
            _message: message.to_string(),
        }
        .abi_encode();

        let tx_hash = self
            .agent
            .send_transaction(self.binding.account, self.binding.contract, calldata.into())
            .await
            .map_err(|e| {
                let err = PortalError::from(e);
                tracing::warn!(error = %err, "Wave submission failed");
                err
            })?;

        if !self.is_current() {
            tracing::warn!(tx = %tx_hash, "Session changed during submission, discarding handle");
            return Err(PortalError::Stale);
        }

        tracing::info!(tx = %tx_hash, account = %self.binding.account, "📤 Wave submitted");

        Ok(PendingWave {
            tx_hash,
            epoch: self.binding.epoch,
        })
    }

    /// Poll for the receipt until the transaction is included
    pub async fn await_confirmation(
        &self,
        pending: PendingWave,
    ) -> Result<WaveReceipt, PortalError> {
        let PendingWave { tx_hash, epoch } = pending;
        let mut ticker = interval(Duration::from_millis(self.config.receipt_poll_ms));

        loop {
            ticker.tick().await;

            if epoch != self.binding.epoch || !self.is_current() {
                tracing::warn!(tx = %tx_hash, "Session changed while awaiting confirmation");
                return Err(PortalError::Stale);
            }

            let receipt = self
                .agent
                .transaction_receipt(tx_hash)
                .await
                .map_err(|e| PortalError::RpcError(e.to_string()))?;

            let Some(receipt) = receipt else {
                tracing::trace!(tx = %tx_hash, "Receipt not available yet");
                continue;
            };

            if !self.is_current() {
                return Err(PortalError::Stale);
            }

            if !receipt.succeeded() {
                tracing::error!(tx = %tx_hash, "❌ Wave reverted");
                return Err(PortalError::TransactionFailed { tx_hash });
            }

            let block_number = receipt.block_number.map_or(0, |b| b.to::<u64>());
            tracing::info!(tx = %tx_hash, block = block_number, "✅ Wave confirmed");

            return Ok(WaveReceipt {
                tx_hash,
                block_number,
                gas_used: receipt.gas_used.map(|g| g.to::<u64>()),
            });
        }
    }

    /// Open one live `NewWave` subscription continuing from `cursor`.
    ///
    /// The poller stops as soon as the binding goes stale.
    pub fn subscribe(&self, cursor: LedgerCursor) -> Result<Subscription, PortalError> {
        self.ensure_current()?;

        let id = SubscriptionId::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let poller = LogPoller {
            agent: self.agent.clone(),
            sessions: self.sessions.clone(),
            binding: self.binding,
            subscription: id,
            cursor,
            config: self.config.clone(),
            sender,
            cancel_token: cancel_token.clone(),
        };

        tracing::info!(
            subscription = %id,
            from_block = cursor.next_block,
            from_index = cursor.next_index,
            "📡 Subscribed to NewWave"
        );

        Ok(Subscription {
            id,
            binding: self.binding,
            sessions: self.sessions.clone(),
            receiver,
            cancel_token,
            task: Some(tokio::spawn(poller.run())),
        })
    }
}

struct LogPoller {
    agent: SigningAgent,
    sessions: SessionManager,
    binding: ContractBinding,
    subscription: SubscriptionId,
    cursor: LedgerCursor,
    config: ContractConfig,
    sender: mpsc::UnboundedSender<Delivery>,
    cancel_token: CancellationToken,
}

impl LogPoller {
    async fn run(mut self) {
        let mut ticker = interval(Duration::from_millis(self.config.log_poll_ms));

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.sessions.is_current(self.binding.epoch) {
                tracing::info!(subscription = %self.subscription, "Binding went stale, stopping");
                break;
            }

            if let Err(e) = self.poll_once().await {
                tracing::warn!(subscription = %self.subscription, error = %e, "Log poll failed");
            }

            if self.sender.is_closed() {
                break;
            }
        }

        tracing::debug!(subscription = %self.subscription, "Log poller stopped");
    }

    async fn poll_once(&mut self) -> Result<(), PortalError> {
        let from_block = self.cursor.next_block;
        let head = self.agent.block_number().await?;
        if head < from_block {
            return Ok(());
        }

        let to_block = head.min(from_block + self.config.max_block_range.max(1) - 1);

        let filter = Filter::new()
            .address(self.binding.contract)
            .event_signature(IWavePortal::NewWave::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.agent.get_logs(serde_json::to_value(&filter)?).await?;

        // Answers for an older binding are dropped unseen; `run` then stops
        if !self.sessions.is_current(self.binding.epoch) {
            return Ok(());
        }

        tracing::trace!(from_block, to_block, count = logs.len(), "Fetched NewWave logs");

        for log in logs.iter().filter(|log| !log.removed) {
            let key = SourceKey::new(self.binding.contract, self.cursor.next_index);
            self.cursor.next_index += 1;

            match decode_wave(log, key) {
                Ok(event) => {
                    let delivery = Delivery {
                        subscription: self.subscription,
                        event,
                    };
                    if self.sender.send(delivery).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping undecodable NewWave log")
                }
            }
        }

        self.cursor.next_block = to_block + 1;
        Ok(())
    }
}

fn decode_wave(log: &RpcLog, key: SourceKey) -> Result<WaveEvent, PortalError> {
    let primitive = PrimitiveLog::new(log.address, log.topics.clone(), log.data.clone())
        .ok_or_else(|| PortalError::RpcError("Log carries too many topics".to_string()))?;

    let decoded = IWavePortal::NewWave::decode_log(&primitive)?;

    let origin = LogOrigin {
        tx_hash: log.transaction_hash.unwrap_or_default(),
        log_index: log.log_index.map_or(0, |i| i.to::<u64>()),
        block_number: log.block_number.map_or(0, |b| b.to::<u64>()),
    };

    Ok(WaveEvent::from_log(
        key,
        decoded.data.from,
        timestamp_secs(decoded.data.timestamp)?,
        decoded.data.message.clone(),
        origin,
    ))
}

fn timestamp_secs(timestamp: U256) -> Result<u64, PortalError> {
    u64::try_from(timestamp)
        .map_err(|_| PortalError::RpcError(format!("Timestamp out of range: {}", timestamp)))
}
