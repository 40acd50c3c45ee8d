//! In-memory signing agent with its own single-contract ledger.
//!
//! Speaks the same request surface as a browser wallet: account
//! authorization, chain switching and registration, `eth_call` /
//! `eth_sendTransaction` against the portal contract, receipts and logs.
//! Every transaction is mined into its own block immediately; receipts can be
//! held back for a number of polls to exercise confirmation waiting. An
//! [`Interruption`] makes something happen inside the wallet while a given
//! request is in flight.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256, U64};
use alloy_sol_types::{sol_data, SolCall, SolEvent, SolType};
use common::interfaces::wave_portal::IWavePortal;
use common::networks::ChainId;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use super::{error_codes, AgentNotification, Eip1193Provider, ProviderRpcError, RpcLog, RpcReceipt};

const EXECUTION_REVERTED: i64 = -32000;
const WAVE_GAS_USED: u64 = 45_000;

struct StoredReceipt {
    receipt: RpcReceipt,
    polls_until_visible: u32,
}

/// Something that happens in the wallet while a request is pending
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    /// The user picks another chain
    ChangeChain(ChainId),
    /// The user switches or revokes accounts
    ChangeAccounts(Vec<Address>),
    /// Someone else's wave is mined
    ExternalWave { from: Address, message: String },
}

struct Ledger {
    contract: Address,
    waves: Vec<IWavePortal::Wave>,
    /// Block each entry of `waves` was mined in
    wave_blocks: Vec<u64>,
    logs: Vec<RpcLog>,
    receipts: HashMap<B256, StoredReceipt>,
    block_number: u64,
    clock: u64,
    nonce: u64,
}

impl Ledger {
    fn next_block(&mut self) -> (u64, B256) {
        self.block_number += 1;
        self.nonce += 1;
        let tx_hash = keccak256([self.contract.as_slice(), &self.nonce.to_be_bytes()[..]].concat());
        (self.block_number, tx_hash)
    }

    fn mine_wave(
        &mut self,
        from: Address,
        timestamp: u64,
        message: String,
        receipt_delay: u32,
    ) -> B256 {
        let (block_number, tx_hash) = self.next_block();
        self.wave_blocks.push(block_number);

        self.waves.push(IWavePortal::Wave {
            waver: from,
            message: message.clone(),
            timestamp: U256::from(timestamp),
        });

        let log_data = IWavePortal::NewWave {
            from,
            timestamp: U256::from(timestamp),
            message,
        }
        .encode_log_data();

        self.logs.push(RpcLog {
            address: self.contract,
            topics: log_data.topics().to_vec(),
            data: log_data.data.clone(),
            block_number: Some(U64::from(block_number)),
            transaction_hash: Some(tx_hash),
            log_index: Some(U64::ZERO),
            removed: false,
        });

        self.store_receipt(tx_hash, block_number, true, receipt_delay);
        tx_hash
    }

    fn mine_revert(&mut self, receipt_delay: u32) -> B256 {
        let (block_number, tx_hash) = self.next_block();
        self.store_receipt(tx_hash, block_number, false, receipt_delay);
        tx_hash
    }

    /// Waves mined at or before `block`
    fn waves_at(&self, block: u64) -> &[IWavePortal::Wave] {
        let count = self.wave_blocks.partition_point(|mined| *mined <= block);
        &self.waves[..count]
    }

    fn store_receipt(&mut self, tx_hash: B256, block_number: u64, success: bool, delay: u32) {
        let receipt = RpcReceipt {
            transaction_hash: tx_hash,
            block_number: Some(U64::from(block_number)),
            status: Some(if success { U64::from(1) } else { U64::ZERO }),
            gas_used: Some(U64::from(WAVE_GAS_USED)),
        };
        self.receipts.insert(
            tx_hash,
            StoredReceipt {
                receipt,
                polls_until_visible: delay,
            },
        );
    }
}

struct WalletState {
    accounts: Vec<Address>,
    authorized: bool,
    chain_id: ChainId,
    known_chains: HashSet<ChainId>,
    reject_connect: bool,
    reject_signing: bool,
    reject_switch: bool,
    fail_registration: bool,
    revert_next: bool,
    confirmation_delay: u32,
    registrations: Vec<Value>,
    calls: Vec<String>,
    interruptions: Vec<(String, Interruption)>,
    ledger: Ledger,
}

/// Simulated browser wallet
pub struct SimulatedWallet {
    state: Mutex<WalletState>,
    notification_tx: broadcast::Sender<AgentNotification>,
}

impl SimulatedWallet {
    /// Wallet on Polygon Mumbai with no accounts and an empty ledger
    pub fn new(contract: Address) -> Self {
        let chain_id = ChainId::new(0x13881);
        let (notification_tx, _) = broadcast::channel(64);

        Self {
            state: Mutex::new(WalletState {
                accounts: Vec::new(),
                authorized: false,
                chain_id,
                known_chains: HashSet::from([chain_id]),
                reject_connect: false,
                reject_signing: false,
                reject_switch: false,
                fail_registration: false,
                revert_next: false,
                confirmation_delay: 0,
                registrations: Vec::new(),
                calls: Vec::new(),
                interruptions: Vec::new(),
                ledger: Ledger {
                    contract,
                    waves: Vec::new(),
                    wave_blocks: Vec::new(),
                    logs: Vec::new(),
                    receipts: HashMap::new(),
                    block_number: 0,
                    clock: chrono::Utc::now().timestamp().max(0) as u64,
                    nonce: 0,
                },
            }),
            notification_tx,
        }
    }

    pub fn with_accounts(mut self, accounts: Vec<Address>) -> Self {
        self.state.get_mut().accounts = accounts;
        self
    }

    /// Accounts are already authorized for this client (no prompt needed)
    pub fn authorized(mut self) -> Self {
        self.state.get_mut().authorized = true;
        self
    }

    pub fn on_chain(mut self, chain_id: ChainId) -> Self {
        let state = self.state.get_mut();
        state.chain_id = chain_id;
        state.known_chains.insert(chain_id);
        self
    }

    /// Chain the wallet can switch to without registration
    pub fn knows_chain(mut self, chain_id: ChainId) -> Self {
        self.state.get_mut().known_chains.insert(chain_id);
        self
    }

    /// Start the ledger clock used for new waves
    pub fn at_time(mut self, timestamp_secs: u64) -> Self {
        self.state.get_mut().ledger.clock = timestamp_secs;
        self
    }

    /// Seed a historical wave
    pub fn with_wave(mut self, waver: Address, timestamp_secs: u64, message: &str) -> Self {
        self.state
            .get_mut()
            .ledger
            .mine_wave(waver, timestamp_secs, message.to_string(), 0);
        self
    }

    pub fn set_reject_connect(&self, reject: bool) {
        self.state.lock().reject_connect = reject;
    }

    pub fn set_reject_signing(&self, reject: bool) {
        self.state.lock().reject_signing = reject;
    }

    pub fn set_reject_switch(&self, reject: bool) {
        self.state.lock().reject_switch = reject;
    }

    pub fn set_fail_registration(&self, fail: bool) {
        self.state.lock().fail_registration = fail;
    }

    /// The next submitted transaction is mined but reverts
    pub fn revert_next_transaction(&self) {
        self.state.lock().revert_next = true;
    }

    /// Receipts stay hidden for this many polls after mining
    pub fn set_confirmation_delay(&self, polls: u32) {
        self.state.lock().confirmation_delay = polls;
    }

    /// User switched accounts inside the wallet
    pub fn change_accounts(&self, accounts: Vec<Address>) {
        let notify = {
            let mut state = self.state.lock();
            state.accounts = accounts.clone();
            state.authorized
        };
        if notify {
            let _ = self
                .notification_tx
                .send(AgentNotification::AccountsChanged(accounts));
        }
    }

    /// User switched chains inside the wallet
    pub fn change_chain(&self, chain_id: ChainId) {
        {
            let mut state = self.state.lock();
            state.chain_id = chain_id;
            state.known_chains.insert(chain_id);
        }
        let _ = self
            .notification_tx
            .send(AgentNotification::ChainChanged(chain_id));
    }

    /// Someone else waves at the contract; mined immediately
    pub fn external_wave(&self, from: Address, message: &str) -> B256 {
        let mut state = self.state.lock();
        let ledger = &mut state.ledger;
        let timestamp = ledger.clock;
        ledger.clock += 1;
        ledger.mine_wave(from, timestamp, message.to_string(), 0)
    }

    /// Perform `interruption` the next time `method` is served, after the
    /// answer is computed and before it is returned
    pub fn interrupt_next(&self, method: &str, interruption: Interruption) {
        self.state
            .lock()
            .interruptions
            .push((method.to_string(), interruption));
    }

    fn take_interruption(&self, method: &str) -> Option<Interruption> {
        let mut state = self.state.lock();
        let position = state.interruptions.iter().position(|(m, _)| m == method)?;
        Some(state.interruptions.remove(position).1)
    }

    fn interrupt(&self, interruption: Interruption) {
        tracing::debug!(?interruption, "Simulated wallet interrupted");
        match interruption {
            Interruption::ChangeChain(chain_id) => self.change_chain(chain_id),
            Interruption::ChangeAccounts(accounts) => self.change_accounts(accounts),
            Interruption::ExternalWave { from, message } => {
                self.external_wave(from, &message);
            }
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.state.lock().chain_id
    }

    pub fn wave_count(&self) -> usize {
        self.state.lock().ledger.waves.len()
    }

    pub fn block_number(&self) -> u64 {
        self.state.lock().ledger.block_number
    }

    /// Methods requested so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state.lock().calls.iter().filter(|m| *m == method).count()
    }

    /// Parameters of every `wallet_addEthereumChain` request
    pub fn registrations(&self) -> Vec<Value> {
        self.state.lock().registrations.clone()
    }

    fn handle(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<(Value, Option<AgentNotification>), ProviderRpcError> {
        let mut state = self.state.lock();
        state.calls.push(method.to_string());

        match method {
            "eth_accounts" => {
                let accounts = if state.authorized {
                    state.accounts.clone()
                } else {
                    Vec::new()
                };
                Ok((json!(accounts), None))
            }
            "eth_requestAccounts" => {
                if state.reject_connect {
                    return Err(ProviderRpcError::new(
                        error_codes::USER_REJECTED_REQUEST,
                        "User rejected the request.",
                    ));
                }
                if state.accounts.is_empty() {
                    return Err(ProviderRpcError::new(
                        error_codes::UNAUTHORIZED,
                        "Wallet has no accounts",
                    ));
                }
                state.authorized = true;
                Ok((json!(state.accounts), None))
            }
            "eth_chainId" => Ok((json!(state.chain_id.to_string()), None)),
            "wallet_switchEthereumChain" => {
                let target = chain_param(params)?;
                if state.reject_switch {
                    return Err(ProviderRpcError::new(
                        error_codes::USER_REJECTED_REQUEST,
                        "User rejected the request.",
                    ));
                }
                if !state.known_chains.contains(&target) {
                    return Err(ProviderRpcError::new(
                        error_codes::UNRECOGNIZED_CHAIN,
                        format!("Unrecognized chain ID \"{}\"", target),
                    ));
                }
                let changed = state.chain_id != target;
                state.chain_id = target;
                let notification = changed.then_some(AgentNotification::ChainChanged(target));
                Ok((Value::Null, notification))
            }
            "wallet_addEthereumChain" => {
                let target = chain_param(params)?;
                state.registrations.push(params[0].clone());
                if state.fail_registration {
                    return Err(ProviderRpcError::new(
                        error_codes::INTERNAL_ERROR,
                        "Could not add chain",
                    ));
                }
                state.known_chains.insert(target);
                Ok((Value::Null, None))
            }
            "eth_blockNumber" => Ok((json!(U64::from(state.ledger.block_number)), None)),
            "eth_call" => {
                let data = tx_data(params)?;
                let head = state.ledger.block_number;
                let block = block_param(&params[1], head, head)?;
                let output = state.call_contract(&data, block)?;
                Ok((json!(Bytes::from(output)), None))
            }
            "eth_sendTransaction" => {
                let tx_hash = state.send_transaction(params)?;
                Ok((json!(tx_hash), None))
            }
            "eth_getTransactionReceipt" => {
                let tx_hash: B256 = serde_json::from_value(params[0].clone())
                    .map_err(|e| {
                        ProviderRpcError::new(error_codes::INVALID_PARAMS, e.to_string())
                    })?;
                let receipt = match state.ledger.receipts.get_mut(&tx_hash) {
                    Some(stored) if stored.polls_until_visible > 0 => {
                        stored.polls_until_visible -= 1;
                        Value::Null
                    }
                    Some(stored) => json!(stored.receipt),
                    None => Value::Null,
                };
                Ok((receipt, None))
            }
            "eth_getLogs" => {
                let filter = &params[0];
                let head = state.ledger.block_number;
                let from = block_param(&filter["fromBlock"], 0, head)?;
                let to = block_param(&filter["toBlock"], head, head)?;
                let address = filter["address"]
                    .as_str()
                    .and_then(|a| a.parse::<Address>().ok());

                let logs: Vec<&RpcLog> = state
                    .ledger
                    .logs
                    .iter()
                    .filter(|log| address.map_or(true, |a| a == log.address))
                    .filter(|log| {
                        let block = log.block_number.map_or(0, |b| b.to::<u64>());
                        block >= from && block <= to
                    })
                    .collect();
                Ok((json!(logs), None))
            }
            other => Err(ProviderRpcError::new(
                error_codes::UNSUPPORTED_METHOD,
                format!("Method {} is not supported", other),
            )),
        }
    }
}

impl WalletState {
    fn call_contract(&self, data: &Bytes, block: u64) -> Result<Vec<u8>, ProviderRpcError> {
        let selector = data.get(..4).unwrap_or_default();
        let waves = self.ledger.waves_at(block);

        if selector == IWavePortal::getAllWavesCall::SELECTOR {
            Ok(sol_data::Array::<IWavePortal::Wave>::abi_encode(&waves.to_vec()))
        } else if selector == IWavePortal::getTotalWavesCall::SELECTOR {
            let total = U256::from(waves.len());
            Ok(total.to_be_bytes::<32>().to_vec())
        } else {
            Err(ProviderRpcError::new(EXECUTION_REVERTED, "execution reverted"))
        }
    }

    fn send_transaction(&mut self, params: &Value) -> Result<B256, ProviderRpcError> {
        let from: Address = serde_json::from_value(params[0]["from"].clone())
            .map_err(|e| ProviderRpcError::new(error_codes::INVALID_PARAMS, e.to_string()))?;

        if !self.authorized || !self.accounts.contains(&from) {
            return Err(ProviderRpcError::new(
                error_codes::UNAUTHORIZED,
                "The requested account has not been authorized",
            ));
        }
        if self.reject_signing {
            return Err(ProviderRpcError::new(
                error_codes::USER_REJECTED_REQUEST,
                "User denied transaction signature.",
            ));
        }

        let data = tx_data(params)?;
        let call = IWavePortal::waveCall::abi_decode(&data)
            .map_err(|_| ProviderRpcError::new(EXECUTION_REVERTED, "execution reverted"))?;

        let delay = self.confirmation_delay;
        if self.revert_next {
            self.revert_next = false;
            return Ok(self.ledger.mine_revert(delay));
        }

        let timestamp = self.ledger.clock;
        self.ledger.clock += 1;
        Ok(self.ledger.mine_wave(from, timestamp, call._message, delay))
    }
}

#[async_trait::async_trait]
impl Eip1193Provider for SimulatedWallet {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderRpcError> {
        let (value, notification) = self.handle(method, &params)?;
        if let Some(notification) = notification {
            let _ = self.notification_tx.send(notification);
        }
        if let Some(interruption) = self.take_interruption(method) {
            self.interrupt(interruption);
        }
        Ok(value)
    }

    fn notifications(&self) -> broadcast::Receiver<AgentNotification> {
        self.notification_tx.subscribe()
    }
}

fn chain_param(params: &Value) -> Result<ChainId, ProviderRpcError> {
    params[0]["chainId"]
        .as_str()
        .ok_or_else(|| ProviderRpcError::new(error_codes::INVALID_PARAMS, "Missing chainId"))?
        .parse::<ChainId>()
        .map_err(|e| ProviderRpcError::new(error_codes::INVALID_PARAMS, e.to_string()))
}

fn tx_data(params: &Value) -> Result<Bytes, ProviderRpcError> {
    let tx = &params[0];
    let raw = if tx["data"].is_string() { &tx["data"] } else { &tx["input"] };
    serde_json::from_value(raw.clone()).map_err(|e| {
        ProviderRpcError::new(
            error_codes::INVALID_PARAMS,
            format!("Invalid call data: {}", e),
        )
    })
}

fn block_param(value: &Value, default: u64, head: u64) -> Result<u64, ProviderRpcError> {
    match value.as_str() {
        None => Ok(default),
        Some("latest") | Some("pending") | Some("safe") | Some("finalized") => Ok(head),
        Some("earliest") => Ok(0),
        Some(quantity) => u64::from_str_radix(quantity.trim_start_matches("0x"), 16).map_err(|_| {
            ProviderRpcError::new(
                error_codes::INVALID_PARAMS,
                format!("Invalid block {}", quantity),
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SigningAgent;
    use std::sync::Arc;

    const CONTRACT: Address = Address::repeat_byte(0xc0);

    fn agent(wallet: SimulatedWallet) -> (Arc<SimulatedWallet>, SigningAgent) {
        let wallet = Arc::new(wallet);
        let agent = SigningAgent::new(wallet.clone());
        (wallet, agent)
    }

    #[tokio::test]
    async fn test_accounts_hidden_until_authorized() {
        let (_wallet, agent) =
            agent(SimulatedWallet::new(CONTRACT).with_accounts(vec![Address::repeat_byte(1)]));

        assert!(agent.get_authorized_accounts().await.unwrap().is_empty());
        assert_eq!(agent.request_accounts().await.unwrap(), vec![Address::repeat_byte(1)]);
        assert_eq!(agent.get_authorized_accounts().await.unwrap(), vec![Address::repeat_byte(1)]);
    }

    #[tokio::test]
    async fn test_switch_to_unknown_chain_reports_4902() {
        let (wallet, agent) = agent(SimulatedWallet::new(CONTRACT).on_chain(ChainId::new(0x89)));

        let err = agent.switch_chain(ChainId::new(0x13882)).await.unwrap_err();
        assert!(err.is_unrecognized_chain());
        assert_eq!(wallet.chain_id(), ChainId::new(0x89));
    }

    #[tokio::test]
    async fn test_switch_emits_chain_changed() {
        let (wallet, agent) = agent(
            SimulatedWallet::new(CONTRACT)
                .on_chain(ChainId::new(0x89))
                .knows_chain(ChainId::new(0x13881)),
        );
        let mut notifications = agent.notifications();

        agent.switch_chain(ChainId::new(0x13881)).await.unwrap();

        assert_eq!(wallet.chain_id(), ChainId::new(0x13881));
        assert_eq!(
            notifications.try_recv().unwrap(),
            AgentNotification::ChainChanged(ChainId::new(0x13881))
        );
    }

    #[tokio::test]
    async fn test_get_all_waves_round_trips_through_abi() {
        let (_wallet, agent) = agent(
            SimulatedWallet::new(CONTRACT)
                .with_wave(Address::repeat_byte(1), 100, "first")
                .with_wave(Address::repeat_byte(2), 200, "second"),
        );

        let calldata = IWavePortal::getAllWavesCall {}.abi_encode();
        let output = agent.call(CONTRACT, calldata.into()).await.unwrap();
        let waves = IWavePortal::getAllWavesCall::abi_decode_returns(&output).unwrap();

        assert_eq!(waves.len(), 2);
        assert_eq!(waves[1].message, "second");
        assert_eq!(waves[1].timestamp, U256::from(200));
    }

    #[tokio::test]
    async fn test_call_at_block_sees_only_earlier_waves() {
        let (wallet, agent) = agent(
            SimulatedWallet::new(CONTRACT)
                .with_wave(Address::repeat_byte(1), 100, "first")
                .with_wave(Address::repeat_byte(2), 200, "second"),
        );
        wallet.external_wave(Address::repeat_byte(3), "third");

        let calldata = IWavePortal::getAllWavesCall {}.abi_encode();
        let output = agent.call_at(CONTRACT, calldata.into(), 2).await.unwrap();
        let waves = IWavePortal::getAllWavesCall::abi_decode_returns(&output).unwrap();

        assert_eq!(waves.len(), 2);
        assert_eq!(waves[1].message, "second");
        assert_eq!(wallet.wave_count(), 3);
    }

    #[tokio::test]
    async fn test_interruption_fires_once_after_the_answer() {
        let (wallet, agent) = agent(SimulatedWallet::new(CONTRACT));
        let mut notifications = agent.notifications();
        wallet.interrupt_next("eth_blockNumber", Interruption::ChangeChain(ChainId::new(0x89)));

        assert_eq!(agent.get_chain_id().await.unwrap(), ChainId::new(0x13881));
        assert!(notifications.try_recv().is_err());

        assert_eq!(agent.block_number().await.unwrap(), 0);
        assert_eq!(
            notifications.try_recv().unwrap(),
            AgentNotification::ChainChanged(ChainId::new(0x89))
        );
        assert_eq!(wallet.chain_id(), ChainId::new(0x89));

        agent.block_number().await.unwrap();
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_requires_authorization() {
        let sender = Address::repeat_byte(1);
        let (_wallet, agent) = agent(SimulatedWallet::new(CONTRACT).with_accounts(vec![sender]));
        let calldata = IWavePortal::waveCall { _message: "hi".into() }.abi_encode();

        let err = agent
            .send_transaction(sender, CONTRACT, calldata.into())
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_receipt_delay() {
        let sender = Address::repeat_byte(1);
        let (wallet, agent) = agent(
            SimulatedWallet::new(CONTRACT)
                .with_accounts(vec![sender])
                .authorized(),
        );
        wallet.set_confirmation_delay(2);

        let calldata = IWavePortal::waveCall { _message: "hi".into() }.abi_encode();
        let tx_hash = agent.send_transaction(sender, CONTRACT, calldata.into()).await.unwrap();

        assert!(agent.transaction_receipt(tx_hash).await.unwrap().is_none());
        assert!(agent.transaction_receipt(tx_hash).await.unwrap().is_none());
        let receipt = agent.transaction_receipt(tx_hash).await.unwrap().unwrap();
        assert!(receipt.succeeded());
    }

    #[tokio::test]
    async fn test_logs_filtered_by_block_range() {
        let (wallet, agent) = agent(
            SimulatedWallet::new(CONTRACT)
                .with_wave(Address::repeat_byte(1), 100, "a")
                .with_wave(Address::repeat_byte(1), 101, "b"),
        );
        wallet.external_wave(Address::repeat_byte(2), "c");

        let logs = agent
            .get_logs(json!({ "address": CONTRACT, "fromBlock": "0x2", "toBlock": "0x3" }))
            .await
            .unwrap();

        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].block_number, Some(U64::from(2)));
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let wallet = SimulatedWallet::new(CONTRACT);
        let err = wallet.request("eth_signTypedData_v4", json!([])).await.unwrap_err();

        assert_eq!(err.code, error_codes::UNSUPPORTED_METHOD);
        assert_eq!(wallet.call_count("eth_signTypedData_v4"), 1);
    }
}
