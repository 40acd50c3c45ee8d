//! Coordinator wiring session, network guard, contract client and feed.
//!
//! Any account or chain change tears the contract client and the feed down;
//! [`Portal::establish`] builds them again against the new session. Changes
//! picked up while an operation was suspended are reported by
//! [`Portal::next_event`] afterwards.

use alloy_primitives::Address;
use common::feed::Feed;
use common::networks::{NetworkDescriptor, NetworkRegistration, NetworkRegistry, NetworkStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::{AgentNotification, SigningAgent};
use crate::aggregator::{AggregatorState, EventAggregator, FeedUpdate};
use crate::contract::{ContractClient, ContractConfig, WaveReceipt};
use crate::errors::PortalError;
use crate::network_guard::{NetworkGuard, NetworkPrompt};
use crate::session::{Session, SessionChange, SessionManager};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSettings {
    pub contract: Address,
    pub required_network: NetworkRegistration,
    #[serde(default)]
    pub contract_config: ContractConfig,
    /// Switch chains without asking when the agent is on the wrong one
    #[serde(default)]
    pub auto_switch: bool,
}

impl PortalSettings {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            required_network: NetworkRegistration::polygon_mumbai(),
            contract_config: ContractConfig::default(),
            auto_switch: false,
        }
    }
}

/// Result of a wave as reported to the user
#[derive(Debug, Clone, PartialEq)]
pub enum WaveOutcome {
    Confirmed(WaveReceipt),
    /// Nothing reached the ledger
    NotSubmitted(PortalError),
    /// Submitted, but not confirmed as a successful wave
    Failed(PortalError),
}

/// Something the front-end should react to
#[derive(Debug, Clone, PartialEq)]
pub enum PortalEvent {
    Feed(FeedUpdate),
    Session(SessionChange),
    /// The agent notification stream ended
    AgentClosed,
}

pub struct Portal {
    settings: PortalSettings,
    agent: Option<SigningAgent>,
    sessions: SessionManager,
    guard: NetworkGuard,
    client: Option<ContractClient>,
    aggregator: EventAggregator,
    /// Wakes [`Portal::next_event`]; the session applies the notifications
    wake: Option<broadcast::Receiver<AgentNotification>>,
}

impl Portal {
    pub fn new(
        agent: Option<SigningAgent>,
        registry: NetworkRegistry,
        settings: PortalSettings,
    ) -> Self {
        let guard = NetworkGuard::new(agent.clone(), registry, settings.required_network.clone());
        let sessions = SessionManager::new(agent.clone(), guard.registry().clone());
        let wake = agent.as_ref().map(SigningAgent::notifications);

        Self {
            settings,
            agent,
            sessions,
            guard,
            client: None,
            aggregator: EventAggregator::new(),
            wake,
        }
    }

    pub fn session(&self) -> Session {
        self.sessions.sync();
        self.sessions.snapshot()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn guard(&self) -> &NetworkGuard {
        &self.guard
    }

    pub fn feed(&self) -> &Feed {
        self.aggregator.feed()
    }

    pub fn feed_state(&self) -> AggregatorState {
        self.aggregator.state()
    }

    pub fn client(&self) -> Option<&ContractClient> {
        self.client.as_ref()
    }

    /// Pick up an authorized account without prompting and read the network
    pub async fn restore(&mut self) -> Result<Option<Address>, PortalError> {
        let account = self.sessions.restore_session().await;
        self.drop_stale();
        if self.agent.is_some() {
            self.refresh_network().await?;
        }
        Ok(account)
    }

    /// Interactive connect; may prompt the user
    pub async fn connect(&mut self) -> Result<Address, PortalError> {
        let connected = self.sessions.connect().await;
        self.drop_stale();
        let account = connected?;
        self.refresh_network().await?;
        Ok(account)
    }

    pub fn disconnect(&mut self) {
        self.invalidate();
        self.sessions.disconnect();
    }

    /// Blocking prompt while the recorded network is not the required one
    pub fn network_prompt(&self) -> Option<NetworkPrompt> {
        self.sessions
            .snapshot()
            .network()
            .and_then(|status| self.guard.network_prompt(status))
    }

    /// Make sure the agent is on the required network, switching if allowed
    pub async fn ensure_network(
        &mut self,
        allow_switch: bool,
    ) -> Result<NetworkDescriptor, PortalError> {
        let status = self.refresh_network().await?;
        let Some(prompt) = self.guard.network_prompt(&status) else {
            return Ok(self.guard.required().descriptor());
        };

        if !(allow_switch || self.settings.auto_switch) {
            tracing::warn!(%prompt, "Wrong network");
            return Err(PortalError::WrongNetwork {
                current: prompt.current,
                required: prompt.required,
            });
        }

        let descriptor = self.guard.switch_network().await?;
        self.refresh_network().await?;
        Ok(descriptor)
    }

    /// Bind the contract client and bring the feed live
    pub async fn establish(&mut self, allow_switch: bool) -> Result<(), PortalError> {
        self.drop_stale();
        if !self.sessions.snapshot().is_connected() {
            return Err(PortalError::NotConnected);
        }
        self.ensure_network(allow_switch).await?;

        let agent = self.agent.clone().ok_or(PortalError::NoProvider)?;
        let client = ContractClient::bind(
            agent,
            self.sessions.clone(),
            self.settings.contract,
            self.settings.contract_config.clone(),
        )?;

        self.aggregator.start(&client).await?;
        self.client = Some(client);
        Ok(())
    }

    /// Submit a wave and wait for it to be included
    pub async fn wave(&mut self, message: &str) -> WaveOutcome {
        self.drop_stale();
        if self.client.is_none() {
            if let Err(e) = self.bind_for_write().await {
                return WaveOutcome::NotSubmitted(e);
            }
        }
        let Some(client) = self.client.as_ref() else {
            return WaveOutcome::NotSubmitted(PortalError::NotConnected);
        };

        let pending = match client.submit(message).await {
            Ok(pending) => pending,
            Err(e) => return WaveOutcome::NotSubmitted(e),
        };

        match client.await_confirmation(pending).await {
            Ok(receipt) => {
                match client.total_waves().await {
                    Ok(total) => tracing::info!(total, "Total waves"),
                    Err(e) => tracing::debug!(error = %e, "Could not read wave count"),
                }
                WaveOutcome::Confirmed(receipt)
            }
            Err(e) => WaveOutcome::Failed(e),
        }
    }

    async fn bind_for_write(&mut self) -> Result<(), PortalError> {
        if !self.sessions.snapshot().is_connected() {
            return Err(PortalError::NotConnected);
        }
        self.ensure_network(false).await?;

        let agent = self.agent.clone().ok_or(PortalError::NoProvider)?;
        self.client = Some(ContractClient::bind(
            agent,
            self.sessions.clone(),
            self.settings.contract,
            self.settings.contract_config.clone(),
        )?);
        Ok(())
    }

    /// Apply an agent notification; any change tears the downstream state down
    pub fn handle_notification(
        &mut self,
        notification: &AgentNotification,
    ) -> Option<SessionChange> {
        let change = self.sessions.handle_notification(notification)?;
        self.invalidate();
        Some(change)
    }

    /// Wait for the next session change or feed update.
    ///
    /// Session changes are reported before any feed update.
    pub async fn next_event(&mut self) -> PortalEvent {
        loop {
            self.sessions.sync();
            self.drop_stale();
            // Bindings made after the change are kept
            if let Some(change) = self.sessions.take_change() {
                return PortalEvent::Session(change);
            }

            tokio::select! {
                biased;

                notification = recv_notification(&mut self.wake) => match notification {
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Wake-up receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.wake = None;
                        self.sessions.sync();
                        self.drop_stale();
                        return PortalEvent::AgentClosed;
                    }
                },
                update = self.aggregator.next_update() => match update {
                    Some(FeedUpdate::Stale) => {}
                    Some(update) => return PortalEvent::Feed(update),
                    None => {
                        tracing::warn!("Live subscription ended");
                        self.aggregator.teardown();
                    }
                },
            }
        }
    }

    /// Re-hydrate the feed on the current binding
    pub async fn refresh(&mut self) -> Result<(), PortalError> {
        if self.drop_stale() {
            return Err(PortalError::Stale);
        }
        let client = self.client.as_ref().ok_or(PortalError::NotConnected)?;
        self.aggregator.refresh(client).await
    }

    pub fn clear(&mut self) {
        self.aggregator.clear();
    }

    async fn refresh_network(&mut self) -> Result<NetworkStatus, PortalError> {
        let status = self.guard.get_current_network().await?;
        if self.sessions.observe_network(status.clone()).is_some() {
            self.invalidate();
        }
        Ok(status)
    }

    /// Tear down whatever was bound in an older epoch. True if anything was.
    fn drop_stale(&mut self) -> bool {
        let client_stale = self.client.as_ref().is_some_and(|c| !c.is_current());
        if client_stale || !self.aggregator.is_current() {
            tracing::debug!("Dropping bindings from an earlier session");
            self.invalidate();
            return true;
        }
        false
    }

    fn invalidate(&mut self) {
        self.aggregator.teardown();
        self.client = None;
    }
}

async fn recv_notification(
    receiver: &mut Option<broadcast::Receiver<AgentNotification>>,
) -> Result<AgentNotification, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
