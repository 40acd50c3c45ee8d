//! Active chain inspection and correction.

use std::fmt;

use common::networks::{NetworkDescriptor, NetworkRegistration, NetworkRegistry, NetworkStatus};

use crate::agent::SigningAgent;
use crate::errors::PortalError;

/// Blocking prompt shown while the session is on the wrong chain
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPrompt {
    pub current: NetworkStatus,
    pub required: NetworkDescriptor,
}

impl fmt::Display for NetworkPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Please switch to {}. You are currently on {}.",
            self.required, self.current
        )
    }
}

pub struct NetworkGuard {
    agent: Option<SigningAgent>,
    registry: NetworkRegistry,
    required: NetworkRegistration,
}

impl NetworkGuard {
    /// The required network is added to `registry` so it always resolves
    pub fn new(
        agent: Option<SigningAgent>,
        registry: NetworkRegistry,
        required: NetworkRegistration,
    ) -> Self {
        Self {
            agent,
            registry: registry.with(required.descriptor()),
            required,
        }
    }

    pub fn required(&self) -> &NetworkRegistration {
        &self.required
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    fn agent(&self) -> Result<&SigningAgent, PortalError> {
        self.agent.as_ref().ok_or(PortalError::NoProvider)
    }

    pub async fn get_current_network(&self) -> Result<NetworkStatus, PortalError> {
        let chain_id = self.agent()?.get_chain_id().await?;
        Ok(self.registry.resolve(chain_id))
    }

    pub async fn is_on_required_network(&self) -> Result<bool, PortalError> {
        let status = self.get_current_network().await?;
        Ok(status.is_chain(self.required.chain_id))
    }

    /// `None` when `status` is the required network
    pub fn network_prompt(&self, status: &NetworkStatus) -> Option<NetworkPrompt> {
        if status.is_chain(self.required.chain_id) {
            return None;
        }
        Some(NetworkPrompt {
            current: status.clone(),
            required: self.required.descriptor(),
        })
    }

    pub async fn ensure_required_network(&self) -> Result<NetworkDescriptor, PortalError> {
        let status = self.get_current_network().await?;
        match self.network_prompt(&status) {
            None => Ok(self.required.descriptor()),
            Some(prompt) => Err(PortalError::WrongNetwork {
                current: prompt.current,
                required: prompt.required,
            }),
        }
    }

    /// Ask the agent to switch to the required network.
    ///
    /// An unrecognized chain gets exactly one registration attempt followed
    /// by exactly one retry of the switch.
    pub async fn switch_network(&self) -> Result<NetworkDescriptor, PortalError> {
        let agent = self.agent()?;
        let target = self.required.chain_id;

        tracing::info!(chain = %target, "Requesting network switch");

        match agent.switch_chain(target).await {
            Ok(()) => {}
            Err(e) if e.is_user_rejection() => {
                tracing::info!("Network switch rejected by the user");
                return Err(PortalError::UserRejected);
            }
            Err(e) if e.is_unrecognized_chain() => {
                tracing::info!(
                    chain = %target,
                    name = %self.required.name,
                    "Chain unknown to agent, registering"
                );

                agent.register_chain(&self.required).await.map_err(|e| {
                    tracing::warn!(error = %e, "Chain registration failed");
                    PortalError::ChainSwitchFailed(format!("registration failed: {}", e))
                })?;

                agent.switch_chain(target).await.map_err(|e| {
                    tracing::warn!(error = %e, "Switch retry after registration failed");
                    PortalError::ChainSwitchFailed(e.to_string())
                })?;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Network switch failed");
                return Err(PortalError::ChainSwitchFailed(e.to_string()));
            }
        }

        let status = self.get_current_network().await?;
        if !status.is_chain(target) {
            return Err(PortalError::ChainSwitchFailed(format!(
                "agent reports {} after switching",
                status
            )));
        }

        tracing::info!(network = %status, "✅ On required network");
        Ok(self.required.descriptor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SimulatedWallet;
    use alloy_primitives::Address;
    use common::networks::ChainId;
    use std::sync::Arc;

    const POLYGON: ChainId = ChainId::new(0x89);
    const MUMBAI: ChainId = ChainId::new(0x13881);

    fn guard(wallet: SimulatedWallet) -> (Arc<SimulatedWallet>, NetworkGuard) {
        let wallet = Arc::new(wallet);
        let guard = NetworkGuard::new(
            Some(SigningAgent::new(wallet.clone())),
            NetworkRegistry::default(),
            NetworkRegistration::polygon_mumbai(),
        );
        (wallet, guard)
    }

    #[tokio::test]
    async fn test_without_agent() {
        let guard = NetworkGuard::new(
            None,
            NetworkRegistry::default(),
            NetworkRegistration::polygon_mumbai(),
        );
        assert_eq!(guard.get_current_network().await, Err(PortalError::NoProvider));
        assert_eq!(guard.switch_network().await, Err(PortalError::NoProvider));
    }

    #[tokio::test]
    async fn test_unknown_chain_resolves_to_unrecognized() {
        let (_wallet, guard) =
            guard(SimulatedWallet::new(Address::ZERO).on_chain(ChainId::new(0x2105)));

        let status = guard.get_current_network().await.unwrap();
        assert_eq!(status, NetworkStatus::Unrecognized(ChainId::new(0x2105)));
        assert!(!guard.is_on_required_network().await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_reports_wrong_network() {
        let (_wallet, guard) = guard(SimulatedWallet::new(Address::ZERO).on_chain(POLYGON));

        let err = guard.ensure_required_network().await.unwrap_err();
        match err {
            PortalError::WrongNetwork { current, required } => {
                assert!(current.is_chain(POLYGON));
                assert_eq!(required.chain_id, MUMBAI);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_prompt_only_off_network() {
        let (_wallet, guard) = guard(SimulatedWallet::new(Address::ZERO));

        let on = guard.registry().resolve(MUMBAI);
        assert!(guard.network_prompt(&on).is_none());

        let off = guard.registry().resolve(POLYGON);
        let prompt = guard.network_prompt(&off).unwrap();
        assert!(prompt.to_string().contains("Polygon Mumbai Testnet"));
    }

    #[tokio::test]
    async fn test_switch_to_known_chain() {
        let (wallet, guard) = guard(
            SimulatedWallet::new(Address::ZERO)
                .on_chain(POLYGON)
                .knows_chain(MUMBAI),
        );

        let descriptor = guard.switch_network().await.unwrap();

        assert_eq!(descriptor.chain_id, MUMBAI);
        assert!(guard.is_on_required_network().await.unwrap());
        assert_eq!(wallet.call_count("wallet_addEthereumChain"), 0);
    }

    #[tokio::test]
    async fn test_switch_registers_unknown_chain_once() {
        let (wallet, guard) = guard(SimulatedWallet::new(Address::ZERO).on_chain(POLYGON));

        guard.switch_network().await.unwrap();

        assert!(guard.is_on_required_network().await.unwrap());
        assert_eq!(wallet.call_count("wallet_switchEthereumChain"), 2);
        assert_eq!(wallet.call_count("wallet_addEthereumChain"), 1);

        let registration = &wallet.registrations()[0];
        assert_eq!(registration["chainId"], "0x13881");
        assert_eq!(registration["nativeCurrency"]["symbol"], "MATIC");
        assert_eq!(registration["rpcUrls"][0], "https://rpc-mumbai.maticvigil.com");
    }

    #[tokio::test]
    async fn test_failed_registration_is_not_retried() {
        let (wallet, guard) = guard(SimulatedWallet::new(Address::ZERO).on_chain(POLYGON));
        wallet.set_fail_registration(true);

        let err = guard.switch_network().await.unwrap_err();

        assert!(matches!(err, PortalError::ChainSwitchFailed(_)));
        assert_eq!(wallet.call_count("wallet_switchEthereumChain"), 1);
        assert_eq!(wallet.call_count("wallet_addEthereumChain"), 1);
        assert_eq!(wallet.chain_id(), POLYGON);
    }

    #[tokio::test]
    async fn test_rejected_switch() {
        let (wallet, guard) = guard(
            SimulatedWallet::new(Address::ZERO)
                .on_chain(POLYGON)
                .knows_chain(MUMBAI),
        );
        wallet.set_reject_switch(true);

        assert_eq!(guard.switch_network().await, Err(PortalError::UserRejected));
        assert_eq!(wallet.call_count("wallet_addEthereumChain"), 0);
    }
}
