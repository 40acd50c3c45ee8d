//! Error types for the wallet session and contract lifecycle

use alloy_primitives::B256;
use common::networks::{NetworkDescriptor, NetworkStatus};

use crate::agent::ProviderRpcError;

/// Errors surfaced by the session, network guard, contract client and feed
#[derive(Debug, Clone, PartialEq)]
pub enum PortalError {
    // User-facing, terminal for the attempted operation
    NoProvider,
    UserRejected,

    // Network errors
    WrongNetwork {
        current: NetworkStatus,
        required: NetworkDescriptor,
    },
    ChainSwitchFailed(String),

    // Ledger errors
    TransactionFailed { tx_hash: B256 },
    RpcError(String),

    // Lifecycle errors
    NotConnected,
    Stale,
}

impl PortalError {
    /// Recoverable through the network switch flow
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PortalError::WrongNetwork { .. })
    }

    /// Errors the user has to be told about directly
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            PortalError::NoProvider
                | PortalError::UserRejected
                | PortalError::WrongNetwork { .. }
                | PortalError::ChainSwitchFailed(_)
        )
    }
}

impl std::fmt::Display for PortalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortalError::NoProvider => write!(f, "No signing agent available"),
            PortalError::UserRejected => write!(f, "Request rejected by the user"),
            PortalError::WrongNetwork { current, required } => {
                write!(f, "Wrong network: on {}, {} required", current, required)
            }
            PortalError::ChainSwitchFailed(msg) => write!(f, "Chain switch failed: {}", msg),
            PortalError::TransactionFailed { tx_hash } => {
                write!(f, "Transaction {} failed on chain", tx_hash)
            }
            PortalError::RpcError(msg) => write!(f, "RPC error: {}", msg),
            PortalError::NotConnected => write!(f, "No connected session"),
            PortalError::Stale => write!(f, "Session changed while the operation was in flight"),
        }
    }
}

impl std::error::Error for PortalError {}

impl From<ProviderRpcError> for PortalError {
    fn from(err: ProviderRpcError) -> Self {
        if err.is_user_rejection() {
            PortalError::UserRejected
        } else {
            PortalError::RpcError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PortalError {
    fn from(err: serde_json::Error) -> Self {
        PortalError::RpcError(format!("Malformed agent response: {}", err))
    }
}

impl From<alloy_sol_types::Error> for PortalError {
    fn from(err: alloy_sol_types::Error) -> Self {
        PortalError::RpcError(format!("ABI decode failed: {}", err))
    }
}
