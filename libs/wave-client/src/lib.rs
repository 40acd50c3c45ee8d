//! Wallet session and wave feed lifecycle for the wave portal contract.
//!
//! Provides:
//! - Connecting to a signing agent and tracking the active account
//! - Checking and correcting the active chain
//! - Submitting waves and waiting for confirmation
//! - A deduplicated feed merging `getAllWaves()` history with live `NewWave` logs

pub mod agent;
pub mod aggregator;
pub mod contract;
pub mod errors;
pub mod network_guard;
pub mod portal;
pub mod session;

pub use agent::{
    AgentNotification, Eip1193Provider, Interruption, ProviderRpcError, RpcWallet, RpcWalletConfig,
    SigningAgent, SimulatedWallet,
};
pub use aggregator::{AggregatorState, EventAggregator, FeedUpdate};
pub use contract::{
    ContractBinding, ContractClient, ContractConfig, Delivery, HistorySnapshot, LedgerCursor,
    PendingWave, Subscription, SubscriptionId, WaveReceipt,
};
pub use errors::PortalError;
pub use network_guard::{NetworkGuard, NetworkPrompt};
pub use portal::{Portal, PortalEvent, PortalSettings, WaveOutcome};
pub use session::{ConnectionState, Session, SessionChange, SessionManager};
