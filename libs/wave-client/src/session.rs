//! Wallet session ownership.
//!
//! [`SessionManager`] is the only writer of the [`Session`] value. Everything
//! downstream holds a clone of the manager and compares epochs to find out
//! whether the binding it was created against is still current.
//!
//! Agent notifications queue up on the manager's own receiver. They are
//! applied by [`SessionManager::sync`], which runs before every epoch
//! comparison, so a chain or account change that arrived while a request
//! was in flight invalidates that request's result.

use std::collections::VecDeque;
use std::sync::Arc;

use alloy_primitives::Address;
use common::networks::{ChainId, NetworkRegistry, NetworkStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::watch;

use crate::agent::{AgentNotification, SigningAgent};
use crate::errors::PortalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Current account, network and connection state.
///
/// `state == Connected` exactly when `account` is present.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    account: Option<Address>,
    network: Option<NetworkStatus>,
    state: ConnectionState,
    epoch: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            account: None,
            network: None,
            state: ConnectionState::Disconnected,
            epoch: 0,
        }
    }
}

impl Session {
    pub fn account(&self) -> Option<Address> {
        self.account
    }

    /// Last network observed; `None` until the chain has been read
    pub fn network(&self) -> Option<&NetworkStatus> {
        self.network.as_ref()
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.network.as_ref().map(NetworkStatus::chain_id)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation counter, bumped on every account, chain or connection change
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn set_account(&mut self, account: Option<Address>) {
        if self.account != account {
            self.epoch += 1;
        }
        self.account = account;
        self.state = match account {
            Some(_) => ConnectionState::Connected,
            None => ConnectionState::Disconnected,
        };
    }
}

/// What changed in the session, handed to registered handlers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    AccountChanged {
        previous: Option<Address>,
        current: Option<Address>,
    },
    ChainChanged {
        previous: Option<ChainId>,
        current: NetworkStatus,
    },
    Disconnected,
}

type ChangeHandler = Box<dyn Fn(&SessionChange, &Session) + Send + Sync>;

struct SessionInner {
    agent: Option<SigningAgent>,
    registry: NetworkRegistry,
    session: watch::Sender<Session>,
    handlers: RwLock<Vec<ChangeHandler>>,
    notifications: Mutex<Option<broadcast::Receiver<AgentNotification>>>,
    pending: Mutex<VecDeque<SessionChange>>,
}

/// Cheap to clone; every clone manages the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(agent: Option<SigningAgent>, registry: NetworkRegistry) -> Self {
        let (session, _) = watch::channel(Session::default());
        let notifications = agent.as_ref().map(SigningAgent::notifications);
        Self {
            inner: Arc::new(SessionInner {
                agent,
                registry,
                session,
                handlers: RwLock::new(Vec::new()),
                notifications: Mutex::new(notifications),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn agent(&self) -> Option<&SigningAgent> {
        self.inner.agent.as_ref()
    }

    pub fn registry(&self) -> &NetworkRegistry {
        &self.inner.registry
    }

    /// Session as last applied; see [`SessionManager::sync`]
    pub fn snapshot(&self) -> Session {
        self.inner.session.borrow().clone()
    }

    /// Read-only view for observers
    pub fn watch(&self) -> watch::Receiver<Session> {
        self.inner.session.subscribe()
    }

    /// Apply every agent notification received so far.
    ///
    /// Resulting changes are queued for [`SessionManager::take_change`].
    /// Registered handlers run with the receiver locked and must not call
    /// back into `sync`.
    pub fn sync(&self) {
        let mut receiver = self.inner.notifications.lock();
        let Some(notifications) = receiver.as_mut() else {
            return;
        };

        loop {
            match notifications.try_recv() {
                Ok(notification) => {
                    if let Some(change) = self.handle_notification(&notification) {
                        self.inner.pending.lock().push_back(change);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed agent notifications, invalidating bindings");
                    self.inner.session.send_modify(|s| s.epoch += 1);
                }
                Err(TryRecvError::Closed) => {
                    tracing::debug!("Agent notification stream closed");
                    *receiver = None;
                    break;
                }
            }
        }
    }

    /// Oldest change applied by [`SessionManager::sync`] not yet taken
    pub fn take_change(&self) -> Option<SessionChange> {
        self.inner.pending.lock().pop_front()
    }

    /// Current epoch after applying pending notifications
    pub fn epoch(&self) -> u64 {
        self.sync();
        self.inner.session.borrow().epoch
    }

    /// True while nothing invalidated bindings made in `epoch`
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    /// Pick up an already-authorized account without prompting
    pub async fn restore_session(&self) -> Option<Address> {
        let Some(agent) = &self.inner.agent else {
            tracing::info!("No signing agent detected");
            return None;
        };

        match agent.get_authorized_accounts().await {
            Ok(accounts) => {
                let account = accounts.first().copied();
                match account {
                    Some(account) => {
                        tracing::info!(account = %account, "Restored authorized account");
                        self.inner.session.send_modify(|s| s.set_account(Some(account)));
                    }
                    None => tracing::info!("No authorized account found"),
                }
                account
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read authorized accounts");
                None
            }
        }
    }

    /// Ask the agent for account access; may prompt the user
    pub async fn connect(&self) -> Result<Address, PortalError> {
        let Some(agent) = &self.inner.agent else {
            tracing::warn!("Connect requested without a signing agent");
            return Err(PortalError::NoProvider);
        };

        self.inner.session.send_modify(|s| {
            s.set_account(None);
            s.state = ConnectionState::Connecting;
        });

        let result = agent.request_accounts().await;

        let account = match result {
            Ok(accounts) => accounts.first().copied(),
            Err(e) => {
                self.inner.session.send_modify(|s| s.set_account(None));
                let err = PortalError::from(e);
                tracing::warn!(error = %err, "Connect failed");
                return Err(err);
            }
        };

        self.inner.session.send_modify(|s| s.set_account(account));

        match account {
            Some(account) => {
                tracing::info!(account = %account, "🔗 Connected");
                Ok(account)
            }
            None => {
                tracing::warn!("Agent granted access to no accounts");
                Err(PortalError::NotConnected)
            }
        }
    }

    /// Forget the account locally; the agent keeps its authorization
    pub fn disconnect(&self) {
        self.inner.session.send_modify(|s| {
            s.account = None;
            s.state = ConnectionState::Disconnected;
            s.epoch += 1;
        });
        tracing::info!("Disconnected");
    }

    pub fn on_account_or_chain_changed<F>(&self, handler: F)
    where
        F: Fn(&SessionChange, &Session) + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Box::new(handler));
    }

    /// Record the network read by the guard.
    ///
    /// A chain other than the one on record is handled as a chain change.
    pub fn observe_network(&self, status: NetworkStatus) -> Option<SessionChange> {
        self.apply_chain(status)
    }

    /// Apply an agent notification and run the registered handlers
    pub fn handle_notification(
        &self,
        notification: &AgentNotification,
    ) -> Option<SessionChange> {
        match notification {
            AgentNotification::AccountsChanged(accounts) => self.apply_accounts(accounts),
            AgentNotification::ChainChanged(chain_id) => {
                self.apply_chain(self.inner.registry.resolve(*chain_id))
            }
            AgentNotification::Disconnected => {
                if self.inner.session.borrow().state == ConnectionState::Disconnected {
                    return None;
                }
                self.inner.session.send_modify(|s| {
                    s.account = None;
                    s.state = ConnectionState::Disconnected;
                    s.epoch += 1;
                });
                tracing::warn!("Signing agent disconnected");
                self.notify(SessionChange::Disconnected)
            }
        }
    }

    fn apply_accounts(&self, accounts: &[Address]) -> Option<SessionChange> {
        let (state, previous) = {
            let session = self.inner.session.borrow();
            (session.state, session.account)
        };

        if state != ConnectionState::Connected {
            tracing::debug!("Ignoring account change while not connected");
            return None;
        }

        let current = accounts.first().copied();
        if current == previous {
            return None;
        }

        self.inner.session.send_modify(|s| s.set_account(current));

        match current {
            Some(account) => tracing::info!(account = %account, "Account changed"),
            None => tracing::info!("Agent revoked account access"),
        }

        self.notify(SessionChange::AccountChanged { previous, current })
    }

    fn apply_chain(&self, status: NetworkStatus) -> Option<SessionChange> {
        let previous = self.inner.session.borrow().chain_id();

        if previous == Some(status.chain_id()) {
            // Same chain, refresh the descriptor only
            self.inner.session.send_modify(|s| s.network = Some(status));
            return None;
        }

        let current = status.clone();
        self.inner.session.send_modify(|s| {
            s.network = Some(status);
            s.epoch += 1;
        });

        match previous {
            Some(previous) => {
                tracing::info!(previous = %previous, current = %current, "⛓️ Chain changed")
            }
            None => tracing::debug!(current = %current, "Network observed"),
        }

        self.notify(SessionChange::ChainChanged { previous, current })
    }

    fn notify(&self, change: SessionChange) -> Option<SessionChange> {
        let session = self.snapshot();
        for handler in self.inner.handlers.read().iter() {
            handler(&change, &session);
        }
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SimulatedWallet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ALICE: Address = Address::repeat_byte(0xa1);
    const BOB: Address = Address::repeat_byte(0xb0);

    fn assert_invariant(session: &Session) {
        assert_eq!(session.is_connected(), session.account().is_some());
    }

    fn alice() -> SimulatedWallet {
        SimulatedWallet::new(Address::ZERO).with_accounts(vec![ALICE])
    }

    fn setup(wallet: SimulatedWallet) -> (Arc<SimulatedWallet>, SessionManager) {
        let wallet = Arc::new(wallet);
        let manager = SessionManager::new(
            Some(SigningAgent::new(wallet.clone())),
            NetworkRegistry::default(),
        );
        (wallet, manager)
    }

    #[tokio::test]
    async fn test_restore_without_agent() {
        let manager = SessionManager::new(None, NetworkRegistry::default());
        assert_eq!(manager.restore_session().await, None);
        assert_eq!(manager.snapshot().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_without_agent() {
        let manager = SessionManager::new(None, NetworkRegistry::default());
        assert_eq!(manager.connect().await, Err(PortalError::NoProvider));
        assert_invariant(&manager.snapshot());
    }

    #[tokio::test]
    async fn test_restore_needs_prior_authorization() {
        let (_wallet, manager) = setup(alice());
        assert_eq!(manager.restore_session().await, None);

        let (_wallet, manager) = setup(
            SimulatedWallet::new(Address::ZERO)
                .with_accounts(vec![ALICE])
                .authorized(),
        );
        assert_eq!(manager.restore_session().await, Some(ALICE));
        assert!(manager.snapshot().is_connected());
    }

    #[tokio::test]
    async fn test_connect_rejected_returns_to_disconnected() {
        let (wallet, manager) = setup(alice());
        wallet.set_reject_connect(true);

        assert_eq!(manager.connect().await, Err(PortalError::UserRejected));

        let session = manager.snapshot();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_invariant(&session);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_bump_epoch() {
        let (_wallet, manager) = setup(alice());

        assert_eq!(manager.connect().await, Ok(ALICE));
        let connected = manager.snapshot();
        assert_invariant(&connected);

        manager.disconnect();
        let disconnected = manager.snapshot();
        assert_invariant(&disconnected);
        assert!(disconnected.epoch() > connected.epoch());
    }

    #[tokio::test]
    async fn test_account_change_runs_handlers() {
        let (_wallet, manager) = setup(alice());
        manager.connect().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.on_account_or_chain_changed(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let before = manager.snapshot().epoch();
        let change = manager.handle_notification(&AgentNotification::AccountsChanged(vec![BOB]));

        assert_eq!(
            change,
            Some(SessionChange::AccountChanged {
                previous: Some(ALICE),
                current: Some(BOB),
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.snapshot().account(), Some(BOB));
        assert!(manager.snapshot().epoch() > before);

        // Same account again is not a change
        assert!(manager
            .handle_notification(&AgentNotification::AccountsChanged(vec![BOB]))
            .is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_accounts_disconnects() {
        let (_wallet, manager) = setup(alice());
        manager.connect().await.unwrap();

        manager.handle_notification(&AgentNotification::AccountsChanged(Vec::new()));

        let session = manager.snapshot();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_invariant(&session);
    }

    #[tokio::test]
    async fn test_accounts_changed_ignored_while_disconnected() {
        let (_wallet, manager) = setup(alice());
        assert!(manager
            .handle_notification(&AgentNotification::AccountsChanged(vec![BOB]))
            .is_none());
        assert_eq!(manager.snapshot().account(), None);
    }

    #[test]
    fn test_chain_change_bumps_epoch_once() {
        let manager = SessionManager::new(None, NetworkRegistry::default());
        let registry = NetworkRegistry::default();

        manager.observe_network(registry.resolve(ChainId::new(0x89)));
        let first = manager.snapshot().epoch();

        assert!(manager
            .observe_network(registry.resolve(ChainId::new(0x89)))
            .is_none());
        assert_eq!(manager.snapshot().epoch(), first);

        let change =
            manager.handle_notification(&AgentNotification::ChainChanged(ChainId::new(0x13881)));
        assert!(matches!(
            change,
            Some(SessionChange::ChainChanged { previous: Some(p), .. }) if p == ChainId::new(0x89)
        ));
        assert_eq!(manager.snapshot().epoch(), first + 1);
        assert_eq!(manager.snapshot().chain_id(), Some(ChainId::new(0x13881)));
    }

    #[tokio::test]
    async fn test_watch_sees_updates() {
        let (_wallet, manager) = setup(alice());
        let mut rx = manager.watch();

        manager.connect().await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().account(), Some(ALICE));
    }

    #[tokio::test]
    async fn test_sync_applies_queued_agent_notifications() {
        let (wallet, manager) = setup(alice());
        manager.connect().await.unwrap();
        manager.observe_network(manager.registry().resolve(wallet.chain_id()));
        let epoch = manager.epoch();

        wallet.change_chain(ChainId::new(0x89));

        // Not applied until someone looks at the epoch
        assert_eq!(manager.snapshot().epoch(), epoch);
        assert!(!manager.is_current(epoch));
        assert_eq!(manager.snapshot().chain_id(), Some(ChainId::new(0x89)));

        assert!(matches!(
            manager.take_change(),
            Some(SessionChange::ChainChanged { current, .. })
                if current.is_chain(ChainId::new(0x89))
        ));
        assert!(manager.take_change().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_one_session() {
        let (wallet, manager) = setup(
            SimulatedWallet::new(Address::ZERO)
                .with_accounts(vec![ALICE, BOB])
                .authorized(),
        );
        let observer = manager.clone();
        manager.restore_session().await.unwrap();
        let epoch = observer.epoch();

        wallet.change_accounts(vec![BOB]);

        assert!(!observer.is_current(epoch));
        assert_eq!(manager.snapshot().account(), Some(BOB));
        assert!(manager.take_change().is_some());
        assert!(observer.take_change().is_none());
    }
}
