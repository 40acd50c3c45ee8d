//! History + live merge into one deduplicated feed.
//!
//! ```text
//! Idle ──start──▶ Hydrating ──ok──▶ Live
//!   ▲                 │              │
//!   └────failure──────┘◀──teardown───┘
//! ```

use common::feed::{Feed, SourceKey, WaveEvent};

use crate::contract::{ContractClient, Delivery, Subscription, SubscriptionId};
use crate::errors::PortalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Hydrating,
    Live,
}

/// Effect of one delivery on the feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    Appended(WaveEvent),
    /// Key already seen, feed unchanged
    Duplicate(SourceKey),
    /// Delivery from a released or outdated subscription, feed unchanged
    Stale,
}

pub struct EventAggregator {
    state: AggregatorState,
    feed: Feed,
    subscription: Option<Subscription>,
}

impl Default for EventAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventAggregator {
    pub fn new() -> Self {
        Self {
            state: AggregatorState::Idle,
            feed: Feed::new(),
            subscription: None,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription.as_ref().map(Subscription::id)
    }

    /// Hydrate from history and go live.
    ///
    /// Any previous subscription is released first. History is read at the
    /// current block and live delivery starts right after it.
    pub async fn start(&mut self, client: &ContractClient) -> Result<(), PortalError> {
        self.teardown();
        self.state = AggregatorState::Hydrating;

        match Self::hydrate(client).await {
            Ok((feed, subscription)) => {
                tracing::info!(
                    subscription = %subscription.id(),
                    seeded = feed.len(),
                    "🌊 Feed live"
                );
                self.feed = feed;
                self.subscription = Some(subscription);
                self.state = AggregatorState::Live;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Feed hydration failed");
                self.state = AggregatorState::Idle;
                Err(e)
            }
        }
    }

    async fn hydrate(client: &ContractClient) -> Result<(Feed, Subscription), PortalError> {
        let block = client.current_block().await?;
        let snapshot = client.read_history_at(block).await?;

        if !client.is_current() {
            return Err(PortalError::Stale);
        }

        tracing::debug!(records = snapshot.records.len(), block, "History loaded");

        let subscription = client.subscribe(snapshot.cursor)?;
        Ok((Feed::seeded(snapshot.records), subscription))
    }

    /// False once the live subscription's binding is outdated
    pub fn is_current(&self) -> bool {
        self.subscription.as_ref().map_or(true, Subscription::is_current)
    }

    /// Apply one delivery; only the current subscription mutates the feed.
    ///
    /// A delivery arriving after the session moved on discards the feed.
    pub fn accept(&mut self, delivery: Delivery) -> FeedUpdate {
        let current = self.subscription_id();
        if self.state != AggregatorState::Live || current != Some(delivery.subscription) {
            tracing::debug!(
                subscription = %delivery.subscription,
                "Dropping delivery from released subscription"
            );
            return FeedUpdate::Stale;
        }

        if !self.is_current() {
            tracing::warn!(
                subscription = %delivery.subscription,
                "Session changed under the live subscription, discarding feed"
            );
            self.teardown();
            return FeedUpdate::Stale;
        }

        let key = delivery.event.source_key();
        if self.feed.append(delivery.event.clone()) {
            tracing::info!(key = %key, sender = %delivery.event.sender(), "New wave");
            FeedUpdate::Appended(delivery.event)
        } else {
            tracing::trace!(key = %key, "Duplicate wave dropped");
            FeedUpdate::Duplicate(key)
        }
    }

    /// Wait for the next delivery. Pending forever while idle; `None` if the
    /// poller stopped on its own.
    pub async fn next_update(&mut self) -> Option<FeedUpdate> {
        let Some(subscription) = self.subscription.as_mut() else {
            return std::future::pending().await;
        };

        let delivery = subscription.recv().await;
        delivery.map(|delivery| self.accept(delivery))
    }

    /// Apply every delivery already queued, without waiting
    pub fn drain(&mut self) -> Vec<FeedUpdate> {
        let mut updates = Vec::new();
        while let Some(delivery) = self.subscription.as_mut().and_then(Subscription::try_recv) {
            updates.push(self.accept(delivery));
        }
        updates
    }

    /// Release the subscription and discard the feed
    pub fn teardown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.release();
        }
        if self.state != AggregatorState::Idle {
            tracing::debug!("Feed torn down");
        }
        self.feed = Feed::new();
        self.state = AggregatorState::Idle;
    }

    /// Re-hydrate on the same binding
    pub async fn refresh(&mut self, client: &ContractClient) -> Result<(), PortalError> {
        self.start(client).await
    }

    /// Empty the visible feed; the subscription and seen keys stay
    pub fn clear(&mut self) {
        self.feed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;

    #[test]
    fn test_idle_aggregator_rejects_deliveries() {
        let mut aggregator = EventAggregator::new();
        let delivery = Delivery {
            subscription: unknown_subscription(),
            event: WaveEvent::from_history(
                SourceKey::new(Address::repeat_byte(0xc0), 0),
                Address::repeat_byte(1),
                1,
                "hi".to_string(),
            ),
        };

        assert_eq!(aggregator.accept(delivery), FeedUpdate::Stale);
        assert!(aggregator.feed().is_empty());
        assert_eq!(aggregator.state(), AggregatorState::Idle);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut aggregator = EventAggregator::new();
        aggregator.teardown();
        aggregator.teardown();
        assert_eq!(aggregator.state(), AggregatorState::Idle);
        assert!(aggregator.subscription_id().is_none());
        assert!(aggregator.drain().is_empty());
        assert!(aggregator.is_current());
    }

    fn unknown_subscription() -> SubscriptionId {
        SubscriptionId::from(uuid::Uuid::nil())
    }
}
