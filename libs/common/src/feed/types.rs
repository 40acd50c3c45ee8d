use std::collections::HashSet;
use std::fmt;

use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of historical records used to seed a feed
pub const HISTORY_SEED_LIMIT: usize = 4;

/// Identity of an underlying ledger record.
///
/// The contract appends exactly one record to its wave list and emits
/// exactly one `NewWave` log per `wave` call, so the position in that list
/// names the same record whether it was read through `getAllWaves()` or
/// decoded from a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    contract: Address,
    index: u64,
}

impl SourceKey {
    pub fn new(contract: Address, index: u64) -> Self {
        Self { contract, index }
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Position in the contract's wave list
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.contract, self.index)
    }
}

/// Where a live record was found on the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOrigin {
    pub tx_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
}

/// A single wave, immutable once observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaveEvent {
    sender: Address,
    timestamp_secs: u64,
    message: String,
    source_key: SourceKey,
    origin: Option<LogOrigin>,
}

impl WaveEvent {
    /// Record read from `getAllWaves()`
    pub fn from_history(
        source_key: SourceKey,
        sender: Address,
        timestamp_secs: u64,
        message: String,
    ) -> Self {
        Self {
            sender,
            timestamp_secs,
            message,
            source_key,
            origin: None,
        }
    }

    /// Record decoded from a `NewWave` log
    pub fn from_log(
        source_key: SourceKey,
        sender: Address,
        timestamp_secs: u64,
        message: String,
        origin: LogOrigin,
    ) -> Self {
        Self {
            sender,
            timestamp_secs,
            message,
            source_key,
            origin: Some(origin),
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn timestamp_secs(&self) -> u64 {
        self.timestamp_secs
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        i64::try_from(self.timestamp_secs)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn source_key(&self) -> SourceKey {
        self.source_key
    }

    pub fn origin(&self) -> Option<&LogOrigin> {
        self.origin.as_ref()
    }
}

/// Deduplicated wave feed in first-seen order.
///
/// Seeded with at most [`HISTORY_SEED_LIMIT`] historical records; live
/// records are appended without a cap. Every key ever accepted stays in
/// `seen` for the lifetime of the feed, including keys of historical records
/// that fell outside the seed window and entries removed by [`Feed::clear`].
#[derive(Debug, Clone, Default)]
pub struct Feed {
    entries: Vec<WaveEvent>,
    seen: HashSet<SourceKey>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a feed from a full history in ledger order, keeping the last
    /// [`HISTORY_SEED_LIMIT`] records.
    pub fn seeded(history: Vec<WaveEvent>) -> Self {
        let mut feed = Self::new();
        let skip = history.len().saturating_sub(HISTORY_SEED_LIMIT);

        for (position, event) in history.into_iter().enumerate() {
            if position < skip {
                feed.seen.insert(event.source_key);
            } else {
                feed.append(event);
            }
        }

        feed
    }

    /// Append a record if its key was never seen. Returns true when appended.
    pub fn append(&mut self, event: WaveEvent) -> bool {
        if !self.seen.insert(event.source_key) {
            return false;
        }
        self.entries.push(event);
        true
    }

    /// Empty the visible entries. Seen keys are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, key: &SourceKey) -> bool {
        self.entries.iter().any(|e| e.source_key == *key)
    }

    pub fn has_seen(&self, key: &SourceKey) -> bool {
        self.seen.contains(key)
    }

    pub fn entries(&self) -> &[WaveEvent] {
        &self.entries
    }

    pub fn last(&self) -> Option<&WaveEvent> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTRACT: Address = Address::repeat_byte(0xc0);

    fn wave(index: u64, sender: u8, ts: u64, message: &str) -> WaveEvent {
        WaveEvent::from_history(
            SourceKey::new(CONTRACT, index),
            Address::repeat_byte(sender),
            ts,
            message.to_string(),
        )
    }

    fn origin(tx: u8, log_index: u64) -> LogOrigin {
        LogOrigin {
            tx_hash: B256::repeat_byte(tx),
            log_index,
            block_number: 100,
        }
    }

    fn history(count: u64) -> Vec<WaveEvent> {
        (0..count)
            .map(|i| wave(i, 1, 1_000 + i, &format!("wave {}", i)))
            .collect()
    }

    #[test]
    fn test_source_key_matches_across_history_and_log() {
        let history = wave(3, 1, 1_700_000_000, "gm");
        let live = WaveEvent::from_log(
            SourceKey::new(CONTRACT, 3),
            Address::repeat_byte(1),
            1_700_000_000,
            "gm".to_string(),
            origin(9, 0),
        );

        assert_eq!(history.source_key(), live.source_key());
        assert!(history.origin().is_none());
        assert!(live.origin().is_some());
    }

    #[test]
    fn test_identical_content_stays_distinct() {
        let feed = Feed::seeded(vec![
            wave(0, 1, 1_700_000_000, "hi"),
            wave(1, 1, 1_700_000_000, "hi"),
        ]);

        assert_eq!(feed.len(), 2);
        assert_ne!(feed.entries()[0].source_key(), feed.entries()[1].source_key());
    }

    #[test]
    fn test_source_key_scoped_to_contract() {
        let here = SourceKey::new(CONTRACT, 0);
        let elsewhere = SourceKey::new(Address::repeat_byte(0xc1), 0);

        assert_ne!(here, elsewhere);
        assert_eq!(here.index(), elsewhere.index());
        assert!(here.to_string().ends_with("#0"));
    }

    #[test]
    fn test_seeded_keeps_last_four_in_order() {
        let history = history(6);

        let feed = Feed::seeded(history.clone());

        assert_eq!(feed.len(), HISTORY_SEED_LIMIT);
        assert_eq!(feed.entries(), &history[2..]);
        // Older records are remembered but not shown
        assert!(feed.has_seen(&history[0].source_key()));
        assert!(!feed.contains(&history[0].source_key()));
    }

    #[test]
    fn test_seeded_with_short_history() {
        let feed = Feed::seeded(history(2));
        assert_eq!(feed.len(), 2);

        let empty = Feed::seeded(Vec::new());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_append_deduplicates() {
        let mut feed = Feed::seeded(history(1));

        assert!(!feed.append(wave(0, 1, 1_000, "wave 0")));
        assert!(feed.append(wave(1, 1, 2_000, "next")));
        assert!(!feed.append(wave(1, 1, 2_000, "next")));

        assert_eq!(feed.len(), 2);
    }

    #[test]
    fn test_live_entries_are_unbounded() {
        let mut feed = Feed::seeded(history(4));

        for i in 0..10 {
            assert!(feed.append(wave(4 + i, 2, 100 + i, "live")));
        }

        assert_eq!(feed.len(), 14);
    }

    #[test]
    fn test_clear_keeps_seen_keys() {
        let mut feed = Feed::seeded(history(2));
        feed.clear();

        assert!(feed.is_empty());
        assert!(!feed.append(wave(1, 1, 1_001, "wave 1")));
        assert!(feed.append(wave(2, 1, 1_002, "wave 2")));
        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn test_timestamp_conversion() {
        let event = wave(0, 1, 1_700_000_000, "gm");
        assert_eq!(event.timestamp().timestamp(), 1_700_000_000);

        let overflow = wave(0, 1, u64::MAX, "gm");
        assert_eq!(overflow.timestamp(), DateTime::<Utc>::default());
    }

    #[test]
    fn test_wave_event_serialization() {
        let event = WaveEvent::from_log(
            SourceKey::new(CONTRACT, 5),
            Address::repeat_byte(3),
            42,
            "hi".into(),
            origin(7, 2),
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["message"], "hi");
        assert_eq!(json["source_key"]["index"], 5);
        assert_eq!(json["origin"]["log_index"], 2);
    }
}
