//! Feed of wave records emitted by the portal contract.
//!
//! This module provides:
//! - [`WaveEvent`], the immutable record seen through history or live delivery
//! - [`SourceKey`], the ledger-derived identity used for deduplication
//! - [`Feed`], the first-seen ordered, deduplicated sequence shown to the user
//!
//! # Deduplication
//!
//! `getAllWaves()` returns records without any transaction identity, while
//! live `NewWave` logs do carry one. Both sources agree on the position of a
//! record in the contract's wave list, which is what [`SourceKey`] holds.
//! Identical waves sent in the same second stay distinct.

pub mod types;

pub use types::{Feed, LogOrigin, SourceKey, WaveEvent, HISTORY_SEED_LIMIT};
