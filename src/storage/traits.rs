//! Storage trait definitions

use crate::market::{
    Character, CharacterRef, CharacterStanding, Chapter, MarketEvent, StockHistoryEntry,
};
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Character not found: {0}")]
    CharacterNotFound(String),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    /// Stored state disagrees with a commit's expectations. This is a logic
    /// or data corruption bug, never a recoverable condition; callers must
    /// abort the run rather than persist on top of it.
    #[error("Store inconsistency: {0}")]
    Inconsistent(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// The full write set for one chapter, committed as a single atomic unit
///
/// Proposed by the event applier and carried to the store by the
/// orchestrator, the only writer. Partial application is forbidden: either
/// every row lands and the chapter flips to processed, or nothing does.
#[derive(Debug, Clone)]
pub struct ChapterCommit {
    /// The chapter row (title/arc/text) to upsert
    pub chapter: Chapter,
    pub processed_at: DateTime<Utc>,
    /// Characters making their first appearance this chapter
    pub new_characters: Vec<Character>,
    pub events: Vec<MarketEvent>,
    pub entries: Vec<StockHistoryEntry>,
    /// Per existing character, the cumulative value the applier started
    /// from. Re-checked inside the commit transaction; a mismatch means the
    /// accumulation chain diverged from stored history.
    pub expected_starts: Vec<(CharacterRef, f64)>,
}

/// Summary counts for operator status output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub characters: usize,
    pub chapters: usize,
    pub processed_chapters: usize,
    pub events: usize,
    pub history_entries: usize,
}

/// Trait for market storage backends
///
/// Implementations must be thread-safe (Send + Sync). All `*_before`
/// queries treat their chapter argument as an exclusive upper bound; they
/// exist so context construction for chapter N can never observe rows
/// produced by chapter N or later.
pub trait MarketStore: Send + Sync {
    // === Characters ===

    /// Load a character by its stable reference
    fn character(&self, reference: &CharacterRef) -> StorageResult<Option<Character>>;

    /// All characters, ordered by reference
    fn all_characters(&self) -> StorageResult<Vec<Character>>;

    // === Chapters ===

    fn chapter(&self, number: u32) -> StorageResult<Option<Chapter>>;

    /// Record a fetched chapter (title/arc/text) without touching its
    /// processed state
    fn record_chapter(&self, chapter: &Chapter) -> StorageResult<()>;

    fn is_processed(&self, number: u32) -> StorageResult<bool>;

    /// Highest committed chapter number, if any
    fn last_committed_chapter(&self) -> StorageResult<Option<u32>>;

    /// Known but unprocessed chapter numbers strictly below `number`,
    /// ascending
    fn unprocessed_below(&self, number: u32) -> StorageResult<Vec<u32>>;

    /// Unprocessed chapter numbers within [start, end], ascending
    fn unprocessed_in_range(&self, start: u32, end: u32) -> StorageResult<Vec<u32>>;

    // === Market reads (boundary-aware) ===

    /// Each character's most recent standing from history rows strictly
    /// before `chapter`. Characters with no entry before the boundary are
    /// absent.
    fn latest_standings_before(&self, chapter: u32) -> StorageResult<Vec<CharacterStanding>>;

    /// One character's latest cumulative value strictly before `chapter`
    fn latest_value_before(
        &self,
        reference: &CharacterRef,
        chapter: u32,
    ) -> StorageResult<Option<f64>>;

    /// Last `k` history entries strictly before `chapter`, most recent
    /// first
    fn recent_entries_before(
        &self,
        reference: &CharacterRef,
        chapter: u32,
        k: usize,
    ) -> StorageResult<Vec<StockHistoryEntry>>;

    // === Audit / presentation reads ===

    /// Full history for one character, ascending by chapter
    fn history(&self, reference: &CharacterRef) -> StorageResult<Vec<StockHistoryEntry>>;

    /// All events for one character in (chapter, action_index) order
    fn events_for_character(&self, reference: &CharacterRef) -> StorageResult<Vec<MarketEvent>>;

    /// All events for one chapter in (character, action_index) order
    fn events_for_chapter(&self, chapter: u32) -> StorageResult<Vec<MarketEvent>>;

    fn stats(&self) -> StorageResult<StoreStats>;

    // === Commit ===

    /// Persist one chapter's write set and flip its processed flag, as a
    /// single transaction. Fails with [`StorageError::Inconsistent`] when
    /// the chapter is already processed, a "new" character already exists,
    /// or an expected start value disagrees with stored history.
    fn commit_chapter(&self, commit: &ChapterCommit) -> StorageResult<()>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: MarketStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
