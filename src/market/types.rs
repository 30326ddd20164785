//! Core market types: characters, chapters, events, and history rows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity key for a character
///
/// Wraps the external reference path (e.g. a wiki path) that uniquely
/// identifies a character across display-name variants. Display text is
/// retained on [`Character`] for presentation only; identity comparisons
/// always go through this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacterRef(String);

impl CharacterRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CharacterRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CharacterRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for CharacterRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tracked character
///
/// Created on first mention, never deleted. The identity key, initial value,
/// and first-appearance chapter are write-once; later chapters express
/// revised assessments as deltas, never as mutations of these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    /// Stable external reference (identity key)
    pub reference: CharacterRef,
    /// Canonical display name
    pub name: String,
    /// Chapter in which the character first appeared
    pub first_appearance: u32,
    /// Oracle-assigned starting stock value (write-once)
    pub initial_value: f64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// A fetched chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// Ordinal chapter number (externally assigned, gaps allowed)
    pub number: u32,
    pub title: String,
    pub arc_name: Option<String>,
    /// Raw narrative text, persisted so later runs can skip re-fetching
    pub text: String,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Chapter {
    /// A freshly fetched, not-yet-processed chapter
    pub fn fetched(
        number: u32,
        title: impl Into<String>,
        arc_name: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            number,
            title: title.into(),
            arc_name,
            text: text.into(),
            processed: false,
            processed_at: None,
        }
    }
}

/// One atomic value change, immutable once written
///
/// Ordered by (chapter, action_index); `action_index` is the ordinal of the
/// action within the character's stream for that chapter. `pre_clamp_value`
/// records the running value before the zero floor was applied, for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub character: CharacterRef,
    pub chapter: u32,
    pub action_index: u32,
    /// Signed delta as returned by the oracle (unbounded)
    pub delta: f64,
    /// Running value after adding `delta`, before the zero floor
    pub pre_clamp_value: f64,
    /// Oracle confidence in [0, 1]
    pub confidence: f64,
    pub justification: String,
}

/// One row per (character, chapter): the cumulative value after all of that
/// chapter's events and the chapter's net effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockHistoryEntry {
    pub character: CharacterRef,
    pub chapter: u32,
    /// Value after the chapter's events, floor-at-zero applied per event
    pub cumulative: f64,
    /// `cumulative` minus the value at the start of the chapter
    pub chapter_change: f64,
    /// Rank in the market after this chapter (1 = highest)
    pub rank: Option<u32>,
    /// Chapter-level justification (oracle-supplied or synthesized)
    pub justification: String,
}

/// A character's market standing as of a context boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterStanding {
    pub reference: CharacterRef,
    pub name: String,
    pub first_appearance: u32,
    /// Latest cumulative value visible at the boundary
    pub value: f64,
    /// Chapter that produced `value`
    pub as_of_chapter: u32,
}

/// Aggregate statistics over all tracked characters at a context boundary
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketStats {
    pub tracked_characters: usize,
    pub mean: f64,
    pub median: f64,
}

/// Recent activity sample for one character, one chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub chapter: u32,
    pub chapter_change: f64,
    pub justification: String,
}

/// Recent history for a character expected in the current chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionHistory {
    pub reference: CharacterRef,
    pub name: String,
    /// Last K committed chapters' samples, oldest first
    pub samples: Vec<HistorySample>,
}

/// The bounded market view handed to the oracle for one chapter
///
/// Derived, never authoritative. Computed strictly from chapters committed
/// before `chapter`; nothing produced by `chapter` or later may appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketContextSnapshot {
    /// The chapter this snapshot was built for (exclusive upper bound)
    pub chapter: u32,
    /// Top characters by latest value, ties broken by earliest first
    /// appearance, then by reference
    pub top: Vec<CharacterStanding>,
    pub stats: MarketStats,
    /// Recent activity for each character expected in the chapter
    pub histories: Vec<MentionHistory>,
}

impl MarketContextSnapshot {
    /// True when no prior market state exists (first chapter overall)
    pub fn is_empty(&self) -> bool {
        self.stats.tracked_characters == 0
    }
}
