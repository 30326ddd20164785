//! Wire types for the narrative-analysis oracle

use crate::market::MarketContextSnapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the oracle gateway
#[derive(Debug, Error)]
pub enum OracleError {
    /// Unreachable service, timeout, or a transient server-side failure.
    /// Retried with bounded backoff.
    #[error("Oracle transport failure: {0}")]
    Transport(String),

    /// Structurally or semantically invalid response. Never retried: a
    /// malformed response is worth inspecting, not re-rolling, and partial
    /// acceptance would corrupt the accumulation invariant. `payload`
    /// carries the offending content for the operator.
    #[error("Oracle response violates schema: {reason}")]
    Schema { reason: String, payload: String },
}

/// Result type for oracle operations
pub type OracleResult<T> = Result<T, OracleError>;

/// One mentioned character's state as presented to the oracle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionState {
    pub reference: String,
    pub name: String,
    /// True when this is the character's first appearance
    pub new: bool,
    /// Current cumulative value; absent for first appearances
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_value: Option<f64>,
}

/// The full analysis request for one chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    pub chapter: u32,
    pub title: String,
    pub text: String,
    pub characters: Vec<MentionState>,
    pub context: MarketContextSnapshot,
}

/// One scored narrative action for one character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionVerdict {
    /// Signed value change; explicitly unbounded in either direction
    pub delta: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub justification: String,
}

/// The oracle's verdict for one character in one chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterVerdict {
    /// Must match a reference from the request's mention list
    pub reference: String,
    /// Starting value for a first appearance; forbidden otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<f64>,
    /// Ordered actions, chronological within the chapter
    #[serde(default)]
    pub actions: Vec<ActionVerdict>,
}

/// A full chapter analysis as returned by the oracle
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChapterAnalysis {
    #[serde(default)]
    pub verdicts: Vec<CharacterVerdict>,
    /// Optional chapter-level justification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ChapterAnalysis {
    pub fn verdict_for(&self, reference: &str) -> Option<&CharacterVerdict> {
        self.verdicts.iter().find(|v| v.reference == reference)
    }
}
