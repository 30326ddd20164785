//! Deterministic oracle backed by canned analyses
//!
//! Serves pre-authored [`ChapterAnalysis`] values keyed by chapter number.
//! This is both the offline-data path (run the engine over a corpus without
//! a live model) and the fixed-response fake the engine's own tests use,
//! since the real oracle is nondeterministic and must never be assumed
//! otherwise in tests.

use super::types::{ChapterAnalysis, OracleError, OracleRequest, OracleResult};
use super::ChapterOracle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ScriptedOracle {
    analyses: HashMap<u32, ChapterAnalysis>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON file mapping chapter numbers to analyses
    pub fn from_file(path: impl AsRef<Path>) -> OracleResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| OracleError::Transport(format!("{}: {e}", path.as_ref().display())))?;
        let analyses: HashMap<u32, ChapterAnalysis> =
            serde_json::from_str(&raw).map_err(|e| OracleError::Schema {
                reason: format!("scripted analyses file: {e}"),
                payload: raw,
            })?;
        Ok(Self { analyses })
    }

    pub fn insert(&mut self, chapter: u32, analysis: ChapterAnalysis) {
        self.analyses.insert(chapter, analysis);
    }

    pub fn with_analysis(mut self, chapter: u32, analysis: ChapterAnalysis) -> Self {
        self.insert(chapter, analysis);
        self
    }
}

#[async_trait]
impl ChapterOracle for ScriptedOracle {
    async fn analyze(&self, request: &OracleRequest) -> OracleResult<ChapterAnalysis> {
        self.analyses
            .get(&request.chapter)
            .cloned()
            .ok_or_else(|| {
                OracleError::Transport(format!(
                    "no scripted analysis for chapter {}",
                    request.chapter
                ))
            })
    }
}
