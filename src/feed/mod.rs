//! Source feed: where raw chapters come from
//!
//! Scraping mechanics live outside the engine; this module only defines the
//! collaborator contract and a JSON fixture-directory implementation for
//! operators and tests. Previously fetched text is persisted by the store,
//! so runs can also skip the feed entirely (`skip_fetch`).

mod json_dir;

pub use json_dir::JsonDirFeed;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the source feed
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Chapter {0} not found in the feed")]
    NotFound(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed chapter payload: {0}")]
    Malformed(String),
}

/// Result type for feed operations
pub type FeedResult<T> = Result<T, FeedError>;

/// A raw character mention as delivered by the feed
///
/// `reference` is the stable external link/path. It may be empty for
/// mentions the feed could not anchor; the identity resolver rejects those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub name: String,
    #[serde(default)]
    pub reference: String,
}

impl Mention {
    pub fn new(name: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reference: reference.into(),
        }
    }
}

/// One raw chapter as delivered by the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSource {
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub arc_name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub mentions: Vec<Mention>,
}

/// Trait for chapter sources
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Fetch one chapter by number
    async fn fetch(&self, chapter: u32) -> FeedResult<ChapterSource>;
}
