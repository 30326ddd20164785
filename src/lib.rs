//! Storymarket: Narrative Character Stock Engine
//!
//! Maintains a time-ordered "stock value" for every character across a
//! serialized story. Each chapter's value changes come from an external
//! narrative-analysis oracle; this crate is the engine that turns a raw
//! chapter into durable, consistent stock-history records.
//!
//! # Core Concepts
//!
//! - **Characters**: identified by a stable external reference, created on
//!   first mention, never deleted
//! - **Market events**: per-action signed deltas, floor-clamped at zero,
//!   append-only
//! - **Stock history**: one cumulative row per (character, chapter),
//!   replayable from the event log
//! - **Information boundary**: chapter N's analysis context reflects only
//!   chapters committed before N
//!
//! # Example
//!
//! ```no_run
//! use storymarket::config::EngineConfig;
//! use storymarket::feed::JsonDirFeed;
//! use storymarket::oracle::ScriptedOracle;
//! use storymarket::pipeline::{ChapterOrchestrator, ChapterSelection};
//! use storymarket::storage::{OpenStore, SqliteStore};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::open("market.db")?;
//! let feed = JsonDirFeed::new("chapters/");
//! let oracle = ScriptedOracle::from_file("analyses.json")?;
//!
//! let orchestrator =
//!     ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::default());
//! let report = orchestrator
//!     .run(&ChapterSelection::Range { start: 1, end: 10 }, None)
//!     .await?;
//! assert!(report.fully_committed());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod feed;
pub mod market;
pub mod oracle;
pub mod pipeline;
pub mod storage;

pub use config::EngineConfig;
pub use market::{
    Character, CharacterRef, CharacterStanding, Chapter, MarketContextSnapshot, MarketEvent,
    MarketStats, StockHistoryEntry,
};
pub use oracle::{ChapterAnalysis, ChapterOracle, HttpOracle, OracleError, ScriptedOracle};
pub use pipeline::{ChapterOrchestrator, ChapterSelection, OutcomeStatus, RunError, RunReport};
pub use storage::{MarketStore, OpenStore, SqliteStore, StorageError, StorageResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
