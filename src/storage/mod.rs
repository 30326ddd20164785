//! Storage backends for the market
//!
//! The engine talks to persistence through the `MarketStore` trait. The
//! primary implementation is `SqliteStore`; tests use its in-memory mode.

mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{
    ChapterCommit, MarketStore, OpenStore, StorageError, StorageResult, StoreStats,
};
