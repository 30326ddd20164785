//! Market domain: characters, chapters, valuation events, and the
//! components that build oracle context and apply oracle verdicts

pub mod applier;
mod context;
pub mod resolver;
mod types;

pub use applier::{apply, ApplyError, ChapterMutation};
pub use context::ContextBuilder;
pub use resolver::{resolve, resolve_mentions, ResolveError, ResolvedMention, Standing};
pub use types::{
    Character, CharacterRef, CharacterStanding, Chapter, HistorySample, MarketContextSnapshot,
    MarketEvent, MarketStats, MentionHistory, StockHistoryEntry,
};
