//! Identity resolution: raw mentions to stable character keys

use super::types::CharacterRef;
use crate::feed::Mention;
use crate::storage::{MarketStore, StorageError};
use thiserror::Error;

/// Errors from identity resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The mention carries no stable external reference. Name text alone
    /// must not mint an identity: names collide across arcs (aliases), so
    /// such a mention is untrackable and is dropped from the chapter.
    #[error("Mention '{0}' has no stable external reference")]
    NoStableRef(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A mention's market standing at the chapter being processed
#[derive(Debug, Clone, PartialEq)]
pub enum Standing {
    /// Already tracked; `current_value` is the cumulative value visible
    /// before the chapter (initial value if no chapter has touched the
    /// character yet)
    Existing { current_value: f64 },
    /// First appearance; the oracle supplies the initial value
    New,
}

/// A mention resolved to its identity key
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMention {
    pub reference: CharacterRef,
    /// Display text from the feed, retained for presentation only
    pub display_name: String,
    pub standing: Standing,
}

impl ResolvedMention {
    pub fn is_new(&self) -> bool {
        matches!(self.standing, Standing::New)
    }
}

/// Resolve one raw mention against the store, as of `chapter`
///
/// Identity is the external reference alone; display-name variants of the
/// same reference resolve to the same character. The character row itself is
/// only created at commit time (its initial value comes from the oracle), so
/// an unknown reference resolves to [`Standing::New`] without writing
/// anything.
pub fn resolve(
    store: &dyn MarketStore,
    mention: &Mention,
    chapter: u32,
) -> Result<ResolvedMention, ResolveError> {
    if mention.reference.trim().is_empty() {
        return Err(ResolveError::NoStableRef(mention.name.clone()));
    }

    let reference = CharacterRef::new(mention.reference.clone());
    let standing = match store.character(&reference)? {
        Some(character) => {
            let current_value = store
                .latest_value_before(&reference, chapter)?
                .unwrap_or(character.initial_value);
            Standing::Existing { current_value }
        }
        None => Standing::New,
    };

    Ok(ResolvedMention {
        reference,
        display_name: mention.name.clone(),
        standing,
    })
}

/// Resolve a chapter's mention list, partitioning out the untrackable ones
///
/// Storage failures propagate; `NoStableRef` is fatal only to the mention it
/// names. Duplicate references collapse to the first occurrence so one
/// character cannot enter a chapter twice under different display texts.
pub fn resolve_mentions(
    store: &dyn MarketStore,
    mentions: &[Mention],
    chapter: u32,
) -> Result<(Vec<ResolvedMention>, Vec<String>), StorageError> {
    let mut resolved: Vec<ResolvedMention> = Vec::with_capacity(mentions.len());
    let mut dropped = Vec::new();

    for mention in mentions {
        match resolve(store, mention, chapter) {
            Ok(r) => {
                if !resolved.iter().any(|seen| seen.reference == r.reference) {
                    resolved.push(r);
                }
            }
            Err(ResolveError::NoStableRef(name)) => dropped.push(name),
            Err(ResolveError::Storage(e)) => return Err(e),
        }
    }

    Ok((resolved, dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Character, CharacterRef};
    use crate::storage::{ChapterCommit, MarketStore, OpenStore, SqliteStore};
    use crate::market::StockHistoryEntry;
    use chrono::Utc;

    fn seeded_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .commit_chapter(&ChapterCommit {
                chapter: crate::market::Chapter::fetched(1, "Romance Dawn", None, "text"),
                processed_at: Utc::now(),
                new_characters: vec![Character {
                    reference: CharacterRef::new("/wiki/Monkey_D._Luffy"),
                    name: "Monkey D. Luffy".to_string(),
                    first_appearance: 1,
                    initial_value: 150.0,
                    created_at: Utc::now(),
                }],
                events: vec![],
                entries: vec![StockHistoryEntry {
                    character: CharacterRef::new("/wiki/Monkey_D._Luffy"),
                    chapter: 1,
                    cumulative: 150.0,
                    chapter_change: 0.0,
                    rank: Some(1),
                    justification: "debut".to_string(),
                }],
                expected_starts: vec![],
            })
            .unwrap();
        store
    }

    #[test]
    fn same_reference_different_display_text_is_one_identity() {
        let store = seeded_store();
        let a = resolve(&store, &Mention::new("Luffy", "/wiki/Monkey_D._Luffy"), 2).unwrap();
        let b = resolve(
            &store,
            &Mention::new("Straw Hat", "/wiki/Monkey_D._Luffy"),
            2,
        )
        .unwrap();
        assert_eq!(a.reference, b.reference);
        assert_eq!(
            a.standing,
            Standing::Existing {
                current_value: 150.0
            }
        );
    }

    #[test]
    fn unknown_reference_is_new() {
        let store = seeded_store();
        let r = resolve(&store, &Mention::new("Zoro", "/wiki/Roronoa_Zoro"), 2).unwrap();
        assert!(r.is_new());
    }

    #[test]
    fn missing_reference_is_rejected() {
        let store = seeded_store();
        let err = resolve(&store, &Mention::new("Some Villager", "  "), 2).unwrap_err();
        assert!(matches!(err, ResolveError::NoStableRef(_)));
    }

    #[test]
    fn resolve_mentions_partitions_and_dedupes() {
        let store = seeded_store();
        let mentions = vec![
            Mention::new("Luffy", "/wiki/Monkey_D._Luffy"),
            Mention::new("Straw Hat", "/wiki/Monkey_D._Luffy"),
            Mention::new("Nameless", ""),
            Mention::new("Zoro", "/wiki/Roronoa_Zoro"),
        ];
        let (resolved, dropped) = resolve_mentions(&store, &mentions, 2).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].display_name, "Luffy");
        assert_eq!(dropped, vec!["Nameless".to_string()]);
    }

    #[test]
    fn standing_respects_the_chapter_boundary() {
        let store = seeded_store();
        // Before chapter 1 nothing is visible; the initial value stands in.
        let r = resolve(&store, &Mention::new("Luffy", "/wiki/Monkey_D._Luffy"), 1).unwrap();
        assert_eq!(
            r.standing,
            Standing::Existing {
                current_value: 150.0
            }
        );
    }
}
