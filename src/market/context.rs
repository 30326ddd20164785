//! Market context construction for oracle analysis
//!
//! The single most important invariant of the engine lives here: the
//! snapshot handed to the oracle for chapter N is computed strictly from
//! chapters committed before N. Every store query this module issues is
//! boundary-bounded (`*_before(chapter)`), so nothing produced by chapter N
//! or later can leak into its own analysis context.

use super::resolver::ResolvedMention;
use super::types::{HistorySample, MarketContextSnapshot, MarketStats, MentionHistory};
use crate::storage::{MarketStore, StorageResult};

/// Builds the bounded market snapshot visible to the oracle
pub struct ContextBuilder<'a> {
    store: &'a dyn MarketStore,
    top_n: usize,
    history_k: usize,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(store: &'a dyn MarketStore, top_n: usize, history_k: usize) -> Self {
        Self {
            store,
            top_n,
            history_k,
        }
    }

    /// Assemble the snapshot for `chapter`
    ///
    /// `mentions` is the chapter's resolved mention list; each mention gets
    /// its last-K activity (empty for first appearances). Characters first
    /// appearing this chapter have no committed rows before the boundary
    /// and therefore contribute nothing to top-N or the aggregate stats.
    pub fn build(
        &self,
        chapter: u32,
        mentions: &[ResolvedMention],
    ) -> StorageResult<MarketContextSnapshot> {
        let mut standings = self.store.latest_standings_before(chapter)?;

        // Deterministic market ordering: value desc, then earliest debut,
        // then reference.
        standings.sort_by(|a, b| {
            b.value
                .partial_cmp(&a.value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.first_appearance.cmp(&b.first_appearance))
                .then(a.reference.cmp(&b.reference))
        });

        let stats = Self::stats_over(standings.iter().map(|s| s.value));
        let top = standings.into_iter().take(self.top_n).collect();

        let mut histories = Vec::with_capacity(mentions.len());
        for mention in mentions {
            let samples = if mention.is_new() {
                Vec::new()
            } else {
                let mut recent =
                    self.store
                        .recent_entries_before(&mention.reference, chapter, self.history_k)?;
                // Store returns most recent first; the oracle reads oldest
                // first.
                recent.reverse();
                recent
                    .into_iter()
                    .map(|entry| HistorySample {
                        chapter: entry.chapter,
                        chapter_change: entry.chapter_change,
                        justification: entry.justification,
                    })
                    .collect()
            };
            histories.push(MentionHistory {
                reference: mention.reference.clone(),
                name: mention.display_name.clone(),
                samples,
            });
        }

        Ok(MarketContextSnapshot {
            chapter,
            top,
            stats,
            histories,
        })
    }

    fn stats_over(values: impl Iterator<Item = f64>) -> MarketStats {
        let mut values: Vec<f64> = values.collect();
        if values.is_empty() {
            return MarketStats::default();
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let tracked = values.len();
        let mean = values.iter().sum::<f64>() / tracked as f64;
        let median = if tracked % 2 == 1 {
            values[tracked / 2]
        } else {
            (values[tracked / 2 - 1] + values[tracked / 2]) / 2.0
        };

        MarketStats {
            tracked_characters: tracked,
            mean,
            median,
        }
    }
}
