//! Event application: oracle verdicts to ordered, floor-clamped value changes

use super::resolver::{ResolvedMention, Standing};
use super::types::{Character, CharacterRef, CharacterStanding, MarketEvent, StockHistoryEntry};
use crate::oracle::ChapterAnalysis;
use chrono::Utc;
use thiserror::Error;

/// Errors from event application
///
/// These can only fire on analyses that bypassed schema validation, so the
/// orchestrator treats them as run-fatal logic errors rather than
/// chapter-level outcomes.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Verdict for '{0}' does not match any resolved mention")]
    UnknownCharacter(String),

    #[error("First appearance of '{0}' has no initial value")]
    MissingInitialValue(String),
}

/// The proposed write set for one chapter
///
/// The applier never writes; the orchestrator carries this to the store as
/// one atomic commit.
#[derive(Debug, Clone, Default)]
pub struct ChapterMutation {
    pub new_characters: Vec<Character>,
    pub events: Vec<MarketEvent>,
    pub entries: Vec<StockHistoryEntry>,
    /// Starting values the accumulation was computed from, re-checked at
    /// commit time against stored history
    pub expected_starts: Vec<(CharacterRef, f64)>,
}

impl ChapterMutation {
    pub fn is_empty(&self) -> bool {
        self.new_characters.is_empty() && self.events.is_empty() && self.entries.is_empty()
    }
}

/// Turn a validated chapter analysis into events and history rows
///
/// Per character, in oracle action order: start from the last known
/// cumulative value (or the oracle-assigned initial value on first
/// appearance), add each delta, and clamp the running value to a floor of
/// zero after every individual action. A character who would dip negative
/// mid-chapter and then gain therefore recovers from zero, not from the
/// negative trough. There is no upper clamp anywhere: unbounded growth is
/// intentional.
///
/// `standings` is the pre-chapter market (latest values before this
/// chapter) and is only used to place ranks; characters untouched this
/// chapter keep their prior value for ranking purposes.
pub fn apply(
    chapter: u32,
    mentions: &[ResolvedMention],
    analysis: &ChapterAnalysis,
    standings: &[CharacterStanding],
) -> Result<ChapterMutation, ApplyError> {
    let mut mutation = ChapterMutation::default();
    // Post-chapter values for rank placement, seeded with the pre-chapter
    // market.
    let mut market: Vec<(CharacterRef, f64)> = standings
        .iter()
        .map(|s| (s.reference.clone(), s.value))
        .collect();

    for verdict in &analysis.verdicts {
        let mention = mentions
            .iter()
            .find(|m| m.reference.as_str() == verdict.reference)
            .ok_or_else(|| ApplyError::UnknownCharacter(verdict.reference.clone()))?;

        let start = match &mention.standing {
            Standing::Existing { current_value } => {
                mutation
                    .expected_starts
                    .push((mention.reference.clone(), *current_value));
                *current_value
            }
            Standing::New => {
                let initial = verdict
                    .initial_value
                    .ok_or_else(|| ApplyError::MissingInitialValue(verdict.reference.clone()))?;
                mutation.new_characters.push(Character {
                    reference: mention.reference.clone(),
                    name: mention.display_name.clone(),
                    first_appearance: chapter,
                    initial_value: initial,
                    created_at: Utc::now(),
                });
                initial
            }
        };

        let mut running = start;
        for (index, action) in verdict.actions.iter().enumerate() {
            let pre_clamp = running + action.delta;
            running = pre_clamp.max(0.0);
            mutation.events.push(MarketEvent {
                character: mention.reference.clone(),
                chapter,
                action_index: index as u32,
                delta: action.delta,
                pre_clamp_value: pre_clamp,
                confidence: action.confidence,
                justification: action.justification.clone(),
            });
        }

        let justification = analysis
            .summary
            .clone()
            .unwrap_or_else(|| synthesize_summary(verdict.actions.len(), running - start));

        mutation.entries.push(StockHistoryEntry {
            character: mention.reference.clone(),
            chapter,
            cumulative: running,
            chapter_change: running - start,
            rank: None, // placed below once the whole chapter is folded
            justification,
        });

        match market.iter_mut().find(|(r, _)| *r == mention.reference) {
            Some(slot) => slot.1 = running,
            None => market.push((mention.reference.clone(), running)),
        }
    }

    // Competition ranking over the post-chapter market: rank is one plus
    // the number of strictly greater values.
    for entry in &mut mutation.entries {
        let value = entry.cumulative;
        let higher = market.iter().filter(|(_, v)| *v > value).count();
        entry.rank = Some(higher as u32 + 1);
    }

    Ok(mutation)
}

fn synthesize_summary(actions: usize, net_change: f64) -> String {
    if actions == 0 {
        "No scored actions this chapter".to_string()
    } else {
        format!("{actions} scored action(s), net change {net_change:+.1}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{ActionVerdict, CharacterVerdict};

    fn existing(reference: &str, value: f64) -> ResolvedMention {
        ResolvedMention {
            reference: CharacterRef::new(reference),
            display_name: reference.trim_start_matches("/wiki/").to_string(),
            standing: Standing::Existing {
                current_value: value,
            },
        }
    }

    fn newcomer(reference: &str, name: &str) -> ResolvedMention {
        ResolvedMention {
            reference: CharacterRef::new(reference),
            display_name: name.to_string(),
            standing: Standing::New,
        }
    }

    fn action(delta: f64) -> ActionVerdict {
        ActionVerdict {
            delta,
            confidence: 0.9,
            justification: format!("delta {delta}"),
        }
    }

    fn analysis_of(verdicts: Vec<CharacterVerdict>) -> ChapterAnalysis {
        ChapterAnalysis {
            verdicts,
            summary: None,
        }
    }

    #[test]
    fn new_character_debut_establishes_initial_value() {
        let mentions = vec![newcomer("/wiki/Monkey_D._Luffy", "Luffy")];
        let analysis = analysis_of(vec![CharacterVerdict {
            reference: "/wiki/Monkey_D._Luffy".to_string(),
            initial_value: Some(150.0),
            actions: vec![],
        }]);

        let mutation = apply(1, &mentions, &analysis, &[]).unwrap();

        assert_eq!(mutation.new_characters.len(), 1);
        assert_eq!(mutation.new_characters[0].initial_value, 150.0);
        assert_eq!(mutation.new_characters[0].first_appearance, 1);
        assert_eq!(mutation.entries.len(), 1);
        assert_eq!(mutation.entries[0].cumulative, 150.0);
        assert_eq!(mutation.entries[0].chapter_change, 0.0);
        assert!(mutation.events.is_empty());
        assert!(mutation.expected_starts.is_empty());
    }

    #[test]
    fn clamp_applies_after_each_action() {
        // Chapter 2: Luffy at 150, actions +20 then -200.
        let mentions = vec![existing("/wiki/Luffy", 150.0)];
        let analysis = analysis_of(vec![CharacterVerdict {
            reference: "/wiki/Luffy".to_string(),
            initial_value: None,
            actions: vec![action(20.0), action(-200.0)],
        }]);

        let mutation = apply(2, &mentions, &analysis, &[]).unwrap();

        assert_eq!(mutation.events.len(), 2);
        assert_eq!(mutation.events[0].delta, 20.0);
        assert_eq!(mutation.events[0].pre_clamp_value, 170.0);
        assert_eq!(mutation.events[1].delta, -200.0);
        assert_eq!(mutation.events[1].pre_clamp_value, -30.0);

        assert_eq!(mutation.entries[0].cumulative, 0.0);
        assert_eq!(mutation.entries[0].chapter_change, -150.0);
        assert_eq!(
            mutation.expected_starts,
            vec![(CharacterRef::new("/wiki/Luffy"), 150.0)]
        );
    }

    #[test]
    fn dip_then_gain_recovers_from_the_floor() {
        // Clamped after each action: 150 -200 -> 0, then +50 -> 50, not
        // max(0, 150 - 200 + 50) = 0.
        let mentions = vec![existing("/wiki/Luffy", 150.0)];
        let analysis = analysis_of(vec![CharacterVerdict {
            reference: "/wiki/Luffy".to_string(),
            initial_value: None,
            actions: vec![action(-200.0), action(50.0)],
        }]);

        let mutation = apply(3, &mentions, &analysis, &[]).unwrap();
        assert_eq!(mutation.entries[0].cumulative, 50.0);
        assert_eq!(mutation.events[0].pre_clamp_value, -50.0);
        assert_eq!(mutation.events[1].pre_clamp_value, 50.0);
    }

    #[test]
    fn upside_is_unbounded() {
        let mentions = vec![existing("/wiki/Luffy", 150.0)];
        let analysis = analysis_of(vec![CharacterVerdict {
            reference: "/wiki/Luffy".to_string(),
            initial_value: None,
            actions: vec![action(100_000.0)],
        }]);

        let mutation = apply(4, &mentions, &analysis, &[]).unwrap();
        assert_eq!(mutation.entries[0].cumulative, 100_150.0);
        assert_eq!(mutation.entries[0].chapter_change, 100_000.0);
    }

    #[test]
    fn ranks_place_against_untouched_characters() {
        let standings = vec![
            CharacterStanding {
                reference: CharacterRef::new("/wiki/Shanks"),
                name: "Shanks".to_string(),
                first_appearance: 1,
                value: 300.0,
                as_of_chapter: 1,
            },
            CharacterStanding {
                reference: CharacterRef::new("/wiki/Luffy"),
                name: "Luffy".to_string(),
                first_appearance: 1,
                value: 100.0,
                as_of_chapter: 1,
            },
        ];
        let mentions = vec![existing("/wiki/Luffy", 100.0)];
        let analysis = analysis_of(vec![CharacterVerdict {
            reference: "/wiki/Luffy".to_string(),
            initial_value: None,
            actions: vec![action(50.0)],
        }]);

        let mutation = apply(2, &mentions, &analysis, &standings).unwrap();
        // Luffy at 150 is still behind Shanks at 300.
        assert_eq!(mutation.entries[0].rank, Some(2));
    }

    #[test]
    fn synthesized_summary_when_oracle_gives_none() {
        let mentions = vec![existing("/wiki/Luffy", 100.0)];
        let analysis = analysis_of(vec![CharacterVerdict {
            reference: "/wiki/Luffy".to_string(),
            initial_value: None,
            actions: vec![action(25.0)],
        }]);

        let mutation = apply(2, &mentions, &analysis, &[]).unwrap();
        assert!(mutation.entries[0].justification.contains("net change +25.0"));
    }

    #[test]
    fn oracle_summary_wins_when_present() {
        let mentions = vec![existing("/wiki/Luffy", 100.0)];
        let analysis = ChapterAnalysis {
            verdicts: vec![CharacterVerdict {
                reference: "/wiki/Luffy".to_string(),
                initial_value: None,
                actions: vec![action(25.0)],
            }],
            summary: Some("Luffy outwits the crew".to_string()),
        };

        let mutation = apply(2, &mentions, &analysis, &[]).unwrap();
        assert_eq!(mutation.entries[0].justification, "Luffy outwits the crew");
    }

    #[test]
    fn verdict_for_unresolved_character_is_an_error() {
        let analysis = analysis_of(vec![CharacterVerdict {
            reference: "/wiki/Ghost".to_string(),
            initial_value: None,
            actions: vec![action(1.0)],
        }]);
        let err = apply(2, &[], &analysis, &[]).unwrap_err();
        assert!(matches!(err, ApplyError::UnknownCharacter(_)));
    }
}
