use super::*;
use crate::feed::{ChapterSource, FeedResult, Mention};
use crate::market::{Character, CharacterRef, StockHistoryEntry};
use crate::oracle::{
    ActionVerdict, ChapterAnalysis, CharacterVerdict, OracleResult, ScriptedOracle,
};
use crate::storage::{OpenStore, SqliteStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

struct MapFeed {
    chapters: HashMap<u32, ChapterSource>,
}

impl MapFeed {
    fn new(chapters: Vec<ChapterSource>) -> Self {
        Self {
            chapters: chapters.into_iter().map(|c| (c.number, c)).collect(),
        }
    }
}

#[async_trait]
impl SourceFeed for MapFeed {
    async fn fetch(&self, chapter: u32) -> FeedResult<ChapterSource> {
        self.chapters
            .get(&chapter)
            .cloned()
            .ok_or(FeedError::NotFound(chapter))
    }
}

/// Oracle that records every request it serves
struct CapturingOracle {
    inner: ScriptedOracle,
    requests: Mutex<Vec<OracleRequest>>,
}

#[async_trait]
impl ChapterOracle for CapturingOracle {
    async fn analyze(&self, request: &OracleRequest) -> OracleResult<ChapterAnalysis> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.analyze(request).await
    }
}

const LUFFY: &str = "/wiki/Monkey_D._Luffy";

fn chapter_source(number: u32, mentions: Vec<Mention>) -> ChapterSource {
    ChapterSource {
        number,
        title: format!("Chapter {number}"),
        arc_name: Some("East Blue".to_string()),
        text: format!("Narrative of chapter {number}."),
        mentions,
    }
}

fn action(delta: f64, why: &str) -> ActionVerdict {
    ActionVerdict {
        delta,
        confidence: 0.9,
        justification: why.to_string(),
    }
}

fn luffy_debut_analysis() -> ChapterAnalysis {
    ChapterAnalysis {
        verdicts: vec![CharacterVerdict {
            reference: LUFFY.to_string(),
            initial_value: Some(150.0),
            actions: vec![],
        }],
        summary: Some("Luffy sets out to sea".to_string()),
    }
}

fn luffy_swing_analysis() -> ChapterAnalysis {
    ChapterAnalysis {
        verdicts: vec![CharacterVerdict {
            reference: LUFFY.to_string(),
            initial_value: None,
            actions: vec![action(20.0, "lands a hit"), action(-200.0, "captured")],
        }],
        summary: None,
    }
}

fn two_chapter_fixture() -> (SqliteStore, MapFeed, ScriptedOracle) {
    let store = SqliteStore::open_in_memory().unwrap();
    let feed = MapFeed::new(vec![
        chapter_source(1, vec![Mention::new("Luffy", LUFFY)]),
        chapter_source(2, vec![Mention::new("Monkey D. Luffy", LUFFY)]),
    ]);
    let oracle = ScriptedOracle::new()
        .with_analysis(1, luffy_debut_analysis())
        .with_analysis(2, luffy_swing_analysis());
    (store, feed, oracle)
}

#[tokio::test]
async fn commits_chapters_in_sequence() {
    let (store, feed, oracle) = two_chapter_fixture();
    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());

    let report = orchestrator
        .run(&ChapterSelection::Range { start: 1, end: 2 }, None)
        .await
        .unwrap();

    assert!(report.fully_committed());
    assert_eq!(report.committed(), 2);

    let luffy = CharacterRef::new(LUFFY);
    let character = store.character(&luffy).unwrap().unwrap();
    assert_eq!(character.initial_value, 150.0);
    assert_eq!(character.first_appearance, 1);
    assert_eq!(character.name, "Luffy");

    let history = store.history(&luffy).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].cumulative, 150.0);
    assert_eq!(history[1].cumulative, 0.0);
    assert_eq!(history[1].chapter_change, -150.0);

    let events = store.events_for_character(&luffy).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].delta, 20.0);
    assert_eq!(events[0].pre_clamp_value, 170.0);
    assert_eq!(events[1].delta, -200.0);
    assert_eq!(events[1].pre_clamp_value, -30.0);
}

#[tokio::test]
async fn stored_events_replay_to_stored_cumulatives() {
    let (store, feed, oracle) = two_chapter_fixture();
    ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate())
        .run(&ChapterSelection::Range { start: 1, end: 2 }, None)
        .await
        .unwrap();

    let luffy = CharacterRef::new(LUFFY);
    let character: Character = store.character(&luffy).unwrap().unwrap();
    let events = store.events_for_character(&luffy).unwrap();
    let history: Vec<StockHistoryEntry> = store.history(&luffy).unwrap();

    // Replay the append-only event log in (chapter, action_index) order
    // from the initial value; every stored cumulative must be reproduced.
    let mut running = character.initial_value;
    for entry in &history {
        for event in events.iter().filter(|e| e.chapter == entry.chapter) {
            running = (running + event.delta).max(0.0);
        }
        assert_eq!(
            running, entry.cumulative,
            "replay diverged at chapter {}",
            entry.chapter
        );
    }
}

#[tokio::test]
async fn rerun_over_committed_range_is_a_no_op() {
    let (store, feed, oracle) = two_chapter_fixture();
    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());
    let selection = ChapterSelection::Range { start: 1, end: 2 };

    orchestrator.run(&selection, None).await.unwrap();
    let stats_before = store.stats().unwrap();

    let report = orchestrator.run(&selection, None).await.unwrap();
    assert!(report.fully_committed());
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.status == OutcomeStatus::AlreadyProcessed));
    assert_eq!(store.stats().unwrap(), stats_before);
}

#[tokio::test]
async fn malformed_response_aborts_the_chapter_without_writes() {
    let store = SqliteStore::open_in_memory().unwrap();
    let feed = MapFeed::new(vec![chapter_source(1, vec![Mention::new("Luffy", LUFFY)])]);
    // Verdict for a character that is not in the mention list.
    let oracle = ScriptedOracle::new().with_analysis(
        1,
        ChapterAnalysis {
            verdicts: vec![
                CharacterVerdict {
                    reference: LUFFY.to_string(),
                    initial_value: Some(150.0),
                    actions: vec![],
                },
                CharacterVerdict {
                    reference: "/wiki/Ghost".to_string(),
                    initial_value: None,
                    actions: vec![action(10.0, "haunting")],
                },
            ],
            summary: None,
        },
    );

    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());
    let report = orchestrator
        .run(&ChapterSelection::List(vec![1]), None)
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].status, OutcomeStatus::SkippedPermanent);
    assert!(!store.is_processed(1).unwrap());
    assert!(store.events_for_chapter(1).unwrap().is_empty());
    assert!(store
        .character(&CharacterRef::new(LUFFY))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn transient_failure_skips_and_continues() {
    let store = SqliteStore::open_in_memory().unwrap();
    let feed = MapFeed::new(vec![
        chapter_source(1, vec![]),
        chapter_source(2, vec![Mention::new("Luffy", LUFFY)]),
    ]);
    // No script for chapter 1: every call is a transport failure.
    let oracle = ScriptedOracle::new().with_analysis(2, luffy_debut_analysis());

    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());
    let report = orchestrator
        .run(&ChapterSelection::Range { start: 1, end: 2 }, None)
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].status, OutcomeStatus::SkippedRetryable);
    assert_eq!(report.outcomes[1].status, OutcomeStatus::Committed);
    assert!(!report.fully_committed());
    assert!(!store.is_processed(1).unwrap());
    assert!(store.is_processed(2).unwrap());
}

#[tokio::test]
async fn missing_feed_chapter_is_retryable() {
    let store = SqliteStore::open_in_memory().unwrap();
    let feed = MapFeed::new(vec![]);
    let oracle = ScriptedOracle::new();

    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());
    let report = orchestrator
        .run(&ChapterSelection::List(vec![7]), None)
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].status, OutcomeStatus::SkippedRetryable);
}

#[tokio::test]
async fn refuses_chapter_above_a_known_hole() {
    let (store, _, _) = two_chapter_fixture();
    // Chapter 2 is known to the store but unprocessed.
    store
        .record_chapter(&crate::market::Chapter::fetched(2, "Chapter 2", None, "t"))
        .unwrap();

    let feed = MapFeed::new(vec![chapter_source(4, vec![Mention::new("Luffy", LUFFY)])]);
    let oracle = ScriptedOracle::new().with_analysis(4, luffy_debut_analysis());
    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());

    let report = orchestrator
        .run(&ChapterSelection::List(vec![4]), None)
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].status, OutcomeStatus::SkippedOutOfOrder);
    assert!(!store.is_processed(4).unwrap());
}

#[tokio::test]
async fn refuses_chapter_below_the_committed_frontier() {
    let store = SqliteStore::open_in_memory().unwrap();
    let feed = MapFeed::new(vec![
        chapter_source(1, vec![Mention::new("Luffy", LUFFY)]),
        chapter_source(2, vec![Mention::new("Luffy", LUFFY)]),
    ]);
    // Luffy debuts in chapter 2; chapter 1 then sees him as existing.
    let oracle = ScriptedOracle::new()
        .with_analysis(2, luffy_debut_analysis())
        .with_analysis(
            1,
            ChapterAnalysis {
                verdicts: vec![CharacterVerdict {
                    reference: LUFFY.to_string(),
                    initial_value: None,
                    actions: vec![action(20.0, "early exploit")],
                }],
                summary: None,
            },
        );

    // Commit only chapter 2, leaving a hole at 1.
    let best_effort = ChapterOrchestrator::new(
        &store,
        &feed,
        &oracle,
        EngineConfig::immediate().with_allow_gaps(true),
    );
    best_effort
        .run(&ChapterSelection::List(vec![2]), None)
        .await
        .unwrap();
    assert!(store.is_processed(2).unwrap());

    // A strict run must now refuse chapter 1.
    let strict = ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());
    let report = strict
        .run(&ChapterSelection::List(vec![1]), None)
        .await
        .unwrap();
    assert_eq!(report.outcomes[0].status, OutcomeStatus::SkippedOutOfOrder);
    assert!(!store.is_processed(1).unwrap());

    // Best-effort mode processes it with a degraded context.
    let report = best_effort
        .run(&ChapterSelection::List(vec![1]), None)
        .await
        .unwrap();
    assert_eq!(report.outcomes[0].status, OutcomeStatus::Committed);
}

#[tokio::test]
async fn chapter_with_no_trackable_mentions_still_commits() {
    let store = SqliteStore::open_in_memory().unwrap();
    let feed = MapFeed::new(vec![chapter_source(
        1,
        vec![Mention::new("Some Villager", "")],
    )]);
    let oracle = ScriptedOracle::new().with_analysis(1, ChapterAnalysis::default());

    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());
    let report = orchestrator
        .run(&ChapterSelection::List(vec![1]), None)
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].status, OutcomeStatus::Committed);
    assert!(store.is_processed(1).unwrap());
    let stats = store.stats().unwrap();
    assert_eq!(stats.characters, 0);
    assert_eq!(stats.events, 0);
}

#[tokio::test]
async fn limit_caps_attempted_chapters() {
    let (store, feed, oracle) = two_chapter_fixture();
    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());

    let report = orchestrator
        .run(&ChapterSelection::Range { start: 1, end: 2 }, Some(1))
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert!(store.is_processed(1).unwrap());
    assert!(!store.is_processed(2).unwrap());
}

#[tokio::test]
async fn skip_fetch_reuses_stored_text() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .record_chapter(&crate::market::Chapter::fetched(
            1,
            "Chapter 1",
            None,
            "the archived narrative",
        ))
        .unwrap();

    let feed = MapFeed::new(vec![chapter_source(1, vec![Mention::new("Luffy", LUFFY)])]);
    let oracle = CapturingOracle {
        inner: ScriptedOracle::new().with_analysis(1, luffy_debut_analysis()),
        requests: Mutex::new(Vec::new()),
    };

    let orchestrator = ChapterOrchestrator::new(
        &store,
        &feed,
        &oracle,
        EngineConfig::immediate().with_skip_fetch(true),
    );
    let report = orchestrator
        .run(&ChapterSelection::List(vec![1]), None)
        .await
        .unwrap();

    assert!(report.fully_committed());
    let requests = oracle.requests.lock().unwrap();
    assert_eq!(requests[0].text, "the archived narrative");
}

#[tokio::test]
async fn oracle_sees_only_prior_market_state() {
    let (store, feed, oracle) = two_chapter_fixture();
    let capturing = CapturingOracle {
        inner: oracle,
        requests: Mutex::new(Vec::new()),
    };
    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &capturing, EngineConfig::immediate());
    orchestrator
        .run(&ChapterSelection::Range { start: 1, end: 2 }, None)
        .await
        .unwrap();

    let requests = capturing.requests.lock().unwrap();
    // Chapter 1: empty market.
    assert!(requests[0].context.is_empty());
    // Chapter 2: exactly the chapter-1 state, nothing from chapter 2.
    assert_eq!(requests[1].context.stats.tracked_characters, 1);
    assert_eq!(requests[1].context.top[0].value, 150.0);
    assert_eq!(requests[1].context.top[0].as_of_chapter, 1);
}

#[tokio::test]
async fn all_unprocessed_selection_picks_up_known_chapters() {
    let (store, feed, oracle) = two_chapter_fixture();
    store
        .record_chapter(&crate::market::Chapter::fetched(1, "Chapter 1", None, "t"))
        .unwrap();
    store
        .record_chapter(&crate::market::Chapter::fetched(2, "Chapter 2", None, "t"))
        .unwrap();

    let orchestrator =
        ChapterOrchestrator::new(&store, &feed, &oracle, EngineConfig::immediate());
    let report = orchestrator
        .run(&ChapterSelection::AllUnprocessed, None)
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.fully_committed());
}
