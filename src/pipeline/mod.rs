//! Chapter orchestration: the processing state machine
//!
//! Drives the per-chapter loop: select chapters, check resumability, fetch,
//! build context, analyze, apply, and commit atomically. Chapters advance
//! through `Pending → Fetching → ContextBuilt → Analyzing → Applying →
//! Committed`; any failure short of commit leaves the chapter pending for a
//! future run, with nothing written.
//!
//! Processing is strictly sequential: chapter N+1's context is only valid
//! once chapter N has committed, and within a chapter each action's starting
//! value is the previous action's clamped result, so there is no parallelism
//! to exploit anywhere in the loop.

use crate::config::EngineConfig;
use crate::feed::{FeedError, SourceFeed};
use crate::market::{
    apply, resolve_mentions, ApplyError, Chapter, ContextBuilder, ResolvedMention, Standing,
};
use crate::oracle::{
    analyze_with_retry, validate_analysis, ChapterOracle, MentionState, OracleError, OracleRequest,
};
use crate::storage::{ChapterCommit, MarketStore, StorageError};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Which chapters a run should attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterSelection {
    /// Inclusive range of chapter numbers; numbers the feed does not know
    /// are skipped as retryable
    Range { start: u32, end: u32 },
    /// Explicit chapter numbers
    List(Vec<u32>),
    /// Every chapter the store knows about that is not yet processed
    AllUnprocessed,
}

impl ChapterSelection {
    /// Candidate chapter numbers, ascending and deduplicated
    fn candidates(&self, store: &dyn MarketStore) -> Result<Vec<u32>, StorageError> {
        let mut numbers = match self {
            Self::Range { start, end } => (*start..=*end).collect::<Vec<u32>>(),
            Self::List(numbers) => numbers.clone(),
            Self::AllUnprocessed => store.unprocessed_in_range(0, u32::MAX)?,
        };
        numbers.sort_unstable();
        numbers.dedup();
        Ok(numbers)
    }
}

/// Per-attempt state of a chapter in the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterState {
    Pending,
    Fetching,
    ContextBuilt,
    Analyzing,
    Applying,
    Committed,
}

/// Terminal status of one attempted chapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// All rows persisted and the processed flag flipped
    Committed,
    /// Processed in an earlier run; re-running is a no-op
    AlreadyProcessed,
    /// Transient failure (feed or oracle transport); worth retrying in a
    /// future run
    SkippedRetryable,
    /// Malformed input or oracle response; retrying without investigation
    /// will not help
    SkippedPermanent,
    /// Refused to protect sequential consistency (an earlier chapter is
    /// known but uncommitted)
    SkippedOutOfOrder,
}

/// What happened to one chapter during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterOutcome {
    pub chapter: u32,
    pub status: OutcomeStatus,
    pub detail: Option<String>,
}

impl ChapterOutcome {
    fn new(chapter: u32, status: OutcomeStatus) -> Self {
        Self {
            chapter,
            status,
            detail: None,
        }
    }

    fn with_detail(chapter: u32, status: OutcomeStatus, detail: impl Into<String>) -> Self {
        Self {
            chapter,
            status,
            detail: Some(detail.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            OutcomeStatus::Committed | OutcomeStatus::AlreadyProcessed
        )
    }
}

/// Summary of a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub outcomes: Vec<ChapterOutcome>,
}

impl RunReport {
    pub fn committed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Committed)
            .count()
    }

    /// True when every selected chapter ended committed (or already was)
    pub fn fully_committed(&self) -> bool {
        self.outcomes.iter().all(|o| o.succeeded())
    }
}

/// Errors that abort a whole run
///
/// Chapter-local failures (feed, oracle) become [`ChapterOutcome`]s instead;
/// what reaches this type is corruption-class: storage inconsistencies and
/// applier errors that should be impossible after validation. Stopping is
/// the only safe response.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Event application failed: {0}")]
    Apply(#[from] ApplyError),
}

/// Why a single chapter attempt stopped short of commit
enum AttemptFailure {
    Retryable(String),
    Permanent(String),
}

/// The chapter orchestrator
///
/// Sole writer of chapter processed flags and market rows; every other
/// component only reads the store or proposes writes.
pub struct ChapterOrchestrator<'a> {
    store: &'a dyn MarketStore,
    feed: &'a dyn SourceFeed,
    oracle: &'a dyn ChapterOracle,
    config: EngineConfig,
}

impl<'a> ChapterOrchestrator<'a> {
    pub fn new(
        store: &'a dyn MarketStore,
        feed: &'a dyn SourceFeed,
        oracle: &'a dyn ChapterOracle,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            feed,
            oracle,
            config,
        }
    }

    /// Process the selected chapters in strictly ascending order
    ///
    /// `limit` caps how many chapters are attempted. Returns the per-chapter
    /// report; corruption-class failures abort the run with an error
    /// instead.
    pub async fn run(
        &self,
        selection: &ChapterSelection,
        limit: Option<usize>,
    ) -> Result<RunReport, RunError> {
        let mut candidates = selection.candidates(self.store)?;
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }

        // Ordering guard baselines, taken once: holes created *by this
        // run's own failures* do not retroactively refuse later chapters
        // (transient failures are explicitly non-fatal to the run), but
        // pre-existing holes below a candidate do.
        let frontier_at_start = self.store.last_committed_chapter()?;

        info!(
            chapters = candidates.len(),
            allow_gaps = self.config.allow_gaps,
            "Starting run"
        );

        let mut report = RunReport::default();
        let mut first = true;
        for chapter in candidates {
            if !first && !self.config.request_delay.is_zero() {
                tokio::time::sleep(self.config.request_delay).await;
            }
            first = false;

            let outcome = self
                .attempt_chapter(chapter, frontier_at_start, &report)
                .await?;
            match &outcome.status {
                OutcomeStatus::Committed => info!(chapter, "Chapter committed"),
                OutcomeStatus::AlreadyProcessed => {
                    debug!(chapter, "Chapter already processed, skipping")
                }
                OutcomeStatus::SkippedRetryable => {
                    warn!(chapter, detail = outcome.detail.as_deref(), "Chapter skipped, retryable")
                }
                OutcomeStatus::SkippedPermanent => {
                    error!(chapter, detail = outcome.detail.as_deref(), "Chapter skipped, permanent")
                }
                OutcomeStatus::SkippedOutOfOrder => {
                    warn!(chapter, detail = outcome.detail.as_deref(), "Chapter refused, out of order")
                }
            }
            report.outcomes.push(outcome);
        }

        info!(
            committed = report.committed(),
            attempted = report.outcomes.len(),
            "Run finished"
        );
        Ok(report)
    }

    async fn attempt_chapter(
        &self,
        chapter: u32,
        frontier_at_start: Option<u32>,
        report: &RunReport,
    ) -> Result<ChapterOutcome, RunError> {
        let mut state = ChapterState::Pending;
        debug!(chapter, state = ?state, "Attempting chapter");

        if self.store.is_processed(chapter)? {
            return Ok(ChapterOutcome::new(chapter, OutcomeStatus::AlreadyProcessed));
        }

        if let Some(reason) = self.ordering_violation(chapter, frontier_at_start, report)? {
            if self.config.allow_gaps {
                warn!(chapter, reason = %reason, "Processing out of order with degraded context");
            } else {
                return Ok(ChapterOutcome::with_detail(
                    chapter,
                    OutcomeStatus::SkippedOutOfOrder,
                    reason,
                ));
            }
        }

        state = ChapterState::Fetching;
        debug!(chapter, state = ?state, "Fetching chapter");
        // Mentions are not persisted with the chapter, so even a skip-fetch
        // run asks the feed for the mention list; only the narrative text is
        // reused from the store.
        let stored_text = if self.config.skip_fetch {
            self.store.chapter(chapter)?.map(|c| c.text)
        } else {
            None
        };
        let mut source = match self.feed.fetch(chapter).await {
            Ok(source) => source,
            Err(e) => {
                return Ok(match feed_failure(chapter, e) {
                    AttemptFailure::Retryable(detail) => ChapterOutcome::with_detail(
                        chapter,
                        OutcomeStatus::SkippedRetryable,
                        detail,
                    ),
                    AttemptFailure::Permanent(detail) => ChapterOutcome::with_detail(
                        chapter,
                        OutcomeStatus::SkippedPermanent,
                        detail,
                    ),
                });
            }
        };
        match stored_text {
            Some(text) => {
                debug!(chapter, "Reusing previously fetched chapter text");
                source.text = text;
            }
            None => {
                // Persist the raw text immediately so later runs can reuse
                // it even if this attempt fails downstream. This touches no
                // market state and never flips the processed flag.
                self.store.record_chapter(&Chapter::fetched(
                    chapter,
                    source.title.clone(),
                    source.arc_name.clone(),
                    source.text.clone(),
                ))?;
            }
        }

        let (resolved, dropped) = resolve_mentions(self.store, &source.mentions, chapter)?;
        for name in &dropped {
            warn!(chapter, mention = %name, "Dropping mention without a stable reference");
        }

        state = ChapterState::ContextBuilt;
        let context =
            ContextBuilder::new(self.store, self.config.top_n, self.config.history_k)
                .build(chapter, &resolved)?;
        debug!(
            chapter,
            state = ?state,
            tracked = context.stats.tracked_characters,
            "Market context built"
        );

        state = ChapterState::Analyzing;
        debug!(chapter, state = ?state, mentions = resolved.len(), "Analyzing chapter");
        let request = OracleRequest {
            chapter,
            title: source.title.clone(),
            text: source.text.clone(),
            characters: resolved.iter().map(mention_state).collect(),
            context,
        };
        let analysis = match analyze_with_retry(self.oracle, &request, &self.config.retry).await {
            Ok(analysis) => analysis,
            Err(OracleError::Transport(detail)) => {
                return Ok(ChapterOutcome::with_detail(
                    chapter,
                    OutcomeStatus::SkippedRetryable,
                    format!("oracle transport: {detail}"),
                ));
            }
            Err(OracleError::Schema { reason, payload }) => {
                error!(chapter, %reason, %payload, "Oracle response rejected");
                return Ok(ChapterOutcome::with_detail(
                    chapter,
                    OutcomeStatus::SkippedPermanent,
                    format!("oracle schema: {reason}"),
                ));
            }
        };

        if let Err(OracleError::Schema { reason, payload }) =
            validate_analysis(&analysis, &resolved)
        {
            error!(chapter, %reason, %payload, "Oracle response rejected");
            return Ok(ChapterOutcome::with_detail(
                chapter,
                OutcomeStatus::SkippedPermanent,
                format!("oracle schema: {reason}"),
            ));
        }

        state = ChapterState::Applying;
        debug!(chapter, state = ?state, verdicts = analysis.verdicts.len(), "Applying analysis");
        let standings = self.store.latest_standings_before(chapter)?;
        let mutation = apply(chapter, &resolved, &analysis, &standings)?;

        let commit = ChapterCommit {
            chapter: Chapter::fetched(chapter, source.title, source.arc_name, source.text),
            processed_at: Utc::now(),
            new_characters: mutation.new_characters,
            events: mutation.events,
            entries: mutation.entries,
            expected_starts: mutation.expected_starts,
        };
        self.store.commit_chapter(&commit)?;

        state = ChapterState::Committed;
        debug!(chapter, state = ?state, "Chapter committed");
        Ok(ChapterOutcome::new(chapter, OutcomeStatus::Committed))
    }

    /// Sequential-consistency check for one candidate chapter
    ///
    /// A chapter is out of order when the store already knows of an
    /// unattempted chapter below it: either an unprocessed chapter row below
    /// `chapter` that this run is not about to handle, or a committed
    /// frontier above `chapter` (a hole below the frontier). Chapter numbers
    /// the store has never seen are admissible, because externally assigned
    /// numbering may legitimately skip values and the engine cannot tell a
    /// gap from an unfetched chapter.
    fn ordering_violation(
        &self,
        chapter: u32,
        frontier_at_start: Option<u32>,
        report: &RunReport,
    ) -> Result<Option<String>, StorageError> {
        if let Some(frontier) = frontier_at_start {
            if chapter < frontier {
                return Ok(Some(format!(
                    "chapter {chapter} lies below the committed frontier {frontier}"
                )));
            }
        }

        let attempted_this_run =
            |n: u32| report.outcomes.iter().any(|o| o.chapter == n);
        let holes: Vec<u32> = self
            .store
            .unprocessed_below(chapter)?
            .into_iter()
            .filter(|n| !attempted_this_run(*n))
            .collect();
        if let Some(hole) = holes.first() {
            return Ok(Some(format!(
                "chapter {hole} is known but uncommitted below chapter {chapter}"
            )));
        }

        Ok(None)
    }
}

fn feed_failure(chapter: u32, error: FeedError) -> AttemptFailure {
    match error {
        // A chapter the feed does not know yet may simply not be published.
        FeedError::NotFound(_) | FeedError::Io(_) => {
            AttemptFailure::Retryable(format!("feed: {error}"))
        }
        FeedError::Malformed(_) => {
            AttemptFailure::Permanent(format!("feed: chapter {chapter}: {error}"))
        }
    }
}

fn mention_state(mention: &ResolvedMention) -> MentionState {
    let (new, current_value) = match &mention.standing {
        Standing::Existing { current_value } => (false, Some(*current_value)),
        Standing::New => (true, None),
    };
    MentionState {
        reference: mention.reference.to_string(),
        name: mention.display_name.clone(),
        new,
        current_value,
    }
}

#[cfg(test)]
mod tests;
