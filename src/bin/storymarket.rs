//! Storymarket CLI — chapter-processing engine for narrative stock values.
//!
//! Usage:
//!   storymarket run --start 1 --end 100 --feed chapters/ [--db path]
//!   storymarket run --chapters 4,7,9 --scripted analyses.json
//!   storymarket status [--db path]
//!   storymarket top [--n 10] [--db path]
//!   storymarket history <reference> [--events] [--db path]

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use storymarket::config::EngineConfig;
use storymarket::feed::JsonDirFeed;
use storymarket::oracle::{ChapterOracle, HttpOracle, RetryPolicy, ScriptedOracle};
use storymarket::pipeline::{ChapterOrchestrator, ChapterSelection, OutcomeStatus};
use storymarket::storage::{MarketStore, OpenStore, SqliteStore};
use storymarket::CharacterRef;

#[derive(Parser)]
#[command(
    name = "storymarket",
    version,
    about = "Narrative character stock engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a selection of chapters
    Run {
        /// First chapter of an inclusive range
        #[arg(long, conflicts_with_all = ["chapters", "all_unprocessed"])]
        start: Option<u32>,
        /// Last chapter of an inclusive range
        #[arg(long, requires = "start")]
        end: Option<u32>,
        /// Explicit comma-separated chapter list (e.g. 4,7,9)
        #[arg(long, value_delimiter = ',')]
        chapters: Option<Vec<u32>>,
        /// Process every known unprocessed chapter
        #[arg(long)]
        all_unprocessed: bool,
        /// Cap on how many chapters to attempt
        #[arg(long)]
        max_chapters: Option<usize>,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
        /// Directory of chapter_<n>.json files to feed from
        #[arg(long, required = true)]
        feed: PathBuf,
        /// Oracle HTTP endpoint (or STORYMARKET_ORACLE_URL)
        #[arg(long)]
        oracle_url: Option<String>,
        /// Oracle model/variant to request
        #[arg(long, default_value = "narrative-analyst-v2")]
        model: String,
        /// Serve canned analyses from a JSON file instead of a live oracle
        #[arg(long, conflicts_with = "oracle_url")]
        scripted: Option<PathBuf>,
        /// Delay between chapters, in milliseconds
        #[arg(long, default_value_t = 1000)]
        delay_ms: u64,
        /// Retry attempts for transient oracle failures
        #[arg(long, default_value_t = 3)]
        retries: usize,
        /// Reuse previously fetched chapter text from the store
        #[arg(long)]
        skip_fetch: bool,
        /// Accept out-of-order processing with a degraded context
        #[arg(long)]
        allow_gaps: bool,
        /// Characters shown to the oracle in the top-of-market list
        #[arg(long, default_value_t = 10)]
        top_n: usize,
        /// Committed chapters of per-character activity shown to the oracle
        #[arg(long, default_value_t = 3)]
        history_k: usize,
    },
    /// Show store statistics and the committed frontier
    Status {
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show the current top of the market
    Top {
        /// How many characters to list
        #[arg(long, default_value_t = 10)]
        n: usize,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show one character's stock history
    History {
        /// The character's stable reference (e.g. /wiki/Monkey_D._Luffy)
        reference: String,
        /// Also list the per-action event log
        #[arg(long)]
        events: bool,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// Get the default database path (~/.local/share/storymarket/market.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let dir = data_dir.join("storymarket");
    std::fs::create_dir_all(&dir).ok();
    dir.join("market.db")
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore, String> {
    let path = db.unwrap_or_else(default_db_path);
    SqliteStore::open(&path).map_err(|e| format!("Failed to open database: {e}"))
}

fn build_oracle(
    scripted: Option<PathBuf>,
    oracle_url: Option<String>,
    model: String,
) -> Result<Box<dyn ChapterOracle>, String> {
    if let Some(path) = scripted {
        let oracle = ScriptedOracle::from_file(&path)
            .map_err(|e| format!("Failed to load scripted analyses: {e}"))?;
        return Ok(Box::new(oracle));
    }

    let endpoint = oracle_url
        .or_else(|| std::env::var("STORYMARKET_ORACLE_URL").ok())
        .ok_or_else(|| {
            "No oracle configured: pass --oracle-url, set STORYMARKET_ORACLE_URL, or use --scripted"
                .to_string()
        })?;
    let mut oracle = HttpOracle::new(endpoint, model, Duration::from_secs(120))
        .map_err(|e| format!("Failed to build oracle client: {e}"))?;
    if let Ok(api_key) = std::env::var("STORYMARKET_ORACLE_KEY") {
        oracle = oracle.with_api_key(api_key);
    }
    Ok(Box::new(oracle))
}

async fn cmd_run(
    store: &SqliteStore,
    feed_dir: PathBuf,
    selection: ChapterSelection,
    max_chapters: Option<usize>,
    oracle: Box<dyn ChapterOracle>,
    config: EngineConfig,
) -> i32 {
    let feed = JsonDirFeed::new(feed_dir);
    let orchestrator = ChapterOrchestrator::new(store, &feed, oracle.as_ref(), config);

    let report = match orchestrator.run(&selection, max_chapters).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Run aborted: {e}");
            return 2;
        }
    };

    println!("{:<9}  {:<20}  DETAIL", "CHAPTER", "OUTCOME");
    println!("{}", "-".repeat(60));
    for outcome in &report.outcomes {
        let status = match outcome.status {
            OutcomeStatus::Committed => "committed",
            OutcomeStatus::AlreadyProcessed => "already-processed",
            OutcomeStatus::SkippedRetryable => "skipped-retryable",
            OutcomeStatus::SkippedPermanent => "skipped-permanent",
            OutcomeStatus::SkippedOutOfOrder => "skipped-out-of-order",
        };
        println!(
            "{:<9}  {:<20}  {}",
            outcome.chapter,
            status,
            outcome.detail.as_deref().unwrap_or("")
        );
    }
    println!(
        "\n{} committed, {} attempted",
        report.committed(),
        report.outcomes.len()
    );

    if report.fully_committed() {
        0
    } else {
        1
    }
}

fn cmd_status(store: &SqliteStore) -> i32 {
    let stats = match store.stats() {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    let frontier = match store.last_committed_chapter() {
        Ok(frontier) => frontier,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };

    println!("Characters:         {}", stats.characters);
    println!(
        "Chapters:           {} ({} processed)",
        stats.chapters, stats.processed_chapters
    );
    println!("Market events:      {}", stats.events);
    println!("History entries:    {}", stats.history_entries);
    match frontier {
        Some(n) => println!("Committed frontier: chapter {n}"),
        None => println!("Committed frontier: none"),
    }
    0
}

fn cmd_top(store: &SqliteStore, n: usize) -> i32 {
    let mut standings = match store.latest_standings_before(u32::MAX) {
        Ok(standings) => standings,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    if standings.is_empty() {
        println!("No tracked characters.");
        return 0;
    }
    standings.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.first_appearance.cmp(&b.first_appearance))
    });

    println!("{:<4}  {:<28}  {:>10}  {:>8}", "#", "NAME", "VALUE", "SINCE");
    println!("{}", "-".repeat(58));
    for (i, standing) in standings.iter().take(n).enumerate() {
        println!(
            "{:<4}  {:<28}  {:>10.1}  {:>8}",
            i + 1,
            standing.name,
            standing.value,
            standing.first_appearance
        );
    }
    0
}

fn cmd_history(store: &SqliteStore, reference: &str, show_events: bool) -> i32 {
    let reference = CharacterRef::new(reference);
    let character = match store.character(&reference) {
        Ok(Some(character)) => character,
        Ok(None) => {
            eprintln!("Error: no character with reference '{reference}'");
            return 1;
        }
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };

    println!(
        "{} (first appearance: chapter {}, initial value: {:.1})",
        character.name, character.first_appearance, character.initial_value
    );

    let history = match store.history(&reference) {
        Ok(history) => history,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    println!(
        "\n{:<9}  {:>10}  {:>8}  {:>6}  JUSTIFICATION",
        "CHAPTER", "VALUE", "CHANGE", "RANK"
    );
    println!("{}", "-".repeat(72));
    for entry in &history {
        let rank = entry
            .rank
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<9}  {:>10.1}  {:>+8.1}  {:>6}  {}",
            entry.chapter, entry.cumulative, entry.chapter_change, rank, entry.justification
        );
    }

    if show_events {
        let events = match store.events_for_character(&reference) {
            Ok(events) => events,
            Err(e) => {
                eprintln!("Error: {e}");
                return 1;
            }
        };
        println!(
            "\n{:<9}  {:<6}  {:>8}  {:>10}  {:>5}  JUSTIFICATION",
            "CHAPTER", "ACTION", "DELTA", "PRE-CLAMP", "CONF"
        );
        println!("{}", "-".repeat(78));
        for event in &events {
            println!(
                "{:<9}  {:<6}  {:>+8.1}  {:>10.1}  {:>5.2}  {}",
                event.chapter,
                event.action_index,
                event.delta,
                event.pre_clamp_value,
                event.confidence,
                event.justification
            );
        }
    }
    0
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("storymarket=info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run {
            start,
            end,
            chapters,
            all_unprocessed,
            max_chapters,
            db,
            feed,
            oracle_url,
            model,
            scripted,
            delay_ms,
            retries,
            skip_fetch,
            allow_gaps,
            top_n,
            history_k,
        } => {
            let selection = if let Some(chapters) = chapters {
                ChapterSelection::List(chapters)
            } else if all_unprocessed {
                ChapterSelection::AllUnprocessed
            } else {
                match (start, end, max_chapters) {
                    (Some(start), Some(end), _) => ChapterSelection::Range { start, end },
                    (Some(start), None, Some(max)) => ChapterSelection::Range {
                        start,
                        end: start + max.saturating_sub(1) as u32,
                    },
                    _ => {
                        eprintln!(
                            "error: select chapters with --chapters, --all-unprocessed, or --start with --end/--max-chapters"
                        );
                        std::process::exit(2);
                    }
                }
            };

            let store = match open_store(db) {
                Ok(store) => store,
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            };
            let oracle = match build_oracle(scripted, oracle_url, model) {
                Ok(oracle) => oracle,
                Err(e) => {
                    eprintln!("Error: {e}");
                    std::process::exit(1);
                }
            };
            let config = EngineConfig::new()
                .with_top_n(top_n)
                .with_history_k(history_k)
                .with_request_delay(Duration::from_millis(delay_ms))
                .with_retry(RetryPolicy {
                    max_retries: retries,
                    ..RetryPolicy::default()
                })
                .with_skip_fetch(skip_fetch)
                .with_allow_gaps(allow_gaps);

            cmd_run(&store, feed, selection, max_chapters, oracle, config).await
        }
        Commands::Status { db } => match open_store(db) {
            Ok(store) => cmd_status(&store),
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
        Commands::Top { n, db } => match open_store(db) {
            Ok(store) => cmd_top(&store, n),
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
        Commands::History {
            reference,
            events,
            db,
        } => match open_store(db) {
            Ok(store) => cmd_history(&store, &reference, events),
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
    };
    std::process::exit(code);
}
