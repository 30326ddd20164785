//! SQLite storage backend for the market

use super::traits::{ChapterCommit, MarketStore, OpenStore, StorageError, StorageResult, StoreStats};
use crate::market::{
    Character, CharacterRef, CharacterStanding, Chapter, MarketEvent, StockHistoryEntry,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Tolerance for comparing a commit's expected start value against stored
/// history. Values on both sides come from the same accumulation chain, so
/// any real divergence is far larger than rounding noise.
const START_VALUE_TOLERANCE: f64 = 1e-9;

/// SQLite-backed market store
///
/// Uses a single SQLite database file with tables for characters, chapters,
/// market events, and stock history. Thread-safe via internal mutex on the
/// connection. The event and history tables are append-only logs keyed by
/// chapter number; nothing ever updates or deletes their rows, which is what
/// makes full replay of any cumulative value possible.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Characters: identity keyed by the stable external reference.
            -- initial_value and first_appearance are write-once; no UPDATE
            -- path exists for them anywhere in this module.
            CREATE TABLE IF NOT EXISTS characters (
                reference TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                first_appearance INTEGER NOT NULL,
                initial_value REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Chapters: processed flips exactly once, inside commit_chapter.
            CREATE TABLE IF NOT EXISTS chapters (
                number INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                arc_name TEXT,
                text TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chapters_processed
                ON chapters(processed, number);

            -- Append-only per-action event log.
            CREATE TABLE IF NOT EXISTS market_events (
                character_ref TEXT NOT NULL,
                chapter_number INTEGER NOT NULL,
                action_index INTEGER NOT NULL,
                delta REAL NOT NULL,
                pre_clamp_value REAL NOT NULL,
                confidence REAL NOT NULL,
                justification TEXT NOT NULL,
                PRIMARY KEY (character_ref, chapter_number, action_index),
                FOREIGN KEY (character_ref) REFERENCES characters(reference)
            );

            CREATE INDEX IF NOT EXISTS idx_events_chapter
                ON market_events(chapter_number);

            -- Append-only per-chapter cumulative log.
            CREATE TABLE IF NOT EXISTS stock_history (
                character_ref TEXT NOT NULL,
                chapter_number INTEGER NOT NULL,
                cumulative REAL NOT NULL,
                chapter_change REAL NOT NULL,
                market_rank INTEGER,
                justification TEXT NOT NULL,
                PRIMARY KEY (character_ref, chapter_number),
                FOREIGN KEY (character_ref) REFERENCES characters(reference)
            );

            CREATE INDEX IF NOT EXISTS idx_history_chapter
                ON stock_history(chapter_number);

            PRAGMA foreign_keys = ON;

            -- WAL for concurrent reads during a commit.
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn parse_datetime(text: &str) -> StorageResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StorageError::DateParse(format!("{text}: {e}")))
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<StockHistoryEntry> {
        Ok(StockHistoryEntry {
            character: CharacterRef::new(row.get::<_, String>(0)?),
            chapter: row.get(1)?,
            cumulative: row.get(2)?,
            chapter_change: row.get(3)?,
            rank: row.get(4)?,
            justification: row.get(5)?,
        })
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<MarketEvent> {
        Ok(MarketEvent {
            character: CharacterRef::new(row.get::<_, String>(0)?),
            chapter: row.get(1)?,
            action_index: row.get(2)?,
            delta: row.get(3)?,
            pre_clamp_value: row.get(4)?,
            confidence: row.get(5)?,
            justification: row.get(6)?,
        })
    }

    /// Latest cumulative before `chapter` inside an open transaction,
    /// falling back to the character's initial value when no entry exists
    /// yet. Used by the commit-time consistency check.
    fn stored_start_value(
        tx: &rusqlite::Transaction<'_>,
        reference: &CharacterRef,
        chapter: u32,
    ) -> StorageResult<f64> {
        let from_history: Option<f64> = tx
            .query_row(
                r#"
                SELECT cumulative FROM stock_history
                WHERE character_ref = ?1 AND chapter_number < ?2
                ORDER BY chapter_number DESC LIMIT 1
                "#,
                params![reference.as_str(), chapter],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(value) = from_history {
            return Ok(value);
        }

        tx.query_row(
            "SELECT initial_value FROM characters WHERE reference = ?1",
            params![reference.as_str()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StorageError::CharacterNotFound(reference.to_string()))
    }
}

impl MarketStore for SqliteStore {
    // === Characters ===

    fn character(&self, reference: &CharacterRef) -> StorageResult<Option<Character>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT reference, name, first_appearance, initial_value, created_at
                FROM characters WHERE reference = ?1
                "#,
                params![reference.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((reference, name, first_appearance, initial_value, created_at)) => {
                Ok(Some(Character {
                    reference: CharacterRef::new(reference),
                    name,
                    first_appearance,
                    initial_value,
                    created_at: Self::parse_datetime(&created_at)?,
                }))
            }
            None => Ok(None),
        }
    }

    fn all_characters(&self) -> StorageResult<Vec<Character>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT reference, name, first_appearance, initial_value, created_at
            FROM characters ORDER BY reference
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut characters = Vec::new();
        for row in rows {
            let (reference, name, first_appearance, initial_value, created_at) = row?;
            characters.push(Character {
                reference: CharacterRef::new(reference),
                name,
                first_appearance,
                initial_value,
                created_at: Self::parse_datetime(&created_at)?,
            });
        }
        Ok(characters)
    }

    // === Chapters ===

    fn chapter(&self, number: u32) -> StorageResult<Option<Chapter>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                r#"
                SELECT number, title, arc_name, text, processed, processed_at
                FROM chapters WHERE number = ?1
                "#,
                params![number],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((number, title, arc_name, text, processed, processed_at)) => {
                let processed_at = match processed_at {
                    Some(text) => Some(Self::parse_datetime(&text)?),
                    None => None,
                };
                Ok(Some(Chapter {
                    number,
                    title,
                    arc_name,
                    text,
                    processed,
                    processed_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn record_chapter(&self, chapter: &Chapter) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO chapters (number, title, arc_name, text, processed, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            ON CONFLICT(number) DO UPDATE SET
                title = excluded.title,
                arc_name = excluded.arc_name,
                text = excluded.text
            "#,
            params![
                chapter.number,
                chapter.title,
                chapter.arc_name,
                chapter.text,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn is_processed(&self, number: u32) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let processed: Option<bool> = conn
            .query_row(
                "SELECT processed FROM chapters WHERE number = ?1",
                params![number],
                |row| row.get(0),
            )
            .optional()?;
        Ok(processed.unwrap_or(false))
    }

    fn last_committed_chapter(&self) -> StorageResult<Option<u32>> {
        let conn = self.conn.lock().unwrap();
        let number: Option<u32> = conn.query_row(
            "SELECT MAX(number) FROM chapters WHERE processed = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(number)
    }

    fn unprocessed_below(&self, number: u32) -> StorageResult<Vec<u32>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT number FROM chapters WHERE processed = 0 AND number < ?1 ORDER BY number",
        )?;
        let rows = stmt.query_map(params![number], |row| row.get(0))?;
        rows.collect::<Result<Vec<u32>, _>>()
            .map_err(StorageError::Database)
    }

    fn unprocessed_in_range(&self, start: u32, end: u32) -> StorageResult<Vec<u32>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT number FROM chapters
            WHERE processed = 0 AND number BETWEEN ?1 AND ?2
            ORDER BY number
            "#,
        )?;
        let rows = stmt.query_map(params![start, end], |row| row.get(0))?;
        rows.collect::<Result<Vec<u32>, _>>()
            .map_err(StorageError::Database)
    }

    // === Market reads (boundary-aware) ===

    fn latest_standings_before(&self, chapter: u32) -> StorageResult<Vec<CharacterStanding>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT c.reference, c.name, c.first_appearance, h.cumulative, h.chapter_number
            FROM characters c
            JOIN stock_history h ON h.character_ref = c.reference
            WHERE h.chapter_number = (
                SELECT MAX(h2.chapter_number) FROM stock_history h2
                WHERE h2.character_ref = c.reference AND h2.chapter_number < ?1
            )
            ORDER BY c.reference
            "#,
        )?;
        let rows = stmt.query_map(params![chapter], |row| {
            Ok(CharacterStanding {
                reference: CharacterRef::new(row.get::<_, String>(0)?),
                name: row.get(1)?,
                first_appearance: row.get(2)?,
                value: row.get(3)?,
                as_of_chapter: row.get(4)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::Database)
    }

    fn latest_value_before(
        &self,
        reference: &CharacterRef,
        chapter: u32,
    ) -> StorageResult<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let value: Option<f64> = conn
            .query_row(
                r#"
                SELECT cumulative FROM stock_history
                WHERE character_ref = ?1 AND chapter_number < ?2
                ORDER BY chapter_number DESC LIMIT 1
                "#,
                params![reference.as_str(), chapter],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn recent_entries_before(
        &self,
        reference: &CharacterRef,
        chapter: u32,
        k: usize,
    ) -> StorageResult<Vec<StockHistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT character_ref, chapter_number, cumulative, chapter_change, market_rank, justification
            FROM stock_history
            WHERE character_ref = ?1 AND chapter_number < ?2
            ORDER BY chapter_number DESC LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(
            params![reference.as_str(), chapter, k as i64],
            Self::row_to_entry,
        )?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::Database)
    }

    // === Audit / presentation reads ===

    fn history(&self, reference: &CharacterRef) -> StorageResult<Vec<StockHistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT character_ref, chapter_number, cumulative, chapter_change, market_rank, justification
            FROM stock_history
            WHERE character_ref = ?1
            ORDER BY chapter_number
            "#,
        )?;
        let rows = stmt.query_map(params![reference.as_str()], Self::row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::Database)
    }

    fn events_for_character(&self, reference: &CharacterRef) -> StorageResult<Vec<MarketEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT character_ref, chapter_number, action_index, delta, pre_clamp_value,
                   confidence, justification
            FROM market_events
            WHERE character_ref = ?1
            ORDER BY chapter_number, action_index
            "#,
        )?;
        let rows = stmt.query_map(params![reference.as_str()], Self::row_to_event)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::Database)
    }

    fn events_for_chapter(&self, chapter: u32) -> StorageResult<Vec<MarketEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT character_ref, chapter_number, action_index, delta, pre_clamp_value,
                   confidence, justification
            FROM market_events
            WHERE chapter_number = ?1
            ORDER BY character_ref, action_index
            "#,
        )?;
        let rows = stmt.query_map(params![chapter], Self::row_to_event)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::Database)
    }

    fn stats(&self) -> StorageResult<StoreStats> {
        let conn = self.conn.lock().unwrap();
        let count = |sql: &str| -> StorageResult<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(StoreStats {
            characters: count("SELECT COUNT(*) FROM characters")?,
            chapters: count("SELECT COUNT(*) FROM chapters")?,
            processed_chapters: count("SELECT COUNT(*) FROM chapters WHERE processed = 1")?,
            events: count("SELECT COUNT(*) FROM market_events")?,
            history_entries: count("SELECT COUNT(*) FROM stock_history")?,
        })
    }

    // === Commit ===

    fn commit_chapter(&self, commit: &ChapterCommit) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let number = commit.chapter.number;

        // A processed chapter must never be committed twice; the
        // orchestrator checks first, so hitting this means two writers or a
        // caller bug.
        let already: Option<bool> = tx
            .query_row(
                "SELECT processed FROM chapters WHERE number = ?1",
                params![number],
                |row| row.get(0),
            )
            .optional()?;
        if already == Some(true) {
            return Err(StorageError::Inconsistent(format!(
                "chapter {number} is already committed"
            )));
        }

        // Consistency check: the applier's starting values must match what
        // history says now. Divergence means the accumulation invariant is
        // about to break.
        for (reference, expected) in &commit.expected_starts {
            let stored = Self::stored_start_value(&tx, reference, number)?;
            if (stored - expected).abs() > START_VALUE_TOLERANCE {
                return Err(StorageError::Inconsistent(format!(
                    "character {reference} start value {expected} disagrees with stored history {stored} at chapter {number}"
                )));
            }
        }

        for character in &commit.new_characters {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM characters WHERE reference = ?1",
                    params![character.reference.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StorageError::Inconsistent(format!(
                    "new character {} already exists",
                    character.reference
                )));
            }
            tx.execute(
                r#"
                INSERT INTO characters (reference, name, first_appearance, initial_value, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    character.reference.as_str(),
                    character.name,
                    character.first_appearance,
                    character.initial_value,
                    character.created_at.to_rfc3339(),
                ],
            )?;
        }

        tx.execute(
            r#"
            INSERT INTO chapters (number, title, arc_name, text, processed, processed_at, created_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
            ON CONFLICT(number) DO UPDATE SET
                title = excluded.title,
                arc_name = excluded.arc_name,
                text = excluded.text,
                processed = 1,
                processed_at = excluded.processed_at
            "#,
            params![
                number,
                commit.chapter.title,
                commit.chapter.arc_name,
                commit.chapter.text,
                commit.processed_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        for event in &commit.events {
            tx.execute(
                r#"
                INSERT INTO market_events
                    (character_ref, chapter_number, action_index, delta, pre_clamp_value,
                     confidence, justification)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    event.character.as_str(),
                    event.chapter,
                    event.action_index,
                    event.delta,
                    event.pre_clamp_value,
                    event.confidence,
                    event.justification,
                ],
            )?;
        }

        for entry in &commit.entries {
            tx.execute(
                r#"
                INSERT INTO stock_history
                    (character_ref, chapter_number, cumulative, chapter_change, market_rank, justification)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    entry.character.as_str(),
                    entry.chapter,
                    entry.cumulative,
                    entry.chapter_change,
                    entry.rank,
                    entry.justification,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}
