//! SQLite persistence for watches, records, authors, and media.
//!
//! All writes are idempotent upserts keyed on stable external identifiers.
//! Watch tags are an additive set union, and author score sums are mutated
//! only through atomic `score_sum + ?` increments so overlapping passes
//! cannot lose updates.

use crate::error::IngestError;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::sync::Mutex;
use watch_ingest_types::*;

use crate::twitter_api::{ApiMedia, ApiUser, Tweet};

pub struct Db {
    conn: Mutex<Connection>,
}

/// A normalized record prepared for insertion, with derived values computed.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub id: String,
    pub author_id: Option<String>,
    pub author_username: Option<String>,
    pub text: String,
    pub created_at: Option<String>,
    pub like_count: i64,
    pub reply_count: i64,
    pub retweet_count: i64,
    pub quote_count: i64,
    pub hashtags: Vec<String>,
    pub media_keys: Vec<String>,
    pub tweet_score: i64,
    pub synergy: f64,
    pub tweet_html: Option<String>,
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn json_vec(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_vec(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Record IDs are opaque strings ordered numerically when both parse, with a
/// length-then-lexicographic fallback.
pub fn id_newer(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u64>(), current.parse::<u64>()) {
        (Ok(a), Ok(b)) => a > b,
        _ => (candidate.len(), candidate) > (current.len(), current),
    }
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS watch_configs (
                name TEXT PRIMARY KEY,
                query TEXT NOT NULL,
                parameters TEXT,
                since_id TEXT,
                maintenance_delta_hours INTEGER NOT NULL DEFAULT 48,
                max_results INTEGER,
                active INTEGER NOT NULL DEFAULT 0,
                status TEXT,
                first_run_completed INTEGER NOT NULL DEFAULT 0,
                kill_switch INTEGER NOT NULL DEFAULT 0,
                last_pull_started TEXT,
                last_pull_finished TEXT,
                last_pull_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                author_id TEXT,
                author_username TEXT,
                text TEXT NOT NULL DEFAULT '',
                created_at TEXT,
                like_count INTEGER NOT NULL DEFAULT 0,
                reply_count INTEGER NOT NULL DEFAULT 0,
                retweet_count INTEGER NOT NULL DEFAULT 0,
                quote_count INTEGER NOT NULL DEFAULT 0,
                hashtags_json TEXT NOT NULL DEFAULT '[]',
                media_keys_json TEXT NOT NULL DEFAULT '[]',
                tweet_score INTEGER NOT NULL DEFAULT 0,
                synergy REAL NOT NULL DEFAULT 0,
                tweet_html TEXT,
                requests_json TEXT NOT NULL DEFAULT '[]',
                stat_rolled_at TEXT,
                captured_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_author ON records(author_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_created ON records(created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS authors (
                id TEXT PRIMARY KEY,
                username TEXT,
                name TEXT,
                raw_json TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS author_watch_usage (
                author_id TEXT NOT NULL,
                watch_name TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                last_used TEXT,
                UNIQUE(author_id, watch_name)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS author_hashtag_usage (
                author_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                last_used TEXT,
                UNIQUE(author_id, tag)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS author_watch_scores (
                author_id TEXT NOT NULL,
                watch_name TEXT NOT NULL,
                score_sum INTEGER NOT NULL DEFAULT 0,
                UNIQUE(author_id, watch_name)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS media (
                media_key TEXT PRIMARY KEY,
                media_type TEXT,
                url TEXT,
                hashtags_json TEXT NOT NULL DEFAULT '[]',
                requests_json TEXT NOT NULL DEFAULT '[]',
                captured_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // Watch Operations
    // =====================================================

    pub fn add_watch(&self, req: &AddWatchRequest) -> SqliteResult<WatchConfig> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        let delta = req.maintenance_delta_hours.unwrap_or(48);

        conn.execute(
            "INSERT INTO watch_configs (name, query, parameters, maintenance_delta_hours,
                max_results, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![req.name, req.query, req.parameters, delta, req.max_results, now],
        )?;

        Ok(WatchConfig {
            name: req.name.clone(),
            query: req.query.clone(),
            parameters: req.parameters.clone(),
            since_id: None,
            maintenance_delta_hours: delta,
            max_results: req.max_results,
            active: false,
            status: None,
            first_run_completed: false,
            kill_switch: false,
            last_pull_started: None,
            last_pull_finished: None,
            last_pull_count: 0,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_watch(&self, name: &str) -> SqliteResult<Option<WatchConfig>> {
        let conn = self.conn.lock().unwrap();
        conn.prepare(
            "SELECT name, query, parameters, since_id, maintenance_delta_hours, max_results,
                    active, status, first_run_completed, kill_switch, last_pull_started,
                    last_pull_finished, last_pull_count, created_at, updated_at
             FROM watch_configs WHERE name = ?1",
        )?
        .query_row([name], row_to_watch)
        .optional()
    }

    pub fn list_watches(&self) -> SqliteResult<Vec<WatchConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, query, parameters, since_id, maintenance_delta_hours, max_results,
                    active, status, first_run_completed, kill_switch, last_pull_started,
                    last_pull_finished, last_pull_count, created_at, updated_at
             FROM watch_configs ORDER BY created_at ASC",
        )?;
        let entries = stmt
            .query_map([], row_to_watch)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }

    /// Mark a pull phase as started: active, phase status, start timestamp.
    pub fn mark_pull_started(&self, name: &str, status: &str) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "UPDATE watch_configs SET active = 1, status = ?1, last_pull_started = ?2,
             updated_at = ?2 WHERE name = ?3",
            rusqlite::params![status, now, name],
        )?;
        Ok(())
    }

    /// Finalize a pull phase: inactive, finish timestamp, downloaded count.
    pub fn mark_pull_finished(&self, name: &str, count: i64) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        conn.execute(
            "UPDATE watch_configs SET active = 0, last_pull_finished = ?1, last_pull_count = ?2,
             updated_at = ?1 WHERE name = ?3",
            rusqlite::params![now, count, name],
        )?;
        Ok(())
    }

    pub fn set_watch_active(&self, name: &str, active: bool, status: Option<&str>) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_iso();
        match status {
            Some(s) => conn.execute(
                "UPDATE watch_configs SET active = ?1, status = ?2, updated_at = ?3 WHERE name = ?4",
                rusqlite::params![active, s, now, name],
            )?,
            None => conn.execute(
                "UPDATE watch_configs SET active = ?1, updated_at = ?2 WHERE name = ?3",
                rusqlite::params![active, now, name],
            )?,
        };
        Ok(())
    }

    /// Advance the cursor. Monotonic: an older candidate is ignored.
    pub fn advance_since_id(&self, name: &str, candidate: &str) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let current: Option<Option<String>> = conn
            .query_row(
                "SELECT since_id FROM watch_configs WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(c) => c,
            None => return Ok(()),
        };
        if let Some(ref cur) = current {
            if !id_newer(candidate, cur) {
                return Ok(());
            }
        }
        conn.execute(
            "UPDATE watch_configs SET since_id = ?1, updated_at = ?2 WHERE name = ?3",
            rusqlite::params![candidate, now_iso(), name],
        )?;
        Ok(())
    }

    pub fn set_kill_switch(&self, name: &str, value: bool) -> SqliteResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE watch_configs SET kill_switch = ?1, updated_at = ?2 WHERE name = ?3",
            rusqlite::params![value, now_iso(), name],
        )?;
        Ok(rows > 0)
    }

    pub fn set_first_run_completed(&self, name: &str) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE watch_configs SET first_run_completed = 1, updated_at = ?1 WHERE name = ?2",
            rusqlite::params![now_iso(), name],
        )?;
        Ok(())
    }

    // =====================================================
    // Record / Author / Media Upserts
    // =====================================================

    /// Apply one page of records as a single batch. Re-applying the same page
    /// is a no-op in effect; the watch tag is unioned, never replaced.
    pub fn upsert_records(&self, rows: &[NewRecord], watch_name: &str) -> Result<(), IngestError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(IngestError::PersistenceBatch)?;

        for r in rows {
            tx.execute(
                "INSERT INTO records (id, author_id, author_username, text, created_at,
                    like_count, reply_count, retweet_count, quote_count, hashtags_json,
                    media_keys_json, tweet_score, synergy, tweet_html)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                    author_id = excluded.author_id,
                    author_username = excluded.author_username,
                    text = excluded.text,
                    created_at = excluded.created_at,
                    like_count = excluded.like_count,
                    reply_count = excluded.reply_count,
                    retweet_count = excluded.retweet_count,
                    quote_count = excluded.quote_count,
                    hashtags_json = excluded.hashtags_json,
                    media_keys_json = excluded.media_keys_json,
                    tweet_score = excluded.tweet_score,
                    synergy = excluded.synergy,
                    tweet_html = COALESCE(excluded.tweet_html, records.tweet_html)",
                rusqlite::params![
                    r.id,
                    r.author_id,
                    r.author_username,
                    r.text,
                    r.created_at,
                    r.like_count,
                    r.reply_count,
                    r.retweet_count,
                    r.quote_count,
                    json_vec(&r.hashtags),
                    json_vec(&r.media_keys),
                    r.tweet_score,
                    r.synergy,
                    r.tweet_html,
                ],
            )
            .map_err(IngestError::PersistenceBatch)?;

            union_tag(&tx, "records", "id", &r.id, watch_name)
                .map_err(IngestError::PersistenceBatch)?;
        }

        tx.commit().map_err(IngestError::PersistenceBatch)
    }

    pub fn upsert_authors(&self, users: &[ApiUser]) -> Result<(), IngestError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(IngestError::PersistenceBatch)?;
        let now = now_iso();

        for u in users {
            let raw = serde_json::to_string(u).ok();
            tx.execute(
                "INSERT INTO authors (id, username, name, raw_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    name = excluded.name,
                    raw_json = excluded.raw_json,
                    updated_at = excluded.updated_at",
                rusqlite::params![u.id, u.username, u.name, raw, now],
            )
            .map_err(IngestError::PersistenceBatch)?;
        }

        tx.commit().map_err(IngestError::PersistenceBatch)
    }

    pub fn upsert_media(&self, media: &[ApiMedia], watch_name: &str) -> Result<(), IngestError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(IngestError::PersistenceBatch)?;

        for m in media {
            tx.execute(
                "INSERT INTO media (media_key, media_type, url, hashtags_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(media_key) DO UPDATE SET
                    media_type = excluded.media_type,
                    url = excluded.url,
                    hashtags_json = excluded.hashtags_json",
                rusqlite::params![m.media_key, m.media_type, m.url, json_vec(&m.hashtags)],
            )
            .map_err(IngestError::PersistenceBatch)?;

            union_tag(&tx, "media", "media_key", &m.media_key, watch_name)
                .map_err(IngestError::PersistenceBatch)?;
        }

        tx.commit().map_err(IngestError::PersistenceBatch)
    }

    // =====================================================
    // Record / Author / Media Reads
    // =====================================================

    pub fn get_record(&self, id: &str) -> SqliteResult<Option<StoredRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.prepare(&format!("{RECORD_SELECT} WHERE id = ?1"))?
            .query_row([id], row_to_record)
            .optional()
    }

    pub fn get_media(&self, media_key: &str) -> SqliteResult<Option<MediaAsset>> {
        let conn = self.conn.lock().unwrap();
        conn.prepare(
            "SELECT media_key, media_type, url, hashtags_json, requests_json
             FROM media WHERE media_key = ?1",
        )?
        .query_row([media_key], |row| {
            Ok(MediaAsset {
                media_key: row.get(0)?,
                media_type: row.get(1)?,
                url: row.get(2)?,
                hashtags: parse_json_vec(&row.get::<_, String>(3)?),
                requests: parse_json_vec(&row.get::<_, String>(4)?),
            })
        })
        .optional()
    }

    pub fn get_author_stats(&self, author_id: &str) -> SqliteResult<Option<AuthorStats>> {
        let conn = self.conn.lock().unwrap();

        let base: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT id, username FROM authors WHERE id = ?1",
                [author_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((id, username)) = base else {
            return Ok(None);
        };

        let watch_usage = conn
            .prepare(
                "SELECT watch_name, count, last_used FROM author_watch_usage
                 WHERE author_id = ?1 ORDER BY watch_name ASC",
            )?
            .query_map([author_id], |row| {
                Ok(WatchUsage {
                    watch_name: row.get(0)?,
                    count: row.get(1)?,
                    last_used: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let hashtag_usage = conn
            .prepare(
                "SELECT tag, count, last_used FROM author_hashtag_usage
                 WHERE author_id = ?1 ORDER BY tag ASC",
            )?
            .query_map([author_id], |row| {
                Ok(HashtagUsage {
                    tag: row.get(0)?,
                    count: row.get(1)?,
                    last_used: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let tweet_scores = conn
            .prepare(
                "SELECT watch_name, score_sum FROM author_watch_scores
                 WHERE author_id = ?1 ORDER BY watch_name ASC",
            )?
            .query_map([author_id], |row| {
                Ok(WatchScore {
                    watch_name: row.get(0)?,
                    score_sum: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(Some(AuthorStats {
            id,
            username,
            watch_usage,
            hashtag_usage,
            tweet_scores,
        }))
    }

    /// Current cumulative score sum for one (author, watch) pair.
    pub fn watch_score(&self, author_id: &str, watch_name: &str) -> SqliteResult<i64> {
        let conn = self.conn.lock().unwrap();
        let sum: Option<i64> = conn
            .query_row(
                "SELECT score_sum FROM author_watch_scores
                 WHERE author_id = ?1 AND watch_name = ?2",
                rusqlite::params![author_id, watch_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(sum.unwrap_or(0))
    }

    // =====================================================
    // Statistics Rollup
    // =====================================================

    /// Roll every unmarked record in the closed ID interval into its author's
    /// aggregates, once per record. Each record commits atomically with its
    /// marker, so a re-run over an overlapping range counts nothing twice.
    pub fn rollup_author_stats(
        &self,
        watch_name: &str,
        oldest_id: &str,
        newest_id: &str,
    ) -> Result<usize, IngestError> {
        let mut conn = self.conn.lock().unwrap();

        struct RollupRow {
            id: String,
            author_id: Option<String>,
            created_at: Option<String>,
            hashtags: Vec<String>,
            tweet_score: i64,
        }

        let rows: Vec<RollupRow> = {
            let mut stmt = conn.prepare(
                "SELECT id, author_id, created_at, hashtags_json, tweet_score FROM records
                 WHERE stat_rolled_at IS NULL
                   AND CAST(id AS INTEGER) BETWEEN CAST(?1 AS INTEGER) AND CAST(?2 AS INTEGER)
                   AND EXISTS (SELECT 1 FROM json_each(records.requests_json)
                               WHERE json_each.value = ?3)
                 ORDER BY CAST(id AS INTEGER) ASC",
            )?;
            stmt.query_map(
                rusqlite::params![oldest_id, newest_id, watch_name],
                |row| {
                    Ok(RollupRow {
                        id: row.get(0)?,
                        author_id: row.get(1)?,
                        created_at: row.get(2)?,
                        hashtags: parse_json_vec(&row.get::<_, String>(3)?),
                        tweet_score: row.get(4)?,
                    })
                },
            )?
            .filter_map(|r| r.ok())
            .collect()
        };

        let mut rolled = 0;
        for row in rows {
            let Some(author_id) = row.author_id else {
                continue;
            };
            let now = now_iso();
            let tx = conn.transaction()?;

            // Claim the marker first; losing the claim means another pass
            // already counted this record.
            let changed = tx.execute(
                "UPDATE records SET stat_rolled_at = ?1 WHERE id = ?2 AND stat_rolled_at IS NULL",
                rusqlite::params![now, row.id],
            )?;
            if changed == 0 {
                continue;
            }

            // Authors are created lazily on first authored record
            tx.execute(
                "INSERT INTO authors (id, created_at, updated_at) VALUES (?1, ?2, ?2)
                 ON CONFLICT(id) DO NOTHING",
                rusqlite::params![author_id, now],
            )?;

            tx.execute(
                "INSERT INTO author_watch_usage (author_id, watch_name, count, last_used)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(author_id, watch_name) DO UPDATE SET
                    count = count + 1, last_used = excluded.last_used",
                rusqlite::params![author_id, watch_name, row.created_at],
            )?;

            let mut seen_tags: Vec<&str> = Vec::new();
            for tag in &row.hashtags {
                if seen_tags.contains(&tag.as_str()) {
                    continue;
                }
                seen_tags.push(tag);
                tx.execute(
                    "INSERT INTO author_hashtag_usage (author_id, tag, count, last_used)
                     VALUES (?1, ?2, 1, ?3)
                     ON CONFLICT(author_id, tag) DO UPDATE SET
                        count = count + 1, last_used = excluded.last_used",
                    rusqlite::params![author_id, tag, row.created_at],
                )?;
            }

            tx.execute(
                "INSERT INTO author_watch_scores (author_id, watch_name, score_sum)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(author_id, watch_name) DO UPDATE SET
                    score_sum = score_sum + excluded.score_sum",
                rusqlite::params![author_id, watch_name, row.tweet_score],
            )?;

            tx.commit()?;
            rolled += 1;
        }

        Ok(rolled)
    }

    // =====================================================
    // Maintenance Support
    // =====================================================

    /// Oldest record for a watch that is strictly older than `since_id` and
    /// no older than the window start. The refresh floor.
    pub fn oldest_record_in_window(
        &self,
        watch_name: &str,
        since_id: &str,
        window_start: &str,
    ) -> SqliteResult<Option<StoredRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.prepare(&format!(
            "{RECORD_SELECT}
             WHERE EXISTS (SELECT 1 FROM json_each(records.requests_json)
                           WHERE json_each.value = ?1)
               AND CAST(id AS INTEGER) < CAST(?2 AS INTEGER)
               AND created_at >= ?3
             ORDER BY CAST(id AS INTEGER) ASC
             LIMIT 1"
        ))?
        .query_row(
            rusqlite::params![watch_name, since_id, window_start],
            row_to_record,
        )
        .optional()
    }

    /// Atomic increment of an author's per-watch score sum.
    pub fn apply_score_delta(
        &self,
        author_id: &str,
        watch_name: &str,
        delta: i64,
    ) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO author_watch_scores (author_id, watch_name, score_sum)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(author_id, watch_name) DO UPDATE SET
                score_sum = score_sum + excluded.score_sum",
            rusqlite::params![author_id, watch_name, delta],
        )?;
        Ok(())
    }

    /// Overwrite a record's volatile metrics, score, and synergy. Leaves the
    /// watch tags, enrichment, and rollup marker untouched.
    pub fn refresh_record(&self, t: &Tweet, tweet_score: i64, synergy: f64) -> SqliteResult<()> {
        let conn = self.conn.lock().unwrap();
        let m = t.public_metrics.clone().unwrap_or_default();
        conn.execute(
            "INSERT INTO records (id, author_id, text, created_at, like_count, reply_count,
                retweet_count, quote_count, tweet_score, synergy)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                like_count = excluded.like_count,
                reply_count = excluded.reply_count,
                retweet_count = excluded.retweet_count,
                quote_count = excluded.quote_count,
                tweet_score = excluded.tweet_score,
                synergy = excluded.synergy",
            rusqlite::params![
                t.id,
                t.author_id,
                t.text,
                t.created_at,
                m.like_count.unwrap_or(0),
                m.reply_count.unwrap_or(0),
                m.retweet_count.unwrap_or(0),
                m.quote_count.unwrap_or(0),
                tweet_score,
                synergy,
            ],
        )?;
        Ok(())
    }

    // =====================================================
    // Service Stats
    // =====================================================

    pub fn get_service_stats(&self) -> SqliteResult<(i64, i64, i64, i64)> {
        let conn = self.conn.lock().unwrap();
        let watches: i64 =
            conn.query_row("SELECT COUNT(*) FROM watch_configs", [], |row| row.get(0))?;
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM watch_configs WHERE active = 1",
            [],
            |row| row.get(0),
        )?;
        let records: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        let authors: i64 = conn.query_row("SELECT COUNT(*) FROM authors", [], |row| row.get(0))?;
        Ok((watches, active, records, authors))
    }
}

/// Additive set-union of a watch name into a row's `requests_json`.
fn union_tag(
    tx: &rusqlite::Transaction,
    table: &str,
    key_col: &str,
    key: &str,
    watch_name: &str,
) -> SqliteResult<()> {
    let current: String = tx.query_row(
        &format!("SELECT requests_json FROM {table} WHERE {key_col} = ?1"),
        [key],
        |row| row.get(0),
    )?;
    let mut set = parse_json_vec(&current);
    if set.iter().any(|w| w == watch_name) {
        return Ok(());
    }
    set.push(watch_name.to_string());
    tx.execute(
        &format!("UPDATE {table} SET requests_json = ?1 WHERE {key_col} = ?2"),
        rusqlite::params![json_vec(&set), key],
    )?;
    Ok(())
}

// =====================================================
// Row Mapping
// =====================================================

const RECORD_SELECT: &str = "SELECT id, author_id, author_username, text, created_at,
    like_count, reply_count, retweet_count, quote_count, hashtags_json, media_keys_json,
    tweet_score, synergy, tweet_html, requests_json, stat_rolled_at, captured_at FROM records";

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<StoredRecord> {
    Ok(StoredRecord {
        id: row.get(0)?,
        author_id: row.get(1)?,
        author_username: row.get(2)?,
        text: row.get(3)?,
        created_at: row.get(4)?,
        like_count: row.get(5)?,
        reply_count: row.get(6)?,
        retweet_count: row.get(7)?,
        quote_count: row.get(8)?,
        hashtags: parse_json_vec(&row.get::<_, String>(9)?),
        media_keys: parse_json_vec(&row.get::<_, String>(10)?),
        tweet_score: row.get(11)?,
        synergy: row.get(12)?,
        tweet_html: row.get(13)?,
        requests: parse_json_vec(&row.get::<_, String>(14)?),
        stat_rolled_at: row.get(15)?,
        captured_at: row.get(16)?,
    })
}

fn row_to_watch(row: &rusqlite::Row) -> rusqlite::Result<WatchConfig> {
    Ok(WatchConfig {
        name: row.get(0)?,
        query: row.get(1)?,
        parameters: row.get(2)?,
        since_id: row.get(3)?,
        maintenance_delta_hours: row.get(4)?,
        max_results: row.get(5)?,
        active: row.get(6)?,
        status: row.get(7)?,
        first_run_completed: row.get(8)?,
        kill_switch: row.get(9)?,
        last_pull_started: row.get(10)?,
        last_pull_finished: row.get(11)?,
        last_pull_count: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Db {
        Db::open(":memory:").unwrap()
    }

    fn add_watch(db: &Db, name: &str) {
        db.add_watch(&AddWatchRequest {
            name: name.to_string(),
            query: "#rustlang".to_string(),
            parameters: None,
            maintenance_delta_hours: Some(48),
            max_results: None,
        })
        .unwrap();
    }

    fn record(id: &str, author: &str, score: i64, tags: &[&str]) -> NewRecord {
        NewRecord {
            id: id.to_string(),
            author_id: Some(author.to_string()),
            author_username: Some("alice".to_string()),
            text: "hello".to_string(),
            created_at: Some("2024-01-01T12:00:00.000Z".to_string()),
            like_count: 0,
            reply_count: 0,
            retweet_count: 0,
            quote_count: 0,
            hashtags: tags.iter().map(|t| t.to_string()).collect(),
            media_keys: Vec::new(),
            tweet_score: score,
            synergy: 0.0,
            tweet_html: None,
        }
    }

    #[test]
    fn test_id_newer() {
        assert!(id_newer("200", "100"));
        assert!(!id_newer("100", "200"));
        assert!(!id_newer("100", "100"));
        // Fallback ordering for non-numeric IDs
        assert!(id_newer("zz", "aa"));
        assert!(id_newer("100a", "99a"));
    }

    #[test]
    fn test_upsert_twice_is_idempotent() {
        let db = test_db();
        let r = record("100", "a1", 5, &[]);
        db.upsert_records(&[r.clone()], "w1").unwrap();
        db.upsert_records(&[r], "w1").unwrap();

        let stored = db.get_record("100").unwrap().unwrap();
        assert_eq!(stored.tweet_score, 5);
        assert_eq!(stored.requests, vec!["w1"]);
    }

    #[test]
    fn test_watch_tag_is_union_not_replacement() {
        let db = test_db();
        let r = record("100", "a1", 5, &[]);
        db.upsert_records(&[r.clone()], "w1").unwrap();
        db.upsert_records(&[r], "w2").unwrap();

        let stored = db.get_record("100").unwrap().unwrap();
        assert_eq!(stored.requests, vec!["w1", "w2"]);
    }

    #[test]
    fn test_upsert_does_not_clobber_enrichment_with_none() {
        let db = test_db();
        let mut r = record("100", "a1", 5, &[]);
        r.tweet_html = Some("<blockquote>x</blockquote>".to_string());
        db.upsert_records(&[r.clone()], "w1").unwrap();

        r.tweet_html = None;
        db.upsert_records(&[r], "w1").unwrap();

        let stored = db.get_record("100").unwrap().unwrap();
        assert_eq!(stored.tweet_html.as_deref(), Some("<blockquote>x</blockquote>"));
    }

    #[test]
    fn test_rollup_counts_each_record_once() {
        let db = test_db();
        add_watch(&db, "w1");
        db.upsert_records(
            &[record("100", "a1", 10, &["rust"]), record("101", "a1", 0, &[])],
            "w1",
        )
        .unwrap();

        let rolled = db.rollup_author_stats("w1", "100", "101").unwrap();
        assert_eq!(rolled, 2);
        assert_eq!(db.watch_score("a1", "w1").unwrap(), 10);

        let stats = db.get_author_stats("a1").unwrap().unwrap();
        assert_eq!(stats.watch_usage.len(), 1);
        assert_eq!(stats.watch_usage[0].count, 2);
        assert_eq!(stats.hashtag_usage.len(), 1);
        assert_eq!(stats.hashtag_usage[0].tag, "rust");
        assert_eq!(stats.hashtag_usage[0].count, 1);

        // Re-running the pass over the same range changes nothing
        let rolled = db.rollup_author_stats("w1", "100", "101").unwrap();
        assert_eq!(rolled, 0);
        assert_eq!(db.watch_score("a1", "w1").unwrap(), 10);
        let stats = db.get_author_stats("a1").unwrap().unwrap();
        assert_eq!(stats.watch_usage[0].count, 2);
    }

    #[test]
    fn test_rollup_scoped_to_watch_and_range() {
        let db = test_db();
        add_watch(&db, "w1");
        db.upsert_records(&[record("100", "a1", 7, &[])], "w1").unwrap();
        db.upsert_records(&[record("200", "a1", 9, &[])], "other").unwrap();
        db.upsert_records(&[record("300", "a1", 11, &[])], "w1").unwrap();

        // Record 200 is another watch's; record 300 is outside the range
        let rolled = db.rollup_author_stats("w1", "100", "250").unwrap();
        assert_eq!(rolled, 1);
        assert_eq!(db.watch_score("a1", "w1").unwrap(), 7);
    }

    #[test]
    fn test_score_delta_is_additive() {
        let db = test_db();
        db.apply_score_delta("a1", "w1", 5).unwrap();
        db.apply_score_delta("a1", "w1", 3).unwrap();
        assert_eq!(db.watch_score("a1", "w1").unwrap(), 8);
        db.apply_score_delta("a1", "w1", -2).unwrap();
        assert_eq!(db.watch_score("a1", "w1").unwrap(), 6);
    }

    #[test]
    fn test_oldest_record_in_window_bounds() {
        let db = test_db();
        // Too old for the window
        let mut stale = record("100", "a1", 0, &[]);
        stale.created_at = Some("2023-01-01T00:00:00.000Z".to_string());
        // Inside the window
        let mut fresh = record("200", "a1", 0, &[]);
        fresh.created_at = Some("2024-01-02T00:00:00.000Z".to_string());
        // At the cursor: excluded
        let mut at_cursor = record("300", "a1", 0, &[]);
        at_cursor.created_at = Some("2024-01-02T06:00:00.000Z".to_string());
        db.upsert_records(&[stale, fresh, at_cursor], "w1").unwrap();

        let floor = db
            .oldest_record_in_window("w1", "300", "2024-01-01T00:00:00.000Z")
            .unwrap();
        assert_eq!(floor.unwrap().id, "200");

        // Nothing inside the window is not an error
        let floor = db
            .oldest_record_in_window("w1", "300", "2024-06-01T00:00:00.000Z")
            .unwrap();
        assert!(floor.is_none());
    }

    #[test]
    fn test_since_id_only_moves_forward() {
        let db = test_db();
        add_watch(&db, "w1");
        db.advance_since_id("w1", "200").unwrap();
        db.advance_since_id("w1", "150").unwrap();
        let watch = db.get_watch("w1").unwrap().unwrap();
        assert_eq!(watch.since_id.as_deref(), Some("200"));

        db.advance_since_id("w1", "300").unwrap();
        let watch = db.get_watch("w1").unwrap().unwrap();
        assert_eq!(watch.since_id.as_deref(), Some("300"));
    }

    #[test]
    fn test_media_upsert_and_tag_union() {
        let db = test_db();
        let m = ApiMedia {
            media_key: "m1".to_string(),
            media_type: Some("photo".to_string()),
            url: Some("https://example.com/m1.jpg".to_string()),
            hashtags: vec!["rust".to_string()],
        };
        db.upsert_media(&[m.clone()], "w1").unwrap();
        db.upsert_media(&[m], "w2").unwrap();

        let stored = db.get_media("m1").unwrap().unwrap();
        assert_eq!(stored.hashtags, vec!["rust"]);
        assert_eq!(stored.requests, vec!["w1", "w2"]);
    }
}
