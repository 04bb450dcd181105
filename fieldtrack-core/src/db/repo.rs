//! Local sample store
//!
//! Durable log of accepted samples keyed by `captured_at` (Unix milliseconds).
//! Records are never deleted here; the only mutations after insert are the
//! sync flag and the rejection bookkeeping.

use crate::error::{Error, Result};
use crate::types::{LocationSample, SampleKind, TrackingSession};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SAMPLE_COLUMNS: &str = "captured_at, latitude, longitude, accuracy, agent_id, attendance_id, \
     session_id, task_id, kind, comment, cluster_id, synced, sync_rejections, last_sync_error";

/// An unsynced sample together with its sync bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsyncedRecord {
    pub sample: LocationSample,
    /// Explicit rejections received so far
    pub sync_rejections: u32,
    /// Message attached to the most recent rejection
    pub last_sync_error: Option<String>,
}

/// Result of recording a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectionOutcome {
    pub rejections: u32,
    /// The record reached the abandon threshold and leaves the flush scan
    pub abandoned: bool,
}

/// Row counts for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_samples: i64,
    /// Unsynced and still eligible for flushing
    pub unsynced: i64,
    pub abandoned: i64,
    pub sessions: i64,
}

/// SQLite-backed sample store (single connection)
pub struct LocalStore {
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Open or create a store at the given path and bring its schema up to date
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL keeps the sync reader from blocking the sampler's appends;
        // FULL sync so a committed sample survives power loss
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        super::schema::run_migrations(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sample store lock poisoned".to_string()))
    }

    // ============================================
    // Sample operations
    // ============================================

    /// Persist an accepted sample.
    ///
    /// Any failure, including a duplicate `captured_at`, is reported as
    /// [`Error::Write`]; nothing is silently dropped.
    pub fn append(&self, sample: &LocationSample) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO location_samples (captured_at, latitude, longitude, accuracy, agent_id,
                                          attendance_id, session_id, task_id, kind, comment,
                                          cluster_id, synced)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                sample.captured_at.timestamp_millis(),
                sample.latitude,
                sample.longitude,
                sample.accuracy,
                sample.agent_id,
                sample.attendance_id,
                sample.session_id,
                sample.task_id,
                sample.kind.as_str(),
                sample.comment,
                sample.cluster_id,
                sample.synced,
            ],
        )
        .map_err(|source| Error::Write {
            captured_at: sample.captured_at,
            source,
        })?;
        Ok(())
    }

    /// Flag a record as synced.
    ///
    /// Returns `true` only when this call flipped the flag; already-synced or
    /// unknown keys are a no-op.
    pub fn mark_synced(&self, captured_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE location_samples SET synced = 1 WHERE captured_at = ?1 AND synced = 0",
            [captured_at.timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    /// Count an explicit remote rejection against a record.
    ///
    /// When `abandon_after` is set and the counter reaches it, the record is
    /// flagged abandoned and no longer returned by unsynced scans.
    pub fn record_rejection(
        &self,
        captured_at: DateTime<Utc>,
        message: &str,
        abandon_after: Option<u32>,
    ) -> Result<RejectionOutcome> {
        let conn = self.lock()?;
        let key = captured_at.timestamp_millis();

        conn.execute(
            r#"
            UPDATE location_samples
            SET sync_rejections = sync_rejections + 1,
                last_sync_error = ?2,
                abandoned = CASE WHEN ?3 IS NOT NULL AND sync_rejections + 1 >= ?3 THEN 1 ELSE abandoned END
            WHERE captured_at = ?1 AND synced = 0
            "#,
            params![key, message, abandon_after],
        )?;

        let outcome = conn
            .query_row(
                "SELECT sync_rejections, abandoned FROM location_samples WHERE captured_at = ?1",
                [key],
                |row| {
                    Ok(RejectionOutcome {
                        rejections: row.get(0)?,
                        abandoned: row.get(1)?,
                    })
                },
            )
            .optional()?;

        Ok(outcome.unwrap_or(RejectionOutcome {
            rejections: 0,
            abandoned: false,
        }))
    }

    /// Lazy iterator over unsynced, non-abandoned records with
    /// `captured_at >= since`, oldest first, loaded `page_size` at a time.
    pub fn unsynced_since(&self, since: DateTime<Utc>, page_size: usize) -> UnsyncedCursor<'_> {
        UnsyncedCursor {
            store: self,
            since_ms: since.timestamp_millis(),
            after_ms: None,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Unsynced records with `captured_at >= since`, oldest first.
    pub fn scan_unsynced(&self, since: DateTime<Utc>) -> Result<Vec<LocationSample>> {
        self.unsynced_since(since, 500)
            .map(|record| record.map(|r| r.sample))
            .collect()
    }

    fn fetch_unsynced_page(
        &self,
        since_ms: i64,
        after_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UnsyncedRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {SAMPLE_COLUMNS}
            FROM location_samples
            WHERE synced = 0 AND abandoned = 0
              AND captured_at >= ?1
              AND (?2 IS NULL OR captured_at > ?2)
            ORDER BY captured_at ASC
            LIMIT ?3
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![since_ms, after_ms, limit as i64], |row| {
                Ok(UnsyncedRecord {
                    sample: Self::row_to_sample(row)?,
                    sync_rejections: row.get("sync_rejections")?,
                    last_sync_error: row.get("last_sync_error")?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Every sample recorded for an agent, oldest first.
    pub fn scan_all(&self, agent_id: &str) -> Result<Vec<LocationSample>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {SAMPLE_COLUMNS} FROM location_samples WHERE agent_id = ?1 ORDER BY captured_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let samples = stmt
            .query_map([agent_id], Self::row_to_sample)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    /// Samples for an agent with `from <= captured_at < to`, oldest first.
    pub fn scan_range(
        &self,
        agent_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LocationSample>> {
        let conn = self.lock()?;
        let sql = format!(
            r#"
            SELECT {SAMPLE_COLUMNS}
            FROM location_samples
            WHERE agent_id = ?1 AND captured_at >= ?2 AND captured_at < ?3
            ORDER BY captured_at ASC
            "#
        );
        let mut stmt = conn.prepare(&sql)?;
        let samples = stmt
            .query_map(
                params![agent_id, from.timestamp_millis(), to.timestamp_millis()],
                Self::row_to_sample,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    /// Look up one sample by key
    pub fn get_sample(&self, captured_at: DateTime<Utc>) -> Result<Option<LocationSample>> {
        let conn = self.lock()?;
        let sql = format!("SELECT {SAMPLE_COLUMNS} FROM location_samples WHERE captured_at = ?1");
        conn.query_row(&sql, [captured_at.timestamp_millis()], Self::row_to_sample)
            .optional()
            .map_err(Into::into)
    }

    /// Most recent capture time in the store, if any
    pub fn latest_captured_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let ms: Option<i64> =
            conn.query_row("SELECT MAX(captured_at) FROM location_samples", [], |r| {
                r.get(0)
            })?;
        ms.map(millis_to_datetime).transpose().map_err(Into::into)
    }

    /// Unsynced records still eligible for flushing
    pub fn count_unsynced(&self) -> Result<i64> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM location_samples WHERE synced = 0 AND abandoned = 0",
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Row counts for diagnostics
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;
        let stats = conn.query_row(
            r#"
            SELECT
                (SELECT COUNT(*) FROM location_samples),
                (SELECT COUNT(*) FROM location_samples WHERE synced = 0 AND abandoned = 0),
                (SELECT COUNT(*) FROM location_samples WHERE abandoned = 1),
                (SELECT COUNT(*) FROM tracking_sessions)
            "#,
            [],
            |r| {
                Ok(StoreStats {
                    total_samples: r.get(0)?,
                    unsynced: r.get(1)?,
                    abandoned: r.get(2)?,
                    sessions: r.get(3)?,
                })
            },
        )?;
        Ok(stats)
    }

    fn row_to_sample(row: &Row) -> rusqlite::Result<LocationSample> {
        Ok(LocationSample {
            captured_at: millis_to_datetime(row.get("captured_at")?)?,
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
            accuracy: row.get("accuracy")?,
            agent_id: row.get("agent_id")?,
            attendance_id: row.get("attendance_id")?,
            session_id: row.get("session_id")?,
            task_id: row.get("task_id")?,
            kind: kind_column(row)?,
            comment: row.get("comment")?,
            cluster_id: row.get("cluster_id")?,
            synced: row.get("synced")?,
        })
    }

    // ============================================
    // Session operations
    // ============================================

    /// Record a session as started
    pub fn record_session_start(&self, session: &TrackingSession) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO tracking_sessions (id, agent_id, attendance_id, task_id, kind, comment,
                                           started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                session.session_id,
                session.agent_id,
                session.attendance_id,
                session.task_id,
                session.kind.as_str(),
                session.comment,
                session.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Stamp the stop time on a session row. Only the first stop is kept.
    pub fn record_session_stop(&self, session_id: &str, stopped_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tracking_sessions SET stopped_at = ?2 WHERE id = ?1 AND stopped_at IS NULL",
            params![session_id, stopped_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// The most recently started session and its stop time, if any
    pub fn latest_session(&self) -> Result<Option<(TrackingSession, Option<DateTime<Utc>>)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM tracking_sessions ORDER BY started_at DESC LIMIT 1",
            [],
            |row| {
                let stopped_str: Option<String> = row.get("stopped_at")?;
                let stopped_at = stopped_str
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                Ok((Self::row_to_session(row)?, stopped_at))
            },
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<TrackingSession> {
        let started_at_str: String = row.get("started_at")?;

        Ok(TrackingSession {
            session_id: row.get("id")?,
            agent_id: row.get("agent_id")?,
            attendance_id: row.get("attendance_id")?,
            task_id: row.get("task_id")?,
            kind: kind_column(row)?,
            comment: row.get("comment")?,
            started_at: DateTime::parse_from_rfc3339(&started_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
        })
    }
}

/// An unknown kind is an error: reading it as a route point would let it be
/// thinned or clustered away.
fn kind_column(row: &Row) -> rusqlite::Result<SampleKind> {
    let index = row.as_ref().column_index("kind")?;
    let value: String = row.get(index)?;
    value.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, e.into())
    })
}

fn millis_to_datetime(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

/// Keyset-paginated walk over unsynced records.
///
/// Each page is a fresh query positioned after the last key returned, so
/// records marked synced mid-walk are simply not seen again and no lock is
/// held between pages. [`UnsyncedCursor::rewind`] restarts from `since`.
pub struct UnsyncedCursor<'a> {
    store: &'a LocalStore,
    since_ms: i64,
    after_ms: Option<i64>,
    page_size: usize,
    buffer: VecDeque<UnsyncedRecord>,
    exhausted: bool,
}

impl UnsyncedCursor<'_> {
    /// Start over from the beginning of the range.
    pub fn rewind(&mut self) {
        self.after_ms = None;
        self.buffer.clear();
        self.exhausted = false;
    }
}

impl Iterator for UnsyncedCursor<'_> {
    type Item = Result<UnsyncedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self
                .store
                .fetch_unsynced_page(self.since_ms, self.after_ms, self.page_size)
            {
                Ok(page) => {
                    self.exhausted = page.len() < self.page_size;
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let record = self.buffer.pop_front()?;
        self.after_ms = Some(record.sample.captured_at.timestamp_millis());
        Some(Ok(record))
    }
}
