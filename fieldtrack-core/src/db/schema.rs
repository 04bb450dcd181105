//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: sample log with sync bookkeeping, session rows
    r#"
    -- ============================================
    -- Sample log (append-mostly, keyed by capture time)
    -- ============================================

    CREATE TABLE IF NOT EXISTS location_samples (
        captured_at      INTEGER PRIMARY KEY,   -- Unix milliseconds
        latitude         REAL NOT NULL,
        longitude        REAL NOT NULL,
        accuracy         REAL NOT NULL,
        agent_id         TEXT NOT NULL,
        attendance_id    TEXT NOT NULL,
        session_id       TEXT NOT NULL,
        task_id          TEXT,
        kind             TEXT NOT NULL,
        comment          TEXT,
        cluster_id       TEXT,
        synced           INTEGER NOT NULL DEFAULT 0,
        sync_rejections  INTEGER NOT NULL DEFAULT 0,
        last_sync_error  TEXT,
        abandoned        INTEGER NOT NULL DEFAULT 0   -- left out of flushes, never synced
    );

    CREATE TABLE IF NOT EXISTS tracking_sessions (
        id               TEXT PRIMARY KEY,
        agent_id         TEXT NOT NULL,
        attendance_id    TEXT NOT NULL,
        task_id          TEXT,
        kind             TEXT NOT NULL,
        comment          TEXT,
        started_at       DATETIME NOT NULL,
        stopped_at       DATETIME
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_samples_pending
        ON location_samples(captured_at) WHERE synced = 0 AND abandoned = 0;
    CREATE INDEX IF NOT EXISTS idx_samples_agent
        ON location_samples(agent_id, captured_at);
    CREATE INDEX IF NOT EXISTS idx_tracking_sessions_agent
        ON tracking_sessions(agent_id, started_at DESC);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["location_samples", "tracking_sessions"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_new_samples_start_unjudged() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO location_samples
                (captured_at, latitude, longitude, accuracy, agent_id, attendance_id, session_id, kind)
             VALUES (1000, 1.0, 2.0, 5.0, '7', '42', 's', 'route_point')",
            [],
        )
        .unwrap();

        let (synced, rejections, abandoned): (i64, i64, i64) = conn
            .query_row(
                "SELECT synced, sync_rejections, abandoned FROM location_samples WHERE captured_at = 1000",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((synced, rejections, abandoned), (0, 0, 0));
    }
}
