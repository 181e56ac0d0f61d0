use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Idempotent. Timestamps are fixed-width RFC 3339 UTC strings with
/// millisecond precision, so `<=` on the text columns is chronological.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cron_jobs (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL,
            enabled     INTEGER NOT NULL DEFAULT 1,
            schedule    TEXT    NOT NULL,   -- cron expression
            timezone    TEXT,               -- IANA name or NULL for the default
            jitter_ms   INTEGER NOT NULL DEFAULT 0,
            not_before  TEXT,
            not_after   TEXT,
            catchup     INTEGER NOT NULL DEFAULT 0,
            concurrency TEXT    NOT NULL DEFAULT 'allow',
            action      TEXT    NOT NULL DEFAULT 'null',   -- opaque JSON payload
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS cron_schedules (
            job_id          TEXT NOT NULL PRIMARY KEY,
            next_due        TEXT,           -- NULL once the window is exhausted
            last_scheduled  TEXT,
            last_attempt    TEXT,
            last_success    TEXT,
            updated_at      TEXT NOT NULL
        ) STRICT;

        -- Due polling: SELECT … WHERE next_due <= ?
        CREATE INDEX IF NOT EXISTS idx_cron_schedules_next_due
            ON cron_schedules (next_due);

        CREATE TABLE IF NOT EXISTS cron_runs (
            id              TEXT    NOT NULL PRIMARY KEY,
            job_id          TEXT    NOT NULL,
            scheduled_at    TEXT    NOT NULL,
            manual          INTEGER NOT NULL DEFAULT 0,   -- operator run-now
            attempt         INTEGER NOT NULL DEFAULT 0,
            state           TEXT    NOT NULL DEFAULT 'due',
            started_at      TEXT,
            completed_at    TEXT,
            error_code      TEXT,
            error_message   TEXT,
            resource_usage  TEXT    NOT NULL DEFAULT '{}',   -- JSON ResourceUsage
            created_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_cron_runs_job
            ON cron_runs (job_id, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_cron_runs_state
            ON cron_runs (state);
        ",
    )?;
    Ok(())
}
