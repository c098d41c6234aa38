use rusqlite::Connection;

use crate::error::Result;

/// Initialise the workflow schema in `conn`.
///
/// Creates the `workflow_instances` table, the `workflow_steps` journal, the
/// `undelivered_reminders` log and an index on `(status, wake_at)` so the
/// polling query stays cheap.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS workflow_instances (
            handle            TEXT    NOT NULL PRIMARY KEY,
            subscription_id   TEXT    NOT NULL,
            target            TEXT    NOT NULL,
            status            TEXT    NOT NULL DEFAULT 'pending',
            wake_at           TEXT,               -- RFC3339 millis or NULL
            current_step      TEXT,
            cancel_requested  INTEGER NOT NULL DEFAULT 0,
            detail            TEXT,
            retry_count       INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL
        ) STRICT;

        -- Polling: SELECT … WHERE status IN (…) AND wake_at <= ?
        CREATE INDEX IF NOT EXISTS idx_instances_wake
            ON workflow_instances (status, wake_at);
        CREATE INDEX IF NOT EXISTS idx_instances_subscription
            ON workflow_instances (subscription_id);

        CREATE TABLE IF NOT EXISTS workflow_steps (
            handle      TEXT NOT NULL,
            label       TEXT NOT NULL,
            state       TEXT NOT NULL,            -- started | completed
            output      TEXT,                     -- JSON, NULL while started
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (handle, label)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS undelivered_reminders (
            handle           TEXT NOT NULL,
            checkpoint       TEXT NOT NULL,
            subscription_id  TEXT NOT NULL,
            error            TEXT NOT NULL,
            recorded_at      TEXT NOT NULL,
            PRIMARY KEY (handle, checkpoint)
        ) STRICT;
        ",
    )?;
    Ok(())
}
