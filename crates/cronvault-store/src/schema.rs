//! Schema bootstrap and verification.
//!
//! Table names carry the configurable prefix via the `{0}` token. Instants
//! are INTEGER epoch milliseconds, flags are INTEGER 0/1, data maps and
//! calendars are BLOBs encoded by the dialect delegate.

use crate::delegate::{DriverDelegate, rtp};
use crate::lock::{LOCK_STATE_ACCESS, LOCK_TRIGGER_ACCESS};
use cronvault_core::{Result, StoreError};
use rusqlite::Connection;

const DDL: &str = "
    CREATE TABLE IF NOT EXISTS {0}JOB_DETAILS (
        JOB_NAME TEXT NOT NULL,
        JOB_GROUP TEXT NOT NULL,
        HANDLER TEXT NOT NULL,
        DESCRIPTION TEXT,
        IS_DURABLE INTEGER NOT NULL DEFAULT 1,
        REQUESTS_RECOVERY INTEGER NOT NULL DEFAULT 0,
        IS_CONCURRENT INTEGER NOT NULL DEFAULT 1,
        JOB_DATA BLOB NOT NULL,
        PRIMARY KEY (JOB_NAME, JOB_GROUP)
    );

    CREATE TABLE IF NOT EXISTS {0}TRIGGERS (
        TRIGGER_NAME TEXT NOT NULL,
        TRIGGER_GROUP TEXT NOT NULL,
        JOB_NAME TEXT NOT NULL,
        JOB_GROUP TEXT NOT NULL,
        DESCRIPTION TEXT,
        TRIGGER_TYPE TEXT NOT NULL,
        START_TIME INTEGER NOT NULL,
        NEXT_FIRE_TIME INTEGER,
        PREV_FIRE_TIME INTEGER,
        PRIORITY INTEGER NOT NULL DEFAULT 5,
        MISFIRE_POLICY TEXT NOT NULL,
        CALENDAR_NAME TEXT,
        TRIGGER_STATE TEXT NOT NULL,
        TRIGGER_DATA BLOB NOT NULL,
        PRIMARY KEY (TRIGGER_NAME, TRIGGER_GROUP)
    );
    CREATE INDEX IF NOT EXISTS {0}IDX_T_NEXT_FIRE
        ON {0}TRIGGERS (TRIGGER_STATE, NEXT_FIRE_TIME);
    CREATE INDEX IF NOT EXISTS {0}IDX_T_JOB
        ON {0}TRIGGERS (JOB_NAME, JOB_GROUP);

    CREATE TABLE IF NOT EXISTS {0}SIMPLE_TRIGGERS (
        TRIGGER_NAME TEXT NOT NULL,
        TRIGGER_GROUP TEXT NOT NULL,
        REPEAT_INTERVAL INTEGER NOT NULL,
        REPEAT_COUNT INTEGER NOT NULL,
        TIMES_TRIGGERED INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (TRIGGER_NAME, TRIGGER_GROUP)
    );

    CREATE TABLE IF NOT EXISTS {0}CRON_TRIGGERS (
        TRIGGER_NAME TEXT NOT NULL,
        TRIGGER_GROUP TEXT NOT NULL,
        CRON_EXPRESSION TEXT NOT NULL,
        PRIMARY KEY (TRIGGER_NAME, TRIGGER_GROUP)
    );

    CREATE TABLE IF NOT EXISTS {0}FIRED_TRIGGERS (
        FIRE_INSTANCE_ID TEXT PRIMARY KEY,
        TRIGGER_NAME TEXT NOT NULL,
        TRIGGER_GROUP TEXT NOT NULL,
        JOB_NAME TEXT NOT NULL,
        JOB_GROUP TEXT NOT NULL,
        INSTANCE_ID TEXT NOT NULL,
        FIRED_TIME INTEGER NOT NULL,
        SCHED_TIME INTEGER NOT NULL,
        STATE TEXT NOT NULL,
        REQUESTS_RECOVERY INTEGER NOT NULL DEFAULT 0,
        IS_CONCURRENT INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS {0}IDX_FT_INSTANCE
        ON {0}FIRED_TRIGGERS (INSTANCE_ID);
    CREATE INDEX IF NOT EXISTS {0}IDX_FT_JOB
        ON {0}FIRED_TRIGGERS (JOB_NAME, JOB_GROUP, STATE);

    CREATE TABLE IF NOT EXISTS {0}CALENDARS (
        CALENDAR_NAME TEXT PRIMARY KEY,
        CALENDAR BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS {0}SCHEDULER_STATE (
        INSTANCE_ID TEXT PRIMARY KEY,
        LAST_CHECKIN_TIME INTEGER NOT NULL,
        CHECKIN_INTERVAL INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS {0}LOCKS (
        LOCK_NAME TEXT PRIMARY KEY,
        OWNER TEXT NOT NULL DEFAULT ''
    );
";

/// Tables probed by [`verify`]; a missing one is fatal at startup.
const TABLES: &[&str] = &[
    "JOB_DETAILS",
    "TRIGGERS",
    "SIMPLE_TRIGGERS",
    "CRON_TRIGGERS",
    "FIRED_TRIGGERS",
    "CALENDARS",
    "SCHEDULER_STATE",
    "LOCKS",
];

/// Create the schema and seed the cluster lock rows.
pub fn bootstrap(
    conn: &Connection,
    delegate: &dyn DriverDelegate,
    table_prefix: &str,
) -> Result<()> {
    conn.execute_batch(&rtp(DDL, table_prefix))
        .map_err(|e| StoreError::Fatal(format!("schema migration: {e}")))?;

    for lock in [LOCK_TRIGGER_ACCESS, LOCK_STATE_ACCESS] {
        let seeded = conn.execute(&rtp(delegate.insert_lock_row_sql(), table_prefix), [lock]);
        match seeded {
            Ok(_) => {}
            // Another instance seeded the row first.
            Err(rusqlite::Error::SqliteFailure(f, _))
                if f.code == rusqlite::ErrorCode::ConstraintViolation => {}
            Err(e) => return Err(StoreError::Fatal(format!("lock row seed: {e}"))),
        }
    }
    Ok(())
}

/// Probe each table with a trivial select; schema absence aborts instance
/// initialization rather than surfacing later as loop noise.
pub fn verify(conn: &Connection, table_prefix: &str) -> Result<()> {
    for table in TABLES {
        let probe = format!("SELECT COUNT(*) FROM {table_prefix}{table}");
        conn.query_row(&probe, [], |row| row.get::<_, i64>(0))
            .map_err(|e| {
                StoreError::Fatal(format!("schema check failed for {table_prefix}{table}: {e}"))
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::SqliteDelegate;

    #[test]
    fn test_bootstrap_and_verify() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn, &SqliteDelegate, "CV_").unwrap();
        verify(&conn, "CV_").unwrap();

        // Lock rows are seeded unowned.
        let owner: String = conn
            .query_row(
                "SELECT OWNER FROM CV_LOCKS WHERE LOCK_NAME = ?1",
                [LOCK_TRIGGER_ACCESS],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(owner, "");
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn, &SqliteDelegate, "CV_").unwrap();
        bootstrap(&conn, &SqliteDelegate, "CV_").unwrap();
        let locks: i64 = conn
            .query_row("SELECT COUNT(*) FROM CV_LOCKS", [], |row| row.get(0))
            .unwrap();
        assert_eq!(locks, 2);
    }

    #[test]
    fn test_verify_rejects_missing_schema() {
        let conn = Connection::open_in_memory().unwrap();
        let err = verify(&conn, "CV_").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_two_prefixes_share_one_database() {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn, &SqliteDelegate, "A_").unwrap();
        bootstrap(&conn, &SqliteDelegate, "B_").unwrap();
        verify(&conn, "A_").unwrap();
        verify(&conn, "B_").unwrap();
    }
}
