//! Dialect delegate: the capability interface between the store and a
//! database product.
//!
//! The store never embeds product-specific SQL: every statement it runs is
//! obtained from a [`DriverDelegate`], and every table name in a statement
//! carries the `{0}` prefix token, substituted once via [`rtp`]. The trait
//! ships standard-SQL defaults; a product delegate overrides only what the
//! product does differently (row locking, upsert-or-ignore syntax).

use chrono::{DateTime, Utc};
use cronvault_core::{Calendar, JobDataMap, Result, StoreError};

/// Replace the table prefix token in a query.
///
/// This is a literal find/replace of the single token `{0}`: it is not a
/// formatting language and is never used to inject anything beyond the
/// fixed prefix.
pub fn rtp(query: &str, table_prefix: &str) -> String {
    query.replace("{0}", table_prefix)
}

// ─── Standard statement templates ──────────────────────────────────────

const INSERT_JOB: &str = "INSERT INTO {0}JOB_DETAILS \
    (JOB_NAME, JOB_GROUP, HANDLER, DESCRIPTION, IS_DURABLE, REQUESTS_RECOVERY, IS_CONCURRENT, JOB_DATA) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";
const UPDATE_JOB: &str = "UPDATE {0}JOB_DETAILS SET \
    HANDLER = ?3, DESCRIPTION = ?4, IS_DURABLE = ?5, REQUESTS_RECOVERY = ?6, IS_CONCURRENT = ?7, JOB_DATA = ?8 \
    WHERE JOB_NAME = ?1 AND JOB_GROUP = ?2";
const SELECT_JOB: &str = "SELECT JOB_NAME, JOB_GROUP, HANDLER, DESCRIPTION, IS_DURABLE, \
    REQUESTS_RECOVERY, IS_CONCURRENT, JOB_DATA \
    FROM {0}JOB_DETAILS WHERE JOB_NAME = ?1 AND JOB_GROUP = ?2";
const DELETE_JOB: &str = "DELETE FROM {0}JOB_DETAILS WHERE JOB_NAME = ?1 AND JOB_GROUP = ?2";
const JOB_EXISTS: &str =
    "SELECT 1 FROM {0}JOB_DETAILS WHERE JOB_NAME = ?1 AND JOB_GROUP = ?2";
const COUNT_ACTIVE_TRIGGERS_FOR_JOB: &str = "SELECT COUNT(*) FROM {0}TRIGGERS \
    WHERE JOB_NAME = ?1 AND JOB_GROUP = ?2 AND TRIGGER_STATE NOT IN ('COMPLETE', 'ERROR')";

const INSERT_TRIGGER: &str = "INSERT INTO {0}TRIGGERS \
    (TRIGGER_NAME, TRIGGER_GROUP, JOB_NAME, JOB_GROUP, DESCRIPTION, TRIGGER_TYPE, START_TIME, \
     NEXT_FIRE_TIME, PREV_FIRE_TIME, PRIORITY, MISFIRE_POLICY, CALENDAR_NAME, TRIGGER_STATE, TRIGGER_DATA) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";
const UPDATE_TRIGGER: &str = "UPDATE {0}TRIGGERS SET \
    JOB_NAME = ?3, JOB_GROUP = ?4, DESCRIPTION = ?5, TRIGGER_TYPE = ?6, START_TIME = ?7, \
    NEXT_FIRE_TIME = ?8, PREV_FIRE_TIME = ?9, PRIORITY = ?10, MISFIRE_POLICY = ?11, \
    CALENDAR_NAME = ?12, TRIGGER_STATE = ?13, TRIGGER_DATA = ?14 \
    WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";
const SELECT_TRIGGER: &str = "SELECT TRIGGER_NAME, TRIGGER_GROUP, JOB_NAME, JOB_GROUP, DESCRIPTION, \
    TRIGGER_TYPE, START_TIME, NEXT_FIRE_TIME, PREV_FIRE_TIME, PRIORITY, MISFIRE_POLICY, \
    CALENDAR_NAME, TRIGGER_STATE, TRIGGER_DATA \
    FROM {0}TRIGGERS WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";
const DELETE_TRIGGER: &str =
    "DELETE FROM {0}TRIGGERS WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";
const SELECT_TRIGGER_STATE: &str =
    "SELECT TRIGGER_STATE FROM {0}TRIGGERS WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";
const UPDATE_TRIGGER_STATE_FROM: &str = "UPDATE {0}TRIGGERS SET TRIGGER_STATE = ?3 \
    WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2 AND TRIGGER_STATE = ?4";
const UPDATE_TRIGGER_STATES_FOR_JOB_FROM: &str = "UPDATE {0}TRIGGERS SET TRIGGER_STATE = ?3 \
    WHERE JOB_NAME = ?1 AND JOB_GROUP = ?2 AND TRIGGER_STATE = ?4";
const UPDATE_TRIGGER_FIRE_TIMES: &str = "UPDATE {0}TRIGGERS SET \
    NEXT_FIRE_TIME = ?3, PREV_FIRE_TIME = ?4, TRIGGER_STATE = ?5 \
    WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2 AND TRIGGER_STATE = ?6";
const SELECT_DUE_TRIGGERS: &str = "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {0}TRIGGERS \
    WHERE TRIGGER_STATE = ?1 AND NEXT_FIRE_TIME IS NOT NULL AND NEXT_FIRE_TIME <= ?2 \
    ORDER BY NEXT_FIRE_TIME ASC, PRIORITY DESC, TRIGGER_GROUP ASC, TRIGGER_NAME ASC LIMIT ?3";
const SELECT_TRIGGERS_FOR_JOB: &str =
    "SELECT TRIGGER_NAME, TRIGGER_GROUP FROM {0}TRIGGERS WHERE JOB_NAME = ?1 AND JOB_GROUP = ?2";
const SELECT_TRIGGER_GROUPS: &str =
    "SELECT DISTINCT TRIGGER_GROUP FROM {0}TRIGGERS ORDER BY TRIGGER_GROUP";
const SELECT_JOB_GROUPS: &str =
    "SELECT DISTINCT JOB_GROUP FROM {0}JOB_DETAILS ORDER BY JOB_GROUP";

const INSERT_SIMPLE_TRIGGER: &str = "INSERT INTO {0}SIMPLE_TRIGGERS \
    (TRIGGER_NAME, TRIGGER_GROUP, REPEAT_INTERVAL, REPEAT_COUNT, TIMES_TRIGGERED) \
    VALUES (?1, ?2, ?3, ?4, ?5)";
const SELECT_SIMPLE_TRIGGER: &str = "SELECT REPEAT_INTERVAL, REPEAT_COUNT, TIMES_TRIGGERED \
    FROM {0}SIMPLE_TRIGGERS WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";
const DELETE_SIMPLE_TRIGGER: &str =
    "DELETE FROM {0}SIMPLE_TRIGGERS WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";
const UPDATE_TIMES_TRIGGERED: &str = "UPDATE {0}SIMPLE_TRIGGERS SET TIMES_TRIGGERED = ?3 \
    WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";

const INSERT_CRON_TRIGGER: &str = "INSERT INTO {0}CRON_TRIGGERS \
    (TRIGGER_NAME, TRIGGER_GROUP, CRON_EXPRESSION) VALUES (?1, ?2, ?3)";
const SELECT_CRON_TRIGGER: &str = "SELECT CRON_EXPRESSION FROM {0}CRON_TRIGGERS \
    WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";
const DELETE_CRON_TRIGGER: &str =
    "DELETE FROM {0}CRON_TRIGGERS WHERE TRIGGER_NAME = ?1 AND TRIGGER_GROUP = ?2";

const INSERT_FIRED_TRIGGER: &str = "INSERT INTO {0}FIRED_TRIGGERS \
    (FIRE_INSTANCE_ID, TRIGGER_NAME, TRIGGER_GROUP, JOB_NAME, JOB_GROUP, INSTANCE_ID, \
     FIRED_TIME, SCHED_TIME, STATE, REQUESTS_RECOVERY, IS_CONCURRENT) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";
const SELECT_FIRED_TRIGGER: &str = "SELECT FIRE_INSTANCE_ID, TRIGGER_NAME, TRIGGER_GROUP, \
    JOB_NAME, JOB_GROUP, INSTANCE_ID, FIRED_TIME, SCHED_TIME, STATE, REQUESTS_RECOVERY, IS_CONCURRENT \
    FROM {0}FIRED_TRIGGERS WHERE FIRE_INSTANCE_ID = ?1";
const SELECT_FIRED_BY_INSTANCE: &str = "SELECT FIRE_INSTANCE_ID, TRIGGER_NAME, TRIGGER_GROUP, \
    JOB_NAME, JOB_GROUP, INSTANCE_ID, FIRED_TIME, SCHED_TIME, STATE, REQUESTS_RECOVERY, IS_CONCURRENT \
    FROM {0}FIRED_TRIGGERS WHERE INSTANCE_ID = ?1 ORDER BY FIRED_TIME ASC";
const UPDATE_FIRED_TRIGGER_STATE_FROM: &str = "UPDATE {0}FIRED_TRIGGERS SET STATE = ?2 \
    WHERE FIRE_INSTANCE_ID = ?1 AND STATE = ?3";
const DELETE_FIRED_TRIGGER: &str =
    "DELETE FROM {0}FIRED_TRIGGERS WHERE FIRE_INSTANCE_ID = ?1";
const COUNT_EXECUTING_FOR_JOB: &str = "SELECT COUNT(*) FROM {0}FIRED_TRIGGERS \
    WHERE JOB_NAME = ?1 AND JOB_GROUP = ?2 AND STATE = 'EXECUTING' AND FIRE_INSTANCE_ID <> ?3";

const INSERT_CALENDAR: &str =
    "INSERT INTO {0}CALENDARS (CALENDAR_NAME, CALENDAR) VALUES (?1, ?2)";
const UPDATE_CALENDAR: &str =
    "UPDATE {0}CALENDARS SET CALENDAR = ?2 WHERE CALENDAR_NAME = ?1";
const SELECT_CALENDAR: &str =
    "SELECT CALENDAR FROM {0}CALENDARS WHERE CALENDAR_NAME = ?1";
const DELETE_CALENDAR: &str = "DELETE FROM {0}CALENDARS WHERE CALENDAR_NAME = ?1";

const INSERT_SCHEDULER_STATE: &str = "INSERT INTO {0}SCHEDULER_STATE \
    (INSTANCE_ID, LAST_CHECKIN_TIME, CHECKIN_INTERVAL) VALUES (?1, ?2, ?3)";
const UPDATE_SCHEDULER_STATE: &str = "UPDATE {0}SCHEDULER_STATE SET \
    LAST_CHECKIN_TIME = ?2, CHECKIN_INTERVAL = ?3 WHERE INSTANCE_ID = ?1";
const SELECT_SCHEDULER_STATES: &str =
    "SELECT INSTANCE_ID, LAST_CHECKIN_TIME, CHECKIN_INTERVAL FROM {0}SCHEDULER_STATE";
const DELETE_SCHEDULER_STATE: &str =
    "DELETE FROM {0}SCHEDULER_STATE WHERE INSTANCE_ID = ?1";

const INSERT_LOCK_ROW: &str = "INSERT INTO {0}LOCKS (LOCK_NAME, OWNER) VALUES (?1, '')";
const INSERT_LOCK_ROW_SQLITE: &str =
    "INSERT OR IGNORE INTO {0}LOCKS (LOCK_NAME, OWNER) VALUES (?1, '')";
const SELECT_LOCK_FOR_UPDATE: &str =
    "SELECT LOCK_NAME FROM {0}LOCKS WHERE LOCK_NAME = ?1 FOR UPDATE";
const UPDATE_LOCK_CAS: &str = "UPDATE {0}LOCKS SET OWNER = ?1 \
    WHERE LOCK_NAME = ?2 AND (OWNER = '' OR OWNER = ?1)";
const RELEASE_LOCK: &str =
    "UPDATE {0}LOCKS SET OWNER = '' WHERE LOCK_NAME = ?1 AND OWNER = ?2";
const CLEAR_LOCKS_FOR_OWNER: &str = "UPDATE {0}LOCKS SET OWNER = '' WHERE OWNER = ?1";

/// Statement generation and value (de)serialization for one database
/// product. Defaults are standard SQL; override per product.
///
/// Every returned statement still contains the `{0}` prefix token: the
/// store applies [`rtp`] with its configured prefix before execution.
pub trait DriverDelegate: Send + Sync {
    // Jobs
    fn insert_job_sql(&self) -> &'static str {
        INSERT_JOB
    }
    fn update_job_sql(&self) -> &'static str {
        UPDATE_JOB
    }
    fn select_job_sql(&self) -> &'static str {
        SELECT_JOB
    }
    fn delete_job_sql(&self) -> &'static str {
        DELETE_JOB
    }
    fn job_exists_sql(&self) -> &'static str {
        JOB_EXISTS
    }
    fn count_active_triggers_for_job_sql(&self) -> &'static str {
        COUNT_ACTIVE_TRIGGERS_FOR_JOB
    }

    // Triggers
    fn insert_trigger_sql(&self) -> &'static str {
        INSERT_TRIGGER
    }
    fn update_trigger_sql(&self) -> &'static str {
        UPDATE_TRIGGER
    }
    fn select_trigger_sql(&self) -> &'static str {
        SELECT_TRIGGER
    }
    fn delete_trigger_sql(&self) -> &'static str {
        DELETE_TRIGGER
    }
    fn select_trigger_state_sql(&self) -> &'static str {
        SELECT_TRIGGER_STATE
    }
    fn update_trigger_state_from_sql(&self) -> &'static str {
        UPDATE_TRIGGER_STATE_FROM
    }
    fn update_trigger_states_for_job_from_sql(&self) -> &'static str {
        UPDATE_TRIGGER_STATES_FOR_JOB_FROM
    }
    fn update_trigger_fire_times_sql(&self) -> &'static str {
        UPDATE_TRIGGER_FIRE_TIMES
    }
    fn select_due_triggers_sql(&self) -> &'static str {
        SELECT_DUE_TRIGGERS
    }
    fn select_triggers_for_job_sql(&self) -> &'static str {
        SELECT_TRIGGERS_FOR_JOB
    }
    fn select_trigger_groups_sql(&self) -> &'static str {
        SELECT_TRIGGER_GROUPS
    }
    fn select_job_groups_sql(&self) -> &'static str {
        SELECT_JOB_GROUPS
    }

    // Trigger subtype tables
    fn insert_simple_trigger_sql(&self) -> &'static str {
        INSERT_SIMPLE_TRIGGER
    }
    fn select_simple_trigger_sql(&self) -> &'static str {
        SELECT_SIMPLE_TRIGGER
    }
    fn delete_simple_trigger_sql(&self) -> &'static str {
        DELETE_SIMPLE_TRIGGER
    }
    fn update_times_triggered_sql(&self) -> &'static str {
        UPDATE_TIMES_TRIGGERED
    }
    fn insert_cron_trigger_sql(&self) -> &'static str {
        INSERT_CRON_TRIGGER
    }
    fn select_cron_trigger_sql(&self) -> &'static str {
        SELECT_CRON_TRIGGER
    }
    fn delete_cron_trigger_sql(&self) -> &'static str {
        DELETE_CRON_TRIGGER
    }

    // Fired triggers
    fn insert_fired_trigger_sql(&self) -> &'static str {
        INSERT_FIRED_TRIGGER
    }
    fn select_fired_trigger_sql(&self) -> &'static str {
        SELECT_FIRED_TRIGGER
    }
    fn select_fired_by_instance_sql(&self) -> &'static str {
        SELECT_FIRED_BY_INSTANCE
    }
    fn update_fired_trigger_state_from_sql(&self) -> &'static str {
        UPDATE_FIRED_TRIGGER_STATE_FROM
    }
    fn delete_fired_trigger_sql(&self) -> &'static str {
        DELETE_FIRED_TRIGGER
    }
    fn count_executing_for_job_sql(&self) -> &'static str {
        COUNT_EXECUTING_FOR_JOB
    }

    // Calendars
    fn insert_calendar_sql(&self) -> &'static str {
        INSERT_CALENDAR
    }
    fn update_calendar_sql(&self) -> &'static str {
        UPDATE_CALENDAR
    }
    fn select_calendar_sql(&self) -> &'static str {
        SELECT_CALENDAR
    }
    fn delete_calendar_sql(&self) -> &'static str {
        DELETE_CALENDAR
    }

    // Scheduler state / check-in
    fn insert_scheduler_state_sql(&self) -> &'static str {
        INSERT_SCHEDULER_STATE
    }
    fn update_scheduler_state_sql(&self) -> &'static str {
        UPDATE_SCHEDULER_STATE
    }
    fn select_scheduler_states_sql(&self) -> &'static str {
        SELECT_SCHEDULER_STATES
    }
    fn delete_scheduler_state_sql(&self) -> &'static str {
        DELETE_SCHEDULER_STATE
    }

    // Locks
    fn insert_lock_row_sql(&self) -> &'static str {
        INSERT_LOCK_ROW
    }
    /// Row-locking statement for the lock table, or `None` when the
    /// product has no usable `SELECT … FOR UPDATE`. A `None` delegate must
    /// be paired with the update-semaphore lock handler.
    fn select_lock_for_update_sql(&self) -> Option<&'static str> {
        None
    }
    fn update_lock_cas_sql(&self) -> &'static str {
        UPDATE_LOCK_CAS
    }
    fn release_lock_sql(&self) -> &'static str {
        RELEASE_LOCK
    }
    fn clear_locks_for_owner_sql(&self) -> &'static str {
        CLEAR_LOCKS_FOR_OWNER
    }

    // Value (de)serialization
    fn encode_datamap(&self, data: &JobDataMap) -> Result<Vec<u8>> {
        serde_json::to_vec(data).map_err(|e| StoreError::Fatal(format!("data map encode: {e}")))
    }
    fn decode_datamap(&self, bytes: &[u8]) -> Result<JobDataMap> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Fatal(format!("data map decode: {e}")))
    }
    fn encode_calendar(&self, calendar: &Calendar) -> Result<Vec<u8>> {
        serde_json::to_vec(calendar)
            .map_err(|e| StoreError::Fatal(format!("calendar encode: {e}")))
    }
    fn decode_calendar(&self, bytes: &[u8]) -> Result<Calendar> {
        serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Fatal(format!("calendar decode: {e}")))
    }

    /// Instants are stored as epoch milliseconds.
    fn encode_instant(&self, t: DateTime<Utc>) -> i64 {
        t.timestamp_millis()
    }
    fn decode_instant(&self, millis: i64) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StoreError::Fatal(format!("corrupt instant: {millis}")))
    }
}

/// Generic ANSI-SQL delegate for products with `SELECT … FOR UPDATE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdSqlDelegate;

impl DriverDelegate for StdSqlDelegate {
    fn select_lock_for_update_sql(&self) -> Option<&'static str> {
        Some(SELECT_LOCK_FOR_UPDATE)
    }
}

/// SQLite delegate: no `FOR UPDATE`, upsert-or-ignore lock seeding.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDelegate;

impl DriverDelegate for SqliteDelegate {
    fn insert_lock_row_sql(&self) -> &'static str {
        INSERT_LOCK_ROW_SQLITE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_substitutes_single_token() {
        assert_eq!(
            rtp("SELECT * FROM {0}TRIGGERS", "CV_"),
            "SELECT * FROM CV_TRIGGERS"
        );
        // Every occurrence, but only the literal token: nothing else is
        // interpreted.
        assert_eq!(rtp("{0}A JOIN {0}B ON {1}", "X_"), "X_A JOIN X_B ON {1}");
        assert_eq!(rtp("no token here", "X_"), "no token here");
    }

    #[test]
    fn test_sqlite_delegate_has_no_row_lock() {
        assert!(SqliteDelegate.select_lock_for_update_sql().is_none());
        assert!(StdSqlDelegate.select_lock_for_update_sql().is_some());
    }

    #[test]
    fn test_datamap_codec_round_trip() {
        let mut data = JobDataMap::new();
        data.insert("a", 1);
        data.insert("b", "two");
        let bytes = SqliteDelegate.encode_datamap(&data).unwrap();
        assert_eq!(SqliteDelegate.decode_datamap(&bytes).unwrap(), data);
    }

    #[test]
    fn test_instant_codec_round_trip() {
        let now = Utc::now();
        let millis = SqliteDelegate.encode_instant(now);
        let back = SqliteDelegate.decode_instant(millis).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_all_templates_prefix_every_table() {
        // Every statement must reference tables only through the prefix
        // token.
        for sql in [
            INSERT_JOB,
            SELECT_JOB,
            INSERT_TRIGGER,
            SELECT_DUE_TRIGGERS,
            INSERT_FIRED_TRIGGER,
            INSERT_CALENDAR,
            INSERT_SCHEDULER_STATE,
            UPDATE_LOCK_CAS,
        ] {
            assert!(sql.contains("{0}"), "unprefixed table in: {sql}");
        }
    }
}
