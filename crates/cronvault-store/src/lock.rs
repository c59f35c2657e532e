//! Cluster lock manager.
//!
//! Mutual exclusion across instances is a row per lock name in the LOCKS
//! table. Two strategies:
//!
//! - [`StdRowLockSemaphore`]: the database's own row lock via the
//!   delegate's `SELECT … FOR UPDATE`; held until the surrounding
//!   transaction ends.
//! - [`UpdateLockRowSemaphore`]: application-managed compare-and-set on
//!   the row's OWNER column, for products (SQLite) without usable row
//!   locking. Acquisition retries with randomized backoff, bounded by a
//!   maximum wait, then fails with `LockTimeout`: the caller's cycle
//!   simply retries on its next tick.

use crate::dberr::classify;
use crate::delegate::{DriverDelegate, rtp};
use cronvault_core::{Result, StoreError};
use rand::Rng;
use rusqlite::Connection;
use std::time::{Duration, Instant};

/// Serializes trigger acquisition and state transitions.
pub const LOCK_TRIGGER_ACCESS: &str = "TRIGGER_ACCESS";
/// Serializes cluster recovery and check-in bookkeeping.
pub const LOCK_STATE_ACCESS: &str = "STATE_ACCESS";

/// Acquire/release of named cluster locks.
pub trait LockHandler: Send + Sync {
    /// Block (bounded) until this owner holds the named lock.
    fn obtain_lock(
        &self,
        conn: &Connection,
        delegate: &dyn DriverDelegate,
        table_prefix: &str,
        lock_name: &str,
        owner: &str,
    ) -> Result<()>;

    /// Give the lock back. A no-op for strategies where the database
    /// releases at transaction end.
    fn release_lock(
        &self,
        conn: &Connection,
        delegate: &dyn DriverDelegate,
        table_prefix: &str,
        lock_name: &str,
        owner: &str,
    ) -> Result<()>;
}

/// Row lock via the delegate's `SELECT … FOR UPDATE`. Release is implicit
/// at transaction end.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdRowLockSemaphore;

impl LockHandler for StdRowLockSemaphore {
    fn obtain_lock(
        &self,
        conn: &Connection,
        delegate: &dyn DriverDelegate,
        table_prefix: &str,
        lock_name: &str,
        _owner: &str,
    ) -> Result<()> {
        let Some(sql) = delegate.select_lock_for_update_sql() else {
            return Err(StoreError::Fatal(
                "delegate provides no row-lock statement; use UpdateLockRowSemaphore".into(),
            ));
        };
        conn.query_row(&rtp(sql, table_prefix), [lock_name], |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::Fatal(format!("lock row '{lock_name}' missing"))
            }
            e => classify("obtain row lock", e),
        })?;
        Ok(())
    }

    fn release_lock(
        &self,
        _conn: &Connection,
        _delegate: &dyn DriverDelegate,
        _table_prefix: &str,
        _lock_name: &str,
        _owner: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Compare-and-set semaphore: `UPDATE … SET OWNER = me WHERE OWNER = ''`,
/// verified by the affected-row count. Re-acquiring a lock this owner
/// already holds succeeds immediately, so a single instance can never
/// deadlock with itself.
#[derive(Debug, Clone, Copy)]
pub struct UpdateLockRowSemaphore {
    pub max_wait: Duration,
    pub retry_base: Duration,
}

impl UpdateLockRowSemaphore {
    pub fn new(max_wait: Duration, retry_base: Duration) -> Self {
        Self {
            max_wait,
            retry_base,
        }
    }
}

impl Default for UpdateLockRowSemaphore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_millis(50))
    }
}

impl LockHandler for UpdateLockRowSemaphore {
    fn obtain_lock(
        &self,
        conn: &Connection,
        delegate: &dyn DriverDelegate,
        table_prefix: &str,
        lock_name: &str,
        owner: &str,
    ) -> Result<()> {
        let sql = rtp(delegate.update_lock_cas_sql(), table_prefix);
        let deadline = Instant::now() + self.max_wait;

        loop {
            match conn.execute(&sql, rusqlite::params![owner, lock_name]) {
                Ok(1) => return Ok(()),
                Ok(0) => {} // held by someone else, back off below
                Ok(n) => {
                    return Err(StoreError::Fatal(format!(
                        "lock CAS affected {n} rows for '{lock_name}'"
                    )));
                }
                Err(e) => match classify("lock CAS", e) {
                    // A busy database is just contention; keep retrying
                    // until the deadline.
                    StoreError::Transient(_) => {}
                    other => return Err(other),
                },
            }

            if Instant::now() >= deadline {
                tracing::debug!("⏳ Lock '{}' not obtained within bounded wait", lock_name);
                return Err(StoreError::LockTimeout(lock_name.to_string()));
            }
            let jitter = rand::thread_rng().gen_range(0..=self.retry_base.as_millis() as u64);
            std::thread::sleep(self.retry_base + Duration::from_millis(jitter));
        }
    }

    fn release_lock(
        &self,
        conn: &Connection,
        delegate: &dyn DriverDelegate,
        table_prefix: &str,
        lock_name: &str,
        owner: &str,
    ) -> Result<()> {
        let sql = rtp(delegate.release_lock_sql(), table_prefix);
        let rows = conn
            .execute(&sql, rusqlite::params![lock_name, owner])
            .map_err(|e| classify("lock release", e))?;
        if rows == 0 {
            // Recovery may have cleared a lock held by an instance it
            // declared failed; losing a lock we thought we held is worth a
            // warning but not an error.
            tracing::warn!(
                "🔓 Released lock '{}' we did not own (owner {})",
                lock_name,
                owner
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::{SqliteDelegate, StdSqlDelegate};
    use crate::schema;

    fn lock_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::bootstrap(&conn, &SqliteDelegate, "CV_").unwrap();
        conn
    }

    fn fast_semaphore() -> UpdateLockRowSemaphore {
        UpdateLockRowSemaphore::new(Duration::from_millis(100), Duration::from_millis(5))
    }

    #[test]
    fn test_cas_mutual_exclusion() {
        let conn = lock_db();
        let sem = fast_semaphore();

        sem.obtain_lock(&conn, &SqliteDelegate, "CV_", LOCK_TRIGGER_ACCESS, "a")
            .unwrap();
        let err = sem
            .obtain_lock(&conn, &SqliteDelegate, "CV_", LOCK_TRIGGER_ACCESS, "b")
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(name) if name == LOCK_TRIGGER_ACCESS));

        sem.release_lock(&conn, &SqliteDelegate, "CV_", LOCK_TRIGGER_ACCESS, "a")
            .unwrap();
        sem.obtain_lock(&conn, &SqliteDelegate, "CV_", LOCK_TRIGGER_ACCESS, "b")
            .unwrap();
    }

    #[test]
    fn test_cas_reentrant_for_same_owner() {
        let conn = lock_db();
        let sem = fast_semaphore();
        sem.obtain_lock(&conn, &SqliteDelegate, "CV_", LOCK_STATE_ACCESS, "a")
            .unwrap();
        sem.obtain_lock(&conn, &SqliteDelegate, "CV_", LOCK_STATE_ACCESS, "a")
            .unwrap();
    }

    #[test]
    fn test_locks_are_independent() {
        let conn = lock_db();
        let sem = fast_semaphore();
        sem.obtain_lock(&conn, &SqliteDelegate, "CV_", LOCK_TRIGGER_ACCESS, "a")
            .unwrap();
        // A different lock name is still free.
        sem.obtain_lock(&conn, &SqliteDelegate, "CV_", LOCK_STATE_ACCESS, "b")
            .unwrap();
    }

    #[test]
    fn test_row_lock_requires_delegate_support() {
        let conn = lock_db();
        let err = StdRowLockSemaphore
            .obtain_lock(&conn, &SqliteDelegate, "CV_", LOCK_TRIGGER_ACCESS, "a")
            .unwrap_err();
        assert!(err.is_fatal());
        // StdSqlDelegate reports a statement, but SQLite cannot run it;
        // pairing is validated at store construction, not here.
        assert!(StdSqlDelegate.select_lock_for_update_sql().is_some());
    }
}
