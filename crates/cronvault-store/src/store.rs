//! The persistent, clusterable job store.
//!
//! Every operation runs inside its own transaction; the cluster lock
//! manager serializes the operations that need more than READ COMMITTED.
//! All SQL comes from the dialect delegate, all instants from the
//! injectable clock.

use crate::dberr::classify;
use crate::delegate::{DriverDelegate, SqliteDelegate, rtp};
use crate::lock::{LOCK_TRIGGER_ACCESS, LockHandler, UpdateLockRowSemaphore};
use crate::schema;
use chrono::{DateTime, Duration, Utc};
use cronvault_core::trigger::{initial_fire_time, next_fire_time_after};
use cronvault_core::{
    Calendar, Clock, FireResult, JobDetail, JobKey, MisfirePolicy, Result, Schedule,
    SchedulerConfig, StoreError, Trigger, TriggerKey, TriggerState,
};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const TYPE_ONCE: &str = "ONCE";
const TYPE_SIMPLE: &str = "SIMPLE";
const TYPE_CRON: &str = "CRON";

/// A trigger claimed by this instance, paired with its fired-trigger row.
#[derive(Debug, Clone)]
pub struct AcquiredFire {
    pub fire_instance_id: String,
    pub trigger: Trigger,
    pub scheduled_time: DateTime<Utc>,
    pub fired_time: DateTime<Utc>,
}

/// One row of the fired-triggers table.
#[derive(Debug, Clone)]
pub struct FiredRecord {
    pub fire_instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub instance_id: String,
    pub fired_time: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub state: String,
    pub requests_recovery: bool,
    pub concurrent: bool,
}

/// Outcome of promoting an acquired fire to executing.
#[derive(Debug)]
pub enum FiredDisposition {
    /// Go ahead: run the job.
    Executing { trigger: Trigger, job: JobDetail },
    /// The job is non-concurrent and another fire of it is executing; the
    /// trigger is parked BLOCKED and will be re-queued when the blocker
    /// completes.
    Blocked,
    /// The trigger, job, or fired row was deleted underneath us. Nothing
    /// to run.
    Vanished,
}

enum MisfireAction {
    Untouched,
    Rescheduled(DateTime<Utc>),
    Completed,
}

/// Database-backed trigger store shared by all instances of a cluster.
pub struct JobStore {
    conn: Mutex<Connection>,
    delegate: Box<dyn DriverDelegate>,
    lock_handler: Box<dyn LockHandler>,
    clock: Arc<dyn Clock>,
    table_prefix: String,
    instance_id: String,
    misfire_threshold: Duration,
    checkin_interval: Duration,
    checkin_grace: Duration,
}

impl JobStore {
    /// Open (and bootstrap) a SQLite-backed store per the configuration.
    pub fn open(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open(&config.db_path)
            .map_err(|e| StoreError::Fatal(format!("DB open: {e}")))?;
        // WAL allows concurrent instances on one file; busy_timeout turns
        // writer collisions into bounded waits instead of hard errors.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| StoreError::Fatal(format!("DB pragma: {e}")))?;

        let lock_handler = UpdateLockRowSemaphore::new(
            std::time::Duration::from_millis(config.lock_max_wait_ms),
            std::time::Duration::from_millis(config.lock_retry_ms),
        );
        Self::open_with(conn, Box::new(SqliteDelegate), Box::new(lock_handler), config, clock)
    }

    /// Open with an explicit delegate and lock strategy (other database
    /// products, tests).
    pub fn open_with(
        conn: Connection,
        delegate: Box<dyn DriverDelegate>,
        lock_handler: Box<dyn LockHandler>,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        schema::bootstrap(&conn, delegate.as_ref(), &config.table_prefix)?;
        schema::verify(&conn, &config.table_prefix)?;
        Ok(Self {
            conn: Mutex::new(conn),
            delegate,
            lock_handler,
            clock,
            table_prefix: config.table_prefix.clone(),
            instance_id: config.resolved_instance_id(),
            misfire_threshold: config.misfire_threshold(),
            checkin_interval: config.checkin_interval(),
            checkin_grace: config.checkin_grace(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn checkin_interval(&self) -> Duration {
        self.checkin_interval
    }

    pub(crate) fn checkin_grace(&self) -> Duration {
        self.checkin_grace
    }

    fn q(&self, template: &str) -> String {
        rtp(template, &self.table_prefix)
    }

    /// Run `f` in its own transaction while holding the named cluster
    /// lock. The lock spans the whole transaction; release failures are
    /// logged, not propagated over `f`'s result.
    pub(crate) fn with_lock<T>(
        &self,
        lock_name: &str,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Fatal("connection mutex poisoned".into()))?;
        self.lock_handler.obtain_lock(
            &conn,
            self.delegate.as_ref(),
            &self.table_prefix,
            lock_name,
            &self.instance_id,
        )?;
        let out = {
            let tx = conn
                .transaction()
                .map_err(|e| classify("begin transaction", e));
            match tx {
                Ok(tx) => f(&tx).and_then(|value| {
                    tx.commit().map_err(|e| classify("commit", e))?;
                    Ok(value)
                }),
                Err(e) => Err(e),
            }
        };
        if let Err(e) = self.lock_handler.release_lock(
            &conn,
            self.delegate.as_ref(),
            &self.table_prefix,
            lock_name,
            &self.instance_id,
        ) {
            tracing::warn!("⚠️ Failed to release lock '{}': {}", lock_name, e);
        }
        out
    }

    /// Read-only access without a cluster lock.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Fatal("connection mutex poisoned".into()))?;
        f(&conn)
    }

    // ─── Jobs ──────────────────────────────────────────────────────────

    /// Insert or (when `replace`) update a job definition.
    pub fn store_job(&self, job: &JobDetail, replace: bool) -> Result<()> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let exists = self.job_exists(conn, &job.key)?;
            if exists && !replace {
                return Err(StoreError::ConstraintViolation(format!(
                    "job {} already exists",
                    job.key
                )));
            }
            let data = self.delegate.encode_datamap(&job.data)?;
            let sql = if exists {
                self.q(self.delegate.update_job_sql())
            } else {
                self.q(self.delegate.insert_job_sql())
            };
            conn.execute(
                &sql,
                params![
                    job.key.name(),
                    job.key.group(),
                    job.handler,
                    job.description,
                    job.durable as i32,
                    job.recoverable as i32,
                    job.concurrent as i32,
                    data,
                ],
            )
            .map_err(|e| classify("store job", e))?;
            Ok(())
        })
    }

    pub fn retrieve_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        self.with_conn(|conn| self.read_job(conn, key))
    }

    /// Delete a job and all of its triggers. Returns false when absent.
    pub fn remove_job(&self, key: &JobKey) -> Result<bool> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let trigger_keys = self.trigger_keys_for_job(conn, key)?;
            for tk in &trigger_keys {
                self.delete_trigger_rows(conn, tk)?;
            }
            let rows = conn
                .execute(
                    &self.q(self.delegate.delete_job_sql()),
                    params![key.name(), key.group()],
                )
                .map_err(|e| classify("delete job", e))?;
            Ok(rows > 0)
        })
    }

    // ─── Triggers ──────────────────────────────────────────────────────

    /// Insert or (when `replace`) update a trigger. The trigger must
    /// reference an existing job and must have a resolvable first fire
    /// time. New triggers start `WAITING`.
    pub fn store_trigger(&self, trigger: &Trigger, replace: bool) -> Result<()> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            if !self.job_exists(conn, &trigger.job_key)? {
                return Err(StoreError::ConstraintViolation(format!(
                    "trigger {} references missing job {}",
                    trigger.key, trigger.job_key
                )));
            }
            let existing_state = self.read_trigger_state(conn, &trigger.key)?;
            if existing_state.is_some() && !replace {
                return Err(StoreError::ConstraintViolation(format!(
                    "trigger {} already exists",
                    trigger.key
                )));
            }

            let mut trigger = trigger.clone();
            // One-shot triggers are anchored at their fire instant.
            if let Schedule::Once { at } = trigger.schedule {
                trigger.start_time = at;
            }
            if trigger.next_fire_time.is_none() {
                let calendar = match &trigger.calendar_name {
                    Some(name) => self.read_calendar(conn, name)?,
                    None => None,
                };
                trigger.next_fire_time = initial_fire_time(&trigger, calendar.as_ref());
            }
            if trigger.next_fire_time.is_none() {
                return Err(StoreError::ConstraintViolation(format!(
                    "trigger {} will never fire",
                    trigger.key
                )));
            }

            let state = existing_state.unwrap_or(TriggerState::Waiting);
            self.write_trigger(conn, &trigger, state, replace && existing_state.is_some())
        })
    }

    pub fn retrieve_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        self.with_conn(|conn| Ok(self.read_trigger(conn, key)?.map(|(t, _)| t)))
    }

    pub fn trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        self.with_conn(|conn| self.read_trigger_state(conn, key))
    }

    /// Delete a trigger; a non-durable job loses its last trigger with it.
    /// Returns false when the trigger was absent.
    pub fn remove_trigger(&self, key: &TriggerKey) -> Result<bool> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let Some((trigger, _)) = self.read_trigger(conn, key)? else {
                return Ok(false);
            };
            self.delete_trigger_rows(conn, key)?;
            self.delete_job_if_orphaned(conn, &trigger.job_key)?;
            Ok(true)
        })
    }

    /// `WAITING → PAUSED`. A paused trigger is invisible to acquisition.
    pub fn pause_trigger(&self, key: &TriggerKey) -> Result<bool> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            self.transition(conn, key, TriggerState::Waiting, TriggerState::Paused)
        })
    }

    /// `PAUSED → WAITING`.
    pub fn resume_trigger(&self, key: &TriggerKey) -> Result<bool> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            self.transition(conn, key, TriggerState::Paused, TriggerState::Waiting)
        })
    }

    /// Pause every waiting trigger of a job. Returns the number paused.
    pub fn pause_job(&self, key: &JobKey) -> Result<usize> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            self.transition_for_job(conn, key, TriggerState::Waiting, TriggerState::Paused)
        })
    }

    /// Resume every paused trigger of a job. Returns the number resumed.
    pub fn resume_job(&self, key: &JobKey) -> Result<usize> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            self.transition_for_job(conn, key, TriggerState::Paused, TriggerState::Waiting)
        })
    }

    /// Distinct trigger groups, sorted.
    pub fn trigger_group_names(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| self.group_names(conn, self.delegate.select_trigger_groups_sql()))
    }

    /// Distinct job groups, sorted.
    pub fn job_group_names(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| self.group_names(conn, self.delegate.select_job_groups_sql()))
    }

    // ─── Calendars ─────────────────────────────────────────────────────

    pub fn store_calendar(&self, name: &str, calendar: &Calendar, replace: bool) -> Result<()> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let exists = self.read_calendar(conn, name)?.is_some();
            if exists && !replace {
                return Err(StoreError::ConstraintViolation(format!(
                    "calendar '{name}' already exists"
                )));
            }
            let blob = self.delegate.encode_calendar(calendar)?;
            let sql = if exists {
                self.q(self.delegate.update_calendar_sql())
            } else {
                self.q(self.delegate.insert_calendar_sql())
            };
            conn.execute(&sql, params![name, blob])
                .map_err(|e| classify("store calendar", e))?;
            Ok(())
        })
    }

    pub fn retrieve_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        self.with_conn(|conn| self.read_calendar(conn, name))
    }

    pub fn remove_calendar(&self, name: &str) -> Result<bool> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let rows = conn
                .execute(&self.q(self.delegate.delete_calendar_sql()), params![name])
                .map_err(|e| classify("delete calendar", e))?;
            Ok(rows > 0)
        })
    }

    // ─── Acquisition ───────────────────────────────────────────────────

    /// Claim up to `max_count` due triggers: under TRIGGER_ACCESS, select
    /// `WAITING` triggers with a fire time inside `no_later_than + window`,
    /// resolve misfires atomically with the claim, flip each to
    /// `ACQUIRED`, and write a fired-trigger row per claim.
    ///
    /// Selection order is `(next_fire_time ASC, priority DESC, trigger key
    /// ASC)`: deterministic for any insertion order. Triggers lost to a
    /// concurrent state change are silently dropped from the batch.
    pub fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        window: Duration,
    ) -> Result<Vec<AcquiredFire>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let now = self.clock.now();
            let cutoff = no_later_than + window;
            let misfire_floor = now - self.misfire_threshold;
            let mut acquired = Vec::new();

            // Headroom over max_count: misfired entries may complete or
            // move out of the window instead of being claimed.
            let candidates = self.due_trigger_keys(conn, cutoff, max_count * 3)?;

            for key in candidates {
                if acquired.len() >= max_count {
                    break;
                }
                let trigger = match self.read_trigger(conn, &key) {
                    Ok(Some((t, TriggerState::Waiting))) => t,
                    Ok(_) => continue,
                    Err(e @ StoreError::MisfirePolicy { .. }) => {
                        tracing::error!("🚫 {e}; moving trigger to ERROR");
                        self.transition(conn, &key, TriggerState::Waiting, TriggerState::Error)?;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let mut trigger = trigger;
                let Some(fire_time) = trigger.next_fire_time else {
                    continue;
                };

                if fire_time < misfire_floor {
                    match self.apply_misfire(conn, &mut trigger, now)? {
                        MisfireAction::Completed => continue,
                        MisfireAction::Rescheduled(next) if next > cutoff => continue,
                        _ => {}
                    }
                }
                let scheduled_time = match trigger.next_fire_time {
                    Some(t) => t,
                    None => continue,
                };

                // The claim itself: an affected-row check so a concurrent
                // pause/delete can never be resurrected.
                if !self.transition(conn, &key, TriggerState::Waiting, TriggerState::Acquired)? {
                    tracing::debug!("Trigger {} changed underneath acquisition; skipped", key);
                    continue;
                }

                let Some(job) = self.read_job(conn, &trigger.job_key)? else {
                    tracing::error!(
                        "🚫 Trigger {} references vanished job {}; moving to ERROR",
                        key,
                        trigger.job_key
                    );
                    self.transition(conn, &key, TriggerState::Acquired, TriggerState::Error)?;
                    continue;
                };

                let fire_instance_id = format!("{}-{}", self.instance_id, Uuid::new_v4());
                conn.execute(
                    &self.q(self.delegate.insert_fired_trigger_sql()),
                    params![
                        fire_instance_id,
                        key.name(),
                        key.group(),
                        job.key.name(),
                        job.key.group(),
                        self.instance_id,
                        self.delegate.encode_instant(now),
                        self.delegate.encode_instant(scheduled_time),
                        TriggerState::Acquired.as_str(),
                        job.recoverable as i32,
                        job.concurrent as i32,
                    ],
                )
                .map_err(|e| classify("insert fired trigger", e))?;

                acquired.push(AcquiredFire {
                    fire_instance_id,
                    trigger,
                    scheduled_time,
                    fired_time: now,
                });
            }

            if !acquired.is_empty() {
                tracing::debug!("🔔 Acquired {} trigger(s)", acquired.len());
            }
            Ok(acquired)
        })
    }

    /// Promote an acquired fire to EXECUTING, or park it when the job is
    /// non-concurrent and already running somewhere in the cluster.
    pub fn trigger_fired(&self, fire_instance_id: &str) -> Result<FiredDisposition> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let Some(fired) = self.read_fired(conn, fire_instance_id)? else {
                return Ok(FiredDisposition::Vanished);
            };
            let Some((mut trigger, state)) = self.read_trigger(conn, &fired.trigger_key)? else {
                self.delete_fired(conn, fire_instance_id)?;
                return Ok(FiredDisposition::Vanished);
            };
            if state != TriggerState::Acquired {
                self.delete_fired(conn, fire_instance_id)?;
                return Ok(FiredDisposition::Vanished);
            }
            let Some(job) = self.read_job(conn, &trigger.job_key)? else {
                self.delete_fired(conn, fire_instance_id)?;
                self.transition(
                    conn,
                    &fired.trigger_key,
                    TriggerState::Acquired,
                    TriggerState::Error,
                )?;
                return Ok(FiredDisposition::Vanished);
            };

            if !job.concurrent && self.executing_count_for_job(conn, &job.key, fire_instance_id)? > 0
            {
                self.delete_fired(conn, fire_instance_id)?;
                self.transition(
                    conn,
                    &fired.trigger_key,
                    TriggerState::Acquired,
                    TriggerState::Blocked,
                )?;
                tracing::debug!("⛔ Fire of non-concurrent job {} blocked", job.key);
                return Ok(FiredDisposition::Blocked);
            }

            let rows = conn
                .execute(
                    &self.q(self.delegate.update_fired_trigger_state_from_sql()),
                    params![
                        fire_instance_id,
                        TriggerState::Executing.as_str(),
                        TriggerState::Acquired.as_str(),
                    ],
                )
                .map_err(|e| classify("mark fired executing", e))?;
            if rows == 0 {
                return Ok(FiredDisposition::Vanished);
            }
            if !self.transition(
                conn,
                &fired.trigger_key,
                TriggerState::Acquired,
                TriggerState::Executing,
            )? {
                self.delete_fired(conn, fire_instance_id)?;
                return Ok(FiredDisposition::Vanished);
            }

            trigger.times_triggered += 1;
            if matches!(trigger.schedule, Schedule::Interval { .. }) {
                conn.execute(
                    &self.q(self.delegate.update_times_triggered_sql()),
                    params![
                        trigger.key.name(),
                        trigger.key.group(),
                        trigger.times_triggered,
                    ],
                )
                .map_err(|e| classify("update times triggered", e))?;
            }
            Ok(FiredDisposition::Executing { trigger, job })
        })
    }

    /// Record a fire outcome: remove the fired row, advance or complete
    /// the trigger, release any fires this job was blocking, and cascade-
    /// delete a non-durable job left without active triggers.
    pub fn triggered_job_complete(&self, fire_instance_id: &str, result: &FireResult) -> Result<()> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let Some(fired) = self.read_fired(conn, fire_instance_id)? else {
                // Already consumed: recovery got here first.
                return Ok(());
            };
            self.delete_fired(conn, fire_instance_id)?;

            // Whatever happens to this trigger, the job no longer blocks
            // its peers.
            conn.execute(
                &self.q(self.delegate.update_trigger_states_for_job_from_sql()),
                params![
                    fired.job_key.name(),
                    fired.job_key.group(),
                    TriggerState::Waiting.as_str(),
                    TriggerState::Blocked.as_str(),
                ],
            )
            .map_err(|e| classify("unblock job triggers", e))?;

            let Some((trigger, _)) = self.read_trigger(conn, &fired.trigger_key)? else {
                return Ok(());
            };

            if let FireResult::Veto = result {
                // A vetoed fire is not an execution: put the trigger back
                // without advancing its schedule.
                self.transition(
                    conn,
                    &fired.trigger_key,
                    TriggerState::Executing,
                    TriggerState::Waiting,
                )?;
                return Ok(());
            }
            if let FireResult::Failure(reason) = result {
                tracing::warn!("⚠️ Job {} fire failed: {}", fired.job_key, reason);
            }

            let calendar = match &trigger.calendar_name {
                Some(name) => self.read_calendar(conn, name)?,
                None => None,
            };
            let next = next_fire_time_after(&trigger, fired.scheduled_time, calendar.as_ref());

            match next {
                Some(next) => {
                    conn.execute(
                        &self.q(self.delegate.update_trigger_fire_times_sql()),
                        params![
                            fired.trigger_key.name(),
                            fired.trigger_key.group(),
                            Some(self.delegate.encode_instant(next)),
                            self.delegate.encode_instant(fired.scheduled_time),
                            TriggerState::Waiting.as_str(),
                            TriggerState::Executing.as_str(),
                        ],
                    )
                    .map_err(|e| classify("reschedule trigger", e))?;
                }
                None => {
                    conn.execute(
                        &self.q(self.delegate.update_trigger_fire_times_sql()),
                        params![
                            fired.trigger_key.name(),
                            fired.trigger_key.group(),
                            None::<i64>,
                            self.delegate.encode_instant(fired.scheduled_time),
                            TriggerState::Complete.as_str(),
                            TriggerState::Executing.as_str(),
                        ],
                    )
                    .map_err(|e| classify("complete trigger", e))?;
                    self.delete_job_if_orphaned(conn, &fired.job_key)?;
                }
            }
            Ok(())
        })
    }

    /// Undo an acquisition this instance could not dispatch: delete the
    /// fired row and return the trigger to WAITING.
    pub fn release_acquired_fire(&self, fire_instance_id: &str) -> Result<()> {
        self.with_lock(LOCK_TRIGGER_ACCESS, |conn| {
            let Some(fired) = self.read_fired(conn, fire_instance_id)? else {
                return Ok(());
            };
            self.delete_fired(conn, fire_instance_id)?;
            self.transition(
                conn,
                &fired.trigger_key,
                TriggerState::Acquired,
                TriggerState::Waiting,
            )?;
            Ok(())
        })
    }

    // ─── Internal row plumbing ─────────────────────────────────────────

    fn job_exists(&self, conn: &Connection, key: &JobKey) -> Result<bool> {
        conn.query_row(
            &self.q(self.delegate.job_exists_sql()),
            params![key.name(), key.group()],
            |_| Ok(()),
        )
        .optional()
        .map(|o| o.is_some())
        .map_err(|e| classify("job exists", e))
    }

    fn read_job(&self, conn: &Connection, key: &JobKey) -> Result<Option<JobDetail>> {
        let row = conn
            .query_row(
                &self.q(self.delegate.select_job_sql()),
                params![key.name(), key.group()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i32>(4)? != 0,
                        row.get::<_, i32>(5)? != 0,
                        row.get::<_, i32>(6)? != 0,
                        row.get::<_, Vec<u8>>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| classify("select job", e))?;

        let Some((name, group, handler, description, durable, recoverable, concurrent, blob)) = row
        else {
            return Ok(None);
        };
        Ok(Some(JobDetail {
            key: JobKey::new(name, group),
            handler,
            description,
            durable,
            recoverable,
            concurrent,
            data: self.delegate.decode_datamap(&blob)?,
        }))
    }

    pub(crate) fn delete_job_if_orphaned(&self, conn: &Connection, key: &JobKey) -> Result<()> {
        let Some(job) = self.read_job(conn, key)? else {
            return Ok(());
        };
        if job.durable {
            return Ok(());
        }
        let active: i64 = conn
            .query_row(
                &self.q(self.delegate.count_active_triggers_for_job_sql()),
                params![key.name(), key.group()],
                |row| row.get(0),
            )
            .map_err(|e| classify("count active triggers", e))?;
        if active == 0 {
            conn.execute(
                &self.q(self.delegate.delete_job_sql()),
                params![key.name(), key.group()],
            )
            .map_err(|e| classify("delete orphaned job", e))?;
            tracing::debug!("🧹 Deleted non-durable job {} with no triggers left", key);
        }
        Ok(())
    }

    fn read_trigger_state(
        &self,
        conn: &Connection,
        key: &TriggerKey,
    ) -> Result<Option<TriggerState>> {
        let state = conn
            .query_row(
                &self.q(self.delegate.select_trigger_state_sql()),
                params![key.name(), key.group()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| classify("select trigger state", e))?;
        match state {
            None => Ok(None),
            Some(s) => TriggerState::parse(&s)
                .map(Some)
                .ok_or_else(|| StoreError::Fatal(format!("unknown trigger state '{s}'"))),
        }
    }

    pub(crate) fn read_trigger(
        &self,
        conn: &Connection,
        key: &TriggerKey,
    ) -> Result<Option<(Trigger, TriggerState)>> {
        type Raw = (
            String,
            String,
            String,
            String,
            Option<String>,
            String,
            i64,
            Option<i64>,
            Option<i64>,
            i32,
            String,
            Option<String>,
            String,
            Vec<u8>,
        );
        let row: Option<Raw> = conn
            .query_row(
                &self.q(self.delegate.select_trigger_sql()),
                params![key.name(), key.group()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                        row.get(13)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| classify("select trigger", e))?;

        let Some((
            name,
            group,
            job_name,
            job_group,
            description,
            trigger_type,
            start,
            next,
            prev,
            priority,
            misfire,
            calendar_name,
            state,
            data_blob,
        )) = row
        else {
            return Ok(None);
        };

        let key = TriggerKey::new(name, group);
        let start_time = self.delegate.decode_instant(start)?;
        let misfire_policy = MisfirePolicy::parse(&misfire).ok_or_else(|| {
            StoreError::MisfirePolicy {
                trigger: key.to_string(),
                reason: format!("unknown policy '{misfire}'"),
            }
        })?;
        let state = TriggerState::parse(&state)
            .ok_or_else(|| StoreError::Fatal(format!("unknown trigger state '{state}'")))?;

        let (schedule, times_triggered) = match trigger_type.as_str() {
            TYPE_ONCE => (Schedule::Once { at: start_time }, 0),
            TYPE_SIMPLE => {
                let (interval, count, times): (i64, i64, u32) = conn
                    .query_row(
                        &self.q(self.delegate.select_simple_trigger_sql()),
                        params![key.name(), key.group()],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .map_err(|e| classify("select simple trigger", e))?;
                (
                    Schedule::Interval {
                        every_ms: interval,
                        repeat_count: (count >= 0).then_some(count as u32),
                    },
                    times,
                )
            }
            TYPE_CRON => {
                let expression: String = conn
                    .query_row(
                        &self.q(self.delegate.select_cron_trigger_sql()),
                        params![key.name(), key.group()],
                        |row| row.get(0),
                    )
                    .map_err(|e| classify("select cron trigger", e))?;
                (Schedule::Cron { expression }, 0)
            }
            other => {
                return Err(StoreError::Fatal(format!(
                    "unknown trigger type '{other}' for {key}"
                )));
            }
        };

        let trigger = Trigger {
            key,
            job_key: JobKey::new(job_name, job_group),
            description,
            schedule,
            start_time,
            next_fire_time: next.map(|m| self.delegate.decode_instant(m)).transpose()?,
            previous_fire_time: prev.map(|m| self.delegate.decode_instant(m)).transpose()?,
            priority,
            misfire_policy,
            calendar_name,
            times_triggered,
            data: self.delegate.decode_datamap(&data_blob)?,
        };
        Ok(Some((trigger, state)))
    }

    pub(crate) fn write_trigger(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        state: TriggerState,
        update: bool,
    ) -> Result<()> {
        let trigger_type = match &trigger.schedule {
            Schedule::Once { .. } => TYPE_ONCE,
            Schedule::Interval { .. } => TYPE_SIMPLE,
            Schedule::Cron { .. } => TYPE_CRON,
        };
        let data = self.delegate.encode_datamap(&trigger.data)?;
        let sql = if update {
            self.q(self.delegate.update_trigger_sql())
        } else {
            self.q(self.delegate.insert_trigger_sql())
        };
        conn.execute(
            &sql,
            params![
                trigger.key.name(),
                trigger.key.group(),
                trigger.job_key.name(),
                trigger.job_key.group(),
                trigger.description,
                trigger_type,
                self.delegate.encode_instant(trigger.start_time),
                trigger.next_fire_time.map(|t| self.delegate.encode_instant(t)),
                trigger
                    .previous_fire_time
                    .map(|t| self.delegate.encode_instant(t)),
                trigger.priority,
                trigger.misfire_policy.as_str(),
                trigger.calendar_name,
                state.as_str(),
                data,
            ],
        )
        .map_err(|e| classify("write trigger", e))?;

        // A replace may change the schedule kind, so rewrite the subtype
        // row from scratch.
        if update {
            for sql in [
                self.delegate.delete_simple_trigger_sql(),
                self.delegate.delete_cron_trigger_sql(),
            ] {
                conn.execute(&self.q(sql), params![trigger.key.name(), trigger.key.group()])
                    .map_err(|e| classify("clear trigger subtype", e))?;
            }
        }
        match &trigger.schedule {
            Schedule::Once { .. } => {}
            Schedule::Interval {
                every_ms,
                repeat_count,
            } => {
                let count = repeat_count.map(|c| c as i64).unwrap_or(-1);
                conn.execute(
                    &self.q(self.delegate.insert_simple_trigger_sql()),
                    params![
                        trigger.key.name(),
                        trigger.key.group(),
                        every_ms,
                        count,
                        trigger.times_triggered,
                    ],
                )
                .map_err(|e| classify("write simple trigger", e))?;
            }
            Schedule::Cron { expression } => {
                conn.execute(
                    &self.q(self.delegate.insert_cron_trigger_sql()),
                    params![trigger.key.name(), trigger.key.group(), expression],
                )
                .map_err(|e| classify("write cron trigger", e))?;
            }
        }
        Ok(())
    }

    fn delete_trigger_rows(&self, conn: &Connection, key: &TriggerKey) -> Result<()> {
        for sql in [
            self.delegate.delete_simple_trigger_sql(),
            self.delegate.delete_cron_trigger_sql(),
            self.delegate.delete_trigger_sql(),
        ] {
            conn.execute(&self.q(sql), params![key.name(), key.group()])
                .map_err(|e| classify("delete trigger", e))?;
        }
        Ok(())
    }

    fn trigger_keys_for_job(&self, conn: &Connection, key: &JobKey) -> Result<Vec<TriggerKey>> {
        let mut stmt = conn
            .prepare(&self.q(self.delegate.select_triggers_for_job_sql()))
            .map_err(|e| classify("select triggers for job", e))?;
        let rows = stmt
            .query_map(params![key.name(), key.group()], |row| {
                Ok(TriggerKey::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                ))
            })
            .map_err(|e| classify("select triggers for job", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| classify("select triggers for job", e))
    }

    /// Conditional state transition; true when exactly one row changed.
    pub(crate) fn transition(
        &self,
        conn: &Connection,
        key: &TriggerKey,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<bool> {
        let rows = conn
            .execute(
                &self.q(self.delegate.update_trigger_state_from_sql()),
                params![key.name(), key.group(), to.as_str(), from.as_str()],
            )
            .map_err(|e| classify("trigger transition", e))?;
        Ok(rows == 1)
    }

    fn transition_for_job(
        &self,
        conn: &Connection,
        key: &JobKey,
        from: TriggerState,
        to: TriggerState,
    ) -> Result<usize> {
        conn.execute(
            &self.q(self.delegate.update_trigger_states_for_job_from_sql()),
            params![key.name(), key.group(), to.as_str(), from.as_str()],
        )
        .map_err(|e| classify("job trigger transition", e))
    }

    fn group_names(&self, conn: &Connection, template: &str) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(&self.q(template))
            .map_err(|e| classify("select groups", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| classify("select groups", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| classify("select groups", e))
    }

    fn due_trigger_keys(
        &self,
        conn: &Connection,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TriggerKey>> {
        let mut stmt = conn
            .prepare(&self.q(self.delegate.select_due_triggers_sql()))
            .map_err(|e| classify("select due triggers", e))?;
        let rows = stmt
            .query_map(
                params![
                    TriggerState::Waiting.as_str(),
                    self.delegate.encode_instant(cutoff),
                    limit as i64,
                ],
                |row| {
                    Ok(TriggerKey::new(
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                },
            )
            .map_err(|e| classify("select due triggers", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| classify("select due triggers", e))
    }

    /// Apply the trigger's misfire instruction, in the same transaction as
    /// the acquisition that detected it.
    fn apply_misfire(
        &self,
        conn: &Connection,
        trigger: &mut Trigger,
        now: DateTime<Utc>,
    ) -> Result<MisfireAction> {
        match trigger.misfire_policy {
            MisfirePolicy::Ignore => Ok(MisfireAction::Untouched),
            MisfirePolicy::FireNow => {
                self.update_fire_times(conn, trigger, Some(now), TriggerState::Waiting)?;
                trigger.next_fire_time = Some(now);
                tracing::info!("⏰ Misfired trigger {} firing now", trigger.key);
                Ok(MisfireAction::Rescheduled(now))
            }
            MisfirePolicy::SmartSkip => {
                let calendar = match &trigger.calendar_name {
                    Some(name) => self.read_calendar(conn, name)?,
                    None => None,
                };
                match next_fire_time_after(trigger, now, calendar.as_ref()) {
                    Some(next) => {
                        self.update_fire_times(conn, trigger, Some(next), TriggerState::Waiting)?;
                        trigger.next_fire_time = Some(next);
                        tracing::info!("⏰ Misfired trigger {} skipped to {}", trigger.key, next);
                        Ok(MisfireAction::Rescheduled(next))
                    }
                    None => {
                        self.update_fire_times(conn, trigger, None, TriggerState::Complete)?;
                        trigger.next_fire_time = None;
                        tracing::info!("⏰ Misfired trigger {} exhausted; COMPLETE", trigger.key);
                        self.delete_job_if_orphaned(conn, &trigger.job_key)?;
                        Ok(MisfireAction::Completed)
                    }
                }
            }
        }
    }

    fn update_fire_times(
        &self,
        conn: &Connection,
        trigger: &Trigger,
        next: Option<DateTime<Utc>>,
        state: TriggerState,
    ) -> Result<()> {
        conn.execute(
            &self.q(self.delegate.update_trigger_fire_times_sql()),
            params![
                trigger.key.name(),
                trigger.key.group(),
                next.map(|t| self.delegate.encode_instant(t)),
                trigger
                    .previous_fire_time
                    .map(|t| self.delegate.encode_instant(t)),
                state.as_str(),
                TriggerState::Waiting.as_str(),
            ],
        )
        .map_err(|e| classify("update fire times", e))?;
        Ok(())
    }

    pub(crate) fn read_calendar(&self, conn: &Connection, name: &str) -> Result<Option<Calendar>> {
        let blob = conn
            .query_row(
                &self.q(self.delegate.select_calendar_sql()),
                params![name],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(|e| classify("select calendar", e))?;
        blob.map(|b| self.delegate.decode_calendar(&b)).transpose()
    }

    pub(crate) fn read_fired(
        &self,
        conn: &Connection,
        fire_instance_id: &str,
    ) -> Result<Option<FiredRecord>> {
        conn.query_row(
            &self.q(self.delegate.select_fired_trigger_sql()),
            params![fire_instance_id],
            Self::map_fired_row,
        )
        .optional()
        .map_err(|e| classify("select fired trigger", e))?
        .map(|r| self.decode_fired(r))
        .transpose()
    }

    pub(crate) fn fired_records_for_instance(
        &self,
        conn: &Connection,
        instance_id: &str,
    ) -> Result<Vec<FiredRecord>> {
        let mut stmt = conn
            .prepare(&self.q(self.delegate.select_fired_by_instance_sql()))
            .map_err(|e| classify("select fired by instance", e))?;
        let rows = stmt
            .query_map(params![instance_id], Self::map_fired_row)
            .map_err(|e| classify("select fired by instance", e))?;
        let raw = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| classify("select fired by instance", e))?;
        raw.into_iter().map(|r| self.decode_fired(r)).collect()
    }

    #[allow(clippy::type_complexity)]
    fn map_fired_row(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<(String, String, String, String, String, String, i64, i64, String, bool, bool)>
    {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get::<_, i32>(9)? != 0,
            row.get::<_, i32>(10)? != 0,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn decode_fired(
        &self,
        raw: (String, String, String, String, String, String, i64, i64, String, bool, bool),
    ) -> Result<FiredRecord> {
        let (id, tn, tg, jn, jg, instance, fired, sched, state, recovery, concurrent) = raw;
        Ok(FiredRecord {
            fire_instance_id: id,
            trigger_key: TriggerKey::new(tn, tg),
            job_key: JobKey::new(jn, jg),
            instance_id: instance,
            fired_time: self.delegate.decode_instant(fired)?,
            scheduled_time: self.delegate.decode_instant(sched)?,
            state,
            requests_recovery: recovery,
            concurrent,
        })
    }

    pub(crate) fn delete_fired(&self, conn: &Connection, fire_instance_id: &str) -> Result<()> {
        conn.execute(
            &self.q(self.delegate.delete_fired_trigger_sql()),
            params![fire_instance_id],
        )
        .map_err(|e| classify("delete fired trigger", e))?;
        Ok(())
    }

    fn executing_count_for_job(
        &self,
        conn: &Connection,
        key: &JobKey,
        excluding_fire_id: &str,
    ) -> Result<i64> {
        conn.query_row(
            &self.q(self.delegate.count_executing_for_job_sql()),
            params![key.name(), key.group(), excluding_fire_id],
            |row| row.get(0),
        )
        .map_err(|e| classify("count executing for job", e))
    }

    // Shared with the recovery module.
    pub(crate) fn delegate(&self) -> &dyn DriverDelegate {
        self.delegate.as_ref()
    }

    pub(crate) fn sql(&self, template: &str) -> String {
        self.q(template)
    }
}
