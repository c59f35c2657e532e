//! Cluster membership and crash recovery.
//!
//! Every instance periodically stamps a check-in row. An instance whose
//! stamp goes stale past its grace window is treated as dead: its
//! abandoned lock rows are cleared, its in-flight fires are either turned
//! into recovery triggers or returned to the waiting queue, and its
//! check-in row is removed last so a half-finished sweep is simply
//! repeated.

use crate::dberr::classify;
use crate::lock::LOCK_STATE_ACCESS;
use crate::store::{FiredRecord, JobStore};
use chrono::{DateTime, Duration, Utc};
use cronvault_core::job::recovery_keys;
use cronvault_core::trigger::{RECOVERING_TRIGGERS_GROUP, next_fire_time_after};
use cronvault_core::{
    JobDataMap, MisfirePolicy, Result, Trigger, TriggerKey, TriggerState,
};
use rusqlite::{Connection, params};

/// One row of the scheduler-state (check-in) table.
#[derive(Debug, Clone)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

impl JobStore {
    /// Stamp this instance's check-in row, creating it on first contact.
    pub fn check_in(&self) -> Result<()> {
        self.with_lock(LOCK_STATE_ACCESS, |conn| {
            let now = self.clock().now();
            let rows = conn
                .execute(
                    &self.sql(self.delegate().update_scheduler_state_sql()),
                    params![
                        self.instance_id(),
                        self.delegate().encode_instant(now),
                        self.checkin_interval().num_milliseconds(),
                    ],
                )
                .map_err(|e| classify("update check-in", e))?;
            if rows == 0 {
                conn.execute(
                    &self.sql(self.delegate().insert_scheduler_state_sql()),
                    params![
                        self.instance_id(),
                        self.delegate().encode_instant(now),
                        self.checkin_interval().num_milliseconds(),
                    ],
                )
                .map_err(|e| classify("insert check-in", e))?;
                tracing::info!("🤝 Instance '{}' joined the cluster", self.instance_id());
            }
            Ok(())
        })
    }

    /// All check-in rows, including this instance's own.
    pub fn scheduler_states(&self) -> Result<Vec<SchedulerStateRecord>> {
        self.with_conn(|conn| self.read_scheduler_states(conn))
    }

    /// Instances whose check-in stamp is stale past their grace window.
    /// Never includes this instance.
    pub fn find_failed_instances(&self) -> Result<Vec<String>> {
        let now = self.clock().now();
        self.with_conn(|conn| {
            Ok(self
                .read_scheduler_states(conn)?
                .into_iter()
                .filter(|s| s.instance_id != self.instance_id() && self.is_stale(s, now))
                .map(|s| s.instance_id)
                .collect())
        })
    }

    /// One recovery sweep: detect dead instances and take over their
    /// in-flight work. Returns the number of instances recovered.
    ///
    /// A dead instance can hold a cluster lock row forever, so abandoned
    /// lock rows are cleared before STATE_ACCESS is taken, not after.
    pub fn recover_failed_instances(&self) -> Result<usize> {
        let failed = self.find_failed_instances()?;
        if failed.is_empty() {
            return Ok(0);
        }
        tracing::warn!("💀 Detected failed instance(s): {:?}", failed);
        for id in &failed {
            self.release_abandoned_locks(id)?;
        }
        self.with_lock(LOCK_STATE_ACCESS, |conn| {
            let now = self.clock().now();
            let mut recovered = 0;
            // Re-check staleness under the lock: another instance may have
            // already swept (its sweep deletes the check-in row).
            for state in self.read_scheduler_states(conn)? {
                if state.instance_id == self.instance_id() || !self.is_stale(&state, now) {
                    continue;
                }
                let fires = self.recover_instance(conn, &state.instance_id, now)?;
                tracing::info!(
                    "🛠️ Recovered {} in-flight fire(s) of instance '{}'",
                    fires,
                    state.instance_id
                );
                recovered += 1;
            }
            Ok(recovered)
        })
    }

    /// Recover this instance's own leftovers from a previous run that
    /// crashed. Call once at startup, before the first check-in.
    pub fn recover_own_fires(&self) -> Result<usize> {
        self.release_abandoned_locks(self.instance_id())?;
        self.with_lock(LOCK_STATE_ACCESS, |conn| {
            let now = self.clock().now();
            self.recover_instance(conn, self.instance_id(), now)
        })
    }

    fn is_stale(&self, state: &SchedulerStateRecord, now: DateTime<Utc>) -> bool {
        // Honor an instance that advertised a slower heartbeat than ours.
        let allowance = self
            .checkin_grace()
            .max(Duration::milliseconds(state.checkin_interval_ms * 2));
        now - state.last_checkin > allowance
    }

    /// Clear lock rows still owned by a dead instance so the CAS
    /// semaphores can make progress again.
    fn release_abandoned_locks(&self, owner: &str) -> Result<()> {
        self.with_conn(|conn| {
            let rows = conn
                .execute(
                    &self.sql(self.delegate().clear_locks_for_owner_sql()),
                    params![owner],
                )
                .map_err(|e| classify("clear abandoned locks", e))?;
            if rows > 0 {
                tracing::warn!("🔓 Cleared {} abandoned lock(s) owned by '{}'", rows, owner);
            }
            Ok(())
        })
    }

    /// Take over one instance's fired-trigger rows. Deletes its check-in
    /// row last, so a crash mid-sweep leaves the instance still marked
    /// failed and the next sweep finishes the job.
    fn recover_instance(
        &self,
        conn: &Connection,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let fires = self.fired_records_for_instance(conn, instance_id)?;
        for fired in &fires {
            if fired.requests_recovery {
                self.spawn_recovery_trigger(conn, fired, now)?;
                self.advance_past_abandoned_fire(conn, fired)?;
            } else {
                // At-least-once: the abandoned fire is simply re-queued.
                for from in [
                    TriggerState::Acquired,
                    TriggerState::Executing,
                    TriggerState::Blocked,
                ] {
                    self.transition(conn, &fired.trigger_key, from, TriggerState::Waiting)?;
                }
            }
            // Triggers parked behind this fire would otherwise wait forever.
            conn.execute(
                &self.sql(self.delegate().update_trigger_states_for_job_from_sql()),
                params![
                    fired.job_key.name(),
                    fired.job_key.group(),
                    TriggerState::Waiting.as_str(),
                    TriggerState::Blocked.as_str(),
                ],
            )
            .map_err(|e| classify("unblock job triggers", e))?;
            self.delete_fired(conn, &fired.fire_instance_id)?;
        }
        conn.execute(
            &self.sql(self.delegate().delete_scheduler_state_sql()),
            params![instance_id],
        )
        .map_err(|e| classify("delete check-in row", e))?;
        Ok(fires.len())
    }

    /// Create a one-shot trigger in the RECOVERING group that re-runs the
    /// abandoned job immediately, carrying the original fire's identity in
    /// its data map.
    fn spawn_recovery_trigger(
        &self,
        conn: &Connection,
        fired: &FiredRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = TriggerKey::new(
            format!("recover_{}", fired.fire_instance_id),
            RECOVERING_TRIGGERS_GROUP,
        );
        let mut data = JobDataMap::new();
        data.insert(recovery_keys::ORIGINAL_TRIGGER_NAME, fired.trigger_key.name());
        data.insert(
            recovery_keys::ORIGINAL_TRIGGER_GROUP,
            fired.trigger_key.group(),
        );
        data.insert(
            recovery_keys::SCHEDULED_TIME,
            self.delegate().encode_instant(fired.scheduled_time),
        );
        data.insert(
            recovery_keys::FIRED_TIME,
            self.delegate().encode_instant(fired.fired_time),
        );
        let mut trigger = Trigger::once(key, fired.job_key.clone(), now)
            .with_misfire_policy(MisfirePolicy::FireNow)
            .with_data(data);
        trigger.next_fire_time = Some(now);
        self.write_trigger(conn, &trigger, TriggerState::Waiting, false)
    }

    /// The recovery trigger replaces the abandoned fire, so the original
    /// trigger must move on to the fire after it (or complete) instead of
    /// re-firing the same instant.
    fn advance_past_abandoned_fire(&self, conn: &Connection, fired: &FiredRecord) -> Result<()> {
        let Some((trigger, state)) = self.read_trigger(conn, &fired.trigger_key)? else {
            return Ok(());
        };
        let calendar = match &trigger.calendar_name {
            Some(name) => self.read_calendar(conn, name)?,
            None => None,
        };
        let next = next_fire_time_after(&trigger, fired.scheduled_time, calendar.as_ref());
        let (next_ms, new_state) = match next {
            Some(n) => (Some(self.delegate().encode_instant(n)), TriggerState::Waiting),
            None => (None, TriggerState::Complete),
        };
        conn.execute(
            &self.sql(self.delegate().update_trigger_fire_times_sql()),
            params![
                fired.trigger_key.name(),
                fired.trigger_key.group(),
                next_ms,
                self.delegate().encode_instant(fired.scheduled_time),
                new_state.as_str(),
                state.as_str(),
            ],
        )
        .map_err(|e| classify("advance recovered trigger", e))?;
        if next.is_none() {
            self.delete_job_if_orphaned(conn, &fired.job_key)?;
        }
        Ok(())
    }

    pub(crate) fn read_scheduler_states(&self, conn: &Connection) -> Result<Vec<SchedulerStateRecord>> {
        let mut stmt = conn
            .prepare(&self.sql(self.delegate().select_scheduler_states_sql()))
            .map_err(|e| classify("select scheduler states", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(|e| classify("select scheduler states", e))?;
        let raw = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| classify("select scheduler states", e))?;
        raw.into_iter()
            .map(|(id, checkin, interval)| {
                Ok(SchedulerStateRecord {
                    instance_id: id,
                    last_checkin: self.delegate().decode_instant(checkin)?,
                    checkin_interval_ms: interval,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::SqliteDelegate;
    use crate::lock::UpdateLockRowSemaphore;
    use crate::store::FiredDisposition;
    use chrono::TimeZone;
    use cronvault_core::Clock;
    use cronvault_core::{FireResult, JobDetail, JobKey, ManualClock, SchedulerConfig};
    use rusqlite::Connection;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn temp_db(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cronvault-{tag}-{}.db", Uuid::new_v4()))
    }

    fn store_at(path: &PathBuf, instance: &str, clock: Arc<ManualClock>) -> JobStore {
        let config = SchedulerConfig {
            instance_id: instance.into(),
            ..SchedulerConfig::default()
        };
        JobStore::open_with(
            Connection::open(path).unwrap(),
            Box::new(SqliteDelegate),
            Box::new(UpdateLockRowSemaphore::new(
                StdDuration::from_millis(500),
                StdDuration::from_millis(5),
            )),
            &config,
            clock,
        )
        .unwrap()
    }

    /// Stand up a job mid-execution on instance `b`, then stop driving `b`
    /// as if it crashed. Returns the fire id.
    fn strand_fire(store: &JobStore, recoverable: bool) -> String {
        let job = JobDetail::new(JobKey::named("j"), "noop").recoverable(recoverable);
        store.store_job(&job, false).unwrap();
        store
            .store_trigger(
                &Trigger::once(TriggerKey::named("t1"), JobKey::named("j"), t0()),
                false,
            )
            .unwrap();
        let fires = store
            .acquire_next_triggers(t0(), 1, Duration::seconds(30))
            .unwrap();
        assert_eq!(fires.len(), 1);
        assert!(matches!(
            store.trigger_fired(&fires[0].fire_instance_id).unwrap(),
            FiredDisposition::Executing { .. }
        ));
        fires[0].fire_instance_id.clone()
    }

    #[test]
    fn test_check_in_creates_then_updates_the_row() {
        let path = temp_db("checkin");
        let clock = Arc::new(ManualClock::new(t0()));
        let store = store_at(&path, "node-a", clock.clone());

        store.check_in().unwrap();
        let states = store.scheduler_states().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].instance_id, "node-a");
        assert_eq!(states[0].last_checkin, t0());

        clock.advance(Duration::seconds(8));
        store.check_in().unwrap();
        let states = store.scheduler_states().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].last_checkin, t0() + Duration::seconds(8));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_silent_peer_is_reported_failed() {
        let path = temp_db("stale");
        let clock = Arc::new(ManualClock::new(t0()));
        let a = store_at(&path, "node-a", clock.clone());
        let b = store_at(&path, "node-b", clock.clone());

        a.check_in().unwrap();
        b.check_in().unwrap();
        assert!(a.find_failed_instances().unwrap().is_empty());

        // Only node-a keeps its heartbeat going.
        clock.advance(Duration::seconds(60));
        a.check_in().unwrap();
        assert_eq!(a.find_failed_instances().unwrap(), vec!["node-b"]);
        // An instance never reports itself, even when stale.
        assert!(b.find_failed_instances().unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_recovery_requeues_abandoned_fire() {
        let path = temp_db("requeue");
        let clock = Arc::new(ManualClock::new(t0()));
        let a = store_at(&path, "node-a", clock.clone());
        let b = store_at(&path, "node-b", clock.clone());
        a.check_in().unwrap();
        b.check_in().unwrap();

        strand_fire(&b, false);
        drop(b);

        clock.advance(Duration::seconds(60));
        assert_eq!(a.recover_failed_instances().unwrap(), 1);

        let key = TriggerKey::named("t1");
        assert_eq!(a.trigger_state(&key).unwrap(), Some(TriggerState::Waiting));
        assert!(a
            .scheduler_states()
            .unwrap()
            .iter()
            .all(|s| s.instance_id != "node-b"));
        // At-least-once: the survivor can claim the fire again.
        let refires = a
            .acquire_next_triggers(clock.now(), 10, Duration::seconds(30))
            .unwrap();
        assert_eq!(refires.len(), 1);
        assert_eq!(refires[0].trigger.key, key);

        // A second sweep finds nothing left to do.
        assert_eq!(a.recover_failed_instances().unwrap(), 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_recovery_spawns_recovery_trigger_for_recoverable_job() {
        let path = temp_db("spawn");
        let clock = Arc::new(ManualClock::new(t0()));
        let a = store_at(&path, "node-a", clock.clone());
        let b = store_at(&path, "node-b", clock.clone());
        a.check_in().unwrap();
        b.check_in().unwrap();

        let fire_id = strand_fire(&b, true);
        drop(b);

        clock.advance(Duration::seconds(60));
        assert_eq!(a.recover_failed_instances().unwrap(), 1);

        // The one-shot original advanced past its consumed fire.
        assert_eq!(
            a.trigger_state(&TriggerKey::named("t1")).unwrap(),
            Some(TriggerState::Complete)
        );

        let fires = a
            .acquire_next_triggers(clock.now(), 10, Duration::seconds(30))
            .unwrap();
        assert_eq!(fires.len(), 1);
        let recovery = &fires[0].trigger;
        assert_eq!(recovery.key.group(), RECOVERING_TRIGGERS_GROUP);
        assert_eq!(recovery.key.name(), format!("recover_{fire_id}"));
        assert_eq!(recovery.job_key, JobKey::named("j"));
        assert_eq!(
            recovery.data.get_str(recovery_keys::ORIGINAL_TRIGGER_NAME),
            Some("t1")
        );
        assert_eq!(
            recovery.data.get_i64(recovery_keys::SCHEDULED_TIME),
            Some(t0().timestamp_millis())
        );

        // The recovery fire runs to completion like any other.
        match a.trigger_fired(&fires[0].fire_instance_id).unwrap() {
            FiredDisposition::Executing { job, .. } => assert!(job.recoverable),
            other => panic!("expected Executing, got {other:?}"),
        }
        a.triggered_job_complete(&fires[0].fire_instance_id, &FireResult::Success)
            .unwrap();
        assert_eq!(
            a.trigger_state(&recovery.key).unwrap(),
            Some(TriggerState::Complete)
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_recovery_clears_locks_held_by_the_dead() {
        let path = temp_db("locks");
        let clock = Arc::new(ManualClock::new(t0()));
        let a = store_at(&path, "node-a", clock.clone());
        a.check_in().unwrap();

        // Simulate a peer that died while owning STATE_ACCESS.
        let raw = Connection::open(&path).unwrap();
        raw.execute(
            "UPDATE CV_LOCKS SET OWNER = 'node-dead' WHERE LOCK_NAME = ?1",
            [LOCK_STATE_ACCESS],
        )
        .unwrap();
        raw.execute(
            "INSERT INTO CV_SCHEDULER_STATE (INSTANCE_ID, LAST_CHECKIN_TIME, CHECKIN_INTERVAL) \
             VALUES ('node-dead', ?1, 7500)",
            [t0().timestamp_millis() - 600_000],
        )
        .unwrap();

        assert_eq!(a.recover_failed_instances().unwrap(), 1);
        let owner: String = raw
            .query_row(
                "SELECT OWNER FROM CV_LOCKS WHERE LOCK_NAME = ?1",
                [LOCK_STATE_ACCESS],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(owner, "");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_startup_recovers_own_previous_run() {
        let path = temp_db("own");
        let clock = Arc::new(ManualClock::new(t0()));
        let first_run = store_at(&path, "node-a", clock.clone());
        first_run.check_in().unwrap();
        strand_fire(&first_run, false);
        drop(first_run);

        let second_run = store_at(&path, "node-a", clock.clone());
        assert_eq!(second_run.recover_own_fires().unwrap(), 1);
        assert_eq!(
            second_run.trigger_state(&TriggerKey::named("t1")).unwrap(),
            Some(TriggerState::Waiting)
        );
        // Fresh check-in after the sweep rejoins the cluster.
        second_run.check_in().unwrap();
        assert_eq!(second_run.scheduler_states().unwrap().len(), 1);

        let _ = std::fs::remove_file(&path);
    }
}
