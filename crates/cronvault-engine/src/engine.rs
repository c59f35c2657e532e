//! The scheduler runtime: acquisition ticks, worker dispatch, cluster
//! heartbeat and recovery sweeps.
//!
//! One `Scheduler` drives one store instance. The main loop claims due
//! triggers in batches sized to the free worker pool, hands each claimed
//! fire to its handler on the blocking pool, and reports the outcome back
//! to the store. Heartbeat and recovery run as independent loops so a
//! slow tick never delays failure detection.

use crate::runner::{JobContext, JobRegistry};
use cronvault_core::{FireResult, Result, SchedulerConfig, StoreError};
use cronvault_store::{AcquiredFire, FiredDisposition, JobStore};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};

/// The runtime facade over one store instance.
pub struct Scheduler {
    store: Arc<JobStore>,
    registry: JobRegistry,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>, registry: JobRegistry, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            workers: Arc::new(Semaphore::new(config.max_workers)),
            store,
            registry,
            config,
            shutdown,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// One acquisition pass: claim up to a pool-limited batch of due
    /// triggers and dispatch them. Returns the number claimed. A full
    /// worker pool shrinks the batch, down to skipping the pass entirely.
    pub async fn tick(&self) -> Result<usize> {
        let batch = self
            .workers
            .available_permits()
            .min(self.config.max_batch_size);
        if batch == 0 {
            return Ok(0);
        }
        let now = self.store.clock().now();
        let fires =
            self.store
                .acquire_next_triggers(now, batch, self.config.lookahead_window())?;
        let count = fires.len();
        // A dispatch failure is scoped to its own fire: the failed claim is
        // given back and the rest of the batch still runs. Stopping here
        // would strand the remaining claims as ACQUIRED rows owned by a
        // live instance, which neither acquisition nor cluster recovery
        // would ever revisit.
        let mut first_err = None;
        for fire in fires {
            let outcome = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(permit) => self.dispatch(fire, permit),
                Err(_) => {
                    self.release_fire(&fire.fire_instance_id);
                    Err(StoreError::Fatal("worker semaphore closed".into()))
                }
            };
            if let Err(e) = outcome {
                tracing::warn!("⚠️ Dispatch failed, claim released: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Wait until every in-flight job on this instance has completed.
    pub async fn quiesce(&self) {
        let all = self.config.max_workers as u32;
        if let Ok(permits) = self.workers.acquire_many(all).await {
            drop(permits);
        }
    }

    fn dispatch(&self, fire: AcquiredFire, permit: OwnedSemaphorePermit) -> Result<()> {
        match self.store.trigger_fired(&fire.fire_instance_id) {
            Ok(FiredDisposition::Executing { trigger, job }) => {
                let Some(runner) = self.registry.get(&job.handler) else {
                    tracing::error!("🚫 No handler '{}' for job {}", job.handler, job.key);
                    let result =
                        FireResult::Failure(format!("no handler '{}' registered", job.handler));
                    return self
                        .store
                        .triggered_job_complete(&fire.fire_instance_id, &result);
                };
                tracing::debug!("▶️ Firing job {} via '{}'", job.key, job.handler);
                let store = Arc::clone(&self.store);
                let ctx = JobContext {
                    job,
                    trigger,
                    fire_instance_id: fire.fire_instance_id,
                    scheduled_time: fire.scheduled_time,
                };
                tokio::task::spawn_blocking(move || {
                    let result = runner.run(&ctx);
                    if let Err(e) = store.triggered_job_complete(&ctx.fire_instance_id, &result) {
                        tracing::error!(
                            "🚫 Failed to record completion of {}: {}",
                            ctx.fire_instance_id,
                            e
                        );
                    }
                    drop(permit);
                });
                Ok(())
            }
            Ok(FiredDisposition::Blocked) | Ok(FiredDisposition::Vanished) => Ok(()),
            Err(e) => {
                // Give the claim back so a later tick (or another
                // instance) can pick it up.
                self.release_fire(&fire.fire_instance_id);
                Err(e)
            }
        }
    }

    fn release_fire(&self, fire_instance_id: &str) {
        if let Err(e) = self.store.release_acquired_fire(fire_instance_id) {
            tracing::warn!("⚠️ Failed to release fire {}: {}", fire_instance_id, e);
        }
    }

    /// Run until [`shutdown`](Self::shutdown): recover this instance's own
    /// leftovers, join the cluster, then poll. Transient store errors are
    /// logged and retried on the next tick; only a fatal error stops the
    /// scheduler.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        match self.store.recover_own_fires() {
            Ok(0) => {}
            Ok(n) => tracing::info!("🛠️ Recovered {} fire(s) from a previous run", n),
            Err(e) => tracing::warn!("⚠️ Startup self-recovery failed: {e}"),
        }
        if let Err(e) = self.store.check_in() {
            if e.is_fatal() {
                return Err(e);
            }
            tracing::warn!("⚠️ Initial check-in failed, heartbeat will retry: {e}");
        }
        tracing::info!(
            "⏰ Scheduler '{}' started (poll every {}ms, {} workers)",
            self.store.instance_id(),
            self.config.poll_interval_ms,
            self.config.max_workers
        );

        if self.config.cluster_enabled {
            tokio::spawn(Arc::clone(&self).heartbeat_loop());
            tokio::spawn(Arc::clone(&self).recovery_loop());
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut interval =
            tokio::time::interval(StdDuration::from_millis(self.config.poll_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            tracing::error!("🚫 Scheduler stopping on fatal store error: {e}");
                            return Err(e);
                        }
                        Err(e) => tracing::warn!("⚠️ Tick failed, will retry: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("🛑 Scheduler '{}' shutting down", self.store.instance_id());
                    self.quiesce().await;
                    return Ok(());
                }
            }
        }
    }

    /// Signal every loop to stop. `run` drains in-flight jobs before
    /// returning.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval =
            tokio::time::interval(StdDuration::from_millis(self.config.checkin_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.store.check_in() {
                        tracing::warn!("⚠️ Check-in failed: {e}");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn recovery_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval =
            tokio::time::interval(StdDuration::from_millis(self.config.recovery_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.store.recover_failed_instances() {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("🛠️ Recovered {} failed instance(s)", n),
                        Err(e) => tracing::warn!("⚠️ Recovery sweep failed: {e}"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use cronvault_core::{
        JobDetail, JobKey, ManualClock, Trigger, TriggerKey, TriggerState,
    };
    use cronvault_store::{DriverDelegate, SqliteDelegate, UpdateLockRowSemaphore};
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, mpsc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup(max_workers: usize) -> (Arc<JobStore>, SchedulerConfig) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let config = SchedulerConfig {
            instance_id: "engine-test".into(),
            max_workers,
            ..SchedulerConfig::default()
        };
        let store = JobStore::open_with(
            Connection::open_in_memory().unwrap(),
            Box::new(SqliteDelegate),
            Box::new(UpdateLockRowSemaphore::default()),
            &config,
            Arc::new(ManualClock::new(t0())),
        )
        .unwrap();
        (Arc::new(store), config)
    }

    fn once_trigger(name: &str, job: &str) -> Trigger {
        Trigger::once(TriggerKey::named(name), JobKey::named(job), t0())
    }

    #[tokio::test]
    async fn test_tick_runs_job_to_completion() {
        let (store, config) = setup(4);
        store
            .store_job(&JobDetail::new(JobKey::named("j1"), "count").durable(false), false)
            .unwrap();
        store.store_trigger(&once_trigger("t1", "j1"), false).unwrap();

        let registry = JobRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        registry.register("count", move |_: &JobContext| {
            c.fetch_add(1, Ordering::SeqCst);
            FireResult::Success
        });

        let scheduler = Scheduler::new(store.clone(), registry, config);
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        scheduler.quiesce().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.trigger_state(&TriggerKey::named("t1")).unwrap(),
            Some(TriggerState::Complete)
        );
        assert!(store.retrieve_job(&JobKey::named("j1")).unwrap().is_none());
        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_handler_is_recorded_as_failure() {
        let (store, config) = setup(4);
        store
            .store_job(&JobDetail::new(JobKey::named("j1"), "ghost"), false)
            .unwrap();
        store.store_trigger(&once_trigger("t1", "j1"), false).unwrap();

        let scheduler = Scheduler::new(store.clone(), JobRegistry::new(), config);
        assert_eq!(scheduler.tick().await.unwrap(), 1);

        // A failed fire still advances the schedule; a one-shot completes.
        assert_eq!(
            store.trigger_state(&TriggerKey::named("t1")).unwrap(),
            Some(TriggerState::Complete)
        );
    }

    #[tokio::test]
    async fn test_full_worker_pool_shrinks_the_batch_to_zero() {
        let (store, config) = setup(1);
        store
            .store_job(&JobDetail::new(JobKey::named("j1"), "gate"), false)
            .unwrap();
        store.store_trigger(&once_trigger("a", "j1"), false).unwrap();
        store.store_trigger(&once_trigger("b", "j1"), false).unwrap();

        let registry = JobRegistry::new();
        let (tx, rx) = mpsc::channel::<()>();
        let rx = Mutex::new(rx);
        registry.register("gate", move |_: &JobContext| {
            rx.lock().unwrap().recv().unwrap();
            FireResult::Success
        });

        let scheduler = Scheduler::new(store.clone(), registry, config);
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        // The only worker is occupied: the next pass must not claim.
        assert_eq!(scheduler.tick().await.unwrap(), 0);

        tx.send(()).unwrap();
        scheduler.quiesce().await;
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        tx.send(()).unwrap();
        scheduler.quiesce().await;

        for name in ["a", "b"] {
            assert_eq!(
                store.trigger_state(&TriggerKey::named(name)).unwrap(),
                Some(TriggerState::Complete)
            );
        }
    }

    /// Delegate whose mark-executing statement references a missing table,
    /// so promoting any claim to EXECUTING fails while the release path
    /// still works.
    #[derive(Debug, Default, Clone, Copy)]
    struct BrokenDelegate;

    impl DriverDelegate for BrokenDelegate {
        fn update_fired_trigger_state_from_sql(&self) -> &'static str {
            "UPDATE {0}GONE SET STATE = ?2 WHERE FIRE_INSTANCE_ID = ?1 AND STATE = ?3"
        }
    }

    #[tokio::test]
    async fn test_dispatch_error_releases_the_whole_batch() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let config = SchedulerConfig {
            instance_id: "engine-test".into(),
            ..SchedulerConfig::default()
        };
        let store = Arc::new(
            JobStore::open_with(
                Connection::open_in_memory().unwrap(),
                Box::new(BrokenDelegate),
                Box::new(UpdateLockRowSemaphore::default()),
                &config,
                Arc::new(ManualClock::new(t0())),
            )
            .unwrap(),
        );
        store
            .store_job(&JobDetail::new(JobKey::named("j1"), "noop"), false)
            .unwrap();
        store.store_trigger(&once_trigger("a", "j1"), false).unwrap();
        store.store_trigger(&once_trigger("b", "j1"), false).unwrap();

        let registry = JobRegistry::new();
        registry.register("noop", |_: &JobContext| FireResult::Success);
        let scheduler = Scheduler::new(store.clone(), registry, config);

        // Every dispatch fails, but each claim must be given back rather
        // than left ACQUIRED forever.
        assert!(scheduler.tick().await.is_err());
        for name in ["a", "b"] {
            assert_eq!(
                store.trigger_state(&TriggerKey::named(name)).unwrap(),
                Some(TriggerState::Waiting)
            );
        }
        let again = store
            .acquire_next_triggers(t0(), 10, chrono::Duration::seconds(30))
            .unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn test_startup_survives_transient_check_in_failure() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let path = std::env::temp_dir().join(format!(
            "cronvault-heartbeat-{}.db",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let config = SchedulerConfig {
            instance_id: "engine-test".into(),
            ..SchedulerConfig::default()
        };
        let store = JobStore::open_with(
            Connection::open(&path).unwrap(),
            Box::new(SqliteDelegate),
            Box::new(UpdateLockRowSemaphore::new(
                StdDuration::from_millis(50),
                StdDuration::from_millis(5),
            )),
            &config,
            Arc::new(ManualClock::new(t0())),
        )
        .unwrap();

        // Another process holds STATE_ACCESS, so the initial check-in hits
        // the bounded lock wait and times out.
        let raw = Connection::open(&path).unwrap();
        raw.execute(
            "UPDATE CV_LOCKS SET OWNER = 'intruder' WHERE LOCK_NAME = 'STATE_ACCESS'",
            [],
        )
        .unwrap();

        let scheduler = Arc::new(Scheduler::new(Arc::new(store), JobRegistry::new(), config));
        let handle = tokio::spawn(Arc::clone(&scheduler).run());
        tokio::time::sleep(StdDuration::from_millis(500)).await;
        scheduler.shutdown();

        // A transient check-in failure must not abort startup.
        assert!(handle.await.unwrap().is_ok());
        assert!(scheduler.store().scheduler_states().unwrap().is_empty());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_vetoed_fire_leaves_trigger_waiting() {
        let (store, config) = setup(2);
        store
            .store_job(&JobDetail::new(JobKey::named("j1"), "veto"), false)
            .unwrap();
        store.store_trigger(&once_trigger("t1", "j1"), false).unwrap();

        let registry = JobRegistry::new();
        registry.register("veto", |_: &JobContext| FireResult::Veto);

        let scheduler = Scheduler::new(store.clone(), registry, config);
        assert_eq!(scheduler.tick().await.unwrap(), 1);
        scheduler.quiesce().await;

        let key = TriggerKey::named("t1");
        assert_eq!(store.trigger_state(&key).unwrap(), Some(TriggerState::Waiting));
        assert_eq!(
            store.retrieve_trigger(&key).unwrap().unwrap().next_fire_time,
            Some(t0())
        );
    }
}
