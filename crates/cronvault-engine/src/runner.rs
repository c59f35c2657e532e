//! Job handlers and the registry that resolves them by name.
//!
//! A job row stores only a handler name; the registry maps that name to
//! the code that runs. Handlers execute on the blocking pool, so they may
//! do synchronous work freely.

use chrono::{DateTime, Utc};
use cronvault_core::{FireResult, JobDataMap, JobDetail, Trigger};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Everything a handler sees about the fire it is servicing.
pub struct JobContext {
    pub job: JobDetail,
    pub trigger: Trigger,
    pub fire_instance_id: String,
    /// The instant this fire was scheduled for, which may lag the wall
    /// clock after a misfire or recovery.
    pub scheduled_time: DateTime<Utc>,
}

impl JobContext {
    /// Job data overlaid with trigger data; the trigger wins collisions.
    pub fn merged_data(&self) -> JobDataMap {
        let mut merged = self.job.data.clone();
        for (k, v) in &self.trigger.data.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// The unit of executable work.
pub trait JobRunner: Send + Sync {
    fn run(&self, ctx: &JobContext) -> FireResult;
}

impl<F> JobRunner for F
where
    F: Fn(&JobContext) -> FireResult + Send + Sync,
{
    fn run(&self, ctx: &JobContext) -> FireResult {
        self(ctx)
    }
}

/// Name → handler map shared by the engine loops. Cloning is cheap and
/// clones observe later registrations.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobRunner>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, runner: impl JobRunner + 'static) {
        let name = name.into();
        tracing::info!("📇 Handler registered: '{}'", name);
        self.handlers
            .write()
            .expect("registry lock poisoned")
            .insert(name, Arc::new(runner));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobRunner>> {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
