//! Job definitions: the unit of work referenced by triggers.

use crate::key::JobKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Reserved data-map keys attached to recovery triggers so a re-executed
/// job can see what it is recovering from.
pub mod recovery_keys {
    /// Name of the trigger whose fire was abandoned.
    pub const ORIGINAL_TRIGGER_NAME: &str = "cv.recovery.trigger_name";
    /// Group of the trigger whose fire was abandoned.
    pub const ORIGINAL_TRIGGER_GROUP: &str = "cv.recovery.trigger_group";
    /// Epoch-millis instant the abandoned fire was scheduled for.
    pub const SCHEDULED_TIME: &str = "cv.recovery.scheduled_time";
    /// Epoch-millis instant the abandoned fire actually started.
    pub const FIRED_TIME: &str = "cv.recovery.fired_time";
}

/// String-keyed bag of values carried with a job. Stored as a blob by the
/// dialect delegate; JSON values keep it product-neutral.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobDataMap(pub BTreeMap<String, Value>);

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Outcome of one job execution, reported back to the store so it can
/// advance (or, for a veto, not advance) the firing trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum FireResult {
    Success,
    /// Execution ran and failed; the trigger still advances.
    Failure(String),
    /// Execution was declined before it started; the trigger returns to
    /// WAITING without advancing its schedule.
    Veto,
}

/// A persisted job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    /// Identity. Immutable once stored.
    pub key: JobKey,
    /// Name of the handler in the engine's registry that executes this job.
    pub handler: String,
    pub description: Option<String>,
    /// A durable job survives with zero triggers; a non-durable job is
    /// deleted together with its last trigger.
    pub durable: bool,
    /// Re-execute via a recovery trigger if an instance dies mid-fire.
    pub recoverable: bool,
    /// When false, at most one fire of this job executes cluster-wide at a
    /// time; concurrent fires are blocked and retried.
    pub concurrent: bool,
    pub data: JobDataMap,
}

impl JobDetail {
    /// A durable, concurrent, non-recoverable job with an empty data map.
    pub fn new(key: JobKey, handler: impl Into<String>) -> Self {
        Self {
            key,
            handler: handler.into(),
            description: None,
            durable: true,
            recoverable: false,
            concurrent: true,
            data: JobDataMap::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_map_typed_getters() {
        let mut data = JobDataMap::new();
        data.insert("report", "daily");
        data.insert("retries", 3);
        assert_eq!(data.get_str("report"), Some("daily"));
        assert_eq!(data.get_i64("retries"), Some(3));
        assert_eq!(data.get_str("missing"), None);
    }

    #[test]
    fn test_builder_flags() {
        let job = JobDetail::new(JobKey::named("cleanup"), "cleanup-handler")
            .durable(false)
            .recoverable(true)
            .concurrent(false);
        assert!(!job.durable);
        assert!(job.recoverable);
        assert!(!job.concurrent);
    }
}
