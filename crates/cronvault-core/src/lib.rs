//! # Cronvault Core
//!
//! Shared data model for the Cronvault clustered job scheduler.
//!
//! This crate holds everything that is pure data or pure computation:
//! job/trigger identity, trigger schedules and their next-fire-time math,
//! exclusion calendars, the misfire policies, the injectable clock, the
//! error taxonomy, and the configuration surface. Nothing in here touches
//! a database: persistence lives in `cronvault-store`, the runtime loops
//! in `cronvault-engine`.

pub mod calendar;
pub mod clock;
pub mod config;
pub mod cron;
pub mod error;
pub mod job;
pub mod key;
pub mod trigger;

pub use calendar::Calendar;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::{Result, StoreError};
pub use job::{FireResult, JobDataMap, JobDetail};
pub use key::{JobKey, Key, TriggerKey};
pub use trigger::{MisfirePolicy, Schedule, Trigger, TriggerState};
