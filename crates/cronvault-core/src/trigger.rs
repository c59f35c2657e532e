//! Triggers: a schedule plus metadata deciding when a job next runs.
//!
//! Schedule kinds are a tagged enum, and next-fire-time computation is a
//! pure function over `(trigger, after, calendar)`. The store never calls
//! a virtual method on a schedule: it persists the variant and calls
//! [`next_fire_time_after`], which keeps the store schedule-agnostic.

use crate::calendar::Calendar;
use crate::cron;
use crate::job::JobDataMap;
use crate::key::{JobKey, TriggerKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default trigger priority. Higher wins ties on equal fire time.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Group that recovery triggers are created in by the cluster recoverer.
pub const RECOVERING_TRIGGERS_GROUP: &str = "RECOVERING";

/// Bound on calendar-exclusion skips before giving up on a fire time.
const MAX_CALENDAR_SKIPS: usize = 500;

/// When and how often a trigger fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once.
    Once { at: DateTime<Utc> },
    /// Fire every `every_ms` starting at the trigger's start time.
    /// `repeat_count` bounds the number of repeats after the first fire;
    /// `None` repeats forever.
    Interval {
        every_ms: i64,
        repeat_count: Option<u32>,
    },
    /// Fire on a 5-field cron expression.
    Cron { expression: String },
}

/// What to do with a trigger whose fire time is more than the misfire
/// threshold in the past at acquisition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Advance to the next fire time after now, skipping missed fires.
    SmartSkip,
    /// Fire once immediately, then resume the normal schedule.
    FireNow,
    /// Leave the stale fire time alone and fire as if on time.
    Ignore,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmartSkip => "SMART_SKIP",
            Self::FireNow => "FIRE_NOW",
            Self::Ignore => "IGNORE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SMART_SKIP" => Some(Self::SmartSkip),
            "FIRE_NOW" => Some(Self::FireNow),
            "IGNORE" => Some(Self::Ignore),
            _ => None,
        }
    }
}

/// Store-visible trigger lifecycle state.
///
/// `WAITING → ACQUIRED → EXECUTING → { WAITING | COMPLETE | ERROR }`,
/// with `BLOCKED` parking non-concurrent fires and `PAUSED` orthogonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Blocked,
    Paused,
    Complete,
    Error,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Acquired => "ACQUIRED",
            Self::Executing => "EXECUTING",
            Self::Blocked => "BLOCKED",
            Self::Paused => "PAUSED",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(Self::Waiting),
            "ACQUIRED" => Some(Self::Acquired),
            "EXECUTING" => Some(Self::Executing),
            "BLOCKED" => Some(Self::Blocked),
            "PAUSED" => Some(Self::Paused),
            "COMPLETE" => Some(Self::Complete),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A persisted trigger. State lives in the store, not on this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub schedule: Schedule,
    /// Anchor for interval schedules and lower bound for the first fire.
    pub start_time: DateTime<Utc>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub priority: i32,
    pub misfire_policy: MisfirePolicy,
    pub calendar_name: Option<String>,
    pub times_triggered: u32,
    pub data: JobDataMap,
}

impl Trigger {
    pub fn new(
        key: TriggerKey,
        job_key: JobKey,
        schedule: Schedule,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            job_key,
            description: None,
            schedule,
            start_time,
            next_fire_time: None,
            previous_fire_time: None,
            priority: DEFAULT_PRIORITY,
            misfire_policy: MisfirePolicy::SmartSkip,
            calendar_name: None,
            times_triggered: 0,
            data: JobDataMap::new(),
        }
    }

    /// One-shot trigger firing at `at`.
    pub fn once(key: TriggerKey, job_key: JobKey, at: DateTime<Utc>) -> Self {
        Self::new(key, job_key, Schedule::Once { at }, at)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_calendar(mut self, name: impl Into<String>) -> Self {
        self.calendar_name = Some(name.into());
        self
    }

    pub fn with_data(mut self, data: JobDataMap) -> Self {
        self.data = data;
        self
    }
}

/// Next fire time strictly after `after`, honoring the calendar's
/// exclusions. `None` means the schedule is exhausted.
pub fn next_fire_time_after(
    trigger: &Trigger,
    after: DateTime<Utc>,
    calendar: Option<&Calendar>,
) -> Option<DateTime<Utc>> {
    let mut after = after;
    for _ in 0..MAX_CALENDAR_SKIPS {
        let candidate = next_raw(trigger, after)?;
        let Some(cal) = calendar else {
            return Some(candidate);
        };
        if cal.is_included(candidate) {
            return Some(candidate);
        }
        // Jump to the end of the exclusion covering the candidate; back off
        // one millisecond so a fire landing exactly on the range end is kept.
        let resume = cal.next_included_after(candidate)? - Duration::milliseconds(1);
        after = resume.max(candidate);
    }
    None
}

/// First fire time at or after the trigger's start time.
pub fn initial_fire_time(trigger: &Trigger, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
    next_fire_time_after(
        trigger,
        trigger.start_time - Duration::milliseconds(1),
        calendar,
    )
}

/// Schedule math without calendar filtering.
fn next_raw(trigger: &Trigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &trigger.schedule {
        Schedule::Once { at } => (*at > after).then_some(*at),
        Schedule::Interval {
            every_ms,
            repeat_count,
        } => {
            let start = trigger.start_time;
            if *every_ms <= 0 {
                // Degenerate interval behaves as one-shot at the start time.
                return (start > after).then_some(start);
            }
            let n: i64 = if after < start {
                0
            } else {
                (after - start).num_milliseconds() / every_ms + 1
            };
            if let Some(rc) = repeat_count {
                if n > *rc as i64 {
                    return None;
                }
            }
            Some(start + Duration::milliseconds(every_ms * n))
        }
        Schedule::Cron { expression } => cron::next_after(expression, after),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, s).unwrap()
    }

    fn interval_trigger(every_secs: i64, repeat_count: Option<u32>) -> Trigger {
        Trigger::new(
            TriggerKey::named("t"),
            JobKey::named("j"),
            Schedule::Interval {
                every_ms: every_secs * 1000,
                repeat_count,
            },
            t(10, 0, 0),
        )
    }

    #[test]
    fn test_once_fires_once() {
        let trig = Trigger::once(TriggerKey::named("t"), JobKey::named("j"), t(12, 0, 0));
        assert_eq!(initial_fire_time(&trig, None), Some(t(12, 0, 0)));
        assert_eq!(next_fire_time_after(&trig, t(12, 0, 0), None), None);
    }

    #[test]
    fn test_interval_anchored_to_start() {
        let trig = interval_trigger(60, None);
        assert_eq!(initial_fire_time(&trig, None), Some(t(10, 0, 0)));
        assert_eq!(next_fire_time_after(&trig, t(10, 0, 0), None), Some(t(10, 1, 0)));
        // A late "after" snaps to the next multiple of the interval, not
        // to after + interval.
        assert_eq!(next_fire_time_after(&trig, t(10, 2, 30), None), Some(t(10, 3, 0)));
    }

    #[test]
    fn test_interval_repeat_count_exhausts() {
        // First fire + 2 repeats = fires at 10:00, 10:01, 10:02.
        let trig = interval_trigger(60, Some(2));
        assert_eq!(next_fire_time_after(&trig, t(10, 1, 0), None), Some(t(10, 2, 0)));
        assert_eq!(next_fire_time_after(&trig, t(10, 2, 0), None), None);
    }

    #[test]
    fn test_next_fire_strictly_increases() {
        let trig = interval_trigger(30, None);
        let mut prev = initial_fire_time(&trig, None).unwrap();
        for _ in 0..100 {
            let next = next_fire_time_after(&trig, prev, None).unwrap();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_calendar_exclusion_skips_range() {
        let cal = Calendar::new().exclude(t(10, 0, 30), t(10, 2, 30));
        let trig = interval_trigger(60, None);
        // 10:01 and 10:02 fall inside the exclusion; next allowed is 10:03.
        assert_eq!(
            next_fire_time_after(&trig, t(10, 0, 0), Some(&cal)),
            Some(t(10, 3, 0))
        );
    }

    #[test]
    fn test_calendar_allows_fire_at_range_end() {
        let cal = Calendar::new().exclude(t(10, 0, 30), t(10, 2, 0));
        let trig = interval_trigger(60, None);
        assert_eq!(
            next_fire_time_after(&trig, t(10, 0, 0), Some(&cal)),
            Some(t(10, 2, 0))
        );
    }

    #[test]
    fn test_cron_schedule() {
        let trig = Trigger::new(
            TriggerKey::named("t"),
            JobKey::named("j"),
            Schedule::Cron {
                expression: "*/10 * * * *".into(),
            },
            t(10, 0, 0),
        );
        assert_eq!(initial_fire_time(&trig, None), Some(t(10, 0, 0)));
        assert_eq!(next_fire_time_after(&trig, t(10, 0, 0), None), Some(t(10, 10, 0)));
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            TriggerState::Waiting,
            TriggerState::Acquired,
            TriggerState::Executing,
            TriggerState::Blocked,
            TriggerState::Paused,
            TriggerState::Complete,
            TriggerState::Error,
        ] {
            assert_eq!(TriggerState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TriggerState::parse("NOPE"), None);
    }

    #[test]
    fn test_misfire_policy_round_trip() {
        for p in [
            MisfirePolicy::SmartSkip,
            MisfirePolicy::FireNow,
            MisfirePolicy::Ignore,
        ] {
            assert_eq!(MisfirePolicy::parse(p.as_str()), Some(p));
        }
    }
}
