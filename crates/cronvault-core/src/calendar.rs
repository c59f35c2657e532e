//! Named exclusion calendars.
//!
//! A calendar is pure data: a set of half-open time ranges during which a
//! trigger must not fire. Fire-time computation consults the calendar and
//! advances past excluded ranges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A half-open exclusion range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl ExclusionRange {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from <= t && t < self.to
    }
}

/// A named set of excluded time ranges referenced by triggers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub excluded: Vec<ExclusionRange>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.excluded.push(ExclusionRange { from, to });
        self
    }

    /// True when firing at `t` is allowed.
    pub fn is_included(&self, t: DateTime<Utc>) -> bool {
        !self.excluded.iter().any(|r| r.contains(t))
    }

    /// The end of the exclusion range covering `t`, if any. Schedules use
    /// this to jump past an exclusion instead of scanning through it.
    pub fn next_included_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.excluded.iter().find(|r| r.contains(t)).map(|r| r.to)
    }
}
