//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field syntax: *, */N, N, N,M,...
//! Example: "0 8 * * *" = every day at 8:00

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// Parse a 5-field cron expression and compute the first matching minute
/// strictly after `after`. Returns `None` for a malformed expression, or
/// when no minute within the next 366 days matches.
pub fn next_after(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
        tracing::warn!(
            "Invalid cron expression: '{}' (need 5 fields: MIN HOUR DOM MON DOW)",
            expression
        );
        return None;
    }

    let minutes = parse_field(parts[0], 0, 59)?;
    let hours = parse_field(parts[1], 0, 23)?;
    let doms = parse_field(parts[2], 1, 31)?;
    let months = parse_field(parts[3], 1, 12)?;
    let dows = parse_field(parts[4], 0, 6)?;

    let mut candidate = (after + Duration::minutes(1))
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(after);

    // Minute-resolution scan, bounded at a leap year ahead.
    for _ in 0..(366 * 24 * 60) {
        if minutes.contains(&candidate.minute())
            && hours.contains(&candidate.hour())
            && doms.contains(&candidate.day())
            && months.contains(&candidate.month())
            && dows.contains(&candidate.weekday().num_days_from_sunday())
        {
            return Some(candidate);
        }
        candidate += Duration::minutes(1);
    }

    None
}

/// True when the expression parses as 5 valid fields.
pub fn is_valid(expression: &str) -> bool {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    parts.len() == 5
        && parse_field(parts[0], 0, 59).is_some()
        && parse_field(parts[1], 0, 23).is_some()
        && parse_field(parts[2], 1, 31).is_some()
        && parse_field(parts[3], 1, 12).is_some()
        && parse_field(parts[4], 0, 6).is_some()
}

/// Parse a cron field into a list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    // */N: every N
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((min..=max).step_by(n as usize).collect());
    }

    // Comma-separated: "0,15,30,45"
    if field.contains(',') {
        let vals: Result<Vec<u32>, _> = field.split(',').map(|s| s.trim().parse()).collect();
        let vals = vals.ok()?;
        if vals.iter().any(|v| *v < min || *v > max) {
            return None;
        }
        return Some(vals);
    }

    // Single number
    let n: u32 = field.parse().ok()?;
    if n >= min && n <= max {
        Some(vec![n])
    } else {
        None
    }
}
