//! Five-field cron matching: "MIN HOUR DOM MON DOW".
//! Fields accept `*`, `*/N`, a single value, or a comma list.
//! DOW uses 0-6 with 0 = Monday.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::triggers::CronSpec;

/// One parsed cron field as the set of matching values.
#[derive(Debug, Clone)]
pub(crate) struct FieldSet(Vec<u32>);

impl FieldSet {
    fn contains(&self, v: u32) -> bool {
        self.0.contains(&v)
    }
}

/// Parse a cron field into its matching values, or `None` when the
/// field is malformed or out of range.
pub(crate) fn parse_field(field: &str, min: u32, max: u32) -> Option<FieldSet> {
    if field == "*" {
        return Some(FieldSet((min..=max).collect()));
    }

    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some(FieldSet((min..=max).step_by(n as usize).collect()));
    }

    if field.contains(',') {
        let vals: Result<Vec<u32>, _> = field.split(',').map(|s| s.trim().parse()).collect();
        let vals = vals.ok()?;
        if vals.iter().any(|v| *v < min || *v > max) {
            return None;
        }
        return Some(FieldSet(vals));
    }

    let n: u32 = field.parse().ok()?;
    if n >= min && n <= max {
        Some(FieldSet(vec![n]))
    } else {
        None
    }
}

pub(crate) struct CronMatcher {
    minutes: FieldSet,
    hours: FieldSet,
    days: FieldSet,
    months: FieldSet,
    weekdays: FieldSet,
}

impl CronMatcher {
    pub(crate) fn parse(spec: &CronSpec) -> Option<Self> {
        Some(Self {
            minutes: parse_field(&spec.minute, 0, 59)?,
            hours: parse_field(&spec.hour, 0, 23)?,
            days: parse_field(&spec.day, 1, 31)?,
            months: parse_field(&spec.month, 1, 12)?,
            weekdays: parse_field(&spec.day_of_week, 0, 6)?,
        })
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        self.months.contains(t.month())
            && self.days.contains(t.day())
            && self.weekdays.contains(t.weekday().num_days_from_monday())
    }

    /// First matching minute strictly after `after`, searched up to a
    /// year ahead. Day-level mismatches skip to the next midnight so the
    /// search stays cheap even for sparse specs.
    pub(crate) fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after);

        let horizon = after + Duration::days(366);
        while candidate <= horizon {
            if !self.day_matches(candidate) {
                candidate = (candidate + Duration::days(1))
                    .with_hour(0)
                    .and_then(|t| t.with_minute(0))
                    .unwrap_or(candidate + Duration::days(1));
                continue;
            }
            if self.hours.contains(candidate.hour()) && self.minutes.contains(candidate.minute()) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}
