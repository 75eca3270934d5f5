//! Trigger kinds and their fire-time arithmetic.

use caseflow_core::{CaseflowError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronMatcher;

/// Five cron fields kept as strings so the wire shape mirrors the
/// stored `trigger_params` JSON. Parsed on demand by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronSpec {
    #[serde(default = "star")]
    pub minute: String,
    #[serde(default = "star")]
    pub hour: String,
    #[serde(default = "star")]
    pub day: String,
    #[serde(default = "star")]
    pub month: String,
    #[serde(default = "star")]
    pub day_of_week: String,
}

fn star() -> String {
    "*".into()
}

/// When a job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire once at an absolute instant.
    Date { run_at: DateTime<Utc> },
    /// Fire every `seconds`, starting one period from creation.
    Interval { seconds: u64 },
    /// Fire on every matching wall-clock minute.
    Cron(CronSpec),
}

impl Trigger {
    /// Reassemble from the opaque `(kind, params)` pair the store keeps.
    pub fn from_parts(kind: &str, params: &serde_json::Value) -> Result<Self> {
        let trigger = match kind {
            "date" => Trigger::Date {
                run_at: serde_json::from_value(params["run_at"].clone())
                    .map_err(|e| CaseflowError::InvalidArgument(format!("date trigger: {e}")))?,
            },
            "interval" => Trigger::Interval {
                seconds: params["seconds"].as_u64().ok_or_else(|| {
                    CaseflowError::InvalidArgument("interval trigger needs seconds".into())
                })?,
            },
            "cron" => Trigger::Cron(
                serde_json::from_value(params.clone())
                    .map_err(|e| CaseflowError::InvalidArgument(format!("cron trigger: {e}")))?,
            ),
            other => {
                return Err(CaseflowError::InvalidArgument(format!(
                    "unknown trigger kind '{other}'"
                )))
            }
        };
        Ok(trigger)
    }

    /// Split into the `(kind, params)` pair the store keeps.
    pub fn to_parts(&self) -> (&'static str, serde_json::Value) {
        match self {
            Trigger::Date { run_at } => ("date", serde_json::json!({ "run_at": run_at })),
            Trigger::Interval { seconds } => ("interval", serde_json::json!({ "seconds": seconds })),
            Trigger::Cron(spec) => ("cron", serde_json::to_value(spec).unwrap_or_default()),
        }
    }

    /// Reject triggers that can never fire. Runs before anything is
    /// persisted so a bad job leaves no trace.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        match self {
            Trigger::Date { run_at } => {
                if *run_at <= now {
                    return Err(CaseflowError::InvalidArgument(format!(
                        "run date {run_at} is in the past"
                    )));
                }
            }
            Trigger::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(CaseflowError::InvalidArgument(
                        "interval must be at least one second".into(),
                    ));
                }
            }
            Trigger::Cron(spec) => {
                if CronMatcher::parse(spec).is_none() {
                    return Err(CaseflowError::InvalidArgument(format!(
                        "invalid cron fields '{} {} {} {} {}'",
                        spec.minute, spec.hour, spec.day, spec.month, spec.day_of_week
                    )));
                }
            }
        }
        Ok(())
    }

    /// Next fire strictly after `after`; `None` when the trigger is spent.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Date { run_at } => (*run_at > after).then_some(*run_at),
            Trigger::Interval { seconds } => Some(after + Duration::seconds(*seconds as i64)),
            Trigger::Cron(spec) => CronMatcher::parse(spec)?.next_fire(after),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_past_date_rejected() {
        let now = Utc::now();
        let trigger = Trigger::Date { run_at: now - Duration::hours(1) };
        assert!(matches!(
            trigger.validate(now),
            Err(CaseflowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Trigger::Interval { seconds: 0 }.validate(Utc::now()).is_err());
        assert!(Trigger::Interval { seconds: 60 }.validate(Utc::now()).is_ok());
    }

    #[test]
    fn test_date_trigger_is_one_shot() {
        let at = Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap();
        let trigger = Trigger::Date { run_at: at };
        assert_eq!(trigger.next_fire(at - Duration::days(1)), Some(at));
        assert_eq!(trigger.next_fire(at), None);
    }

    #[test]
    fn test_parts_round_trip() {
        let trigger = Trigger::Cron(CronSpec {
            minute: "0".into(),
            hour: "8".into(),
            day: "*".into(),
            month: "*".into(),
            day_of_week: "0,4".into(),
        });
        let (kind, params) = trigger.to_parts();
        assert_eq!(kind, "cron");
        let back = Trigger::from_parts(kind, &params).unwrap();
        assert!(matches!(back, Trigger::Cron(ref s) if s.day_of_week == "0,4"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Trigger::from_parts("calendar", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, CaseflowError::InvalidArgument(_)));
    }
}
