//! Cron trigger expressions.
//!
//! Expressions carry a seconds field: `sec min hour day month weekday [year]`.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use super::SchedulerError;

/// Upper bound on firings listed for one trigger in a single window.
pub const MAX_FIRINGS: usize = 10_000;

/// A parsed trigger expression.
#[derive(Debug, Clone)]
pub struct Trigger {
    expr: String,
    schedule: CronSchedule,
}

impl Trigger {
    pub fn parse(expr: &str) -> Result<Self, SchedulerError> {
        let schedule = CronSchedule::from_str(expr.trim()).map_err(|e| SchedulerError::InvalidTrigger {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }

    /// Firings in `(from, from + window]`, at most [`MAX_FIRINGS`] of them.
    /// A window reaching past the last representable time ends there.
    pub fn firings_within(&self, from: &DateTime<Utc>, window: Duration) -> Vec<DateTime<Utc>> {
        let end = from.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.schedule
            .after(from)
            .take_while(|t| *t <= end)
            .take(MAX_FIRINGS)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_seconds_resolution() {
        let trigger = Trigger::parse("*/10 * * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 3).unwrap();
        let next = trigger.next_after(&base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 10).unwrap());
    }

    #[test]
    fn test_invalid_expression_rejected() {
        let err = Trigger::parse("not-a-cron").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTrigger { .. }));
    }

    #[test]
    fn test_firings_within_window() {
        let trigger = Trigger::parse("0 0 */4 * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let runs = trigger.firings_within(&base, Duration::hours(24));
        // 04, 08, 12, 16, 20, and midnight of the next day.
        assert_eq!(runs.len(), 6);
        assert!(runs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_firings_within_unbounded_window() {
        let trigger = Trigger::parse("* * * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let runs = trigger.firings_within(&base, Duration::MAX);
        assert_eq!(runs.len(), MAX_FIRINGS);
        assert_eq!(runs[0], Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 1).unwrap());
    }
}
