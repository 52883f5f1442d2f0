//! Cron schedules for `schedule` trigger nodes.

use crate::error::ScheduleError;
use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use std::str::FromStr;

/// A parsed cron expression evaluated in a fixed timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    offset: FixedOffset,
}

impl CronSchedule {
    /// Parses a cron expression.
    ///
    /// Five-field expressions have minute precision and get a `0` seconds
    /// field prepended; six and seven-field expressions are taken as-is.
    /// `timezone` is `UTC` (the default) or a fixed offset like `+02:00`.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression or the timezone does not parse.
    pub fn parse(expression: &str, timezone: Option<&str>) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };
        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {expression}"),
            6 | 7 => expression.to_string(),
            n => return Err(invalid(format!("expected 5 to 7 fields, got {n}"))),
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
            offset: parse_offset(timezone)?,
        })
    }

    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first fire time strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.offset);
        self.schedule
            .after(&local)
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    /// Whether a fire time falls in `(since, now]`.
    #[must_use]
    pub fn is_due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.next_after(since).is_some_and(|next| next <= now)
    }
}

fn parse_offset(timezone: Option<&str>) -> Result<FixedOffset, ScheduleError> {
    let utc = FixedOffset::east_opt(0).ok_or_else(|| ScheduleError::InvalidTimezone {
        timezone: "UTC".into(),
    })?;
    match timezone.map(str::trim) {
        None | Some("" | "UTC" | "utc" | "Z") => Ok(utc),
        Some(tz) => tz
            .parse::<FixedOffset>()
            .map_err(|_| ScheduleError::InvalidTimezone {
                timezone: tz.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).single().expect("valid time")
    }

    #[test]
    fn five_fields_fire_on_the_minute() {
        let schedule = CronSchedule::parse("*/15 * * * *", None).expect("parse");
        assert_eq!(schedule.next_after(at(9, 7, 30)), Some(at(9, 15, 0)));
        assert_eq!(schedule.next_after(at(9, 15, 0)), Some(at(9, 30, 0)));
    }

    #[test]
    fn six_fields_keep_seconds() {
        let schedule = CronSchedule::parse("30 0 9 * * *", Some("UTC")).expect("parse");
        assert_eq!(schedule.next_after(at(8, 0, 0)), Some(at(9, 0, 30)));
    }

    #[test]
    fn offset_shifts_fire_times() {
        let schedule = CronSchedule::parse("0 9 * * *", Some("+02:00")).expect("parse");
        assert_eq!(schedule.next_after(at(6, 0, 0)), Some(at(7, 0, 0)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            CronSchedule::parse("* * *", None),
            Err(ScheduleError::InvalidCronExpression { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("99 * * * *", None),
            Err(ScheduleError::InvalidCronExpression { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 9 * * *", Some("America/New_York")),
            Err(ScheduleError::InvalidTimezone { .. })
        ));
    }

    #[test]
    fn due_only_once_a_fire_time_passed() {
        let schedule = CronSchedule::parse("0 * * * *", None).expect("parse");
        assert!(!schedule.is_due(at(9, 0, 0), at(9, 59, 59)));
        assert!(schedule.is_due(at(9, 0, 0), at(10, 0, 0)));
        assert!(schedule.is_due(at(9, 0, 0), at(13, 30, 0)));
    }
}
