//! Error types for the scheduler crate.

use std::fmt;

/// Errors from parsing schedules and dispatching scheduled runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// The cron expression does not parse.
    InvalidCronExpression { expression: String, reason: String },
    /// Only `UTC` and fixed offsets such as `+02:00` are understood.
    InvalidTimezone { timezone: String },
    /// Listing workflows or starting an execution failed.
    DispatchFailed { reason: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCronExpression { expression, reason } => {
                write!(f, "invalid cron expression '{expression}': {reason}")
            }
            Self::InvalidTimezone { timezone } => {
                write!(f, "invalid timezone: {timezone}")
            }
            Self::DispatchFailed { reason } => {
                write!(f, "schedule dispatch failed: {reason}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}
