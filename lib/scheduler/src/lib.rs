//! Schedule triggers for flowforge.
//!
//! - **Cron schedules**: parsing and next-fire computation for `schedule`
//!   trigger nodes
//! - **Dispatcher**: the tick loop that starts SCHEDULE executions for
//!   active workflows

pub mod dispatcher;
pub mod error;
pub mod schedule;

pub use dispatcher::{ScheduleDispatcher, ScheduleTarget, SchedulerConfig};
pub use error::ScheduleError;
pub use schedule::CronSchedule;
