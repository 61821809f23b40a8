//! Periodic refresh scheduling and run history.

pub mod cron;
pub mod engine;
pub mod history;

// Re-export common types
pub use self::cron::Scheduler;
pub use self::engine::{run_scheduled, run_scheduler_loop};
pub use self::history::RunStatus;
