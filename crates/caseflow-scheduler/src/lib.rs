//! # Caseflow Scheduler
//!
//! Persistent job scheduling for the orchestration core. Jobs carry a
//! [`Trigger`] (a one-shot date, a fixed interval, or a five-field cron
//! spec) and survive restarts through the engine's own SQLite file; on
//! start the engine re-hydrates every job and recomputes fire times.
//!
//! The engine knows nothing about what a job does. Firing goes through
//! the injected [`JobRunner`], and each fire runs in its own task so a
//! panicking or slow run never stalls the tick loop.

pub mod cron;
pub mod engine;
pub mod persistence;
pub mod triggers;

pub use engine::{JobRunner, ScheduleEngine, ScheduledJob};
pub use persistence::SchedulerDb;
pub use triggers::{CronSpec, Trigger};
