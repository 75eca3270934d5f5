//! # Caseflow Store
//!
//! SQLite-backed persistence for the orchestration core. Three areas share
//! one database file:
//!
//! - **definitions**: tasks, suites, cases, environments and their
//!   membership rows. Owned by the external CRUD layer; consumed read-only
//!   by the dispatcher, with plain insert helpers so the system is runnable
//!   and testable on its own.
//! - **agents**: the agent registry. Liveness (`reachable`) and workload
//!   are two separate columns; only the heartbeat monitor flips the former.
//! - **records**: the Task → Suite → Case run-record tree with counters.
//!   Parent counters are recomputed from children on every result, so
//!   `task.all == Σ suite.all` holds after each mutation.

pub mod agents;
pub mod db;
pub mod definitions;
pub mod jobs;
pub mod records;

pub use agents::{Agent, AgentRegistration};
pub use db::Store;
pub use definitions::{CaseDef, EnvironmentDef, SuiteCaseDef, SuiteDef, TaskDef};
pub use jobs::{JobDef, JobDefInput};
pub use records::{CaseRunRecord, RunCounters, SuiteRunRecord, TaskRunRecord};
