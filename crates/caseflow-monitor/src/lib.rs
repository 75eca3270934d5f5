//! # Caseflow Monitor
//!
//! Agent liveness. Two independent signals feed one verdict:
//!
//! 1. an HTTP probe of the agent's health endpoint, and
//! 2. a recent heartbeat marker the agent pushed itself.
//!
//! An agent is reachable when either holds, so a NATed agent that can
//! only call out still counts as online. The sweep flips only the
//! `reachable` column; workload is the agent's own report and is never
//! touched here.

pub mod markers;
pub mod sweep;

pub use markers::MarkerCache;
pub use sweep::HeartbeatMonitor;
