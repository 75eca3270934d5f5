//! # Caseflow Dispatch
//!
//! Turns a task, suite, or single case into run records plus execution
//! payloads on per-agent queues. The sequence is always record first,
//! publish second: every payload on the wire already has database rows
//! behind it, so a result callback can never arrive for an unknown run.

pub mod dispatcher;
pub mod envelope;

pub use dispatcher::{AgentSelector, CaseDispatch, DispatchReceipt, Dispatcher, RunRequest, SuiteDispatch};
pub use envelope::{CaseItem, DispatchMessage, RunSuite};
