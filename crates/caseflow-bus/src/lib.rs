//! # Caseflow Bus
//!
//! Messaging seams for the orchestration core:
//!
//! - [`MessageChannel`]: the work-queue abstraction the dispatcher
//!   publishes execution payloads through, one durable queue per agent.
//! - [`TopicBus`]: the in-process pub/sub fabric behind the live relay,
//!   with bounded per-topic history so late subscribers catch up.
//!
//! Both are broker-agnostic; [`InProcBroker`] is the built-in channel
//! backend used for single-node deployments and tests.

pub mod broker;
pub mod channel;
pub mod topic;

pub use broker::InProcBroker;
pub use channel::{publish_with_retry, MessageChannel, MessageHeaders};
pub use topic::{Event, EventKind, TopicBus};
