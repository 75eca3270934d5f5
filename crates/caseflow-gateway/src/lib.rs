//! # Caseflow Gateway
//!
//! The HTTP and WebSocket edge of the orchestration core: job CRUD,
//! run entry points, the record tree, the agent registry, and the live
//! log/screen relay. Everything underneath is shared state; handlers
//! stay thin and translate between JSON and the inner crates.

pub mod routes;
pub mod server;
pub mod ws;

pub use server::{build_router, AppState};
