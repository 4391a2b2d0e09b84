//! fieldsync-core - offline synchronization core
//!
//! Queued field mutations are scored by urgency, applied optimistically to
//! local state, and drained to the server by a background orchestrator that
//! respects connectivity and power. Version mismatches become conflicts with
//! an audit trail and role-checked resolution.

pub mod api;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod events;
pub mod exchange;
pub mod models;
pub mod orchestrator;
pub mod priority;
pub mod runtime;
pub mod scheduler;
pub mod services;
pub mod tracker;
pub mod util;

#[cfg(test)]
mod test_support;

pub use api::{ApiResponse, SyncApi};
pub use config::CoreConfig;
pub use conflict::ConflictEngine;
pub use connectivity::{ConnectivityMonitor, ManualConnectivity};
pub use error::{Error, Result};
pub use exchange::{HttpServerExchange, ServerExchange};
pub use orchestrator::SyncOrchestrator;
pub use priority::PriorityAssigner;
pub use runtime::SyncRuntime;
pub use services::{QueueService, Store};
pub use tracker::UpdateTracker;
