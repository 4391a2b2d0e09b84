//! Shared services over the local store

mod queue;
mod store;

pub use queue::{QueueService, QueueSummary};
pub use store::Store;
