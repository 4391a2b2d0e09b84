pub mod common;
pub mod conflicts;
pub mod queue;
pub mod rules;
pub mod sync;
pub mod updates;
