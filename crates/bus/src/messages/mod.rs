//! Control-plane message types shared by every worker.
//!
//! - **Event messages** (`events`): worker health heartbeats
//! - **Topic constants** (`topics`): reserved topic strings

pub mod events;
pub mod topics;

pub use events::*;
