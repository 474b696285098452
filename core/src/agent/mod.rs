//! Agent module
//!
//! Agent status state machine, launch types and snapshots.

mod model;
mod status;

pub use model::*;
pub use status::AgentStatus;
