//! Queue module
//!
//! Per-folder FIFO of launch requests waiting for their folder's running slot.

mod model;
mod store;

pub use model::{QueueEntry, QueueEntryView};
pub use store::QueueStore;
