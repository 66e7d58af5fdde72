//! Per-item workflow queue
//!
//! Serializes work per board item while allowing unlimited parallelism
//! across items. At most one entry per item is `running`; entries waiting
//! on human validation do not hold the slot.

mod manager;

pub use manager::{DispatchMessage, ItemQueueStatus, PendingInfo, QueueManager, RunningInfo};
