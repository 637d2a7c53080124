//! Scheduler core module
//!
//! - `ready_queue`: per-priority FIFO queues over the process table
//! - `dispatcher`: the single owner of PCB state
//! - `error`: typed dispatcher errors
//! - `statistics`: activity counters

pub mod dispatcher;
pub mod error;
pub mod ready_queue;
pub mod statistics;

pub use dispatcher::{Dispatcher, SpawnParams};
pub use error::{SchedError, SchedResult};
pub use ready_queue::ReadyQueueSet;
pub use statistics::SchedulerStats;
