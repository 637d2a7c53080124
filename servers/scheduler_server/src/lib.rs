//! gsched policy server
//!
//! User-space half of the guaranteed-share scheduler. It keeps one
//! [`PolicyEntry`] per process, runs the [`FairnessEngine`] on every
//! quantum expiry and answers the kernel through the shared protocol.
//!
//! - `table`: per-process policy and CPU placement
//! - `fairness`: justice computation and priority/quantum assignment
//! - `server`: request handling and the periodic balancing sweep

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod fairness;
pub mod server;
pub mod table;

pub use error::{PolicyError, PolicyResult};
pub use fairness::{Assignment, FairnessEngine, FairnessInputs, Verdict};
pub use server::{PolicyServer, PolicyStats};
pub use table::{share_from_fraction, EntryFlags, PolicyEntry, SchedulerPolicyTable};
