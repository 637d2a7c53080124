//! Process Management
//!
//! PCBs, their runtime flags and accounting, and the slot table holding them.

pub mod accounting;
pub mod pcb;
pub mod state;
pub mod table;

pub use accounting::{AccountingRecord, IpcKind};
pub use pcb::{PrivId, ProcessControlBlock, PROC_NAME_LEN};
pub use state::{BlockConcern, BlockReason, MiscFlags, RuntimeFlags, Transition};
pub use table::ProcessTable;
