//! Process control block

use gsched_abi::{Endpoint, Justice, RejectReason, SlotId};

use super::accounting::AccountingRecord;
use super::state::{transition, BlockReason, MiscFlags, RuntimeFlags, Transition};

/// Length of a process name, truncated beyond
pub const PROC_NAME_LEN: usize = 16;

/// Reference to a privilege structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrivId(pub u16);

/// Kernel-owned record of one process
///
/// `flags` is private: every change goes through [`block`](Self::block),
/// [`unblock`](Self::unblock) or [`unblock_all`](Self::unblock_all) so the
/// caller always learns whether runnability changed.
#[derive(Debug, Clone)]
pub struct ProcessControlBlock {
    pub nr: SlotId,
    /// Bumped every time the slot is released
    pub generation: u16,
    pub privilege: Option<PrivId>,
    pub name: [u8; PROC_NAME_LEN],
    pub parent: Option<Endpoint>,
    flags: RuntimeFlags,
    pub misc: MiscFlags,

    pub priority: u8,
    pub max_priority: u8,
    pub ticks_left: u32,
    pub quantum_size: u32,
    pub justice: Justice,

    /// Next process in the same ready queue
    pub(crate) next_ready: Option<SlotId>,
    /// Ready-queue level the PCB sits in
    pub(crate) queued_at: Option<u8>,

    /// Head of the senders blocked on this process
    pub caller_q: Option<SlotId>,
    /// Link in the caller queue of the process we are sending to
    pub q_link: Option<SlotId>,
    /// Message buffer address of a pending send or receive
    pub messbuf: u64,
    /// Whom a blocked receive is waiting for
    pub getfrom: Option<Endpoint>,
    /// Whom a blocked send is addressed to
    pub sendto: Option<Endpoint>,

    /// One bit per signal number
    pub pending_signals: u64,

    pub accounting: AccountingRecord,
    /// Fresh quanta granted over the process lifetime
    pub schedules: u64,
    pub last_rejection: Option<RejectReason>,
}

impl ProcessControlBlock {
    /// A free slot
    pub const fn free(nr: SlotId) -> Self {
        Self {
            nr,
            generation: 0,
            privilege: None,
            name: [0; PROC_NAME_LEN],
            parent: None,
            flags: RuntimeFlags::SLOT_FREE,
            misc: MiscFlags::empty(),
            priority: 0,
            max_priority: 0,
            ticks_left: 0,
            quantum_size: 0,
            justice: Justice::NEUTRAL,
            next_ready: None,
            queued_at: None,
            caller_q: None,
            q_link: None,
            messbuf: 0,
            getfrom: None,
            sendto: None,
            pending_signals: 0,
            accounting: AccountingRecord::new(),
            schedules: 0,
            last_rejection: None,
        }
    }

    /// Identity of the current occupant
    pub const fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.nr, self.generation)
    }

    pub const fn flags(&self) -> RuntimeFlags {
        self.flags
    }

    pub fn is_free(&self) -> bool {
        self.flags.contains(RuntimeFlags::SLOT_FREE)
    }

    pub const fn is_runnable(&self) -> bool {
        self.flags.is_runnable()
    }

    pub const fn is_queued(&self) -> bool {
        self.queued_at.is_some()
    }

    pub const fn queued_at(&self) -> Option<u8> {
        self.queued_at
    }

    pub fn has(&self, reason: BlockReason) -> bool {
        self.flags.contains(reason.flag())
    }

    /// Name up to the first NUL
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(PROC_NAME_LEN);
        match core::str::from_utf8(&self.name[..len]) {
            Ok(name) => name,
            Err(err) => core::str::from_utf8(&self.name[..err.valid_up_to()]).unwrap_or(""),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; PROC_NAME_LEN];
        let mut len = name.len().min(PROC_NAME_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    pub fn block(&mut self, reason: BlockReason) -> Transition {
        self.set_flags(self.flags | reason.flag())
    }

    pub fn unblock(&mut self, reason: BlockReason) -> Transition {
        self.set_flags(self.flags - reason.flag())
    }

    /// Clear several reasons in one step
    pub fn unblock_all(&mut self, reasons: RuntimeFlags) -> Transition {
        self.set_flags(self.flags - reasons)
    }

    fn set_flags(&mut self, flags: RuntimeFlags) -> Transition {
        let before = self.flags;
        self.flags = flags;
        transition(before, flags)
    }

    /// Wipe the occupant: flags back to exactly `SLOT_FREE`, no queue
    /// linkage, next occupant gets a new generation
    pub fn release(&mut self) {
        let nr = self.nr;
        let generation = self.generation.wrapping_add(1);
        *self = Self::free(nr);
        self.generation = generation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_slot() {
        let pcb = ProcessControlBlock::free(SlotId(3));
        assert!(pcb.is_free());
        assert!(!pcb.is_runnable());
        assert_eq!(pcb.flags(), RuntimeFlags::SLOT_FREE);
        assert_eq!(pcb.endpoint(), Endpoint::new(SlotId(3), 0));
    }

    #[test]
    fn test_unblock_all_admits_once() {
        let mut pcb = ProcessControlBlock::free(SlotId(0));
        assert_eq!(pcb.block(BlockReason::Sending), Transition::Unchanged);
        assert_eq!(pcb.unblock(BlockReason::SlotFree), Transition::Unchanged);
        pcb.block(BlockReason::SignalArrived);
        let both = RuntimeFlags::SENDING | RuntimeFlags::SIGNALED;
        assert_eq!(pcb.unblock_all(both), Transition::BecameRunnable);
        assert_eq!(pcb.unblock_all(both), Transition::Unchanged);
        assert_eq!(pcb.block(BlockReason::Stopped), Transition::BecameBlocked);
    }

    #[test]
    fn test_release_bumps_generation() {
        let mut pcb = ProcessControlBlock::free(SlotId(1));
        pcb.unblock(BlockReason::SlotFree);
        pcb.priority = 4;
        pcb.queued_at = Some(4);
        pcb.set_name("init");
        let old = pcb.endpoint();
        pcb.release();
        assert_eq!(pcb.flags(), RuntimeFlags::SLOT_FREE);
        assert_eq!(pcb.queued_at(), None);
        assert_eq!(pcb.name(), "");
        assert_ne!(pcb.endpoint(), old);
        assert_eq!(pcb.endpoint().generation(), 1);
    }

    #[test]
    fn test_name_truncated() {
        let mut pcb = ProcessControlBlock::free(SlotId(0));
        pcb.set_name("a_rather_long_process_name");
        assert_eq!(pcb.name(), "a_rather_long_pr");
        pcb.set_name("vm");
        assert_eq!(pcb.name(), "vm");
    }
}
