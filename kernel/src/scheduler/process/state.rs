//! State - runtime flags state machine
//!
//! Every bit of [`RuntimeFlags`] is an independent reason a process cannot
//! run. A process is runnable iff no bit is set. Collaborators never poke
//! bits directly; they name a [`BlockReason`] and the PCB reports the
//! resulting [`Transition`].

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Reasons a process cannot run (empty = runnable)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RuntimeFlags: u16 {
        /// Process slot is free
        const SLOT_FREE     = 0x0001;
        /// Process has been stopped
        const STOPPED       = 0x0002;
        /// Blocked trying to send
        const SENDING       = 0x0004;
        /// Blocked trying to receive
        const RECEIVING     = 0x0008;
        /// A new kernel signal arrived
        const SIGNALED      = 0x0010;
        /// Unready while a signal is being processed
        const SIG_PENDING   = 0x0020;
        /// Stopped by a tracer
        const TRACED        = 0x0040;
        /// No privilege structure
        const NO_PRIV       = 0x0080;
        /// Cannot send or receive messages
        const NO_ENDPOINT   = 0x0100;
        /// Not scheduled until the page tables are set
        const VM_INHIBIT    = 0x0200;
        /// Unhandled page fault
        const PAGE_FAULT    = 0x0400;
        /// Originator of a memory request
        const VM_REQUEST    = 0x0800;
        /// Target of a memory request
        const VM_REQ_TARGET = 0x1000;
        /// Temporary process lock
        const SYS_LOCK      = 0x2000;
        /// Quantum expired, waiting for requantization
        const PREEMPTED     = 0x4000;
        /// Cannot be scheduled until boot completes
        const BOOT_INHIBIT  = 0x8000;
    }
}

impl RuntimeFlags {
    /// The one runnability predicate
    pub const fn is_runnable(self) -> bool {
        self.is_empty()
    }

    /// Slot not in use: exactly `SLOT_FREE`
    pub fn is_free_slot(self) -> bool {
        self == Self::SLOT_FREE
    }
}

bitflags! {
    /// Miscellaneous per-process flags; none of them affects runnability
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MiscFlags: u16 {
        /// Reply to an IPC request is pending
        const REPLY_PEND         = 0x0001;
        /// Process-virtual timer is running
        const VIRT_TIMER         = 0x0002;
        /// Process-virtual profile timer is running
        const PROF_TIMER         = 0x0004;
        /// Asynchronous message pending
        const ASYNC_MSG          = 0x0010;
        const FULL_VM            = 0x0020;
        /// Copy message for the process before running
        const DELIVER_MSG        = 0x0040;
        /// Send signal when no longer sending
        const SIG_DELAY          = 0x0080;
        /// Syscall tracing: in a system call
        const SC_ACTIVE          = 0x0100;
        /// Syscall tracing: deferred system call
        const SC_DEFER           = 0x0200;
        /// Syscall tracing: trigger syscall events
        const SC_TRACE           = 0x0400;
        /// send() issued by the kernel on behalf of the process
        const SENDING_FROM_KERNEL = 0x0800;
        /// Do not clobber context until next kernel entry
        const CONTEXT_SET        = 0x1000;
        /// Pending senda() failed for lack of memory
        const SENDA_VM_MISS      = 0x2000;
        /// Pending message failed to be delivered
        const MSG_FAILED         = 0x4000;
    }
}

/// Subsystem owning a block reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockConcern {
    Lifecycle,
    Ipc,
    Signal,
    Memory,
    Trace,
    Policy,
}

/// A single reason to keep a process off the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    SlotFree,
    Stopped,
    Sending,
    Receiving,
    SignalArrived,
    SignalPending,
    Traced,
    NoPrivilege,
    NoEndpoint,
    VmInhibited,
    PageFault,
    VmRequestOrigin,
    VmRequestTarget,
    SysLocked,
    Preempted,
    BootInhibited,
}

impl BlockReason {
    /// Every reason, in bit order
    pub const ALL: [Self; 16] = [
        Self::SlotFree,
        Self::Stopped,
        Self::Sending,
        Self::Receiving,
        Self::SignalArrived,
        Self::SignalPending,
        Self::Traced,
        Self::NoPrivilege,
        Self::NoEndpoint,
        Self::VmInhibited,
        Self::PageFault,
        Self::VmRequestOrigin,
        Self::VmRequestTarget,
        Self::SysLocked,
        Self::Preempted,
        Self::BootInhibited,
    ];

    /// Bit this reason sets
    pub const fn flag(self) -> RuntimeFlags {
        match self {
            Self::SlotFree => RuntimeFlags::SLOT_FREE,
            Self::Stopped => RuntimeFlags::STOPPED,
            Self::Sending => RuntimeFlags::SENDING,
            Self::Receiving => RuntimeFlags::RECEIVING,
            Self::SignalArrived => RuntimeFlags::SIGNALED,
            Self::SignalPending => RuntimeFlags::SIG_PENDING,
            Self::Traced => RuntimeFlags::TRACED,
            Self::NoPrivilege => RuntimeFlags::NO_PRIV,
            Self::NoEndpoint => RuntimeFlags::NO_ENDPOINT,
            Self::VmInhibited => RuntimeFlags::VM_INHIBIT,
            Self::PageFault => RuntimeFlags::PAGE_FAULT,
            Self::VmRequestOrigin => RuntimeFlags::VM_REQUEST,
            Self::VmRequestTarget => RuntimeFlags::VM_REQ_TARGET,
            Self::SysLocked => RuntimeFlags::SYS_LOCK,
            Self::Preempted => RuntimeFlags::PREEMPTED,
            Self::BootInhibited => RuntimeFlags::BOOT_INHIBIT,
        }
    }

    /// Subsystem expected to set and clear this reason
    pub const fn concern(self) -> BlockConcern {
        match self {
            Self::SlotFree | Self::Stopped | Self::BootInhibited => BlockConcern::Lifecycle,
            Self::Sending | Self::Receiving | Self::NoEndpoint => BlockConcern::Ipc,
            Self::SignalArrived | Self::SignalPending => BlockConcern::Signal,
            Self::VmInhibited | Self::PageFault | Self::VmRequestOrigin | Self::VmRequestTarget => {
                BlockConcern::Memory
            }
            Self::Traced => BlockConcern::Trace,
            Self::NoPrivilege | Self::SysLocked | Self::Preempted => BlockConcern::Policy,
        }
    }

    /// Reasons currently present in `flags`
    pub fn present_in(flags: RuntimeFlags) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |reason| flags.contains(reason.flag()))
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a flag change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Runnable before, blocked now
    BecameBlocked,
    /// Blocked before, runnable now: admit to a ready queue exactly once
    BecameRunnable,
    /// Runnability did not change
    Unchanged,
}

/// Classify a flag change
pub fn transition(before: RuntimeFlags, after: RuntimeFlags) -> Transition {
    match (before.is_runnable(), after.is_runnable()) {
        (true, false) => Transition::BecameBlocked,
        (false, true) => Transition::BecameRunnable,
        _ => Transition::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_match_reason_order() {
        for (bit, reason) in BlockReason::ALL.iter().enumerate() {
            assert_eq!(reason.flag().bits(), 1 << bit);
        }
        assert_eq!(RuntimeFlags::all().bits(), u16::MAX);
    }

    #[test]
    fn test_runnable_iff_empty() {
        assert!(RuntimeFlags::empty().is_runnable());
        for reason in BlockReason::ALL {
            assert!(!reason.flag().is_runnable());
        }
        assert!(RuntimeFlags::SLOT_FREE.is_free_slot());
        assert!(!(RuntimeFlags::SLOT_FREE | RuntimeFlags::STOPPED).is_free_slot());
    }

    #[test]
    fn test_transition() {
        let blocked = RuntimeFlags::SENDING | RuntimeFlags::SIGNALED;
        assert_eq!(transition(RuntimeFlags::empty(), blocked), Transition::BecameBlocked);
        assert_eq!(transition(blocked, RuntimeFlags::SIGNALED), Transition::Unchanged);
        assert_eq!(transition(blocked, RuntimeFlags::empty()), Transition::BecameRunnable);
    }

    #[test]
    fn test_present_reasons() {
        let flags = RuntimeFlags::PAGE_FAULT | RuntimeFlags::TRACED;
        let reasons: Vec<BlockReason> = BlockReason::present_in(flags).collect();
        assert_eq!(reasons, vec![BlockReason::Traced, BlockReason::PageFault]);
        assert_eq!(BlockReason::PageFault.concern(), BlockConcern::Memory);
    }
}
