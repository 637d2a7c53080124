//! Policy errors
//!
//! Every error refuses one request and leaves the table as it was. Each maps
//! onto the [`RejectReason`] sent back to the kernel.

use core::fmt;

use gsched_abi::{CpuMask, CpuShare, Endpoint, RejectReason, ShareError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PolicyError {
    /// Share outside (0, 1]
    InvalidShare(ShareError),

    /// No CPU in the mask has room for the share
    Oversubscribed { requested: CpuShare, cpu_mask: CpuMask },

    /// Bounds inverted or below the idle level
    InvalidPriority { max_priority: u8, priority: u8 },

    InvalidQuantum { quantum: u32, min: u32, max: u32 },

    /// Mask selects no configured CPU
    InvalidAffinity { cpu_mask: CpuMask },

    UnknownProcess { pid: Endpoint },

    AlreadyRegistered { pid: Endpoint },

    TableFull { capacity: usize },
}

impl PolicyError {
    /// Reason reported to the kernel
    pub const fn reject_reason(&self) -> RejectReason {
        match self {
            Self::InvalidShare(_) => RejectReason::InvalidShare,
            Self::Oversubscribed { .. } => RejectReason::Oversubscribed,
            Self::InvalidPriority { .. } => RejectReason::InvalidPriority,
            Self::InvalidQuantum { .. } => RejectReason::InvalidQuantum,
            Self::InvalidAffinity { .. } => RejectReason::InvalidAffinity,
            Self::UnknownProcess { .. } => RejectReason::UnknownProcess,
            Self::AlreadyRegistered { .. } => RejectReason::AlreadyRegistered,
            Self::TableFull { .. } => RejectReason::TableFull,
        }
    }

    /// Get recovery hint for this error
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            Self::InvalidShare(_) => "Use a share in (0, 1]",
            Self::Oversubscribed { .. } => "Lower the share, widen the affinity mask or wait for exits",
            Self::InvalidPriority { .. } => "Keep max_priority <= priority < idle level",
            Self::InvalidQuantum { .. } => "Use a quantum within the configured bounds",
            Self::InvalidAffinity { .. } => "Include at least one configured CPU",
            Self::UnknownProcess { .. } => "Process exited or was never admitted",
            Self::AlreadyRegistered { .. } => "Creation was already handled",
            Self::TableFull { .. } => "Raise max_processes",
        }
    }
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidShare(err) => write!(f, "Invalid share: {}", err),
            Self::Oversubscribed { requested, cpu_mask } => {
                write!(f, "Share {} does not fit on CPUs {:#x}", requested, cpu_mask.bits())
            }
            Self::InvalidPriority { max_priority, priority } => {
                write!(f, "Invalid priority bounds {}..{}", max_priority, priority)
            }
            Self::InvalidQuantum { quantum, min, max } => {
                write!(f, "Quantum {} outside [{}, {}]", quantum, min, max)
            }
            Self::InvalidAffinity { cpu_mask } => write!(f, "Affinity {:#x} selects no CPU", cpu_mask.bits()),
            Self::UnknownProcess { pid } => write!(f, "Unknown process {}", pid),
            Self::AlreadyRegistered { pid } => write!(f, "Process {} already registered", pid),
            Self::TableFull { capacity } => write!(f, "Policy table full: {} slots", capacity),
        }
    }
}

impl From<ShareError> for PolicyError {
    fn from(err: ShareError) -> Self {
        Self::InvalidShare(err)
    }
}

pub type PolicyResult<T> = Result<T, PolicyError>;
