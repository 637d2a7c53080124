//! Scheduler Error Handling
//!
//! Typed errors for dispatcher operations, with recovery hints.

use core::fmt;

use gsched_abi::{ConfigError, Endpoint, SlotId};

/// Dispatcher error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    // ═══════════════════════════════════════════════════════════════
    // Process table
    // ═══════════════════════════════════════════════════════════════

    /// Every slot is in use
    TableFull { capacity: usize },

    /// Endpoint names a previous occupant of its slot
    StaleEndpoint { endpoint: Endpoint },

    /// Slot is not in use
    SlotFree { slot: SlotId },

    // ═══════════════════════════════════════════════════════════════
    // Scheduling parameters
    // ═══════════════════════════════════════════════════════════════

    /// Priority is not a schedulable level
    InvalidPriority { priority: u8, lowest: u8 },

    /// Quantum outside the configured `min..=max` ticks
    InvalidQuantum { quantum: u32, min: u32, max: u32 },

    // ═══════════════════════════════════════════════════════════════
    // Ready queues
    // ═══════════════════════════════════════════════════════════════

    /// Process already sits in a ready queue
    AlreadyQueued { slot: SlotId, level: u8 },

    /// Process is not in any ready queue
    NotQueued { slot: SlotId },

    /// Process carries block reasons
    NotRunnable { slot: SlotId },

    /// Sender is already waiting on a send
    AlreadySending { endpoint: Endpoint },

    // ═══════════════════════════════════════════════════════════════
    // Policy protocol
    // ═══════════════════════════════════════════════════════════════

    /// A request for this process is still waiting for its response
    RequestOutstanding { endpoint: Endpoint, seq: u32 },

    /// Policy server marked unreachable
    PolicyUnreachable,

    /// Outbox holds `capacity` undelivered requests
    OutboxFull { capacity: usize },

    // ═══════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════

    /// Ready-queue or PCB invariant broken
    InvariantViolation { slot: SlotId, reason: &'static str },

    /// Rejected configuration
    Config(ConfigError),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull { capacity } => write!(f, "Process table full: {} slots", capacity),
            Self::StaleEndpoint { endpoint } => write!(f, "Stale endpoint {}", endpoint),
            Self::SlotFree { slot } => write!(f, "Slot {} is free", slot),
            Self::InvalidPriority { priority, lowest } => {
                write!(f, "Priority {} outside 0..={}", priority, lowest)
            }
            Self::InvalidQuantum { quantum, min, max } => {
                write!(f, "Quantum {} outside {}..={}", quantum, min, max)
            }
            Self::AlreadyQueued { slot, level } => {
                write!(f, "Slot {} already queued at level {}", slot, level)
            }
            Self::NotQueued { slot } => write!(f, "Slot {} not queued", slot),
            Self::NotRunnable { slot } => write!(f, "Slot {} not runnable", slot),
            Self::AlreadySending { endpoint } => write!(f, "{} already blocked sending", endpoint),
            Self::RequestOutstanding { endpoint, seq } => {
                write!(f, "Request {} for {} still outstanding", seq, endpoint)
            }
            Self::PolicyUnreachable => write!(f, "Policy server unreachable"),
            Self::OutboxFull { capacity } => write!(f, "Policy outbox full: {}", capacity),
            Self::InvariantViolation { slot, reason } => {
                write!(f, "Invariant violated at slot {}: {}", slot, reason)
            }
            Self::Config(err) => write!(f, "Configuration: {}", err),
        }
    }
}

impl SchedError {
    /// Get recovery hint for this error
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            Self::TableFull { .. } => "Wait for processes to exit or raise max_processes",
            Self::StaleEndpoint { .. } => "Process exited; drop the endpoint",
            Self::SlotFree { .. } => "Process exited; drop the slot reference",
            Self::InvalidPriority { .. } => "Use a level below the idle queue",
            Self::InvalidQuantum { .. } => "Use a quantum within the configured bounds",
            Self::RequestOutstanding { .. } => "Local default applied; retry after the response",
            Self::PolicyUnreachable | Self::OutboxFull { .. } => {
                "Local default applied; drain the outbox to the policy server"
            }
            Self::InvariantViolation { .. } => "Scheduler state corrupted, halt the offending path",
            Self::Config(_) => "Fix the scheduler configuration",
            _ => "Check collaborator call ordering",
        }
    }

    /// Must the offending path stop?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}

impl From<ConfigError> for SchedError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

/// Result type for dispatcher operations
pub type SchedResult<T> = Result<T, SchedError>;
