//! Kernel <-> policy server protocol messages
//!
//! Request/response, one outstanding request per process. Every request is
//! stamped with a sequence number and the kernel clock; the response echoes
//! the sequence number so the kernel can match it against the request it is
//! still waiting for. A response with sequence [`UNSOLICITED`] comes from a
//! balancing sweep rather than a request.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::affinity::CpuMask;
use crate::config::SchedConfig;
use crate::endpoint::Endpoint;
use crate::fixed::{CpuShare, Justice};

/// Sequence number of server-initiated responses
pub const UNSOLICITED: u32 = 0;

/// Copy of a process's accounting record at the time of a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingSnapshot {
    /// Ticks the process executed since its last accounting reset
    pub cpu_time: u64,
    /// Total ticks spent waiting in ready queues
    pub time_in_queue: u64,
    /// Times the process left a ready queue
    pub dequeues: u64,
    /// Synchronous IPC calls
    pub ipc_sync: u64,
    /// Asynchronous IPC calls
    pub ipc_async: u64,
    /// Quantum expirations
    pub preempted: u64,
    /// Lifetime quanta granted
    pub schedules: u64,
    /// Kernel tick `cpu_time` counts from: creation or the last reset
    pub epoch_start: u64,
}

/// Scheduling bounds requested for a process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityBounds {
    /// Highest (numerically smallest) level the process may reach
    pub max_priority: u8,
    /// Level the process asks to run at
    pub priority: u8,
    /// Quantum size in ticks, `None` for the configured default
    pub quantum: Option<u32>,
    /// Guaranteed share, `None` for the configured default (or unchanged)
    pub cpu_share: Option<CpuShare>,
    /// CPUs the process may run on
    pub cpu_mask: CpuMask,
}

impl PriorityBounds {
    /// Run at `priority`, never above `max_priority`, defaults elsewhere
    pub const fn new(max_priority: u8, priority: u8) -> Self {
        Self {
            max_priority,
            priority,
            quantum: None,
            cpu_share: None,
            cpu_mask: CpuMask::all(),
        }
    }

    /// Bounds for a process that asks for nothing: the configured default
    /// priority, quantum and share, no ceiling
    pub const fn default_for(config: &SchedConfig) -> Self {
        Self::new(0, config.default_priority)
    }

    pub const fn with_quantum(mut self, quantum: u32) -> Self {
        self.quantum = Some(quantum);
        self
    }

    pub const fn with_share(mut self, share: CpuShare) -> Self {
        self.cpu_share = Some(share);
        self
    }

    pub const fn with_mask(mut self, mask: CpuMask) -> Self {
        self.cpu_mask = mask;
        self
    }
}

/// Dispatcher -> FairnessEngine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RequestKind {
    /// The process used up its quantum and waits for a new one
    QuantumExpired { pid: Endpoint, accounting: AccountingSnapshot },
    /// A new process entered the process table
    ProcessCreated { pid: Endpoint, parent: Option<Endpoint>, bounds: PriorityBounds },
    /// The process left the process table; no response is expected
    ProcessExited { pid: Endpoint },
    /// The process asks for new scheduling bounds
    PriorityChangeRequest { pid: Endpoint, bounds: PriorityBounds },
}

impl RequestKind {
    /// Process the request is about
    pub const fn pid(&self) -> Endpoint {
        match self {
            Self::QuantumExpired { pid, .. }
            | Self::ProcessCreated { pid, .. }
            | Self::ProcessExited { pid }
            | Self::PriorityChangeRequest { pid, .. } => *pid,
        }
    }

    /// Does the kernel wait for an answer to this request?
    pub const fn expects_response(&self) -> bool {
        !matches!(self, Self::ProcessExited { .. })
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::QuantumExpired { .. } => "QuantumExpired",
            Self::ProcessCreated { .. } => "ProcessCreated",
            Self::ProcessExited { .. } => "ProcessExited",
            Self::PriorityChangeRequest { .. } => "PriorityChangeRequest",
        }
    }
}

/// Request envelope
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Kernel-assigned sequence number, never [`UNSOLICITED`]
    pub seq: u32,
    /// Kernel clock when the request was issued
    pub now: u64,
    pub kind: RequestKind,
}

/// Why the policy server refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// CPU share outside (0, 1]
    InvalidShare,
    /// Granting the share would push every allowed CPU above 1.0
    Oversubscribed,
    /// Priority bounds are inverted or not schedulable
    InvalidPriority,
    /// Quantum outside the configured bounds
    InvalidQuantum,
    /// Affinity mask selects no configured CPU
    InvalidAffinity,
    /// The process is not in the policy table
    UnknownProcess,
    /// The process is already in the policy table
    AlreadyRegistered,
    /// The policy table has no room
    TableFull,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::InvalidShare => "invalid CPU share",
            Self::Oversubscribed => "CPU share oversubscribed",
            Self::InvalidPriority => "invalid priority bounds",
            Self::InvalidQuantum => "invalid quantum",
            Self::InvalidAffinity => "invalid affinity mask",
            Self::UnknownProcess => "unknown process",
            Self::AlreadyRegistered => "process already registered",
            Self::TableFull => "policy table full",
        };
        f.write_str(text)
    }
}

/// FairnessEngine -> Dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// New scheduling parameters for the process
    Requantize {
        pid: Endpoint,
        priority: u8,
        quantum: u32,
        justice: Justice,
        /// Zero the accounting record after applying
        reset_accounting: bool,
    },
    /// The request was refused; the process keeps its previous parameters
    Rejected { pid: Endpoint, reason: RejectReason },
}

impl ResponseKind {
    /// Process the response is about
    pub const fn pid(&self) -> Endpoint {
        match self {
            Self::Requantize { pid, .. } | Self::Rejected { pid, .. } => *pid,
        }
    }
}

/// Response envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Sequence number of the request being answered
    pub seq: u32,
    pub kind: ResponseKind,
}

impl Response {
    /// Is this a sweep-initiated response?
    pub const fn is_unsolicited(&self) -> bool {
        self.seq == UNSOLICITED
    }
}
