//! Scheduler configuration surface
//!
//! One configuration is shared by the dispatcher and the policy server. It is
//! validated once at initialization; both sides refuse to start on an
//! invalid configuration.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::affinity::{CpuMask, MAX_MASK_CPUS};
use crate::fixed::{CpuShare, JUSTICE_SCALE};

/// Fewest queues that leave room for a top level, one user level and idle
pub const MIN_QUEUES: u8 = 3;

/// Configuration errors detected by [`SchedConfig::validate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Not enough scheduling queues
    TooFewQueues { queues: u8, min: u8 },
    /// Default priority is not a schedulable user level
    DefaultPriorityOutOfRange { priority: u8, lowest: u8 },
    /// Quantum bounds are empty or start at zero
    InvalidQuantumBounds { min: u32, max: u32 },
    /// Default quantum lies outside the quantum bounds
    DefaultQuantumOutOfRange { quantum: u32, min: u32, max: u32 },
    /// Tolerance band of a full ratio or more
    ToleranceTooWide { tolerance: u32 },
    /// Priority step of zero
    ZeroPriorityStep,
    /// CPU count outside 1..=64
    InvalidCpuCount { cpus: u8 },
    /// Process table without slots (or more than a slot index can address)
    InvalidProcessCount { count: usize },
    /// Response timeout of zero ticks
    ZeroResponseTimeout,
    /// Outbox that cannot hold a request
    ZeroOutboxCapacity,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewQueues { queues, min } => {
                write!(f, "{} scheduling queues configured, at least {} required", queues, min)
            }
            Self::DefaultPriorityOutOfRange { priority, lowest } => {
                write!(f, "default priority {} outside 0..={}", priority, lowest)
            }
            Self::InvalidQuantumBounds { min, max } => {
                write!(f, "invalid quantum bounds [{}, {}]", min, max)
            }
            Self::DefaultQuantumOutOfRange { quantum, min, max } => {
                write!(f, "default quantum {} outside [{}, {}]", quantum, min, max)
            }
            Self::ToleranceTooWide { tolerance } => {
                write!(f, "tolerance band {}/1000 is too wide", tolerance)
            }
            Self::ZeroPriorityStep => write!(f, "priority step must be non-zero"),
            Self::InvalidCpuCount { cpus } => write!(f, "{} CPUs configured, 1..=64 supported", cpus),
            Self::InvalidProcessCount { count } => write!(f, "invalid process table size {}", count),
            Self::ZeroResponseTimeout => write!(f, "response timeout must be non-zero"),
            Self::ZeroOutboxCapacity => write!(f, "outbox capacity must be non-zero"),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedConfig {
    /// Number of priority levels (the last one is reserved for idle)
    pub queues: u8,
    /// Priority given to processes that do not ask for one
    pub default_priority: u8,
    /// Quantum size in ticks for processes that do not ask for one
    pub default_quantum: u32,
    /// Smallest quantum the fairness engine may grant
    pub min_quantum: u32,
    /// Largest quantum the fairness engine may grant
    pub max_quantum: u32,
    /// Half-width of the balanced band around a ratio of 1.0, in thousandths
    pub tolerance: u32,
    /// Ratio deviation (in thousandths) worth one priority level
    pub priority_step: u32,
    /// CPUs available, also the affinity-mask width in use
    pub max_cpus: u8,
    /// Share given to processes created without one
    pub default_share: CpuShare,
    /// Ticks the dispatcher waits for a policy response
    pub response_timeout: u64,
    /// Ticks between two balancing sweeps of the policy server
    pub sweep_interval: u64,
    /// Process table slots
    pub max_processes: usize,
    /// Requests the dispatcher may hold for the transport
    pub outbox_capacity: usize,
}

impl SchedConfig {
    /// Stock configuration: 16 queues, user level 7, 10-tick quantum
    pub const DEFAULT: Self = Self {
        queues: 16,
        default_priority: 7,
        default_quantum: 10,
        min_quantum: 2,
        max_quantum: 40,
        tolerance: 100,
        priority_step: 250,
        max_cpus: 1,
        // 1% of a CPU
        default_share: match CpuShare::from_ppm(10_000) {
            Ok(share) => share,
            Err(_) => CpuShare::FULL,
        },
        response_timeout: 50,
        sweep_interval: 500,
        max_processes: 256,
        outbox_capacity: 64,
    };

    pub const fn with_queues(mut self, queues: u8) -> Self {
        self.queues = queues;
        self
    }

    pub const fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    pub const fn with_quantum(mut self, default: u32, min: u32, max: u32) -> Self {
        self.default_quantum = default;
        self.min_quantum = min;
        self.max_quantum = max;
        self
    }

    pub const fn with_tolerance(mut self, tolerance: u32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub const fn with_priority_step(mut self, step: u32) -> Self {
        self.priority_step = step;
        self
    }

    pub const fn with_max_cpus(mut self, cpus: u8) -> Self {
        self.max_cpus = cpus;
        self
    }

    pub const fn with_default_share(mut self, share: CpuShare) -> Self {
        self.default_share = share;
        self
    }

    pub const fn with_response_timeout(mut self, ticks: u64) -> Self {
        self.response_timeout = ticks;
        self
    }

    pub const fn with_sweep_interval(mut self, ticks: u64) -> Self {
        self.sweep_interval = ticks;
        self
    }

    pub const fn with_max_processes(mut self, count: usize) -> Self {
        self.max_processes = count;
        self
    }

    pub const fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Idle level, never used by user processes
    pub const fn idle_queue(&self) -> u8 {
        self.queues - 1
    }

    /// Lowest level a user process may be placed on
    pub const fn lowest_user_queue(&self) -> u8 {
        self.queues - 2
    }

    /// Is `priority` a level processes may be queued on?
    pub const fn is_schedulable(&self, priority: u8) -> bool {
        priority < self.idle_queue()
    }

    /// Mask of every configured CPU
    pub const fn cpu_mask(&self) -> CpuMask {
        CpuMask::first(self.max_cpus as usize)
    }

    /// Check every option; the first inconsistency wins
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues < MIN_QUEUES {
            return Err(ConfigError::TooFewQueues { queues: self.queues, min: MIN_QUEUES });
        }
        if self.default_priority > self.lowest_user_queue() {
            return Err(ConfigError::DefaultPriorityOutOfRange {
                priority: self.default_priority,
                lowest: self.lowest_user_queue(),
            });
        }
        if self.min_quantum == 0 || self.min_quantum > self.max_quantum {
            return Err(ConfigError::InvalidQuantumBounds {
                min: self.min_quantum,
                max: self.max_quantum,
            });
        }
        if self.default_quantum < self.min_quantum || self.default_quantum > self.max_quantum {
            return Err(ConfigError::DefaultQuantumOutOfRange {
                quantum: self.default_quantum,
                min: self.min_quantum,
                max: self.max_quantum,
            });
        }
        if self.tolerance >= JUSTICE_SCALE {
            return Err(ConfigError::ToleranceTooWide { tolerance: self.tolerance });
        }
        if self.priority_step == 0 {
            return Err(ConfigError::ZeroPriorityStep);
        }
        if self.max_cpus == 0 || self.max_cpus as usize > MAX_MASK_CPUS {
            return Err(ConfigError::InvalidCpuCount { cpus: self.max_cpus });
        }
        if self.max_processes == 0 || self.max_processes > u16::MAX as usize + 1 {
            return Err(ConfigError::InvalidProcessCount { count: self.max_processes });
        }
        if self.response_timeout == 0 {
            return Err(ConfigError::ZeroResponseTimeout);
        }
        if self.outbox_capacity == 0 {
            return Err(ConfigError::ZeroOutboxCapacity);
        }
        Ok(())
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PriorityBounds;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(SchedConfig::DEFAULT.validate(), Ok(()));
        assert_eq!(SchedConfig::DEFAULT.idle_queue(), 15);
        assert_eq!(SchedConfig::DEFAULT.lowest_user_queue(), 14);
        assert_eq!(SchedConfig::DEFAULT.default_share.ppm(), 10_000);
    }

    #[test]
    fn test_rejects_inconsistent_options() {
        let config = SchedConfig::DEFAULT.with_queues(2);
        assert_eq!(config.validate(), Err(ConfigError::TooFewQueues { queues: 2, min: 3 }));

        let config = SchedConfig::DEFAULT.with_quantum(10, 0, 40);
        assert_eq!(config.validate(), Err(ConfigError::InvalidQuantumBounds { min: 0, max: 40 }));

        let config = SchedConfig::DEFAULT.with_quantum(50, 2, 40);
        assert!(matches!(config.validate(), Err(ConfigError::DefaultQuantumOutOfRange { .. })));

        let config = SchedConfig::DEFAULT.with_max_cpus(65);
        assert_eq!(config.validate(), Err(ConfigError::InvalidCpuCount { cpus: 65 }));

        let config = SchedConfig::DEFAULT.with_queues(4).with_default_priority(3);
        assert!(matches!(config.validate(), Err(ConfigError::DefaultPriorityOutOfRange { .. })));

        let config = SchedConfig::DEFAULT.with_tolerance(1000);
        assert_eq!(config.validate(), Err(ConfigError::ToleranceTooWide { tolerance: 1000 }));
    }

    #[test]
    fn test_default_bounds_follow_config() {
        let config = SchedConfig::DEFAULT.with_default_priority(4);
        let bounds = PriorityBounds::default_for(&config);
        assert_eq!((bounds.max_priority, bounds.priority), (0, 4));
        assert_eq!((bounds.quantum, bounds.cpu_share), (None, None));
        assert_eq!(PriorityBounds::default_for(&SchedConfig::DEFAULT).priority, 7);
    }

    #[test]
    fn test_schedulable_levels() {
        let config = SchedConfig::DEFAULT.with_queues(4).with_default_priority(1);
        assert!(config.is_schedulable(2));
        assert!(!config.is_schedulable(3));
        assert_eq!(config.cpu_mask().bits(), 1);
    }
}
