//! Statistics - dispatcher activity counters
//!
//! Counters are plain integers: the dispatcher is mutated by one caller at a
//! time (see [`SharedDispatcher`](crate::scheduler::SharedDispatcher)).

/// Dispatcher counters since boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Clock ticks processed
    pub ticks: u64,
    /// Ticks with nothing to run
    pub idle_ticks: u64,
    /// Processes picked from a ready queue
    pub dispatches: u64,
    /// Running process displaced by a higher priority one
    pub preemptions: u64,
    /// Quantum expirations
    pub quantum_expirations: u64,

    pub spawned: u64,
    pub exited: u64,

    /// Requests handed to the outbox
    pub requests_sent: u64,
    /// Responses applied
    pub responses_applied: u64,
    /// Responses refused by the policy server
    pub rejections: u64,
    /// Late, stale or unknown responses dropped
    pub responses_discarded: u64,
    /// Local default applied instead of a policy decision
    pub degraded: u64,
    /// Requests that ran past their deadline
    pub timeouts: u64,
}

impl SchedulerStats {
    pub const fn new() -> Self {
        Self {
            ticks: 0,
            idle_ticks: 0,
            dispatches: 0,
            preemptions: 0,
            quantum_expirations: 0,
            spawned: 0,
            exited: 0,
            requests_sent: 0,
            responses_applied: 0,
            rejections: 0,
            responses_discarded: 0,
            degraded: 0,
            timeouts: 0,
        }
    }

    /// Processes currently in the table according to the counters
    pub fn live(&self) -> u64 {
        self.spawned.saturating_sub(self.exited)
    }

    /// Share of ticks spent idle, in thousandths
    pub fn idle_permille(&self) -> u64 {
        if self.ticks == 0 {
            return 0;
        }
        self.idle_ticks * 1000 / self.ticks
    }
}
