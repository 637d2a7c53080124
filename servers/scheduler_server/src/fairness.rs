//! Guaranteed scheduling
//!
//! Each process is promised a fraction of one CPU. The engine compares the
//! CPU time a process actually received against what that fraction entitles
//! it to since its accounting epoch began, and moves its priority and quantum
//! away from its requested operating point in proportion to the gap:
//! processes that are owed CPU climb toward `max_priority` with a longer
//! quantum, processes running ahead sink toward the lowest user level with a
//! shorter one.
//!
//! Everything here is integer arithmetic on the justice metric (ratio ×
//! 1000), so the assignment is a pure function of its inputs and the kernel
//! can compare the metric without floating point.

use gsched_abi::fixed::JUSTICE_SCALE;
use gsched_abi::{CpuShare, Justice, SchedConfig};
use log::trace;

use crate::table::PolicyEntry;

/// Where a process stands against its entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Received less than its share
    Owed,
    /// Within the tolerance band
    Balanced,
    /// Received more than its share
    Ahead,
}

/// Raw inputs of one recomputation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FairnessInputs {
    pub cpu_share: CpuShare,
    pub cpu_time_used: u64,
    pub start_time: u64,
    pub now: u64,
}

impl FairnessInputs {
    pub fn of(entry: &PolicyEntry, now: u64) -> Self {
        Self {
            cpu_share: entry.cpu_share,
            cpu_time_used: entry.cpu_time_used,
            start_time: entry.start_time,
            now,
        }
    }

    /// Ticks since the epoch began, at least one
    pub fn elapsed(&self) -> u64 {
        self.now.saturating_sub(self.start_time).max(1)
    }
}

/// Result of one recomputation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub justice: Justice,
    pub verdict: Verdict,
    pub priority: u8,
    pub quantum: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FairnessEngine {
    /// Half-width of the balanced band, in thousandths
    tolerance: u32,
    /// Justice deviation worth one priority level
    priority_step: u32,
    min_quantum: u32,
    max_quantum: u32,
    lowest_user: u8,
}

impl FairnessEngine {
    pub fn new(config: &SchedConfig) -> Self {
        Self {
            tolerance: config.tolerance,
            priority_step: config.priority_step.max(1),
            min_quantum: config.min_quantum.max(1),
            max_quantum: config.max_quantum.max(1),
            lowest_user: config.lowest_user_queue(),
        }
    }

    pub fn justice(&self, inputs: &FairnessInputs) -> Justice {
        Justice::from_usage(inputs.cpu_time_used, inputs.cpu_share, inputs.elapsed())
    }

    /// Classify `justice`; the band edges count as balanced
    pub fn verdict(&self, justice: Justice) -> Verdict {
        if justice.deviation() <= self.tolerance {
            Verdict::Balanced
        } else if justice.milli() < JUSTICE_SCALE {
            Verdict::Owed
        } else {
            Verdict::Ahead
        }
    }

    /// Priority and quantum for `entry` at the given justice
    pub fn assign(&self, entry: &PolicyEntry, justice: Justice) -> Assignment {
        let verdict = self.verdict(justice);
        let offset = justice.deviation().div_ceil(self.priority_step);
        let offset = u8::try_from(offset).unwrap_or(u8::MAX);
        let base_quantum = u64::from(entry.base_quantum);

        let (priority, quantum) = match verdict {
            // inside the band the current operating point stands
            Verdict::Balanced => (entry.priority, u64::from(entry.time_slice)),
            Verdict::Owed => (
                entry.base_priority.saturating_sub(offset).max(entry.max_priority),
                base_quantum * u64::from(JUSTICE_SCALE) / u64::from(justice.milli().max(1)),
            ),
            Verdict::Ahead => (
                entry.base_priority.saturating_add(offset).min(self.lowest_user),
                base_quantum * u64::from(JUSTICE_SCALE) / u64::from(justice.milli()),
            ),
        };
        // never above max_priority, never on the idle level
        let priority = priority.clamp(entry.max_priority.min(self.lowest_user), self.lowest_user);
        let quantum = quantum.clamp(u64::from(self.min_quantum), u64::from(self.max_quantum)) as u32;

        Assignment { justice, verdict, priority, quantum }
    }

    /// Assignment at `now` without touching the entry
    pub fn evaluate(&self, entry: &PolicyEntry, now: u64) -> Assignment {
        self.assign(entry, self.justice(&FairnessInputs::of(entry, now)))
    }

    /// Recompute and store the assignment: one more quantum granted
    pub fn recompute(&self, entry: &mut PolicyEntry, now: u64) -> Assignment {
        let assignment = self.evaluate(entry, now);
        entry.priority = assignment.priority;
        entry.time_slice = assignment.quantum;
        entry.fairness_ratio = assignment.justice;
        entry.total_quanta += 1;
        entry.last_update = now;
        trace!(
            "recompute {}: justice {} {:?} -> priority {} quantum {}",
            entry.endpoint,
            assignment.justice,
            assignment.verdict,
            assignment.priority,
            assignment.quantum
        );
        assignment
    }
}
