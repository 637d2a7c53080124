//! Policy table - the server's view of every scheduled process
//!
//! Indexed by the same slot numbers as the kernel process table. Each entry
//! keeps the process's requested operating point (`base_priority`,
//! `base_quantum`) next to the values last assigned by the fairness engine,
//! and the CPU it was placed on. The aggregate share placed on one CPU never
//! exceeds 1.0.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use gsched_abi::fixed::SHARE_SCALE;
use gsched_abi::{CpuMask, CpuShare, Endpoint, Justice, PriorityBounds, SchedConfig};
use log::{debug, warn};

use crate::error::{PolicyError, PolicyResult};

bitflags! {
    /// Entry state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// Slot holds an admitted process
        const IN_USE = 0x01;
        /// Share changed; waiting for the kernel to report the epoch its
        /// accounting restarted from
        const EPOCH_PENDING = 0x02;
    }
}

/// One scheduled process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyEntry {
    pub endpoint: Endpoint,
    pub parent: Option<Endpoint>,
    pub flags: EntryFlags,
    /// Highest (numerically smallest) level the process may reach
    pub max_priority: u8,
    /// Level last assigned
    pub priority: u8,
    /// Level the process asked for
    pub base_priority: u8,
    /// Quantum last assigned
    pub time_slice: u32,
    /// Quantum the process asked for
    pub base_quantum: u32,
    pub cpu: u8,
    pub cpu_mask: CpuMask,
    pub cpu_share: CpuShare,
    /// Ticks executed since `start_time`
    pub cpu_time_used: u64,
    /// Start of the current accounting epoch, as reported by the kernel
    pub start_time: u64,
    pub fairness_ratio: Justice,
    pub total_quanta: u64,
    pub last_update: u64,
}

impl PolicyEntry {
    const UNUSED: Self = Self {
        endpoint: Endpoint::from_raw(0),
        parent: None,
        flags: EntryFlags::empty(),
        max_priority: 0,
        priority: 0,
        base_priority: 0,
        time_slice: 0,
        base_quantum: 0,
        cpu: 0,
        cpu_mask: CpuMask::empty(),
        cpu_share: CpuShare::FULL,
        cpu_time_used: 0,
        start_time: 0,
        fairness_ratio: Justice::NEUTRAL,
        total_quanta: 0,
        last_update: 0,
    };

    pub fn in_use(&self) -> bool {
        self.flags.contains(EntryFlags::IN_USE)
    }

    pub fn epoch_pending(&self) -> bool {
        self.flags.contains(EntryFlags::EPOCH_PENDING)
    }

    /// Take over the kernel's accounting: `cpu_time` ticks executed since
    /// `epoch_start`
    pub fn adopt_epoch(&mut self, epoch_start: u64, cpu_time: u64) {
        self.start_time = epoch_start;
        self.cpu_time_used = cpu_time;
        self.flags.remove(EntryFlags::EPOCH_PENDING);
    }
}

/// Validated request: bounds, quantum, share and usable CPUs
struct Admission {
    bounds: PriorityBounds,
    quantum: u32,
    share: CpuShare,
    mask: CpuMask,
}

pub struct SchedulerPolicyTable {
    config: SchedConfig,
    entries: Vec<PolicyEntry>,
}

impl SchedulerPolicyTable {
    pub fn new(config: SchedConfig) -> Self {
        Self { config, entries: vec![PolicyEntry::UNUSED; config.max_processes] }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.active().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry of the current occupant `pid`
    pub fn get(&self, pid: Endpoint) -> Option<&PolicyEntry> {
        self.entries
            .get(pid.slot().index())
            .filter(|entry| entry.in_use() && entry.endpoint == pid)
    }

    pub fn get_mut(&mut self, pid: Endpoint) -> Option<&mut PolicyEntry> {
        self.entries
            .get_mut(pid.slot().index())
            .filter(|entry| entry.in_use() && entry.endpoint == pid)
    }

    pub fn active(&self) -> impl Iterator<Item = &PolicyEntry> {
        self.entries.iter().filter(|entry| entry.in_use())
    }

    pub fn active_mut(&mut self) -> impl Iterator<Item = &mut PolicyEntry> {
        self.entries.iter_mut().filter(|entry| entry.in_use())
    }

    /// Sum of the shares placed on `cpu`, in parts per million
    pub fn aggregate_share(&self, cpu: u8) -> u64 {
        self.aggregate_share_except(cpu, None)
    }

    fn aggregate_share_except(&self, cpu: u8, except: Option<Endpoint>) -> u64 {
        self.active()
            .filter(|entry| entry.cpu == cpu && Some(entry.endpoint) != except)
            .map(|entry| u64::from(entry.cpu_share.ppm()))
            .sum()
    }

    fn fits(&self, cpu: u8, share: CpuShare, except: Option<Endpoint>) -> bool {
        self.aggregate_share_except(cpu, except) + u64::from(share.ppm()) <= u64::from(SHARE_SCALE)
    }

    /// First CPU of `mask` with room for `share`, trying `preferred` first
    fn place(&self, share: CpuShare, mask: CpuMask, preferred: Option<u8>, except: Option<Endpoint>) -> PolicyResult<u8> {
        if let Some(cpu) = preferred {
            if mask.is_set(cpu as usize) && self.fits(cpu, share, except) {
                return Ok(cpu);
            }
        }
        mask.cpus()
            .map(|cpu| cpu as u8)
            .find(|&cpu| self.fits(cpu, share, except))
            .ok_or(PolicyError::Oversubscribed { requested: share, cpu_mask: mask })
    }

    fn validate(&self, bounds: &PriorityBounds, current_share: Option<CpuShare>) -> PolicyResult<Admission> {
        if bounds.max_priority > bounds.priority || !self.config.is_schedulable(bounds.priority) {
            return Err(PolicyError::InvalidPriority {
                max_priority: bounds.max_priority,
                priority: bounds.priority,
            });
        }
        let quantum = bounds.quantum.unwrap_or(self.config.default_quantum);
        if quantum < self.config.min_quantum || quantum > self.config.max_quantum {
            return Err(PolicyError::InvalidQuantum {
                quantum,
                min: self.config.min_quantum,
                max: self.config.max_quantum,
            });
        }
        let mask = bounds.cpu_mask.intersect(&self.config.cpu_mask());
        if mask.is_empty() {
            return Err(PolicyError::InvalidAffinity { cpu_mask: bounds.cpu_mask });
        }
        let share = bounds.cpu_share.or(current_share).unwrap_or(self.config.default_share);
        Ok(Admission { bounds: *bounds, quantum, share, mask })
    }

    /// Admit a new process. On error nothing changes.
    pub fn admit(
        &mut self,
        pid: Endpoint,
        parent: Option<Endpoint>,
        bounds: &PriorityBounds,
        now: u64,
    ) -> PolicyResult<&PolicyEntry> {
        let index = pid.slot().index();
        let capacity = self.capacity();
        let existing = self.entries.get(index).ok_or(PolicyError::TableFull { capacity })?;
        let stale = existing.in_use().then_some(existing.endpoint);
        if stale == Some(pid) {
            return Err(PolicyError::AlreadyRegistered { pid });
        }

        let admission = self.validate(bounds, None)?;
        let cpu = self.place(admission.share, admission.mask, None, stale)?;
        if let Some(old) = stale {
            warn!("slot {} reused by {}, dropping stale entry {}", pid.slot(), pid, old);
        }

        let entry = &mut self.entries[index];
        *entry = PolicyEntry {
            endpoint: pid,
            parent,
            flags: EntryFlags::IN_USE,
            max_priority: admission.bounds.max_priority,
            priority: admission.bounds.priority,
            base_priority: admission.bounds.priority,
            time_slice: admission.quantum,
            base_quantum: admission.quantum,
            cpu,
            cpu_mask: admission.mask,
            cpu_share: admission.share,
            cpu_time_used: 0,
            start_time: now,
            fairness_ratio: Justice::NEUTRAL,
            total_quanta: 0,
            last_update: now,
        };
        debug!("admit {} on cpu {} with share {}", pid, cpu, admission.share);
        Ok(entry)
    }

    /// Replace the bounds of a process. Returns whether the share changed,
    /// in which case the entry waits for the kernel to restart its
    /// accounting epoch. On error the previous policy stays in place.
    pub fn update_bounds(&mut self, pid: Endpoint, bounds: &PriorityBounds) -> PolicyResult<bool> {
        let current = *self.get(pid).ok_or(PolicyError::UnknownProcess { pid })?;
        let admission = self.validate(bounds, Some(current.cpu_share))?;
        let cpu = self.place(admission.share, admission.mask, Some(current.cpu), Some(pid))?;

        let entry = self.get_mut(pid).ok_or(PolicyError::UnknownProcess { pid })?;
        let share_changed = entry.cpu_share != admission.share;
        entry.max_priority = admission.bounds.max_priority;
        entry.base_priority = admission.bounds.priority;
        entry.priority = admission.bounds.priority;
        entry.base_quantum = admission.quantum;
        entry.time_slice = admission.quantum;
        entry.cpu_mask = admission.mask;
        entry.cpu_share = admission.share;
        entry.cpu = cpu;
        if share_changed {
            // the old epoch's usage says nothing about the new share; the
            // epoch only restarts once the kernel has reset its accounting
            entry.flags.insert(EntryFlags::EPOCH_PENDING);
            entry.fairness_ratio = Justice::NEUTRAL;
        }
        debug!("update {}: priority {} share {} cpu {}", pid, entry.priority, entry.cpu_share, cpu);
        Ok(share_changed)
    }

    pub fn remove(&mut self, pid: Endpoint) -> PolicyResult<PolicyEntry> {
        let entry = self.get_mut(pid).ok_or(PolicyError::UnknownProcess { pid })?;
        let removed = *entry;
        *entry = PolicyEntry::UNUSED;
        Ok(removed)
    }
}

/// Parse an administrator-supplied share fraction
pub fn share_from_fraction(fraction: f64) -> PolicyResult<CpuShare> {
    Ok(CpuShare::from_fraction(fraction)?)
}
