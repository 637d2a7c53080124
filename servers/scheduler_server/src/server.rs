//! Policy server front end
//!
//! Turns kernel requests into table updates and fairness recomputations and
//! answers with the resulting assignment. The server never sees kernel
//! memory: everything it knows about a process arrived in a request.

use alloc::vec::Vec;

use gsched_abi::wire::{self, WireError};
use gsched_abi::{
    AccountingSnapshot, ConfigError, Endpoint, PriorityBounds, Request, RequestKind, Response, ResponseKind,
    SchedConfig, UNSOLICITED,
};
use log::{debug, info, warn};

use crate::error::{PolicyError, PolicyResult};
use crate::fairness::FairnessEngine;
use crate::table::{PolicyEntry, SchedulerPolicyTable};

/// Server counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyStats {
    pub requests: u64,
    pub admitted: u64,
    pub exited: u64,
    pub recomputations: u64,
    pub rejected: u64,
    pub sweeps: u64,
    pub unsolicited: u64,
    pub malformed: u64,
}

pub struct PolicyServer {
    config: SchedConfig,
    table: SchedulerPolicyTable,
    engine: FairnessEngine,
    last_sweep: u64,
    stats: PolicyStats,
}

impl PolicyServer {
    pub fn new(config: SchedConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "policy server: {} processes, {} CPUs, tolerance {}/1000",
            config.max_processes, config.max_cpus, config.tolerance
        );
        Ok(Self {
            config,
            table: SchedulerPolicyTable::new(config),
            engine: FairnessEngine::new(&config),
            last_sweep: 0,
            stats: PolicyStats::default(),
        })
    }

    /// Answer one request; `ProcessExited` gets no answer
    pub fn handle(&mut self, request: &Request) -> Option<Response> {
        self.stats.requests += 1;
        let pid = request.kind.pid();
        debug!("request #{} {} for {} at {}", request.seq, request.kind.name(), pid, request.now);

        let result = match request.kind {
            RequestKind::QuantumExpired { pid, accounting } => self.quantum_expired(pid, &accounting, request.now),
            RequestKind::ProcessCreated { pid, parent, bounds } => self.created(pid, parent, &bounds, request.now),
            RequestKind::ProcessExited { pid } => {
                self.exited(pid);
                return None;
            }
            RequestKind::PriorityChangeRequest { pid, bounds } => self.priority_change(pid, &bounds, request.now),
        };

        let kind = result.unwrap_or_else(|err| {
            self.stats.rejected += 1;
            warn!("{} for {} refused: {}", request.kind.name(), pid, err);
            ResponseKind::Rejected { pid, reason: err.reject_reason() }
        });
        Some(Response { seq: request.seq, kind })
    }

    /// Decode a request from `bytes`, handle it and encode the answer into
    /// `out`. Returns the answer length, `None` when there is nothing to send.
    pub fn handle_encoded(&mut self, bytes: &[u8], out: &mut [u8]) -> Result<Option<usize>, WireError> {
        let request = wire::decode_request(bytes).map_err(|err| {
            self.stats.malformed += 1;
            warn!("malformed request: {}", err);
            err
        })?;
        match self.handle(&request) {
            Some(response) => Ok(Some(wire::encode_response(&response, out)?.len())),
            None => Ok(None),
        }
    }

    fn quantum_expired(
        &mut self,
        pid: Endpoint,
        accounting: &AccountingSnapshot,
        now: u64,
    ) -> PolicyResult<ResponseKind> {
        let engine = self.engine;
        let entry = self.table.get_mut(pid).ok_or(PolicyError::UnknownProcess { pid })?;
        // the kernel's counters and epoch always travel together
        entry.adopt_epoch(accounting.epoch_start, accounting.cpu_time);
        engine.recompute(entry, now);
        self.stats.recomputations += 1;
        Ok(requantize(entry, false))
    }

    fn created(
        &mut self,
        pid: Endpoint,
        parent: Option<Endpoint>,
        bounds: &PriorityBounds,
        now: u64,
    ) -> PolicyResult<ResponseKind> {
        let entry = self.table.admit(pid, parent, bounds, now)?;
        let kind = requantize(entry, false);
        self.stats.admitted += 1;
        Ok(kind)
    }

    fn exited(&mut self, pid: Endpoint) {
        match self.table.remove(pid) {
            Ok(entry) => {
                self.stats.exited += 1;
                debug!("{} left after {} quanta", pid, entry.total_quanta);
            }
            // never admitted (creation was refused), nothing to free
            Err(err) => debug!("exit of {}: {}", pid, err),
        }
    }

    fn priority_change(&mut self, pid: Endpoint, bounds: &PriorityBounds, now: u64) -> PolicyResult<ResponseKind> {
        let share_changed = self.table.update_bounds(pid, bounds)?;
        let engine = self.engine;
        let entry = self.table.get_mut(pid).ok_or(PolicyError::UnknownProcess { pid })?;
        // an earlier reset may have been lost on the way: ask again
        let reset = share_changed || entry.epoch_pending();
        if reset {
            // new operating point at neutral justice; judged again once the
            // kernel reports usage from its reset
            entry.total_quanta += 1;
            entry.last_update = now;
        } else {
            engine.recompute(entry, now);
            self.stats.recomputations += 1;
        }
        Ok(requantize(entry, reset))
    }

    /// Recompute every active entry from its last known usage and return an
    /// unsolicited requantization for each one whose assignment moved
    pub fn sweep(&mut self, now: u64) -> Vec<Response> {
        let engine = self.engine;
        let mut responses = Vec::new();
        for entry in self.table.active_mut().filter(|entry| !entry.epoch_pending()) {
            let assignment = engine.evaluate(entry, now);
            if assignment.priority == entry.priority && assignment.quantum == entry.time_slice {
                continue;
            }
            engine.recompute(entry, now);
            responses.push(Response { seq: UNSOLICITED, kind: requantize(entry, false) });
        }
        self.last_sweep = now;
        self.stats.sweeps += 1;
        self.stats.unsolicited += responses.len() as u64;
        if !responses.is_empty() {
            debug!("sweep at {}: {} processes requantized", now, responses.len());
        }
        responses
    }

    pub fn sweep_due(&self, now: u64) -> bool {
        self.config.sweep_interval > 0 && now.saturating_sub(self.last_sweep) >= self.config.sweep_interval
    }

    /// Sweep if the interval has passed
    pub fn maybe_sweep(&mut self, now: u64) -> Vec<Response> {
        if self.sweep_due(now) {
            self.sweep(now)
        } else {
            Vec::new()
        }
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn table(&self) -> &SchedulerPolicyTable {
        &self.table
    }

    pub fn entry(&self, pid: Endpoint) -> Option<&PolicyEntry> {
        self.table.get(pid)
    }

    pub fn stats(&self) -> PolicyStats {
        self.stats
    }
}

fn requantize(entry: &PolicyEntry, reset_accounting: bool) -> ResponseKind {
    ResponseKind::Requantize {
        pid: entry.endpoint,
        priority: entry.priority,
        quantum: entry.time_slice,
        justice: entry.fairness_ratio,
        reset_accounting,
    }
}
