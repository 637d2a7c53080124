//! Dispatcher - owner of the process table and the ready queues
//!
//! The dispatcher is the only writer of PCB state. It picks the head of the
//! highest non-empty ready queue, charges ticks to the running process and,
//! when a quantum runs out, parks the process as `PREEMPTED` and asks the
//! policy server for a new priority and quantum. Policy answers are applied
//! here; when none arrives in time the process gets a fresh quantum at its
//! current priority instead.

use alloc::vec;
use alloc::vec::Vec;

use gsched_abi::wire::{self, WireError};
use gsched_abi::{
    Endpoint, Justice, PriorityBounds, Request, RequestKind, Response, ResponseKind, SchedConfig, SlotId,
    MAX_MESSAGE_SIZE,
};
use log::{debug, error, info, trace, warn};

use super::error::{SchedError, SchedResult};
use super::ready_queue::ReadyQueueSet;
use super::statistics::SchedulerStats;
use crate::scheduler::process::{
    AccountingRecord, BlockReason, IpcKind, MiscFlags, PrivId, ProcessControlBlock, ProcessTable, RuntimeFlags,
    Transition,
};
use crate::scheduler::protocol::{Correlation, DiscardReason, Pending, PolicyLink, ResponseOutcome};

/// Everything needed to start a process
#[derive(Debug, Clone, Copy)]
pub struct SpawnParams<'a> {
    pub name: &'a str,
    pub parent: Option<Endpoint>,
    /// `None` leaves the process blocked on `NO_PRIV`
    pub privilege: Option<PrivId>,
    pub bounds: PriorityBounds,
    /// Hold the process until [`Dispatcher::boot_complete`]
    pub boot_inhibit: bool,
}

impl<'a> SpawnParams<'a> {
    pub const fn new(name: &'a str, privilege: PrivId, bounds: PriorityBounds) -> Self {
        Self {
            name,
            parent: None,
            privilege: Some(privilege),
            bounds,
            boot_inhibit: false,
        }
    }

    pub const fn with_parent(mut self, parent: Endpoint) -> Self {
        self.parent = Some(parent);
        self
    }

    pub const fn without_privilege(mut self) -> Self {
        self.privilege = None;
        self
    }

    pub const fn boot_inhibited(mut self) -> Self {
        self.boot_inhibit = true;
        self
    }
}

pub struct Dispatcher {
    pub(crate) config: SchedConfig,
    pub(crate) table: ProcessTable,
    pub(crate) queues: ReadyQueueSet,
    pub(crate) link: PolicyLink,
    pub(crate) current: Option<SlotId>,
    pub(crate) now: u64,
    pub(crate) stats: SchedulerStats,
}

impl Dispatcher {
    /// Empty dispatcher for a validated configuration
    pub fn new(config: SchedConfig) -> SchedResult<Self> {
        config.validate()?;
        info!(
            "dispatcher: {} queues, {} slots, quantum {} ticks",
            config.queues, config.max_processes, config.default_quantum
        );
        Ok(Self {
            config,
            table: ProcessTable::new(config.max_processes),
            queues: ReadyQueueSet::new(config.queues),
            link: PolicyLink::new(&config),
            current: None,
            now: 0,
            stats: SchedulerStats::new(),
        })
    }

    // ═══════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════

    /// Put a new process in the table and announce it to the policy server
    pub fn spawn(&mut self, params: SpawnParams<'_>) -> SchedResult<Endpoint> {
        self.check_bounds(&params.bounds)?;
        let slot = self.table.allocate()?;
        let quantum = params.bounds.quantum.unwrap_or(self.config.default_quantum);
        let now = self.now;

        let pcb = self.table.slot_mut(slot).ok_or(SchedError::SlotFree { slot })?;
        pcb.set_name(params.name);
        pcb.parent = params.parent;
        pcb.privilege = params.privilege;
        pcb.priority = params.bounds.priority;
        pcb.max_priority = params.bounds.max_priority;
        pcb.quantum_size = quantum;
        pcb.ticks_left = quantum;
        pcb.justice = Justice::NEUTRAL;
        pcb.schedules = 1;
        pcb.accounting = AccountingRecord::starting_at(now);
        if params.privilege.is_none() {
            pcb.block(BlockReason::NoPrivilege);
        }
        if params.boot_inhibit {
            pcb.block(BlockReason::BootInhibited);
        }
        let endpoint = pcb.endpoint();
        let transition = pcb.unblock(BlockReason::SlotFree);

        self.stats.spawned += 1;
        info!("spawn {} '{}' at priority {}", endpoint, params.name, params.bounds.priority);
        self.settle(slot, transition)?;

        let kind = RequestKind::ProcessCreated { pid: endpoint, parent: params.parent, bounds: params.bounds };
        if !self.post(kind) {
            self.stats.degraded += 1;
        }
        Ok(endpoint)
    }

    /// Remove a process. Its outstanding request is cancelled, so a late
    /// response no longer matches anything.
    pub fn exit(&mut self, endpoint: Endpoint) -> SchedResult<()> {
        let slot = self.table.resolve(endpoint)?;
        if let Some(pending) = self.link.cancel(slot) {
            debug!("exit {}: cancelled request {}", endpoint, pending.seq);
        }
        self.leave(slot)?;

        let pcb = self.table.get(slot)?;
        if pcb.has(BlockReason::Sending) {
            if let Some(dest) = pcb.sendto.and_then(|dest| self.table.resolve(dest).ok()) {
                self.unlink_caller(slot, dest);
            }
        }
        let senders = self.caller_queue_slots(slot);
        let receivers: Vec<SlotId> = self
            .table
            .active()
            .filter(|pcb| pcb.has(BlockReason::Receiving) && pcb.getfrom == Some(endpoint))
            .map(|pcb| pcb.nr)
            .collect();

        if let Some(pcb) = self.table.slot_mut(slot) {
            pcb.release();
        }
        self.stats.exited += 1;
        info!("exit {}", endpoint);

        for sender in senders {
            let Some(pcb) = self.table.slot_mut(sender) else { continue };
            pcb.q_link = None;
            pcb.sendto = None;
            pcb.misc |= MiscFlags::MSG_FAILED;
            let transition = pcb.unblock(BlockReason::Sending);
            self.settle(sender, transition)?;
        }
        for receiver in receivers {
            let Some(pcb) = self.table.slot_mut(receiver) else { continue };
            pcb.getfrom = None;
            pcb.misc |= MiscFlags::MSG_FAILED;
            let transition = pcb.unblock(BlockReason::Receiving);
            self.settle(receiver, transition)?;
        }

        if !self.post(RequestKind::ProcessExited { pid: endpoint }) {
            // the server must still learn of it to release the share
            self.link.owe_exit(endpoint);
        }
        self.schedule();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Block reasons
    // ═══════════════════════════════════════════════════════════════

    /// Add a block reason. `SlotFree` belongs to spawn and exit.
    pub fn block(&mut self, endpoint: Endpoint, reason: BlockReason) -> SchedResult<Transition> {
        let slot = self.table.resolve(endpoint)?;
        if reason == BlockReason::SlotFree {
            return Err(SchedError::InvariantViolation { slot, reason: "SlotFree set outside exit" });
        }
        let transition = self.table.get_mut(slot)?.block(reason);
        self.settle(slot, transition)?;
        Ok(transition)
    }

    pub fn unblock(&mut self, endpoint: Endpoint, reason: BlockReason) -> SchedResult<Transition> {
        let slot = self.table.resolve(endpoint)?;
        if reason == BlockReason::SlotFree {
            return Err(SchedError::InvariantViolation { slot, reason: "SlotFree cleared outside spawn" });
        }
        let transition = self.table.get_mut(slot)?.unblock(reason);
        self.settle(slot, transition)?;
        Ok(transition)
    }

    /// Clear several reasons at once; the process is admitted at most once
    pub fn unblock_all(&mut self, endpoint: Endpoint, reasons: RuntimeFlags) -> SchedResult<Transition> {
        let slot = self.table.resolve(endpoint)?;
        let transition = self.table.get_mut(slot)?.unblock_all(reasons - RuntimeFlags::SLOT_FREE);
        self.settle(slot, transition)?;
        Ok(transition)
    }

    /// Follow up a flag change: admit on `BecameRunnable`, take off the CPU
    /// and out of the queues on `BecameBlocked`
    pub(crate) fn settle(&mut self, slot: SlotId, transition: Transition) -> SchedResult<()> {
        match transition {
            Transition::BecameRunnable => self.make_ready(slot),
            Transition::BecameBlocked => {
                self.leave(slot)?;
                self.schedule();
                Ok(())
            }
            Transition::Unchanged => Ok(()),
        }
    }

    /// Off the CPU and out of any ready queue, without picking a successor
    fn leave(&mut self, slot: SlotId) -> SchedResult<()> {
        if self.current == Some(slot) {
            self.current = None;
        }
        if self.table.get(slot)?.is_queued() {
            self.queues.remove(&mut self.table, slot, self.now)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Dispatching
    // ═══════════════════════════════════════════════════════════════

    /// Admit a runnable process and preempt the running one if the newcomer
    /// has a strictly higher priority
    pub fn make_ready(&mut self, slot: SlotId) -> SchedResult<()> {
        self.queues.enqueue(&mut self.table, slot, self.now)?;
        if self.current.is_some() {
            self.preempt_for(slot);
        } else {
            self.schedule();
        }
        Ok(())
    }

    /// Run the head of the highest non-empty queue if the CPU is free.
    /// Returns the running process, `None` when idle.
    pub fn schedule(&mut self) -> Option<Endpoint> {
        if self.current.is_none() {
            if let Some(slot) = self.queues.dequeue_head(&mut self.table, self.now) {
                self.current = Some(slot);
                self.stats.dispatches += 1;
                trace!("dispatch {}", slot);
            }
        }
        self.current()
    }

    /// Displace the running process in favour of queued `slot` when `slot`
    /// has a strictly higher priority. The displaced process goes to the
    /// tail of its level and keeps its remaining ticks.
    pub fn preempt_for(&mut self, slot: SlotId) -> bool {
        let Some(running) = self.current else {
            return false;
        };
        let (Ok(candidate), Ok(current)) = (self.table.get(slot), self.table.get(running)) else {
            return false;
        };
        if !candidate.is_queued() || candidate.priority >= current.priority {
            return false;
        }
        if let Err(err) = self.queues.remove(&mut self.table, slot, self.now) {
            error!("preempt_for {}: {}", slot, err);
            return false;
        }
        self.current = None;
        if let Err(err) = self.queues.enqueue(&mut self.table, running, self.now) {
            error!("preempt_for: requeue {}: {}", running, err);
        }
        self.current = Some(slot);
        self.stats.preemptions += 1;
        self.stats.dispatches += 1;
        debug!("{} preempts {}", slot, running);
        true
    }

    /// One clock tick: charge the running process, expire overdue policy
    /// requests and dispatch
    pub fn tick(&mut self) -> Option<Endpoint> {
        self.now += 1;
        self.stats.ticks += 1;

        match self.current {
            Some(slot) => {
                let expired = match self.table.get_mut(slot) {
                    Ok(pcb) => {
                        pcb.accounting.on_tick();
                        pcb.ticks_left = pcb.ticks_left.saturating_sub(1);
                        pcb.ticks_left == 0
                    }
                    Err(err) => {
                        error!("tick: running {}: {}", slot, err);
                        self.current = None;
                        false
                    }
                };
                if expired {
                    self.expire_quantum(slot);
                }
            }
            None => self.stats.idle_ticks += 1,
        }

        for pending in self.link.expire(self.now) {
            self.stats.timeouts += 1;
            warn!("no policy response to request {} for {}, local default", pending.seq, pending.endpoint);
            self.fall_back_pending(pending);
        }
        self.schedule()
    }

    fn expire_quantum(&mut self, slot: SlotId) {
        let Ok(pcb) = self.table.get_mut(slot) else { return };
        pcb.block(BlockReason::Preempted);
        pcb.accounting.on_preempt();
        let kind = RequestKind::QuantumExpired {
            pid: pcb.endpoint(),
            accounting: pcb.accounting.snapshot(pcb.schedules),
        };
        self.current = None;
        self.stats.quantum_expirations += 1;
        trace!("quantum expired for {}", slot);
        if !self.post(kind) {
            self.fall_back(slot);
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Policy protocol
    // ═══════════════════════════════════════════════════════════════

    fn post(&mut self, kind: RequestKind) -> bool {
        match self.link.post(kind, self.now) {
            Ok(seq) => {
                self.stats.requests_sent += 1;
                trace!("request {} {} for {}", seq, kind.name(), kind.pid());
                true
            }
            Err(err) => {
                warn!("{} for {} not sent: {}", kind.name(), kind.pid(), err);
                false
            }
        }
    }

    /// Ask the policy server for new bounds. The process keeps its current
    /// parameters until the response arrives.
    pub fn request_priority_change(&mut self, endpoint: Endpoint, bounds: PriorityBounds) -> SchedResult<u32> {
        self.check_bounds(&bounds)?;
        self.table.resolve(endpoint)?;
        let seq = self.link.post(RequestKind::PriorityChangeRequest { pid: endpoint, bounds }, self.now)?;
        self.stats.requests_sent += 1;
        debug!("priority change {} for {}: {}..{}", seq, endpoint, bounds.max_priority, bounds.priority);
        Ok(seq)
    }

    /// Apply one policy response
    pub fn apply_response(&mut self, response: &Response) -> ResponseOutcome {
        let pid = response.kind.pid();
        let Ok(slot) = self.table.resolve(pid) else {
            return self.discard(response, DiscardReason::StaleEndpoint);
        };
        if let Correlation::Unmatched = self.link.correlate(response) {
            let reason = if response.is_unsolicited() {
                DiscardReason::RequestOutstanding
            } else {
                DiscardReason::NoMatchingRequest
            };
            return self.discard(response, reason);
        }

        match response.kind {
            ResponseKind::Requantize { priority, quantum, justice, reset_accounting, .. } => {
                if !self.config.is_schedulable(priority) || !self.quantum_in_bounds(quantum) {
                    warn!("malformed requantize for {}: priority {} quantum {}", pid, priority, quantum);
                    self.fall_back(slot);
                    return ResponseOutcome::Degraded;
                }
                self.requantize(slot, priority, quantum, justice, reset_accounting);
                self.stats.responses_applied += 1;
                ResponseOutcome::Applied
            }
            ResponseKind::Rejected { reason, .. } => {
                if let Ok(pcb) = self.table.get_mut(slot) {
                    pcb.last_rejection = Some(reason);
                }
                self.stats.rejections += 1;
                warn!("policy rejected request {} for {}: {}", response.seq, pid, reason);
                self.fall_back(slot);
                ResponseOutcome::Rejected
            }
        }
    }

    /// Decode and apply one response from the transport
    pub fn deliver_encoded(&mut self, bytes: &[u8]) -> ResponseOutcome {
        match wire::decode_response(bytes) {
            Ok(response) => self.apply_response(&response),
            Err(err) => {
                warn!("undecodable policy response: {}", err);
                self.stats.degraded += 1;
                self.stats.responses_discarded += 1;
                ResponseOutcome::Discarded(DiscardReason::Undecodable)
            }
        }
    }

    /// Requests waiting for the transport, oldest first
    pub fn drain_requests(&mut self) -> Vec<Request> {
        self.link.drain(self.now).collect()
    }

    /// Encode every queued request and hand it to `send`
    pub fn drain_encoded<F: FnMut(&[u8])>(&mut self, mut send: F) -> Result<usize, WireError> {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let mut sent = 0;
        for request in self.link.drain(self.now) {
            send(wire::encode_request(&request, &mut buf)?);
            sent += 1;
        }
        Ok(sent)
    }

    /// Losing the policy server resolves every outstanding request with the
    /// local default at once
    pub fn set_policy_reachable(&mut self, reachable: bool) {
        let closed = self.link.set_reachable(reachable);
        if reachable {
            info!("policy server reachable, {} exits owed", self.link.owed());
            return;
        }
        warn!("policy server unreachable, {} requests fall back", closed.len());
        for pending in closed {
            self.fall_back_pending(pending);
        }
    }

    fn requantize(&mut self, slot: SlotId, priority: u8, quantum: u32, justice: Justice, reset_accounting: bool) {
        let now = self.now;
        let Ok(pcb) = self.table.get_mut(slot) else { return };
        let previous = pcb.priority;
        pcb.priority = priority;
        pcb.quantum_size = quantum;
        pcb.justice = justice;
        let fresh = pcb.has(BlockReason::Preempted);
        if fresh {
            pcb.ticks_left = quantum;
            pcb.schedules += 1;
        } else {
            pcb.ticks_left = pcb.ticks_left.min(quantum);
        }
        if reset_accounting {
            pcb.accounting.reset(now);
        }
        let queued = pcb.is_queued();
        debug!(
            "requantize {}: priority {} -> {}, quantum {}, justice {}",
            slot, previous, priority, quantum, justice
        );

        if fresh {
            let transition = pcb.unblock(BlockReason::Preempted);
            if let Err(err) = self.settle(slot, transition) {
                error!("requantize {}: {}", slot, err);
            }
        } else if queued && previous != priority {
            let requeued = self
                .queues
                .remove(&mut self.table, slot, now)
                .and_then(|()| self.make_ready(slot));
            if let Err(err) = requeued {
                error!("requantize {}: requeue: {}", slot, err);
            }
        } else if self.current == Some(slot) && priority > previous {
            // the running process sank: a waiting process may now outrank it
            if let Some(head) = self.queues.highest_level().and_then(|level| self.queues.head(level)) {
                self.preempt_for(head);
            }
        }
    }

    /// Local default: same priority, a fresh quantum of the current size
    fn fall_back(&mut self, slot: SlotId) {
        self.stats.degraded += 1;
        let Ok(pcb) = self.table.get_mut(slot) else { return };
        if !pcb.has(BlockReason::Preempted) {
            return;
        }
        pcb.ticks_left = pcb.quantum_size;
        pcb.schedules += 1;
        let transition = pcb.unblock(BlockReason::Preempted);
        debug!("local default for {}: quantum {}", slot, pcb.quantum_size);
        if let Err(err) = self.settle(slot, transition) {
            error!("local default {}: {}", slot, err);
        }
    }

    fn fall_back_pending(&mut self, pending: Pending) {
        match self.table.resolve(pending.endpoint) {
            Ok(slot) => self.fall_back(slot),
            Err(_) => self.stats.degraded += 1,
        }
    }

    fn discard(&mut self, response: &Response, reason: DiscardReason) -> ResponseOutcome {
        self.stats.responses_discarded += 1;
        debug!("discard response {} for {}: {:?}", response.seq, response.kind.pid(), reason);
        ResponseOutcome::Discarded(reason)
    }

    fn quantum_in_bounds(&self, quantum: u32) -> bool {
        quantum >= self.config.min_quantum.max(1) && quantum <= self.config.max_quantum
    }

    fn check_bounds(&self, bounds: &PriorityBounds) -> SchedResult<()> {
        let lowest = self.config.lowest_user_queue();
        if !self.config.is_schedulable(bounds.priority) {
            return Err(SchedError::InvalidPriority { priority: bounds.priority, lowest });
        }
        if bounds.max_priority > bounds.priority {
            return Err(SchedError::InvalidPriority { priority: bounds.max_priority, lowest: bounds.priority });
        }
        if let Some(quantum) = bounds.quantum {
            if !self.quantum_in_bounds(quantum) {
                let (min, max) = (self.config.min_quantum, self.config.max_quantum);
                return Err(SchedError::InvalidQuantum { quantum, min, max });
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Collaborator hooks
    // ═══════════════════════════════════════════════════════════════

    /// Release every process held for boot
    pub fn boot_complete(&mut self) -> SchedResult<usize> {
        let held: Vec<SlotId> = self
            .table
            .active()
            .filter(|pcb| pcb.has(BlockReason::BootInhibited))
            .map(|pcb| pcb.nr)
            .collect();
        for &slot in &held {
            let transition = self.table.get_mut(slot)?.unblock(BlockReason::BootInhibited);
            self.settle(slot, transition)?;
        }
        info!("boot complete, {} processes released", held.len());
        Ok(held.len())
    }

    pub fn record_ipc(&mut self, endpoint: Endpoint, kind: IpcKind) -> SchedResult<()> {
        self.table.lookup_mut(endpoint)?.accounting.on_ipc(kind);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Invariants
    // ═══════════════════════════════════════════════════════════════

    /// Walk every queue and every slot. Any violation is fatal to the
    /// caller's path.
    pub fn check_invariants(&self) -> SchedResult<()> {
        self.verify().map_err(|err| {
            error!("{} ({})", err, err.recovery_hint());
            err
        })
    }

    fn verify(&self) -> SchedResult<()> {
        let capacity = self.table.capacity();
        let mut seen = vec![false; capacity];

        if let Some(slot) = self.current {
            if self.table.get(slot).is_err() {
                return Err(SchedError::InvariantViolation { slot, reason: "free slot running" });
            }
        }

        for level in 0..self.queues.levels() {
            let mut last = None;
            let mut walked = 0;
            for slot in self.queues.iter_level(&self.table, level) {
                walked += 1;
                if walked > capacity {
                    return Err(SchedError::InvariantViolation { slot, reason: "ready queue loops" });
                }
                let violation = |reason| Err(SchedError::InvariantViolation { slot, reason });
                let Some(pcb) = self.table.slot(slot) else {
                    return violation("queued slot outside the table");
                };
                if pcb.is_free() {
                    return violation("free slot queued");
                }
                if !pcb.is_runnable() {
                    return violation("blocked process queued");
                }
                if pcb.queued_at() != Some(level) {
                    return violation("queued_at disagrees with queue level");
                }
                if self.current == Some(slot) {
                    return violation("running process queued");
                }
                if core::mem::replace(&mut seen[slot.index()], true) {
                    return violation("process queued twice");
                }
                last = Some(slot);
            }
            if self.queues.tail(level) != last {
                let slot = last.or(self.queues.tail(level)).unwrap_or(SlotId(0));
                return Err(SchedError::InvariantViolation { slot, reason: "tail is not the last queued process" });
            }
        }

        for pcb in self.table.iter() {
            let violation = |reason| Err(SchedError::InvariantViolation { slot: pcb.nr, reason });
            if pcb.is_free() {
                if pcb.flags() != RuntimeFlags::SLOT_FREE {
                    return violation("free slot carries other flags");
                }
                continue;
            }
            if pcb.is_queued() && !seen[pcb.nr.index()] {
                return violation("queued_at set but not in the queue");
            }
            let running = self.current == Some(pcb.nr);
            if pcb.is_runnable() && !running && !pcb.is_queued() {
                return violation("runnable process neither queued nor running");
            }
            if running && !pcb.is_runnable() {
                return violation("blocked process running");
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Kernel clock in ticks
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Running process, `None` when idle
    pub fn current(&self) -> Option<Endpoint> {
        self.current.and_then(|slot| self.table.slot(slot)).map(ProcessControlBlock::endpoint)
    }

    pub fn process(&self, endpoint: Endpoint) -> SchedResult<&ProcessControlBlock> {
        self.table.lookup(endpoint)
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn queues(&self) -> &ReadyQueueSet {
        &self.queues
    }

    /// Outstanding request for `endpoint`, if any
    pub fn pending_request(&self, endpoint: Endpoint) -> Option<&Pending> {
        self.link.pending(endpoint.slot()).filter(|pending| pending.endpoint == endpoint)
    }

    /// Ready processes of one level, head first
    pub fn ready_at(&self, level: u8) -> Vec<Endpoint> {
        self.queues
            .iter_level(&self.table, level)
            .filter_map(|slot| self.table.slot(slot))
            .map(ProcessControlBlock::endpoint)
            .collect()
    }
}
