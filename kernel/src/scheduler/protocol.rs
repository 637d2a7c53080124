//! Kernel side of the policy protocol
//!
//! [`PolicyLink`] numbers outgoing requests, holds them in a bounded outbox
//! until the transport drains them, and remembers the one request per
//! process that still waits for a response together with its deadline.
//! Exits that could not be delivered stay owed, one per slot, until the
//! server can hear them: otherwise it would hold the exited process's share
//! forever.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

use gsched_abi::{Endpoint, Request, RequestKind, Response, SchedConfig, SlotId, UNSOLICITED};

use crate::scheduler::core::error::{SchedError, SchedResult};

/// What an outstanding request asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    QuantumExpired,
    Created,
    PriorityChange,
}

/// A request waiting for its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub seq: u32,
    pub endpoint: Endpoint,
    pub kind: PendingKind,
    /// Tick at which the local default takes over
    pub deadline: u64,
}

/// How an incoming response relates to the outstanding requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// Answers the outstanding request, which is now closed
    Matched(Pending),
    /// Sweep-initiated, and nothing is outstanding for the process
    Unsolicited,
    /// Late, unknown, or unsolicited while a request is outstanding
    Unmatched,
}

/// Why a response was dropped without effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Process exited or its slot was reused
    StaleEndpoint,
    /// No outstanding request with this sequence number
    NoMatchingRequest,
    /// Unsolicited response while a request is outstanding
    RequestOutstanding,
    /// Bytes did not decode as a response
    Undecodable,
}

/// Result of handing a response to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Priority and quantum stored as sent
    Applied,
    /// Policy server refused; local default applied
    Rejected,
    /// Response values unusable; local default applied
    Degraded,
    Discarded(DiscardReason),
}

pub struct PolicyLink {
    outbox: VecDeque<Request>,
    pending: Vec<Option<Pending>>,
    /// Undelivered `ProcessExited`, per slot
    owed_exits: Vec<Option<Endpoint>>,
    next_seq: u32,
    reachable: bool,
    timeout: u64,
    capacity: usize,
}

impl PolicyLink {
    pub fn new(config: &SchedConfig) -> Self {
        Self {
            outbox: VecDeque::with_capacity(config.outbox_capacity),
            pending: vec![None; config.max_processes],
            owed_exits: vec![None; config.max_processes],
            next_seq: UNSOLICITED + 1,
            reachable: true,
            timeout: config.response_timeout,
            capacity: config.outbox_capacity,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Queue a request. Requests expecting a response are refused while
    /// another one for the same process is outstanding.
    pub fn post(&mut self, kind: RequestKind, now: u64) -> SchedResult<u32> {
        if !self.reachable {
            return Err(SchedError::PolicyUnreachable);
        }
        if self.outbox.len() >= self.capacity {
            return Err(SchedError::OutboxFull { capacity: self.capacity });
        }
        let pid = kind.pid();
        let pending_kind = match kind {
            RequestKind::QuantumExpired { .. } => Some(PendingKind::QuantumExpired),
            RequestKind::ProcessCreated { .. } => Some(PendingKind::Created),
            RequestKind::PriorityChangeRequest { .. } => Some(PendingKind::PriorityChange),
            RequestKind::ProcessExited { .. } => None,
        };
        if pending_kind.is_some() {
            if let Some(outstanding) = self.pending(pid.slot()) {
                return Err(SchedError::RequestOutstanding { endpoint: pid, seq: outstanding.seq });
            }
        }

        let seq = self.take_seq();
        self.outbox.push_back(Request { seq, now, kind });
        if let Some(kind) = pending_kind {
            if let Some(entry) = self.pending.get_mut(pid.slot().index()) {
                *entry = Some(Pending { seq, endpoint: pid, kind, deadline: now.saturating_add(self.timeout) });
            }
        }
        Ok(seq)
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = match self.next_seq.wrapping_add(1) {
            UNSOLICITED => UNSOLICITED + 1,
            next => next,
        };
        seq
    }

    pub fn pending(&self, slot: SlotId) -> Option<&Pending> {
        self.pending.get(slot.index()).and_then(Option::as_ref)
    }

    /// Forget the outstanding request of `slot`; its response will not match
    pub fn cancel(&mut self, slot: SlotId) -> Option<Pending> {
        self.pending.get_mut(slot.index()).and_then(Option::take)
    }

    /// Match a response against the outstanding requests
    pub fn correlate(&mut self, response: &Response) -> Correlation {
        let pid = response.kind.pid();
        let Some(entry) = self.pending.get_mut(pid.slot().index()) else {
            return Correlation::Unmatched;
        };
        if response.is_unsolicited() {
            return if entry.is_some() { Correlation::Unmatched } else { Correlation::Unsolicited };
        }
        let matches = matches!(entry, Some(pending) if pending.seq == response.seq && pending.endpoint == pid);
        match entry.take() {
            Some(pending) if matches => Correlation::Matched(pending),
            other => {
                *entry = other;
                Correlation::Unmatched
            }
        }
    }

    /// Close every request whose deadline has passed
    pub fn expire(&mut self, now: u64) -> Vec<Pending> {
        let mut expired = Vec::new();
        for entry in self.pending.iter_mut() {
            if matches!(entry, Some(pending) if pending.deadline <= now) {
                if let Some(pending) = entry.take() {
                    expired.push(pending);
                }
            }
        }
        expired
    }

    /// Mark the server (un)reachable. Going away closes every outstanding
    /// request and drops the undelivered ones, except exits, which stay owed.
    pub fn set_reachable(&mut self, reachable: bool) -> Vec<Pending> {
        self.reachable = reachable;
        if reachable {
            return Vec::new();
        }
        for request in core::mem::take(&mut self.outbox) {
            if let RequestKind::ProcessExited { pid } = request.kind {
                self.owe_exit(pid);
            }
        }
        self.pending.iter_mut().filter_map(Option::take).collect()
    }

    /// Remember an exit the server has not heard of. Only the oldest
    /// generation per slot is kept: a newer occupant that exits while the
    /// first exit is still owed never reached the server either.
    pub fn owe_exit(&mut self, pid: Endpoint) {
        if let Some(entry) = self.owed_exits.get_mut(pid.slot().index()) {
            entry.get_or_insert(pid);
        }
    }

    /// Number the owed exits for sending, if the server can hear them
    fn take_owed_exits(&mut self, now: u64) -> Vec<Request> {
        if !self.reachable {
            return Vec::new();
        }
        let exits: Vec<Endpoint> = self.owed_exits.iter_mut().filter_map(Option::take).collect();
        exits
            .into_iter()
            .map(|pid| Request { seq: self.take_seq(), now, kind: RequestKind::ProcessExited { pid } })
            .collect()
    }

    /// Hand queued requests to the transport, oldest first. Owed exits go
    /// ahead of everything queued since.
    pub fn drain(&mut self, now: u64) -> impl Iterator<Item = Request> + '_ {
        let owed = self.take_owed_exits(now);
        owed.into_iter().chain(self.outbox.drain(..))
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    pub fn owed(&self) -> usize {
        self.owed_exits.iter().filter(|entry| entry.is_some()).count()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.iter().filter(|entry| entry.is_some()).count()
    }
}
