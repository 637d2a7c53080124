//! Accounting - per-process scheduling counters
//!
//! Only the dispatcher mutates a record. It is copied into every
//! `QuantumExpired` request and zeroed when a `Requantize` response asks for
//! it.

use gsched_abi::AccountingSnapshot;

/// Per-process scheduling counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountingRecord {
    /// Tick of the last ready-queue admission, if currently queued
    pub enter_queue: Option<u64>,
    /// Ticks spent waiting in ready queues
    pub time_in_queue: u64,
    /// Ready-queue removals
    pub dequeues: u64,
    pub ipc_sync: u64,
    pub ipc_async: u64,
    /// Quantum expirations
    pub preempted: u64,
    /// Ticks actually executed
    pub cpu_time: u64,
    /// Tick the counters started from: creation or the last reset
    pub epoch_start: u64,
}

/// Kind of IPC a process performed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcKind {
    Sync,
    Async,
}

impl AccountingRecord {
    pub const fn new() -> Self {
        Self {
            enter_queue: None,
            time_in_queue: 0,
            dequeues: 0,
            ipc_sync: 0,
            ipc_async: 0,
            preempted: 0,
            cpu_time: 0,
            epoch_start: 0,
        }
    }

    /// Fresh record for a process created at `now`
    pub const fn starting_at(now: u64) -> Self {
        let mut record = Self::new();
        record.epoch_start = now;
        record
    }

    /// Stamp admission into a ready queue
    pub fn on_enqueue(&mut self, now: u64) {
        self.enter_queue = Some(now);
    }

    /// Close the waiting interval opened by [`on_enqueue`](Self::on_enqueue)
    pub fn on_dequeue(&mut self, now: u64) {
        if let Some(entered) = self.enter_queue.take() {
            self.time_in_queue += now.saturating_sub(entered);
        }
        self.dequeues += 1;
    }

    pub fn on_tick(&mut self) {
        self.cpu_time += 1;
    }

    pub fn on_preempt(&mut self) {
        self.preempted += 1;
    }

    pub fn on_ipc(&mut self, kind: IpcKind) {
        match kind {
            IpcKind::Sync => self.ipc_sync += 1,
            IpcKind::Async => self.ipc_async += 1,
        }
    }

    /// Zero every counter and start a new epoch at `now`. An open queue
    /// interval restarts at `now` too.
    pub fn reset(&mut self, now: u64) {
        let queued = self.enter_queue.is_some();
        *self = Self::starting_at(now);
        if queued {
            self.enter_queue = Some(now);
        }
    }

    /// Copy for the wire, with the lifetime quantum count attached
    pub fn snapshot(&self, schedules: u64) -> AccountingSnapshot {
        AccountingSnapshot {
            cpu_time: self.cpu_time,
            time_in_queue: self.time_in_queue,
            dequeues: self.dequeues,
            ipc_sync: self.ipc_sync,
            ipc_async: self.ipc_async,
            preempted: self.preempted,
            schedules,
            epoch_start: self.epoch_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_interval() {
        let mut record = AccountingRecord::new();
        record.on_enqueue(10);
        record.on_dequeue(25);
        record.on_enqueue(30);
        record.on_dequeue(31);
        assert_eq!(record.time_in_queue, 16);
        assert_eq!(record.dequeues, 2);
        assert_eq!(record.enter_queue, None);
    }

    #[test]
    fn test_reset_keeps_open_interval() {
        let mut record = AccountingRecord::new();
        record.on_tick();
        record.on_ipc(IpcKind::Async);
        record.on_enqueue(5);
        record.reset(40);
        assert_eq!(record.cpu_time, 0);
        assert_eq!(record.ipc_async, 0);
        assert_eq!(record.enter_queue, Some(40));
        assert_eq!(record.epoch_start, 40);
        assert_eq!(record.snapshot(0).epoch_start, 40);
    }

    #[test]
    fn test_snapshot() {
        let mut record = AccountingRecord::starting_at(12);
        record.on_tick();
        record.on_tick();
        record.on_preempt();
        record.on_ipc(IpcKind::Sync);
        let snapshot = record.snapshot(3);
        assert_eq!(snapshot.cpu_time, 2);
        assert_eq!(snapshot.preempted, 1);
        assert_eq!(snapshot.ipc_sync, 1);
        assert_eq!(snapshot.schedules, 3);
        assert_eq!(snapshot.epoch_start, 12);
    }
}
