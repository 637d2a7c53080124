//! Ready queues - one FIFO per priority level
//!
//! Level 0 is the highest priority. Queues are intrusive: the set only keeps
//! head and tail slot indices, the links live in the PCBs (`next_ready`).
//! A PCB records the level it is queued at, so admission checks for
//! duplicates in O(1) and removal only walks one level.

use alloc::vec;
use alloc::vec::Vec;
use core::iter;

use gsched_abi::SlotId;
use log::trace;

use super::error::{SchedError, SchedResult};
use crate::scheduler::process::ProcessTable;

pub struct ReadyQueueSet {
    heads: Vec<Option<SlotId>>,
    tails: Vec<Option<SlotId>>,
}

impl ReadyQueueSet {
    pub fn new(levels: u8) -> Self {
        Self {
            heads: vec![None; levels as usize],
            tails: vec![None; levels as usize],
        }
    }

    pub fn levels(&self) -> u8 {
        self.heads.len() as u8
    }

    /// Append `slot` to the tail of the level of its current priority
    pub fn enqueue(&mut self, table: &mut ProcessTable, slot: SlotId, now: u64) -> SchedResult<()> {
        let levels = self.levels();
        let pcb = table.get_mut(slot)?;
        if !pcb.is_runnable() {
            return Err(SchedError::NotRunnable { slot });
        }
        if let Some(level) = pcb.queued_at {
            return Err(SchedError::AlreadyQueued { slot, level });
        }
        let level = pcb.priority;
        if level >= levels {
            return Err(SchedError::InvalidPriority { priority: level, lowest: levels - 1 });
        }
        pcb.next_ready = None;
        pcb.queued_at = Some(level);
        pcb.accounting.on_enqueue(now);

        let q = level as usize;
        match self.tails[q] {
            Some(tail) => {
                if let Some(last) = table.slot_mut(tail) {
                    last.next_ready = Some(slot);
                }
            }
            None => self.heads[q] = Some(slot),
        }
        self.tails[q] = Some(slot);
        trace!("enqueue {} at level {}", slot, level);
        Ok(())
    }

    /// Pop the head of the highest non-empty level; `None` means idle
    pub fn dequeue_head(&mut self, table: &mut ProcessTable, now: u64) -> Option<SlotId> {
        let level = self.highest_level()?;
        let q = level as usize;
        let slot = self.heads[q]?;
        let pcb = table.slot_mut(slot)?;
        self.heads[q] = pcb.next_ready.take();
        if self.heads[q].is_none() {
            self.tails[q] = None;
        }
        pcb.queued_at = None;
        pcb.accounting.on_dequeue(now);
        trace!("dequeue {} from level {}", slot, level);
        Some(slot)
    }

    /// Unlink `slot` from the middle of its level
    pub fn remove(&mut self, table: &mut ProcessTable, slot: SlotId, now: u64) -> SchedResult<()> {
        let level = table
            .slot(slot)
            .and_then(|pcb| pcb.queued_at)
            .ok_or(SchedError::NotQueued { slot })?;
        let q = level as usize;

        let mut prev = None;
        let mut cursor = self.heads.get(q).copied().flatten();
        while let Some(current) = cursor {
            if current == slot {
                break;
            }
            prev = Some(current);
            cursor = table.slot(current).and_then(|pcb| pcb.next_ready);
        }
        if cursor.is_none() {
            return Err(SchedError::InvariantViolation { slot, reason: "queued_at names a level without the slot" });
        }

        let next = match table.slot_mut(slot) {
            Some(pcb) => {
                pcb.queued_at = None;
                pcb.accounting.on_dequeue(now);
                pcb.next_ready.take()
            }
            None => None,
        };
        match prev {
            Some(prev) => {
                if let Some(pcb) = table.slot_mut(prev) {
                    pcb.next_ready = next;
                }
            }
            None => self.heads[q] = next,
        }
        if self.tails[q] == Some(slot) {
            self.tails[q] = prev;
        }
        trace!("remove {} from level {}", slot, level);
        Ok(())
    }

    pub fn head(&self, level: u8) -> Option<SlotId> {
        self.heads.get(level as usize).copied().flatten()
    }

    pub fn tail(&self, level: u8) -> Option<SlotId> {
        self.tails.get(level as usize).copied().flatten()
    }

    /// Highest (numerically smallest) non-empty level
    pub fn highest_level(&self) -> Option<u8> {
        self.heads.iter().position(Option::is_some).map(|level| level as u8)
    }

    /// Slots of one level, head first. Bounded by the table size so a
    /// corrupted link cannot loop forever.
    pub fn iter_level<'a>(&self, table: &'a ProcessTable, level: u8) -> impl Iterator<Item = SlotId> + 'a {
        iter::successors(self.head(level), move |slot| table.slot(*slot).and_then(|pcb| pcb.next_ready))
            .take(table.capacity() + 1)
    }

    pub fn len(&self, table: &ProcessTable, level: u8) -> usize {
        self.iter_level(table, level).count()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(Option::is_none)
    }
}
