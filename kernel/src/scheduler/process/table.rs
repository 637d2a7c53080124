//! Process table - fixed arena of PCB slots
//!
//! Slots are addressed by [`SlotId`]; processes outside the kernel are
//! addressed by [`Endpoint`], which also carries the slot generation so a
//! reused slot never answers to its previous occupant's endpoint.

use alloc::vec::Vec;

use gsched_abi::{Endpoint, SlotId};

use super::pcb::ProcessControlBlock;
use crate::scheduler::core::error::{SchedError, SchedResult};

pub struct ProcessTable {
    slots: Vec<ProcessControlBlock>,
}

impl ProcessTable {
    /// `capacity` free slots
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|nr| ProcessControlBlock::free(SlotId(nr as u16)))
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|pcb| !pcb.is_free()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First free slot. It still carries `SLOT_FREE`; the caller clears it
    /// once the PCB is set up.
    pub fn allocate(&mut self) -> SchedResult<SlotId> {
        self.slots
            .iter()
            .find(|pcb| pcb.is_free())
            .map(|pcb| pcb.nr)
            .ok_or(SchedError::TableFull { capacity: self.slots.len() })
    }

    /// Raw slot access, free or not
    pub fn slot(&self, slot: SlotId) -> Option<&ProcessControlBlock> {
        self.slots.get(slot.index())
    }

    pub fn slot_mut(&mut self, slot: SlotId) -> Option<&mut ProcessControlBlock> {
        self.slots.get_mut(slot.index())
    }

    /// Occupied slot
    pub fn get(&self, slot: SlotId) -> SchedResult<&ProcessControlBlock> {
        match self.slots.get(slot.index()) {
            Some(pcb) if !pcb.is_free() => Ok(pcb),
            _ => Err(SchedError::SlotFree { slot }),
        }
    }

    pub fn get_mut(&mut self, slot: SlotId) -> SchedResult<&mut ProcessControlBlock> {
        match self.slots.get_mut(slot.index()) {
            Some(pcb) if !pcb.is_free() => Ok(pcb),
            _ => Err(SchedError::SlotFree { slot }),
        }
    }

    /// Current occupant named by `endpoint`
    pub fn lookup(&self, endpoint: Endpoint) -> SchedResult<&ProcessControlBlock> {
        let pcb = self.get(endpoint.slot()).map_err(|_| SchedError::StaleEndpoint { endpoint })?;
        if pcb.generation != endpoint.generation() {
            return Err(SchedError::StaleEndpoint { endpoint });
        }
        Ok(pcb)
    }

    pub fn lookup_mut(&mut self, endpoint: Endpoint) -> SchedResult<&mut ProcessControlBlock> {
        let pcb = self
            .get_mut(endpoint.slot())
            .map_err(|_| SchedError::StaleEndpoint { endpoint })?;
        if pcb.generation != endpoint.generation() {
            return Err(SchedError::StaleEndpoint { endpoint });
        }
        Ok(pcb)
    }

    /// Resolve `endpoint` to its slot
    pub fn resolve(&self, endpoint: Endpoint) -> SchedResult<SlotId> {
        self.lookup(endpoint).map(|pcb| pcb.nr)
    }

    /// Every slot, free ones included
    pub fn iter(&self) -> impl Iterator<Item = &ProcessControlBlock> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessControlBlock> {
        self.slots.iter_mut()
    }

    /// Occupied slots only
    pub fn active(&self) -> impl Iterator<Item = &ProcessControlBlock> {
        self.slots.iter().filter(|pcb| !pcb.is_free())
    }
}
