//! Endpoint - generation-tagged process identity
//!
//! A slot index is reused when a process exits; the endpoint pairs it with
//! the slot's generation so that a stale identity never matches the new
//! occupant.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Number of bits holding the slot index inside an endpoint
pub const ENDPOINT_SLOT_BITS: u32 = 16;

/// Index into the process table (and the policy table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u16);

impl SlotId {
    /// Slot as a table index
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Generation-tagged process identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint(u32);

impl Endpoint {
    /// Build an endpoint from a slot and its current generation
    pub const fn new(slot: SlotId, generation: u16) -> Self {
        Self(((generation as u32) << ENDPOINT_SLOT_BITS) | slot.0 as u32)
    }

    /// Rebuild from the raw wire value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw wire value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Slot this endpoint lives in
    pub const fn slot(self) -> SlotId {
        SlotId(self.0 as u16)
    }

    /// Generation of the slot when the endpoint was issued
    pub const fn generation(self) -> u16 {
        (self.0 >> ENDPOINT_SLOT_BITS) as u16
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot().0, self.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parts() {
        let ep = Endpoint::new(SlotId(42), 7);
        assert_eq!(ep.slot(), SlotId(42));
        assert_eq!(ep.generation(), 7);
        assert_eq!(Endpoint::from_raw(ep.raw()), ep);
    }

    #[test]
    fn test_generation_distinguishes_reuse() {
        let old = Endpoint::new(SlotId(3), 1);
        let new = Endpoint::new(SlotId(3), 2);
        assert_eq!(old.slot(), new.slot());
        assert_ne!(old, new);
    }
}
