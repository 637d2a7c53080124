//! Affinity - CPU affinity masks
//!
//! Controls which CPUs a process may be placed on (64 CPUs max)

use serde::{Deserialize, Serialize};

/// Width of the affinity mask
pub const MAX_MASK_CPUS: usize = 64;

/// CPU affinity mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Create empty mask
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create mask allowing all CPUs
    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    /// Create mask allowing the first `count` CPUs
    pub const fn first(count: usize) -> Self {
        if count >= MAX_MASK_CPUS {
            Self::all()
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// Create mask for single CPU
    pub const fn single(cpu: usize) -> Self {
        Self(1 << (cpu & 63))
    }

    /// Raw bits
    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Set CPU bit
    pub fn set(&mut self, cpu: usize) {
        self.0 |= 1 << (cpu & 63);
    }

    /// Clear CPU bit
    pub fn clear(&mut self, cpu: usize) {
        self.0 &= !(1 << (cpu & 63));
    }

    /// Check if CPU is set
    pub const fn is_set(&self, cpu: usize) -> bool {
        (self.0 & (1 << (cpu & 63))) != 0
    }

    /// Count set CPUs
    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Check if empty
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Intersect with another mask
    pub const fn intersect(&self, other: &Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Set CPUs in ascending order
    pub fn cpus(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..MAX_MASK_CPUS).filter(move |cpu| bits & (1 << cpu) != 0)
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_mask() {
        assert_eq!(CpuMask::first(0), CpuMask::empty());
        assert_eq!(CpuMask::first(3).bits(), 0b111);
        assert_eq!(CpuMask::first(64), CpuMask::all());
    }

    #[test]
    fn test_cpus_iteration() {
        let mut mask = CpuMask::empty();
        mask.set(5);
        mask.set(1);
        mask.set(63);
        let cpus: Vec<usize> = mask.cpus().collect();
        assert_eq!(cpus, vec![1, 5, 63]);
        mask.clear(5);
        assert!(!mask.is_set(5));
        assert_eq!(mask.count(), 2);
    }
}
