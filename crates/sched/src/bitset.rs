//! Fixed-size bitsets backing the CU and slot tables.

use bitvec::prelude::*;

use kds_core::{MASK_BITS, MAX_CUS};

/// Bitset of a fixed length, stored as little-endian 32-bit words so a
/// request mask can be intersected word by word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitset {
    bits: BitVec<u32, Lsb0>,
}

impl Bitset {
    pub fn new(len: usize) -> Self {
        Self {
            bits: bitvec![u32, Lsb0; 0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Set bit `idx`. Out-of-range indices are ignored.
    pub fn set(&mut self, idx: usize) {
        if idx < self.bits.len() {
            self.bits.set(idx, true);
        }
    }

    pub fn clear(&mut self, idx: usize) {
        if idx < self.bits.len() {
            self.bits.set(idx, false);
        }
    }

    pub fn test(&self, idx: usize) -> bool {
        self.bits.get(idx).map(|b| *b).unwrap_or(false)
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    /// Lowest set index.
    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    /// Lowest clear index.
    pub fn first_free(&self) -> Option<usize> {
        self.bits.first_zero()
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    /// Word `w` of the set; bits past the end read as zero.
    pub fn word(&self, w: usize) -> u32 {
        let start = w * MASK_BITS;
        if start >= self.bits.len() {
            return 0;
        }
        let end = (start + MASK_BITS).min(self.bits.len());
        self.bits[start..end].load_le::<u32>()
    }
}

/// Validity, occupancy and initialization state of every CU and slot.
#[derive(Debug, Clone)]
pub struct ResourceTable {
    pub cu_valid: Bitset,
    pub cu_busy: Bitset,
    pub cu_init: Bitset,
    pub slots: Bitset,
    pub scu_busy: Bitset,
}

impl ResourceTable {
    pub fn new(num_cus: usize, num_slots: usize) -> Self {
        Self {
            cu_valid: Bitset::new(num_cus),
            cu_busy: Bitset::new(num_cus),
            cu_init: Bitset::new(num_cus),
            slots: Bitset::new(num_slots),
            scu_busy: Bitset::new(MAX_CUS),
        }
    }

    pub fn free_slots(&self) -> usize {
        self.slots.len() - self.slots.count()
    }
}
