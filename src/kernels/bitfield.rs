//! Read-only view over the phase-2 marked-entries bitfield.
//!
//! The bitfield is persisted as little-endian u64 words; bit `i` of the
//! field lives in word `i / 64` at bit `i % 64`. `bitvec`'s `Lsb0` ordering
//! over the raw words reproduces exactly that layout, so the view is
//! zero-copy over the buffer the I/O queue loaded.

use bitvec::prelude::*;

/// A borrowed marks bitfield. Bit `i` set means pre-prune entry `i` of the
/// r-table survives pruning.
pub struct MarksView<'a> {
    bits: &'a BitSlice<u64, Lsb0>,
}

impl<'a> MarksView<'a> {
    /// Wraps the loaded bitfield words. `entry_count` limits the view to the
    /// table's real entries; the file tail pads to a whole word.
    pub fn new(words: &'a [u64], entry_count: u64) -> Self {
        let bits = words.view_bits::<Lsb0>();
        debug_assert!(entry_count as usize <= bits.len());
        Self {
            bits: &bits[..entry_count as usize],
        }
    }

    /// Whether origin entry `index` is marked (survives pruning).
    #[inline]
    pub fn get(&self, index: u32) -> bool {
        self.bits[index as usize]
    }

    /// Number of marked entries; the pruning-conservation oracle.
    pub fn count_ones(&self) -> u64 {
        self.bits.count_ones() as u64
    }

    /// Number of entries covered by the view.
    pub fn len(&self) -> u64 {
        self.bits.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}
