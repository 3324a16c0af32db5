//! First-Fit Slot Allocator
//!
//! Hands out whole rows of the lane register arrays. A value of `size` bytes
//! needs `ceil(size / (slot_size × lanes))` consecutive rows; the first run of
//! free rows (lowest index) wins.

use std::ops::Range;

use crate::config::CacheLayout;
use crate::error::{Error, Result};

/// Rows granted to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// First row of the run
    pub row: u32,
    /// Number of consecutive rows
    pub row_count: u32,
    /// Lanes occupied in every row of the run
    pub bitmap: u64,
}

impl Allocation {
    /// Row indices covered by this allocation
    pub fn rows(&self) -> Range<u32> {
        self.row..self.row + self.row_count
    }

    /// Storage units granted
    pub fn units(&self) -> u64 {
        self.bitmap.count_ones() as u64 * self.row_count as u64
    }
}

/// Occupancy bitmap per row plus exact unit accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAllocator {
    layout: CacheLayout,
    rows: Vec<u64>,
    used_units: u64,
}

impl SlotAllocator {
    pub fn new(layout: CacheLayout) -> Self {
        Self {
            layout,
            rows: vec![0; layout.rows as usize],
            used_units: 0,
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Rows needed to hold `size` bytes
    pub fn rows_needed(&self, size: usize) -> usize {
        size.div_ceil(self.layout.row_bytes())
    }

    /// Allocate enough whole rows for `size` bytes.
    ///
    /// Never allocates partially: on `Exhausted` the pool is untouched.
    pub fn allocate(&mut self, size: usize) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::InvalidSize { size });
        }

        let needed = self.rows_needed(size);
        let start = self
            .find_free_run(needed)
            .ok_or_else(|| Error::exhausted(format!("{} free consecutive rows", needed)))?;

        let bitmap = self.layout.full_bitmap();
        for row in &mut self.rows[start..start + needed] {
            *row = bitmap;
        }
        let allocation = Allocation {
            row: start as u32,
            row_count: needed as u32,
            bitmap,
        };
        self.used_units += allocation.units();
        Ok(allocation)
    }

    /// Clear `bitmap` in rows `[row, row + row_count)`.
    ///
    /// Bits that are already clear and rows outside the pool are ignored.
    pub fn release(&mut self, row: u32, row_count: u32, bitmap: u64) {
        let start = (row as usize).min(self.rows.len());
        let end = (row as usize + row_count as usize).min(self.rows.len());
        for occupancy in &mut self.rows[start..end] {
            let cleared = *occupancy & bitmap;
            *occupancy &= !bitmap;
            self.used_units -= cleared.count_ones() as u64;
        }
    }

    /// Release a previously granted allocation
    pub fn release_allocation(&mut self, allocation: &Allocation) {
        self.release(allocation.row, allocation.row_count, allocation.bitmap);
    }

    fn find_free_run(&self, needed: usize) -> Option<usize> {
        if needed == 0 || needed > self.rows.len() {
            return None;
        }
        let mut run = 0;
        for (idx, &occupancy) in self.rows.iter().enumerate() {
            if occupancy == 0 {
                run += 1;
                if run == needed {
                    return Some(idx + 1 - needed);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Occupancy bitmap of a row
    pub fn row_bitmap(&self, row: u32) -> Option<u64> {
        self.rows.get(row as usize).copied()
    }

    pub fn is_row_free(&self, row: u32) -> bool {
        self.row_bitmap(row) == Some(0)
    }

    pub fn used_units(&self) -> u64 {
        self.used_units
    }

    pub fn capacity_units(&self) -> u64 {
        self.layout.capacity_units()
    }

    pub fn free_rows(&self) -> usize {
        self.rows.iter().filter(|&&occupancy| occupancy == 0).count()
    }

    /// Sum of set bits over every row, recomputed from the bitmaps
    pub fn counted_units(&self) -> u64 {
        self.rows.iter().map(|r| r.count_ones() as u64).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn small() -> SlotAllocator {
        SlotAllocator::new(CacheLayout::new(8, 2, 4))
    }

    #[test]
    fn test_first_fit_reuses_released_row() {
        let mut alloc = small();

        let a = alloc.allocate(16).unwrap();
        assert_eq!((a.row, a.row_count, a.bitmap), (0, 1, 0b11));

        let b = alloc.allocate(16).unwrap();
        assert_eq!(b.row, 1);

        alloc.release(0, 1, 0b11);
        let c = alloc.allocate(16).unwrap();
        assert_eq!(c.row, 0);
    }

    #[test]
    fn test_rows_needed_rounds_up() {
        let alloc = small();
        assert_eq!(alloc.rows_needed(1), 1);
        assert_eq!(alloc.rows_needed(16), 1);
        assert_eq!(alloc.rows_needed(17), 2);
        assert_eq!(alloc.rows_needed(64), 4);
    }

    #[test]
    fn test_multi_row_run_skips_fragment() {
        let mut alloc = small();
        let first = alloc.allocate(16).unwrap();
        let _second = alloc.allocate(16).unwrap();
        alloc.release_allocation(&first);

        // Row 0 is free but too short a run for 2 rows
        let wide = alloc.allocate(32).unwrap();
        assert_eq!(wide.rows(), 2..4);
        assert_eq!(wide.units(), 4);
        assert!(alloc.is_row_free(0));
    }

    #[test]
    fn test_zero_size_is_invalid() {
        assert_matches!(small().allocate(0), Err(Error::InvalidSize { size: 0 }));
    }

    #[test]
    fn test_oversize_is_exhausted_without_side_effects() {
        let mut alloc = small();
        let before = alloc.clone();
        assert_matches!(alloc.allocate(65), Err(Error::Exhausted { .. }));
        assert_eq!(alloc, before);
    }

    #[test]
    fn test_exhaustion_when_full() {
        let mut alloc = small();
        alloc.allocate(64).unwrap();
        assert_eq!(alloc.free_rows(), 0);
        assert_eq!(alloc.used_units(), alloc.capacity_units());
        assert_matches!(alloc.allocate(1), Err(Error::Exhausted { .. }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut alloc = small();
        let a = alloc.allocate(16).unwrap();
        alloc.release_allocation(&a);
        alloc.release_allocation(&a);
        alloc.release(3, 10, u64::MAX);
        assert_eq!(alloc.used_units(), 0);
        assert_eq!(alloc.counted_units(), 0);
        assert_eq!(alloc.free_rows(), 4);
    }

    #[test]
    fn test_partial_bitmap_release() {
        let mut alloc = small();
        let a = alloc.allocate(16).unwrap();
        alloc.release(a.row, 1, 0b01);
        assert_eq!(alloc.row_bitmap(0), Some(0b10));
        assert_eq!(alloc.used_units(), 1);
        assert!(!alloc.is_row_free(0));
    }
}
