//! Switch Cache State
//!
//! Bookkeeping for what the switch registers currently hold.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            CacheState                                 │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  SlotAllocator          │  ValidityPool        │  KeyIndex            │
//! │  ┌──────────────────┐   │  ┌───────────────┐   │  ┌────────────────┐  │
//! │  │ row 0: 11111111  │   │  │ free ids      │   │  │ key → row,     │  │
//! │  │ row 1: 00000000  │   │  │ (LIFO)        │   │  │  bitmap, id,   │  │
//! │  │ ...  (R rows)    │   │  │ [0, R)        │   │  │  handle        │  │
//! │  └──────────────────┘   │  └───────────────┘   │  └────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An insert is two-phase: [`CacheState::reserve`] takes rows and a validity id,
//! the controller programs the switch, then [`CacheState::commit`] records the
//! entry (or [`CacheState::abandon`] gives everything back). `CacheState` is not
//! synchronized; the controller owns it behind a single lock.

mod allocator;
mod index;
#[cfg(test)]
mod proptest;
mod validity;

pub use allocator::{Allocation, SlotAllocator};
pub use index::{KeyIndex, KeyMapEntry};
pub use validity::ValidityPool;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;

use crate::config::CacheLayout;
use crate::domain::ports::EntryHandle;
use crate::error::{Error, Result};
use crate::protocol::display_key;

/// Resources held for a key between `reserve` and `commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub allocation: Allocation,
    pub validity_id: u32,
    pub value_len: usize,
}

/// Point-in-time view of cache occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    pub resident_keys: usize,
    pub used_units: u64,
    pub capacity_units: u64,
    pub free_rows: usize,
    pub free_validity_ids: usize,
}

/// Allocator, validity pool and key index for one switch.
#[derive(Debug, Clone)]
pub struct CacheState {
    allocator: SlotAllocator,
    validity: ValidityPool,
    index: KeyIndex,
}

impl CacheState {
    pub fn new(layout: CacheLayout) -> Self {
        Self {
            allocator: SlotAllocator::new(layout),
            validity: ValidityPool::new(layout.rows),
            index: KeyIndex::new(),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        self.allocator.layout()
    }

    /// Take rows and a validity id for `key`.
    pub fn reserve(&mut self, key: &[u8], value_len: usize) -> Result<Reservation> {
        if self.index.contains(key) {
            return Err(Error::AlreadyExists {
                key: display_key(key),
            });
        }

        let allocation = self.allocator.allocate(value_len)?;
        let validity_id = match self.validity.acquire() {
            Ok(id) => id,
            Err(e) => {
                self.allocator.release_allocation(&allocation);
                return Err(e);
            }
        };

        Ok(Reservation {
            allocation,
            validity_id,
            value_len,
        })
    }

    /// Give back a reservation that will not be committed.
    pub fn abandon(&mut self, reservation: &Reservation) {
        self.allocator.release_allocation(&reservation.allocation);
        self.validity.release(reservation.validity_id);
    }

    /// Record the entry for a reservation whose switch state is programmed.
    pub fn commit(
        &mut self,
        key: Bytes,
        reservation: Reservation,
        handle: EntryHandle,
    ) -> Result<KeyMapEntry> {
        let entry = KeyMapEntry {
            key: key.clone(),
            row: reservation.allocation.row,
            row_count: reservation.allocation.row_count,
            bitmap: reservation.allocation.bitmap,
            validity_id: reservation.validity_id,
            handle,
            value_len: reservation.value_len,
            inserted_at: Utc::now(),
        };
        self.index.insert(key, entry.clone())?;
        Ok(entry)
    }

    /// Remove `key` and free its rows and validity id.
    pub fn evict(&mut self, key: &[u8]) -> Result<KeyMapEntry> {
        let entry = self.index.remove(key)?;
        self.allocator.release(entry.row, entry.row_count, entry.bitmap);
        self.validity.release(entry.validity_id);
        Ok(entry)
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&KeyMapEntry> {
        self.index.lookup(key)
    }

    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    pub fn validity(&self) -> &ValidityPool {
        &self.validity
    }

    pub fn index(&self) -> &KeyIndex {
        &self.index
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            resident_keys: self.index.len(),
            used_units: self.allocator.used_units(),
            capacity_units: self.allocator.capacity_units(),
            free_rows: self.allocator.free_rows(),
            free_validity_ids: self.validity.available(),
        }
    }

    /// Verify allocator/index/pool agreement. Returns the first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let granted: u64 = self.index.iter().map(KeyMapEntry::units).sum();
        if granted != self.allocator.used_units() {
            return Err(format!(
                "entries hold {} units, allocator reports {}",
                granted,
                self.allocator.used_units()
            ));
        }
        if self.allocator.counted_units() != self.allocator.used_units() {
            return Err("allocator bitmaps disagree with its unit counter".into());
        }

        let mut row_owner = vec![false; self.layout().rows as usize];
        let mut id_owner = vec![false; self.validity.capacity()];
        for entry in self.index.iter() {
            for row in entry.allocation().rows() {
                let slot = &mut row_owner[row as usize];
                if *slot {
                    return Err(format!("row {} owned twice", row));
                }
                *slot = true;
                if self.allocator.row_bitmap(row) != Some(entry.bitmap) {
                    return Err(format!("row {} bitmap does not match its entry", row));
                }
            }
            let id = &mut id_owner[entry.validity_id as usize];
            if *id {
                return Err(format!("validity id {} owned twice", entry.validity_id));
            }
            *id = true;
            if !self.validity.is_in_use(entry.validity_id) {
                return Err(format!("validity id {} not marked in use", entry.validity_id));
            }
        }

        let in_use = self.validity.capacity() - self.validity.available();
        if in_use != self.index.len() {
            return Err(format!(
                "{} validity ids in use for {} keys",
                in_use,
                self.index.len()
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
