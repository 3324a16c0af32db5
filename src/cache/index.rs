//! Key → slot index.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::allocator::Allocation;
use crate::domain::ports::EntryHandle;
use crate::error::{Error, Result};
use crate::protocol::display_key;

/// Where one resident key lives on the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapEntry {
    pub key: Bytes,
    /// First row of the value
    pub row: u32,
    /// Rows spanned by the value
    pub row_count: u32,
    /// Lanes used in each row
    pub bitmap: u64,
    /// Id of the validity register / hit counter
    pub validity_id: u32,
    /// Handle of the lookup-table entry installed for the key
    pub handle: EntryHandle,
    /// Value length in bytes
    pub value_len: usize,
    pub inserted_at: DateTime<Utc>,
}

impl KeyMapEntry {
    pub fn allocation(&self) -> Allocation {
        Allocation {
            row: self.row,
            row_count: self.row_count,
            bitmap: self.bitmap,
        }
    }

    /// Storage units held by this entry
    pub fn units(&self) -> u64 {
        self.allocation().units()
    }
}

/// Resident keys, keyed by raw key bytes.
#[derive(Debug, Default, Clone)]
pub struct KeyIndex {
    entries: HashMap<Bytes, KeyMapEntry>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: Bytes, entry: KeyMapEntry) -> Result<()> {
        if self.entries.contains_key(&key) {
            return Err(Error::AlreadyExists {
                key: display_key(&key),
            });
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&KeyMapEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<KeyMapEntry> {
        self.entries.remove(key).ok_or_else(|| Error::NotFound {
            key: display_key(key),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyMapEntry> {
        self.entries.values()
    }
}
