//! Validity id pool.
//!
//! Each resident key owns one id in `[0, capacity)`, which addresses its
//! present/absent flag (and hit counter) on the switch.

use crate::error::{Error, Result};

/// LIFO pool of free validity ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityPool {
    free: Vec<u32>,
    in_use: Vec<bool>,
}

impl ValidityPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            free: (0..capacity).collect(),
            in_use: vec![false; capacity as usize],
        }
    }

    /// Take the most recently freed id (highest id on a fresh pool).
    pub fn acquire(&mut self) -> Result<u32> {
        let id = self
            .free
            .pop()
            .ok_or_else(|| Error::exhausted("validity ids"))?;
        self.in_use[id as usize] = true;
        Ok(id)
    }

    /// Return an id to the pool. Returns false if it was not in use.
    pub fn release(&mut self, id: u32) -> bool {
        match self.in_use.get_mut(id as usize) {
            Some(flag) if *flag => {
                *flag = false;
                self.free.push(id);
                true
            }
            _ => false,
        }
    }

    pub fn is_in_use(&self, id: u32) -> bool {
        self.in_use.get(id as usize).copied().unwrap_or(false)
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.in_use.len()
    }
}
