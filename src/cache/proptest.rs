//! Property-Based Tests for Cache State
//!
//! # Test Properties
//!
//! 1. **Disjointness**: after any insert/flush sequence no two keys share a row
//!    or a validity id, and granted units match the allocator's accounting
//! 2. **Roundtrip**: insert then flush restores allocator and pool exactly
//! 3. **No partial allocation**: oversize requests leave the pool untouched

#![cfg(test)]

use bytes::Bytes;
use proptest::prelude::*;

use super::CacheState;
use crate::config::CacheLayout;
use crate::domain::ports::EntryHandle;
use crate::error::Error;

#[derive(Debug, Clone)]
enum Step {
    Insert { key: u8, size: usize },
    Flush { key: u8 },
}

fn layout_strategy() -> impl Strategy<Value = CacheLayout> {
    (1usize..=8, 1u32..=8, 1u32..=32).prop_map(|(slot, lanes, rows)| {
        CacheLayout::new(slot, lanes, rows)
    })
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0u8..16, 0usize..400).prop_map(|(key, size)| Step::Insert { key, size }),
        2 => (0u8..16).prop_map(|key| Step::Flush { key }),
    ]
}

fn key_bytes(key: u8) -> Bytes {
    Bytes::from(format!("key-{}", key))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: invariants hold after every step of an arbitrary sequence.
    #[test]
    fn prop_allocation_stays_disjoint(
        layout in layout_strategy(),
        steps in prop::collection::vec(step_strategy(), 1..60),
    ) {
        let mut state = CacheState::new(layout);

        for step in steps {
            match step {
                Step::Insert { key, size } => {
                    let key = key_bytes(key);
                    let resident = state.lookup(&key).is_some();
                    match state.reserve(&key, size) {
                        Ok(reservation) => {
                            prop_assert!(!resident);
                            state.commit(key, reservation, EntryHandle(0))?;
                        }
                        Err(Error::AlreadyExists { .. }) => prop_assert!(resident),
                        Err(Error::InvalidSize { .. }) => prop_assert_eq!(size, 0),
                        Err(Error::Exhausted { .. }) => {}
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                }
                Step::Flush { key } => {
                    let key = key_bytes(key);
                    let resident = state.lookup(&key).is_some();
                    prop_assert_eq!(state.evict(&key).is_ok(), resident);
                }
            }
            if let Err(violation) = state.check_invariants() {
                prop_assert!(false, "{}", violation);
            }
        }
    }

    /// Property: insert immediately followed by flush is a no-op on resources.
    #[test]
    fn prop_insert_flush_roundtrip(
        layout in layout_strategy(),
        prefill in prop::collection::vec(1usize..200, 0..8),
        size in 1usize..200,
    ) {
        let mut state = CacheState::new(layout);
        for (i, len) in prefill.into_iter().enumerate() {
            if let Ok(r) = state.reserve(format!("pre-{}", i).as_bytes(), len) {
                state.commit(Bytes::from(format!("pre-{}", i)), r, EntryHandle(0))?;
            }
        }

        let allocator_before = state.allocator().clone();
        let validity_before = state.validity().clone();

        if let Ok(r) = state.reserve(b"spare", size) {
            state.commit(Bytes::from_static(b"spare"), r, EntryHandle(0))?;
            state.evict(b"spare")?;
        }

        prop_assert_eq!(state.allocator(), &allocator_before);
        prop_assert_eq!(state.validity(), &validity_before);
    }

    /// Property: a request larger than the whole pool is always Exhausted.
    #[test]
    fn prop_oversize_never_partially_allocates(
        layout in layout_strategy(),
        extra in 1usize..1000,
    ) {
        let mut state = CacheState::new(layout);
        let capacity_bytes = layout.capacity_units() as usize * layout.slot_size;
        let before = state.snapshot();

        let result = state.reserve(b"huge", capacity_bytes + extra);
        prop_assert!(matches!(result, Err(Error::Exhausted { .. })), "expected Exhausted, got {:?}", result);
        prop_assert_eq!(state.snapshot(), before);
    }
}
