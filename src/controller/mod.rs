//! Controller module
//!
//! Owns the switch cache state and reacts to reports forwarded by the switch.
//!
//! ```text
//!  switch ──mirrored report──▶ ReportListener ──▶ CacheController ──RPC──▶ switch
//!                                                       │
//!                                                       └──INSERT_OK──▶ backend server
//! ```

mod cache_controller;
mod listener;

pub use cache_controller::{CacheController, ReportOutcome};
pub use listener::{ReportFraming, ReportListener};

// =============================================================================
// Switch Program Names
// =============================================================================

/// Match-action table mapping keys to their cache location
pub const LOOKUP_TABLE: &str = "lookup_table";

/// Action of [`LOOKUP_TABLE`] taking `[bitmap, row, validity_id]`
pub const LOOKUP_ACTION: &str = "set_lookup_metadata";

/// Lane register arrays are named `vt0`, `vt1`, ...
pub const VTABLE_REGISTER_PREFIX: &str = "vt";

/// Per-lane value tables are named `vtable_0`, `vtable_1`, ...
pub const VALUE_TABLE_PREFIX: &str = "vtable_";

/// Action of each value table (`process_array_<lane>`)
pub const VALUE_ACTION_PREFIX: &str = "process_array_";

/// Register marking each validity id present or absent
pub const VALIDITY_REGISTER: &str = "cache_status";

/// Mirror session carrying reports to the controller
pub const CONTROLLER_MIRROR_SESSION: u32 = 100;

/// `cache_status` value of a resident key
pub const PRESENT: u64 = 1;

/// `cache_status` value of a free validity id
pub const ABSENT: u64 = 0;

/// Register array holding `lane`
pub fn lane_register(lane: u32) -> String {
    format!("{}{}", VTABLE_REGISTER_PREFIX, lane)
}
