//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the switch, the backend
//!   side channel and event sinks
//! - **Events** (`events.rs`) - Records of cache changes
//!
//! # Usage
//!
//! ```ignore
//! use netcache::domain::ports::SwitchControl;
//!
//! async fn mark_present<S: SwitchControl + ?Sized>(switch: &S, id: u32) -> Result<()> {
//!     switch.write_register("cache_status", id, 1).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::CacheEvent;
pub use ports::{CompletionNotifier, EntryHandle, EventPublisher, InsertCompletion, SwitchControl};
