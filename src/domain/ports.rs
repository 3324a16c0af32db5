//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions the controller depends on. Infrastructure adapters in
//! [`crate::adapters`] implement them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  SwitchControl │ CompletionNotifier │ EventPublisher │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  SwitchCli │ SimulatedSwitch │ RetryingSwitch        │    │
//! │  │  UnixNotifier │ LoggingEventPublisher                │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;

use super::events::CacheEvent;
use crate::config::{CACHE_INSERT_COMPLETE, CACHE_INSERT_FAILED};
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Handle of a match-action table entry, assigned by the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryHandle(pub u64);

impl std::fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Switch Control Port
// =============================================================================

/// Control surface of one programmable switch.
///
/// Every call is a synchronous RPC to the switch agent. Implementations report
/// agent or transport failures as [`crate::Error::Rpc`].
///
/// # Example
///
/// ```ignore
/// let handle = switch
///     .add_entry("lookup_table", "set_lookup_metadata", &["0x6b6579".into()], &params)
///     .await?;
/// switch.write_register("cache_status", 7, 1).await?;
/// ```
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Install an entry in a match-action table.
    async fn add_entry(
        &self,
        table: &str,
        action: &str,
        match_key: &[String],
        action_params: &[String],
    ) -> Result<EntryHandle>;

    /// Remove an entry by handle.
    async fn delete_entry(&self, table: &str, handle: EntryHandle) -> Result<()>;

    /// Resolve the handle of the entry matching `match_key`, if any.
    async fn get_handle(&self, table: &str, match_key: &[String]) -> Result<Option<EntryHandle>>;

    /// Write one cell of a register array.
    async fn write_register(&self, register: &str, index: u32, value: u64) -> Result<()>;

    /// Read one cell of a register array.
    async fn read_register(&self, register: &str, index: u32) -> Result<u64>;

    /// Mirror packets of `session_id` to `port`.
    async fn enable_mirroring(&self, session_id: u32, port: u32) -> Result<()>;
}

// =============================================================================
// Out-of-band Notification Port
// =============================================================================

/// How a report-driven insert ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertCompletion {
    /// The key is live in the switch
    Inserted,
    /// The insert was refused or failed; the key is not cached
    Failed,
}

impl InsertCompletion {
    /// Out-of-band token carrying this outcome.
    pub fn token(self) -> &'static [u8] {
        match self {
            InsertCompletion::Inserted => CACHE_INSERT_COMPLETE,
            InsertCompletion::Failed => CACHE_INSERT_FAILED,
        }
    }

    /// Outcome carried by `token`, ignoring surrounding whitespace.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token.trim_ascii() {
            t if t == CACHE_INSERT_COMPLETE => Some(InsertCompletion::Inserted),
            t if t == CACHE_INSERT_FAILED => Some(InsertCompletion::Failed),
            _ => None,
        }
    }
}

/// Side channel from the controller to the backend server.
///
/// Every report-driven insert is answered, successful or not, so the server
/// never waits out its completion timeout on a refused insert.
#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    /// Signal that a cache insert ended with `completion`.
    async fn notify_insert(&self, completion: InsertCompletion) -> Result<()>;
}

// =============================================================================
// Event Publishing Port
// =============================================================================

/// Port for publishing cache events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: CacheEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
