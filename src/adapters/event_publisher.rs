//! Event Publisher Adapters
//!
//! `EventPublisher` backends: one writing cache events to the tracing
//! system, one keeping them in memory for inspection.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::events::CacheEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Writes cache events to the tracing system as structured fields.
///
/// Rejected operations are always logged as warnings; every other event is
/// logged at the configured level.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    verbose: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log inserts, flushes and dropped reports at info level.
    pub fn info_level() -> Self {
        Self { verbose: true }
    }

    /// Log inserts, flushes and dropped reports at debug level.
    pub fn debug_level() -> Self {
        Self { verbose: false }
    }

    fn emit(&self, event: &CacheEvent) {
        macro_rules! at_level {
            ($($field:tt)*) => {
                if self.verbose {
                    info!($($field)*);
                } else {
                    debug!($($field)*);
                }
            };
        }

        match event {
            CacheEvent::KeyInserted {
                key,
                row,
                row_count,
                validity_id,
                value_len,
                ..
            } => at_level!(
                key = %key,
                row,
                row_count,
                validity_id,
                value_len,
                "Cache event: key inserted"
            ),
            CacheEvent::KeyFlushed {
                key,
                row,
                row_count,
                validity_id,
                ..
            } => at_level!(
                key = %key,
                row,
                row_count,
                validity_id,
                "Cache event: key flushed"
            ),
            CacheEvent::ReportDropped { op, key, .. } => {
                at_level!(op, key = %key, "Cache event: report dropped")
            }
            CacheEvent::OperationRejected {
                key,
                operation,
                reason,
                ..
            } => warn!(
                key = %key,
                operation = %operation,
                reason = %reason,
                "Cache event: operation rejected"
            ),
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: CacheEvent) -> Result<()> {
        self.emit(&event);
        Ok(())
    }
}

/// Keeps published events in memory, oldest first.
///
/// With a limit, the oldest events are dropped once it is reached.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<VecDeque<CacheEvent>>,
    limit: Option<usize>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain at most `limit` events.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::with_capacity(limit)),
            limit: Some(limit),
        }
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose type name is `event_type` (e.g. `"KeyFlushed"`).
    pub fn events_of_type(&self, event_type: &str) -> Vec<CacheEvent> {
        self.filtered(|e| e.event_type() == event_type)
    }

    /// Events about the key displayed as `key`.
    pub fn events_for_key(&self, key: &str) -> Vec<CacheEvent> {
        self.filtered(|e| e.key() == key)
    }

    fn filtered(&self, keep: impl Fn(&CacheEvent) -> bool) -> Vec<CacheEvent> {
        self.events.read().iter().filter(|e| keep(e)).cloned().collect()
    }

    fn push(&self, events: impl IntoIterator<Item = CacheEvent>) {
        let mut stored = self.events.write();
        stored.extend(events);
        if let Some(limit) = self.limit {
            let excess = stored.len().saturating_sub(limit);
            stored.drain(..excess);
        }
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: CacheEvent) -> Result<()> {
        self.push([event]);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<CacheEvent>) -> Result<()> {
        self.push(events);
        Ok(())
    }
}
