//! Cache Events
//!
//! Immutable records of changes to the switch cache, used for audit logging
//! and for observing the controller in tests.
//!
//! # Example
//!
//! ```ignore
//! let event = CacheEvent::key_flushed(&entry);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::KeyMapEntry;
use crate::protocol::display_key;

/// Something that happened to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CacheEvent {
    /// A key was installed in the switch.
    KeyInserted {
        key: String,
        row: u32,
        row_count: u32,
        validity_id: u32,
        value_len: usize,
        timestamp: DateTime<Utc>,
    },

    /// A key was removed from the switch.
    KeyFlushed {
        key: String,
        row: u32,
        row_count: u32,
        validity_id: u32,
        timestamp: DateTime<Utc>,
    },

    /// An insert or flush was refused.
    OperationRejected {
        key: String,
        operation: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A report carried an op the controller does not act on.
    ReportDropped {
        op: u8,
        key: String,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    pub fn key_inserted(entry: &KeyMapEntry) -> Self {
        CacheEvent::KeyInserted {
            key: display_key(&entry.key),
            row: entry.row,
            row_count: entry.row_count,
            validity_id: entry.validity_id,
            value_len: entry.value_len,
            timestamp: Utc::now(),
        }
    }

    pub fn key_flushed(entry: &KeyMapEntry) -> Self {
        CacheEvent::KeyFlushed {
            key: display_key(&entry.key),
            row: entry.row,
            row_count: entry.row_count,
            validity_id: entry.validity_id,
            timestamp: Utc::now(),
        }
    }

    pub fn rejected(key: &[u8], operation: &str, reason: &crate::error::Error) -> Self {
        CacheEvent::OperationRejected {
            key: display_key(key),
            operation: operation.to_string(),
            reason: reason.kind().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn report_dropped(op: u8, key: &[u8]) -> Self {
        CacheEvent::ReportDropped {
            op,
            key: display_key(key),
            timestamp: Utc::now(),
        }
    }

    /// Event type name, matching the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::KeyInserted { .. } => "KeyInserted",
            CacheEvent::KeyFlushed { .. } => "KeyFlushed",
            CacheEvent::OperationRejected { .. } => "OperationRejected",
            CacheEvent::ReportDropped { .. } => "ReportDropped",
        }
    }

    /// Key the event is about
    pub fn key(&self) -> &str {
        match self {
            CacheEvent::KeyInserted { key, .. }
            | CacheEvent::KeyFlushed { key, .. }
            | CacheEvent::OperationRejected { key, .. }
            | CacheEvent::ReportDropped { key, .. } => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_serialized_tag_matches_event_type() {
        let event = CacheEvent::rejected(b"abc", "insert", &Error::exhausted("rows"));
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"type\":\"OperationRejected\""));
        assert!(json.contains("\"reason\":\"exhausted\""));
        assert_eq!(event.event_type(), "OperationRejected");
        assert_eq!(event.key(), "abc");

        let back: CacheEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
