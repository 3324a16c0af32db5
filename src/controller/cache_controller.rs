//! Cache Controller
//!
//! Decides which keys occupy which register rows and programs the switch
//! accordingly. Allocator, validity pool and key index sit behind a single
//! async mutex that is held across every RPC of an insert or flush, so cache
//! operations are applied one at a time in arrival order.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::{
    lane_register, ABSENT, CONTROLLER_MIRROR_SESSION, LOOKUP_ACTION, LOOKUP_TABLE, PRESENT,
    VALIDITY_REGISTER, VALUE_ACTION_PREFIX, VALUE_TABLE_PREFIX,
};
use crate::adapters::LoggingEventPublisher;
use crate::cache::{CacheSnapshot, CacheState, KeyMapEntry, Reservation};
use crate::config::CacheLayout;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{
    CompletionNotifier, EntryHandle, EventPublisher, InsertCompletion, SwitchControl,
};
use crate::error::{Error, Result};
use crate::metrics::CacheMetrics;
use crate::protocol::{display_key, Op, ProtocolMessage};

/// What a report caused.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Inserted(KeyMapEntry),
    Flushed(KeyMapEntry),
    /// The report's op is not acted upon
    Ignored,
}

/// Control plane of one switch cache.
pub struct CacheController {
    switch: Arc<dyn SwitchControl>,
    notifier: Option<Arc<dyn CompletionNotifier>>,
    events: Arc<dyn EventPublisher>,
    metrics: CacheMetrics,
    key_width: usize,
    cpu_port: Option<u32>,
    state: Mutex<CacheState>,
}

impl CacheController {
    pub fn new(
        layout: CacheLayout,
        key_width: usize,
        switch: Arc<dyn SwitchControl>,
    ) -> Result<Self> {
        layout.validate()?;
        Ok(Self {
            switch,
            notifier: None,
            events: Arc::new(LoggingEventPublisher::debug_level()),
            metrics: CacheMetrics::new()?,
            key_width,
            cpu_port: None,
            state: Mutex::new(CacheState::new(layout)),
        })
    }

    /// Signal the backend server after report-driven inserts.
    pub fn with_notifier(mut self, notifier: Arc<dyn CompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Mirror reports to this switch port during [`CacheController::setup`].
    pub fn with_cpu_port(mut self, cpu_port: Option<u32>) -> Self {
        self.cpu_port = cpu_port;
        self
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Prepare the switch: report mirroring and the per-lane value tables.
    ///
    /// Failure here leaves the switch unusable as a cache.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<()> {
        if let Some(port) = self.cpu_port {
            self.switch
                .enable_mirroring(CONTROLLER_MIRROR_SESSION, port)
                .await?;
            info!(
                "Mirroring session {} sends reports to port {}",
                CONTROLLER_MIRROR_SESSION, port
            );
        } else {
            warn!("No CPU port configured, report mirroring not enabled");
        }

        let lanes = self.state.lock().await.layout().lanes;
        let enabled = vec!["1".to_string()];
        for lane in 0..lanes {
            let table = format!("{}{}", VALUE_TABLE_PREFIX, lane);
            if self.switch.get_handle(&table, &enabled).await?.is_some() {
                debug!("Value table {} already populated", table);
                continue;
            }
            let action = format!("{}{}", VALUE_ACTION_PREFIX, lane);
            self.switch.add_entry(&table, &action, &enabled, &[]).await?;
        }

        info!("Switch setup complete ({} value tables)", lanes);
        Ok(())
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Install `key` with `value` in the switch cache.
    ///
    /// With `notify`, the backend server is told how the insert ended, also
    /// when it was refused.
    #[instrument(skip(self, value), fields(key = %display_key(key), len = value.len()))]
    pub async fn insert(&self, key: &[u8], value: &[u8], notify: bool) -> Result<KeyMapEntry> {
        let result = self.insert_locked(key, value).await;

        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                self.reject(key, "insert", &e).await;
                if notify {
                    self.notify_backend(InsertCompletion::Failed).await;
                }
                return Err(e);
            }
        };

        self.metrics.inserts.inc();
        self.publish(CacheEvent::key_inserted(&entry)).await;
        info!(
            "Cached key {} in rows {}..{} (validity id {})",
            display_key(key),
            entry.row,
            entry.row + entry.row_count,
            entry.validity_id
        );

        if notify {
            self.notify_backend(InsertCompletion::Inserted).await;
        }
        Ok(entry)
    }

    async fn insert_locked(&self, key: &[u8], value: &[u8]) -> Result<KeyMapEntry> {
        let match_key = self.match_key(key)?;

        let mut state = self.state.lock().await;
        let layout = *state.layout();
        let reservation = state.reserve(key, value.len())?;

        match self
            .program_entry(&layout, &match_key, value, &reservation)
            .await
        {
            Ok(handle) => {
                let entry = state.commit(Bytes::copy_from_slice(key), reservation, handle)?;
                self.metrics.observe(&state.snapshot());
                Ok(entry)
            }
            Err(e) => {
                state.abandon(&reservation);
                Err(e)
            }
        }
    }

    /// Write the value, install the lookup entry and mark the id present.
    async fn program_entry(
        &self,
        layout: &CacheLayout,
        match_key: &[String],
        value: &[u8],
        reservation: &Reservation,
    ) -> Result<EntryHandle> {
        let allocation = &reservation.allocation;
        for (i, row) in allocation.rows().enumerate() {
            for lane in 0..layout.lanes {
                let chunk = (i * layout.lanes as usize + lane as usize) * layout.slot_size;
                self.switch
                    .write_register(
                        &lane_register(lane),
                        row,
                        chunk_value(value, chunk, layout.slot_size),
                    )
                    .await?;
            }
        }

        let params = vec![
            allocation.bitmap.to_string(),
            allocation.row.to_string(),
            reservation.validity_id.to_string(),
        ];
        let handle = self
            .switch
            .add_entry(LOOKUP_TABLE, LOOKUP_ACTION, match_key, &params)
            .await?;

        if let Err(e) = self
            .switch
            .write_register(VALIDITY_REGISTER, reservation.validity_id, PRESENT)
            .await
        {
            if let Err(cleanup) = self.switch.delete_entry(LOOKUP_TABLE, handle).await {
                error!(
                    "Failed to remove lookup entry {} after aborted insert: {}",
                    handle, cleanup
                );
            }
            return Err(e);
        }

        Ok(handle)
    }

    async fn notify_backend(&self, completion: InsertCompletion) {
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify_insert(completion).await {
                warn!("Unable to signal {:?} insert to server: {}", completion, e);
            }
        }
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Remove `key` from the switch cache.
    #[instrument(skip(self), fields(key = %display_key(key)))]
    pub async fn flush(&self, key: &[u8]) -> Result<KeyMapEntry> {
        match self.flush_locked(key).await {
            Ok(entry) => {
                self.metrics.flushes.inc();
                self.publish(CacheEvent::key_flushed(&entry)).await;
                info!(
                    "Flushed key {} (validity id {} released)",
                    display_key(key),
                    entry.validity_id
                );
                Ok(entry)
            }
            Err(e) => {
                self.reject(key, "flush", &e).await;
                Err(e)
            }
        }
    }

    async fn flush_locked(&self, key: &[u8]) -> Result<KeyMapEntry> {
        let mut state = self.state.lock().await;
        let entry = state.lookup(key).cloned().ok_or_else(|| Error::NotFound {
            key: display_key(key),
        })?;

        // Invalidate before unlinking so the dataplane never serves stale rows
        self.switch
            .write_register(VALIDITY_REGISTER, entry.validity_id, ABSENT)
            .await?;

        let match_key = self.match_key(key)?;
        match self.switch.get_handle(LOOKUP_TABLE, &match_key).await? {
            Some(handle) => self.switch.delete_entry(LOOKUP_TABLE, handle).await?,
            None => warn!(
                "Lookup entry for {} already gone (recorded handle {})",
                display_key(key),
                entry.handle
            ),
        }

        let entry = state.evict(key)?;
        self.metrics.observe(&state.snapshot());
        Ok(entry)
    }

    // =========================================================================
    // Reports
    // =========================================================================

    /// Apply one report forwarded by the switch.
    pub async fn handle_report(&self, msg: &ProtocolMessage) -> Result<ReportOutcome> {
        self.metrics.record_report(&msg.op.to_string());

        match msg.op {
            Op::Write => {
                debug!("Write report for key {}", msg.key_str());
                self.insert(&msg.key, &msg.value, true)
                    .await
                    .map(ReportOutcome::Inserted)
            }
            Op::Flush => {
                debug!("Flush report for key {}", msg.key_str());
                self.flush(&msg.key).await.map(ReportOutcome::Flushed)
            }
            other => {
                warn!(
                    "Dropping report with unhandled op {} (key {})",
                    other,
                    msg.key_str()
                );
                self.publish(CacheEvent::report_dropped(other.code(), &msg.key))
                    .await;
                Ok(ReportOutcome::Ignored)
            }
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub async fn snapshot(&self) -> CacheSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn is_resident(&self, key: &[u8]) -> bool {
        self.state.lock().await.lookup(key).is_some()
    }

    pub async fn entry(&self, key: &[u8]) -> Option<KeyMapEntry> {
        self.state.lock().await.lookup(key).cloned()
    }

    /// Read a resident value back from the lane registers.
    ///
    /// Every cell of the value is read in parallel and reassembled in lane
    /// order.
    pub async fn read_cached(&self, key: &[u8]) -> Result<Bytes> {
        let state = self.state.lock().await;
        let layout = *state.layout();
        let entry = state.lookup(key).ok_or_else(|| Error::NotFound {
            key: display_key(key),
        })?;

        let mut cells = Vec::new();
        'rows: for (i, row) in entry.allocation().rows().enumerate() {
            for lane in 0..layout.lanes {
                let offset = (i * layout.lanes as usize + lane as usize) * layout.slot_size;
                if offset >= entry.value_len {
                    break 'rows;
                }
                let len = layout.slot_size.min(entry.value_len - offset);
                cells.push((lane_register(lane), row, len));
            }
        }

        let reads = cells
            .iter()
            .map(|(register, row, _)| self.switch.read_register(register, *row));
        let results = join_all(reads).await;

        let mut value = BytesMut::with_capacity(entry.value_len);
        for ((_, _, len), cell) in cells.iter().zip(results) {
            let bytes = cell?.to_be_bytes();
            value.extend_from_slice(&bytes[bytes.len() - len..]);
        }
        Ok(value.freeze())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Exact-match key of the lookup table: the key left-padded to the key
    /// width, as one hex literal.
    fn match_key(&self, key: &[u8]) -> Result<Vec<String>> {
        if key.is_empty() || key.len() > self.key_width {
            return Err(Error::Format(format!(
                "key of {} bytes does not fit key width {}",
                key.len(),
                self.key_width
            )));
        }
        let mut hex = String::with_capacity(2 + self.key_width * 2);
        hex.push_str("0x");
        for _ in key.len()..self.key_width {
            hex.push_str("00");
        }
        for byte in key {
            hex.push_str(&format!("{:02x}", byte));
        }
        Ok(vec![hex])
    }

    async fn reject(&self, key: &[u8], operation: &str, error: &Error) {
        warn!("{} of {} rejected: {}", operation, display_key(key), error);
        self.metrics.record_rejected(error);
        self.publish(CacheEvent::rejected(key, operation, error))
            .await;
    }

    async fn publish(&self, event: CacheEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish cache event: {}", e);
        }
    }
}

impl std::fmt::Debug for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheController")
            .field("key_width", &self.key_width)
            .field("cpu_port", &self.cpu_port)
            .field("notify", &self.notifier.is_some())
            .finish()
    }
}

/// Register value for the `slot_size` bytes of `value` starting at `offset`,
/// big-endian and left-padded. Chunks past the end of the value are 0.
fn chunk_value(value: &[u8], offset: usize, slot_size: usize) -> u64 {
    if offset >= value.len() {
        return 0;
    }
    let end = (offset + slot_size).min(value.len());
    value[offset..end]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
}
