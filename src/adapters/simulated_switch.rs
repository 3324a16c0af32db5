//! Simulated Switch
//!
//! In-memory model of the switch control surface: match-action tables,
//! register arrays and mirroring sessions. Used by tests and by the controller's
//! `--switch simulate` mode. Faults can be injected to exercise retry and rollback.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::ports::{EntryHandle, SwitchControl};
use crate::error::{Error, Result};

/// One installed table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub action: String,
    pub match_key: Vec<String>,
    pub action_params: Vec<String>,
}

#[derive(Debug, Default)]
struct SwitchModel {
    tables: HashMap<String, BTreeMap<EntryHandle, TableEntry>>,
    registers: HashMap<String, HashMap<u32, u64>>,
    mirroring: HashMap<u32, u32>,
    next_handle: u64,
    /// Calls that will fail before the switch recovers
    pending_failures: u32,
    /// Fail only calls of this operation (any operation if `None`)
    failing_operation: Option<String>,
    /// Fail only calls on this table or register (any if `None`)
    failing_target: Option<String>,
    /// Calls of `lossy_operation` that take effect but report a failure
    lost_replies: u32,
    lossy_operation: Option<String>,
    calls: Vec<String>,
}

impl SwitchModel {
    fn enter(&mut self, operation: &str, target: &str) -> Result<()> {
        self.calls.push(operation.to_string());
        let targeted = self
            .failing_operation
            .as_deref()
            .map_or(true, |op| op == operation)
            && self.failing_target.as_deref().map_or(true, |t| t == target);
        if targeted && self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(Error::rpc(operation, "injected fault"));
        }
        Ok(())
    }

    /// Called once `operation` took effect.
    fn leave(&mut self, operation: &str) -> Result<()> {
        if self.lost_replies > 0 && self.lossy_operation.as_deref() == Some(operation) {
            self.lost_replies -= 1;
            return Err(Error::rpc(operation, "injected lost reply"));
        }
        Ok(())
    }
}

/// In-memory switch.
#[derive(Debug, Default)]
pub struct SimulatedSwitch {
    model: Mutex<SwitchModel>,
}

impl SimulatedSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with an RPC error.
    pub fn fail_next(&self, count: u32) {
        let mut model = self.model.lock();
        model.pending_failures = count;
        model.failing_operation = None;
        model.failing_target = None;
    }

    /// Make the next `count` calls of `operation` fail with an RPC error.
    pub fn fail_next_of(&self, operation: &str, count: u32) {
        let mut model = self.model.lock();
        model.pending_failures = count;
        model.failing_operation = Some(operation.to_string());
        model.failing_target = None;
    }

    /// Make the next `count` calls touching `target` (a table or register)
    /// fail with an RPC error.
    pub fn fail_next_on(&self, target: &str, count: u32) {
        let mut model = self.model.lock();
        model.pending_failures = count;
        model.failing_operation = None;
        model.failing_target = Some(target.to_string());
    }

    /// Apply the next `count` calls of `operation` but report them as failed,
    /// as when the agent's reply is lost.
    pub fn lose_next_replies(&self, operation: &str, count: u32) {
        let mut model = self.model.lock();
        model.lost_replies = count;
        model.lossy_operation = Some(operation.to_string());
    }

    /// Current value of a register cell (0 if never written).
    pub fn register(&self, register: &str, index: u32) -> u64 {
        self.model
            .lock()
            .registers
            .get(register)
            .and_then(|cells| cells.get(&index))
            .copied()
            .unwrap_or(0)
    }

    /// Entries of a table in handle order.
    pub fn entries(&self, table: &str) -> Vec<TableEntry> {
        self.model
            .lock()
            .tables
            .get(table)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Port a mirroring session points at.
    pub fn mirroring_port(&self, session_id: u32) -> Option<u32> {
        self.model.lock().mirroring.get(&session_id).copied()
    }

    /// Number of calls made for an operation, failed ones included.
    pub fn call_count(&self, operation: &str) -> usize {
        self.model
            .lock()
            .calls
            .iter()
            .filter(|c| c.as_str() == operation)
            .count()
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.model.lock().calls.clone()
    }
}

#[async_trait]
impl SwitchControl for SimulatedSwitch {
    async fn add_entry(
        &self,
        table: &str,
        action: &str,
        match_key: &[String],
        action_params: &[String],
    ) -> Result<EntryHandle> {
        let mut model = self.model.lock();
        model.enter("add_entry", table)?;

        let duplicate = model
            .tables
            .get(table)
            .is_some_and(|entries| entries.values().any(|e| e.match_key == match_key));
        if duplicate {
            return Err(Error::rpc(
                "add_entry",
                format!("duplicate match key {:?} in {}", match_key, table),
            ));
        }

        let handle = EntryHandle(model.next_handle);
        model.next_handle += 1;
        model.tables.entry(table.to_string()).or_default().insert(
            handle,
            TableEntry {
                action: action.to_string(),
                match_key: match_key.to_vec(),
                action_params: action_params.to_vec(),
            },
        );
        model.leave("add_entry")?;
        Ok(handle)
    }

    async fn delete_entry(&self, table: &str, handle: EntryHandle) -> Result<()> {
        let mut model = self.model.lock();
        model.enter("delete_entry", table)?;
        model
            .tables
            .get_mut(table)
            .and_then(|entries| entries.remove(&handle))
            .map(|_| ())
            .ok_or_else(|| Error::rpc("delete_entry", format!("invalid handle {}", handle)))
    }

    async fn get_handle(&self, table: &str, match_key: &[String]) -> Result<Option<EntryHandle>> {
        let mut model = self.model.lock();
        model.enter("get_handle", table)?;
        Ok(model.tables.get(table).and_then(|entries| {
            entries
                .iter()
                .find(|(_, e)| e.match_key == match_key)
                .map(|(handle, _)| *handle)
        }))
    }

    async fn write_register(&self, register: &str, index: u32, value: u64) -> Result<()> {
        let mut model = self.model.lock();
        model.enter("write_register", register)?;
        model
            .registers
            .entry(register.to_string())
            .or_default()
            .insert(index, value);
        model.leave("write_register")
    }

    async fn read_register(&self, register: &str, index: u32) -> Result<u64> {
        let mut model = self.model.lock();
        model.enter("read_register", register)?;
        Ok(model
            .registers
            .get(register)
            .and_then(|cells| cells.get(&index))
            .copied()
            .unwrap_or(0))
    }

    async fn enable_mirroring(&self, session_id: u32, port: u32) -> Result<()> {
        let mut model = self.model.lock();
        model.enter("enable_mirroring", "")?;
        model.mirroring.insert(session_id, port);
        Ok(())
    }
}
