//! Retrying Switch Decorator
//!
//! Wraps any [`SwitchControl`] and retries failed calls with bounded
//! exponential backoff. Only `Rpc` errors are retried; the last failure is
//! returned once the policy's attempts are used up. A retried `add_entry`
//! first looks the match key up, so an entry installed by an attempt whose
//! reply was lost is reused rather than added twice.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use prometheus::IntCounter;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::domain::ports::{EntryHandle, SwitchControl};
use crate::error::{Error, Result};

/// `SwitchControl` decorator adding retries.
pub struct RetryingSwitch {
    inner: Arc<dyn SwitchControl>,
    policy: RetryPolicy,
    retries: Option<IntCounter>,
}

impl RetryingSwitch {
    pub fn new(inner: Arc<dyn SwitchControl>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            retries: None,
        }
    }

    /// Count every retried call in `counter`.
    pub fn with_retry_counter(mut self, counter: IntCounter) -> Self {
        self.retries = Some(counter);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 0..attempts {
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded on attempt {}", operation, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e @ Error::Rpc { .. }) => {
                    warn!(
                        "Switch call {} failed (attempt {}/{}): {}",
                        operation,
                        attempt + 1,
                        attempts,
                        e
                    );
                    if attempt + 1 == attempts {
                        return Err(e);
                    }
                    if let Some(counter) = &self.retries {
                        counter.inc();
                    }
                    tokio::time::sleep(self.policy.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::rpc(operation, "no attempts made"))
    }
}

impl std::fmt::Debug for RetryingSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingSwitch")
            .field("policy", &self.policy)
            .finish()
    }
}

#[async_trait]
impl SwitchControl for RetryingSwitch {
    async fn add_entry(
        &self,
        table: &str,
        action: &str,
        match_key: &[String],
        action_params: &[String],
    ) -> Result<EntryHandle> {
        // An attempt that timed out may still have installed the entry
        let retrying = AtomicBool::new(false);
        self.call("add_entry", || {
            let retry = retrying.swap(true, Ordering::SeqCst);
            async move {
                if retry {
                    if let Some(handle) = self.inner.get_handle(table, match_key).await? {
                        debug!("add_entry on {} already applied, reusing handle", table);
                        return Ok(handle);
                    }
                }
                self.inner
                    .add_entry(table, action, match_key, action_params)
                    .await
            }
        })
        .await
    }

    async fn delete_entry(&self, table: &str, handle: EntryHandle) -> Result<()> {
        self.call("delete_entry", move || self.inner.delete_entry(table, handle))
            .await
    }

    async fn get_handle(&self, table: &str, match_key: &[String]) -> Result<Option<EntryHandle>> {
        self.call("get_handle", move || self.inner.get_handle(table, match_key))
            .await
    }

    async fn write_register(&self, register: &str, index: u32, value: u64) -> Result<()> {
        self.call("write_register", move || {
            self.inner.write_register(register, index, value)
        })
        .await
    }

    async fn read_register(&self, register: &str, index: u32) -> Result<u64> {
        self.call("read_register", move || self.inner.read_register(register, index))
            .await
    }

    async fn enable_mirroring(&self, session_id: u32, port: u32) -> Result<()> {
        self.call("enable_mirroring", move || {
            self.inner.enable_mirroring(session_id, port)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedSwitch;
    use assert_matches::assert_matches;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let sim = Arc::new(SimulatedSwitch::new());
        let counter = IntCounter::new("retries", "retries").unwrap();
        let switch = RetryingSwitch::new(sim.clone(), fast_policy(3))
            .with_retry_counter(counter.clone());

        sim.fail_next(2);
        switch.write_register("vt0", 1, 7).await.unwrap();

        assert_eq!(sim.register("vt0", 1), 7);
        assert_eq!(sim.call_count("write_register"), 3);
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn test_add_entry_reuses_entry_from_lost_reply() {
        let sim = Arc::new(SimulatedSwitch::new());
        let switch = RetryingSwitch::new(sim.clone(), fast_policy(3));
        let key = vec!["0x6b".to_string()];
        let params = vec!["1".to_string(), "0".to_string()];

        sim.lose_next_replies("add_entry", 1);
        let handle = switch
            .add_entry("lookup", "set_lookup_metadata", &key, &params)
            .await
            .unwrap();

        assert_eq!(sim.entries("lookup").len(), 1);
        assert_eq!(sim.get_handle("lookup", &key).await.unwrap(), Some(handle));
        assert_eq!(sim.call_count("add_entry"), 1);
    }

    #[tokio::test]
    async fn test_add_entry_retried_when_nothing_was_installed() {
        let sim = Arc::new(SimulatedSwitch::new());
        let switch = RetryingSwitch::new(sim.clone(), fast_policy(3));
        let key = vec!["0x6b".to_string()];

        sim.fail_next_of("add_entry", 1);
        switch.add_entry("lookup", "hit", &key, &[]).await.unwrap();

        assert_eq!(sim.entries("lookup").len(), 1);
        assert_eq!(sim.call_count("add_entry"), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_last_attempt() {
        let sim = Arc::new(SimulatedSwitch::new());
        let switch = RetryingSwitch::new(sim.clone(), fast_policy(2));

        sim.fail_next(5);
        assert_matches!(
            switch.enable_mirroring(100, 3).await,
            Err(Error::Rpc { .. })
        );
        assert_eq!(sim.call_count("enable_mirroring"), 2);
        assert_eq!(sim.mirroring_port(100), None);
    }

    #[tokio::test]
    async fn test_no_retry_policy_makes_one_attempt() {
        let sim = Arc::new(SimulatedSwitch::new());
        let switch = RetryingSwitch::new(sim.clone(), RetryPolicy::none());

        sim.fail_next(1);
        assert!(switch.read_register("cache_status", 0).await.is_err());
        assert_eq!(sim.call_count("read_register"), 1);
    }
}
