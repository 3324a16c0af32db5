//! Deployment Configuration
//!
//! Every width, capacity and address in a NetCache deployment is fixed for the
//! lifetime of the deployment. All of them live here, with defaults matching the
//! reference topology (one switch, servers on `10.0.0.x`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Port used by servers when requests go through the cache
pub const NETCACHE_PORT: u16 = 50000;

/// Port used by servers when the cache is bypassed
pub const NOCACHE_PORT: u16 = 50001;

/// Default path of the controller ↔ server out-of-band channel
pub const DEFAULT_OOB_PATH: &str = "/tmp/server_cont.s";

/// Token sent over the out-of-band channel after a cache insert completes
pub const CACHE_INSERT_COMPLETE: &[u8] = b"INSERT_OK";

/// Token sent over the out-of-band channel after a cache insert was refused
pub const CACHE_INSERT_FAILED: &[u8] = b"INSERT_FAIL";

/// Maximum lanes supported (one occupancy bit per lane in a `u64`)
pub const MAX_LANES: u32 = 64;

/// Maximum storage unit width (one register value is a `u64`)
pub const MAX_SLOT_SIZE: usize = 8;

// =============================================================================
// Cache Layout
// =============================================================================

/// Geometry of the on-switch register arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLayout {
    /// Bytes held by one storage unit
    pub slot_size: usize,
    /// Number of parallel register arrays
    pub lanes: u32,
    /// Number of rows per register array
    pub rows: u32,
}

impl Default for CacheLayout {
    fn default() -> Self {
        Self {
            slot_size: 8,
            lanes: 8,
            rows: 65536,
        }
    }
}

impl CacheLayout {
    pub fn new(slot_size: usize, lanes: u32, rows: u32) -> Self {
        Self {
            slot_size,
            lanes,
            rows,
        }
    }

    /// Bytes stored by one full row
    pub fn row_bytes(&self) -> usize {
        self.slot_size * self.lanes as usize
    }

    /// Total storage units (`rows × lanes`)
    pub fn capacity_units(&self) -> u64 {
        self.rows as u64 * self.lanes as u64
    }

    /// Bitmap with every lane bit set
    pub fn full_bitmap(&self) -> u64 {
        if self.lanes >= 64 {
            u64::MAX
        } else {
            (1u64 << self.lanes) - 1
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_size == 0 || self.slot_size > MAX_SLOT_SIZE {
            return Err(Error::Config(format!(
                "slot_size must be within 1..={}, got {}",
                MAX_SLOT_SIZE, self.slot_size
            )));
        }
        if self.lanes == 0 || self.lanes > MAX_LANES {
            return Err(Error::Config(format!(
                "lanes must be within 1..={}, got {}",
                MAX_LANES, self.lanes
            )));
        }
        if self.rows == 0 {
            return Err(Error::Config("rows must be greater than 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Wire Format
// =============================================================================

/// Field widths of the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireFormat {
    /// Width of the key field in bytes
    pub key_width: usize,
    /// Width of the value field in bytes
    pub value_width: usize,
    /// Shortest value field accepted on decode (defaults to `value_width`)
    pub min_value_width: Option<usize>,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self {
            key_width: 16,
            value_width: 512,
            min_value_width: None,
        }
    }
}

impl WireFormat {
    pub fn new(key_width: usize, value_width: usize) -> Self {
        Self {
            key_width,
            value_width,
            min_value_width: None,
        }
    }

    /// Accept messages whose value field is shorter than `value_width`.
    pub fn with_min_value_width(mut self, min_value_width: usize) -> Self {
        self.min_value_width = Some(min_value_width);
        self
    }

    /// Shortest value field accepted on decode
    pub fn min_value_width(&self) -> usize {
        self.min_value_width.unwrap_or(self.value_width)
    }

    /// Size of the fixed header (`op` + `seq` + key)
    pub fn header_len(&self) -> usize {
        1 + 4 + self.key_width
    }

    /// Size of a fully padded message
    pub fn message_len(&self) -> usize {
        self.header_len() + self.value_width
    }

    pub fn validate(&self) -> Result<()> {
        if self.key_width == 0 {
            return Err(Error::Config("key_width must be greater than 0".into()));
        }
        if self.value_width == 0 {
            return Err(Error::Config("value_width must be greater than 0".into()));
        }
        if self.min_value_width() > self.value_width {
            return Err(Error::Config(format!(
                "min_value_width ({}) exceeds value_width ({})",
                self.min_value_width(),
                self.value_width
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff for switch control calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds)
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay to wait after the given failed attempt (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

// =============================================================================
// Deployment
// =============================================================================

/// Complete configuration of one switch/controller/server deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub layout: CacheLayout,
    pub wire: WireFormat,
    pub retry: RetryPolicy,
    /// Port used by servers in cached mode
    pub cached_port: u16,
    /// Port used by servers in no-cache mode
    pub nocache_port: u16,
    /// UDP port on which mirrored reports reach the controller
    pub report_port: u16,
    /// Path of the out-of-band Unix socket
    pub oob_path: PathBuf,
    /// Thrift port of the switch runtime
    pub thrift_port: u16,
    /// Switch port connected to the controller CPU interface
    pub cpu_port: Option<u32>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            layout: CacheLayout::default(),
            wire: WireFormat::default(),
            retry: RetryPolicy::default(),
            cached_port: NETCACHE_PORT,
            nocache_port: NOCACHE_PORT,
            report_port: NETCACHE_PORT,
            oob_path: PathBuf::from(DEFAULT_OOB_PATH),
            thrift_port: 9090,
            cpu_port: None,
        }
    }
}

impl DeploymentConfig {
    /// Load a configuration from a YAML file and validate it.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse a configuration from YAML text and validate it.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        self.wire.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.cached_port == self.nocache_port {
            return Err(Error::Config(
                "cached_port and nocache_port must differ".into(),
            ));
        }
        Ok(())
    }

    /// Server port for the given mode
    pub fn server_port(&self, nocache: bool) -> u16 {
        if nocache {
            self.nocache_port
        } else {
            self.cached_port
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
