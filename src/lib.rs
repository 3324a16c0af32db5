//! NetCache - In-Network Key-Value Cache Control Plane
//!
//! A programmable switch keeps hot key/value pairs in on-switch register
//! arrays. This crate is everything around it: the controller deciding which
//! keys occupy which register rows, the backend server holding the
//! authoritative data, and the client that partitions keys over servers.
//!
//! # Architecture
//!
//! ```text
//! Client ──▶ Switch dataplane ──hit──▶ Client
//!                 │ miss / report
//!                 ├──────────────▶ BackendServer ──INSERT_OK──┐
//!                 ▼                                            │
//!          ReportListener ──▶ CacheController ──RPC──▶ Switch  │
//!                                     ▲                        │
//!                                     └────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache`] - Slot allocator, validity pool and key index
//! - [`client`] - Partitioning client with latency statistics
//! - [`config`] - Deployment configuration
//! - [`controller`] - Insert/flush logic and the report listener
//! - [`domain`] - Domain layer with ports and events (DDD)
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics
//! - [`protocol`] - Binary wire protocol
//! - [`server`] - Backend key-value server

pub mod adapters;
pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use cache::{CacheState, KeyMapEntry, SlotAllocator};
pub use client::{CacheClient, ClientConfig, PartitionScheme};
pub use config::DeploymentConfig;
pub use controller::{CacheController, ReportListener};
pub use error::{Error, Result};
pub use protocol::{Op, ProtocolCodec, ProtocolMessage};
pub use server::{BackendServer, ServerConfig};
