//! Backend Server
//!
//! Authoritative key-value store behind the switch cache.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          BackendServer                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  datagram task        stream task           out-of-band task      │
//! │  READ / READ_FAIL     WRITE / FLUSH         INSERT_OK tokens      │
//! │  WRITE / INIT         (one msg per conn)    (Unix socket)         │
//! │       │                     │                      │              │
//! │       └──────────┬──────────┘                      │              │
//! │                  ▼                                 ▼              │
//! │         DashMap<key, value>            completion channel ──▶ datagram task
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! While the datagram task waits for a completion token it keeps receiving;
//! datagrams that arrive in that window are queued and served, in order,
//! before any new datagram is read.

mod backend;
mod dataset;
mod oob;

pub use backend::{BackendServer, ServerConfig, ServerHandle};
pub use dataset::{load_dataset, load_datasets};
pub use oob::OobListener;
