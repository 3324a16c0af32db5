//! NetCache Wire Protocol
//!
//! Every actor (client, switch, server, controller) speaks the same
//! fixed-layout binary message:
//!
//! ```text
//! ┌──────┬──────────┬──────────────────┬──────────────────────────┐
//! │ op   │ seq      │ key              │ value                    │
//! │ 1 B  │ 4 B (BE) │ key_width B      │ value_width B            │
//! └──────┴──────────┴──────────────────┴──────────────────────────┘
//! ```
//!
//! Key and value are left-zero-padded, so leading NUL bytes do not survive a
//! round trip.

mod codec;
pub mod frame;

pub use codec::{ProtocolCodec, ProtocolMessage};
pub use frame::extract_payload;

/// Protocol operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Read request / read served by the switch
    Read,
    /// Write request, also used to populate the cache
    Write,
    /// Evict a key from the cache
    Flush,
    /// Cache miss forwarded to the backend
    ReadFail,
    /// Bulk-populate the cache from the server's dataset
    Init,
    /// Request completed
    RequestSuccess,
    /// Key is not known
    KeyNotFound,
    /// Any other code seen on the wire
    Other(u8),
}

impl Op {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const FLUSH: u8 = 2;
    pub const READ_FAIL: u8 = 3;
    pub const INIT: u8 = 4;
    pub const REQUEST_SUCCESS: u8 = 10;
    pub const KEY_NOT_FOUND: u8 = 20;

    /// Numeric code on the wire
    pub fn code(self) -> u8 {
        match self {
            Op::Read => Self::READ,
            Op::Write => Self::WRITE,
            Op::Flush => Self::FLUSH,
            Op::ReadFail => Self::READ_FAIL,
            Op::Init => Self::INIT,
            Op::RequestSuccess => Self::REQUEST_SUCCESS,
            Op::KeyNotFound => Self::KEY_NOT_FOUND,
            Op::Other(code) => code,
        }
    }
}

impl From<u8> for Op {
    fn from(code: u8) -> Self {
        match code {
            Self::READ => Op::Read,
            Self::WRITE => Op::Write,
            Self::FLUSH => Op::Flush,
            Self::READ_FAIL => Op::ReadFail,
            Self::INIT => Op::Init,
            Self::REQUEST_SUCCESS => Op::RequestSuccess,
            Self::KEY_NOT_FOUND => Op::KeyNotFound,
            other => Op::Other(other),
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Read => write!(f, "READ"),
            Op::Write => write!(f, "WRITE"),
            Op::Flush => write!(f, "FLUSH"),
            Op::ReadFail => write!(f, "READ_FAIL"),
            Op::Init => write!(f, "INIT"),
            Op::RequestSuccess => write!(f, "REQUEST_SUCCESS"),
            Op::KeyNotFound => write!(f, "KEY_NOT_FOUND"),
            Op::Other(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// Printable form of a raw key for logs and errors.
pub fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}
