//! Client-side partitioning of keys over servers.

use std::hash::Hasher;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Most servers addressable in the `10.0.0.0/24` topology
pub const MAX_SUPPORTED_SERVERS: usize = 254;

/// How a key is mapped to the server that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionScheme {
    /// First key byte modulo the server count
    #[default]
    Range,
    /// Stable hash of the key modulo the server count
    Hash,
    /// Not implemented
    ConsistentHash,
}

impl PartitionScheme {
    /// Index of the server owning `key` among `servers` servers.
    pub fn owner(self, key: &[u8], servers: usize) -> Result<usize> {
        if servers == 0 {
            return Err(Error::Config("no servers configured".into()));
        }
        match self {
            PartitionScheme::Range => key
                .first()
                .map(|byte| *byte as usize % servers)
                .ok_or_else(|| Error::Format("empty key".into())),
            PartitionScheme::Hash => {
                let mut hasher = FxHasher::default();
                hasher.write(key);
                Ok((hasher.finish() % servers as u64) as usize)
            }
            PartitionScheme::ConsistentHash => Err(Error::Unsupported(
                "consistent-hash partitioning".into(),
            )),
        }
    }
}

impl FromStr for PartitionScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "range" => Ok(PartitionScheme::Range),
            "hash" => Ok(PartitionScheme::Hash),
            "consistent-hash" => Ok(PartitionScheme::ConsistentHash),
            other => Err(Error::Config(format!(
                "unknown partition scheme '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for PartitionScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PartitionScheme::Range => "range",
            PartitionScheme::Hash => "hash",
            PartitionScheme::ConsistentHash => "consistent-hash",
        };
        f.write_str(name)
    }
}

/// Server addresses of the reference topology: `10.0.0.1` ..= `10.0.0.n`.
pub fn default_server_ips(count: usize) -> Result<Vec<IpAddr>> {
    if count == 0 || count > MAX_SUPPORTED_SERVERS {
        return Err(Error::Config(format!(
            "server count must be within 1..={}, got {}",
            MAX_SUPPORTED_SERVERS, count
        )));
    }
    Ok((1..=count)
        .map(|i| IpAddr::V4(Ipv4Addr::new(10, 0, 0, i as u8)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_range_uses_first_byte() {
        assert_eq!(PartitionScheme::Range.owner(b"a", 4).unwrap(), 97 % 4);
        assert_eq!(PartitionScheme::Range.owner(b"abc", 1).unwrap(), 0);
        assert_matches!(PartitionScheme::Range.owner(b"", 4), Err(Error::Format(_)));
    }

    #[test]
    fn test_hash_is_stable_and_in_range() {
        for key in [&b"alpha"[..], b"beta", b"gamma"] {
            let owner = PartitionScheme::Hash.owner(key, 7).unwrap();
            assert!(owner < 7);
            assert_eq!(PartitionScheme::Hash.owner(key, 7).unwrap(), owner);
        }
    }

    #[test]
    fn test_consistent_hash_unsupported() {
        assert_matches!(
            PartitionScheme::ConsistentHash.owner(b"k", 3),
            Err(Error::Unsupported(_))
        );
        assert_matches!(PartitionScheme::Range.owner(b"k", 0), Err(Error::Config(_)));
    }

    #[test]
    fn test_parse_roundtrip() {
        for scheme in [
            PartitionScheme::Range,
            PartitionScheme::Hash,
            PartitionScheme::ConsistentHash,
        ] {
            assert_eq!(scheme.to_string().parse::<PartitionScheme>().unwrap(), scheme);
        }
        assert!("ring".parse::<PartitionScheme>().is_err());
    }

    #[test]
    fn test_default_server_ips() {
        let ips = default_server_ips(3).unwrap();
        assert_eq!(ips[0], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ips[2], IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)));
        assert_eq!(default_server_ips(254).unwrap().len(), 254);
        assert_matches!(default_server_ips(255), Err(Error::Config(_)));
        assert_matches!(default_server_ips(0), Err(Error::Config(_)));
    }
}
