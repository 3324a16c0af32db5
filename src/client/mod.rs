//! Cache Client
//!
//! Sends reads as datagrams and writes/flushes over streams to the server
//! owning each key. The owner is picked on the client (static partitioning).
//!
//! # Example
//!
//! ```ignore
//! let mut client = CacheClient::connect(ClientConfig::for_servers(default_server_ips(4)?)).await?;
//! let value = client.read(b"alpha").await?;
//! client.flush(b"alpha").await?;
//! println!("{:?}", client.latency_stats().summary());
//! ```

mod partition;
mod stats;

pub use partition::{default_server_ips, PartitionScheme, MAX_SUPPORTED_SERVERS};
pub use stats::{LatencyStats, LatencySummary};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, instrument, warn};

use crate::config::{WireFormat, NETCACHE_PORT};
use crate::error::{Error, Result};
use crate::protocol::{display_key, Op, ProtocolCodec, ProtocolMessage};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub servers: Vec<IpAddr>,
    /// Server port (cached or no-cache)
    pub port: u16,
    pub wire: WireFormat,
    pub scheme: PartitionScheme,
    /// Longest wait for any single reply
    pub timeout: Duration,
}

impl ClientConfig {
    pub fn for_servers(servers: Vec<IpAddr>) -> Self {
        Self {
            servers,
            port: NETCACHE_PORT,
            wire: WireFormat::default(),
            scheme: PartitionScheme::default(),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Client of a partitioned NetCache deployment.
#[derive(Debug)]
pub struct CacheClient {
    config: ClientConfig,
    codec: ProtocolCodec,
    socket: UdpSocket,
    next_seq: u32,
    stats: LatencyStats,
}

impl CacheClient {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.wire.validate()?;
        if config.servers.is_empty() {
            return Err(Error::Config("no servers configured".into()));
        }
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        Ok(Self {
            codec: ProtocolCodec::new(config.wire),
            config,
            socket,
            next_seq: 0,
            stats: LatencyStats::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Address of the server owning `key`.
    pub fn owner(&self, key: &[u8]) -> Result<SocketAddr> {
        let index = self.config.scheme.owner(key, self.config.servers.len())?;
        Ok(SocketAddr::new(self.config.servers[index], self.config.port))
    }

    pub fn latency_stats(&self) -> &LatencyStats {
        &self.stats
    }

    fn seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Read the value of `key`.
    #[instrument(skip(self), fields(key = %display_key(key)))]
    pub async fn read(&mut self, key: &[u8]) -> Result<Bytes> {
        let server = self.owner(key)?;
        let seq = self.seq();
        let packet = self.codec.encode_parts(Op::Read, seq, key, &[])?;

        let started = Instant::now();
        self.socket.send_to(&packet, server).await?;

        let reply = self.await_datagram(seq, "read reply").await?;
        self.stats.record(started.elapsed());

        match reply.op {
            Op::KeyNotFound => Err(Error::NotFound {
                key: display_key(key),
            }),
            _ => Ok(reply.value),
        }
    }

    /// Wait for the terminal reply to request `seq`, skipping cache-population
    /// echoes and stale replies.
    async fn await_datagram(&mut self, seq: u32, what: &str) -> Result<ProtocolMessage> {
        let timeout = self.config.timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; self.codec.wire().message_len().max(2048)];

        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| Error::Timeout {
                    what: what.to_string(),
                    millis: timeout.as_millis() as u64,
                })?;
            let (len, peer) = received?;

            let reply = match self.codec.decode(&buf[..len]) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Ignoring malformed reply from {}: {}", peer, e);
                    continue;
                }
            };
            if reply.seq != seq {
                debug!("Ignoring reply with seq {} (waiting for {})", reply.seq, seq);
                continue;
            }
            match reply.op {
                Op::Read | Op::RequestSuccess | Op::KeyNotFound => return Ok(reply),
                other => debug!("Skipping {} reply for {}", other, reply.key_str()),
            }
        }
    }

    /// Evict `key` from the cache.
    #[instrument(skip(self), fields(key = %display_key(key)))]
    pub async fn flush(&mut self, key: &[u8]) -> Result<()> {
        let reply = self.stream_request(Op::Flush, key, &[]).await?;
        match reply.op {
            Op::KeyNotFound => Err(Error::NotFound {
                key: display_key(key),
            }),
            _ => Ok(()),
        }
    }

    /// Store `value` under `key` on the owning server.
    #[instrument(skip(self, value), fields(key = %display_key(key)))]
    pub async fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let reply = self.stream_request(Op::Write, key, value).await?;
        match reply.op {
            Op::RequestSuccess => Ok(()),
            other => Err(Error::Internal(format!(
                "unexpected {} reply to WRITE of {}",
                other,
                display_key(key)
            ))),
        }
    }

    async fn stream_request(&mut self, op: Op, key: &[u8], value: &[u8]) -> Result<ProtocolMessage> {
        let server = self.owner(key)?;
        let seq = self.seq();
        let packet = self.codec.encode_parts(op, seq, key, value)?;
        let timeout = self.config.timeout;

        let started = Instant::now();
        let exchange = async {
            let mut stream = TcpStream::connect(server).await?;
            stream.write_all(&packet).await?;
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await?;
            Ok::<_, Error>(reply)
        };
        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout {
                what: format!("{} reply from {}", op, server),
                millis: timeout.as_millis() as u64,
            })??;
        self.stats.record(started.elapsed());

        self.codec.decode(&reply)
    }

    /// Ask server `index` to push its whole store into the cache. Returns the
    /// number of chunks it wrote.
    ///
    /// A server whose dataset holds keys too wide for the wire refuses with
    /// `KEY_NOT_FOUND`, reported here as [`Error::Format`].
    pub async fn init(&mut self, index: usize) -> Result<usize> {
        let ip = *self.config.servers.get(index).ok_or_else(|| {
            Error::Config(format!(
                "server index {} out of range ({} servers)",
                index,
                self.config.servers.len()
            ))
        })?;
        let server = SocketAddr::new(ip, self.config.port);
        let seq = self.seq();
        let packet = self.codec.encode_parts(Op::Init, seq, b"init", &[])?;
        self.socket.send_to(&packet, server).await?;

        let timeout = self.config.timeout;
        let mut buf = vec![0u8; self.codec.wire().message_len().max(2048)];
        let mut chunks = 0;
        loop {
            let (len, _) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| Error::Timeout {
                    what: "INIT progress".into(),
                    millis: timeout.as_millis() as u64,
                })??;
            let Ok(msg) = self.codec.decode(&buf[..len]) else {
                continue;
            };
            match msg.op {
                Op::Write if msg.seq == seq => chunks += 1,
                Op::RequestSuccess if msg.seq == seq => return Ok(chunks),
                Op::KeyNotFound if msg.seq == seq => {
                    return Err(Error::Format(format!(
                        "server {} refused INIT: its dataset does not fit the wire format",
                        server
                    )))
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn local_config(port: u16) -> ClientConfig {
        ClientConfig {
            port,
            wire: WireFormat::new(16, 64),
            timeout: Duration::from_millis(300),
            ..ClientConfig::for_servers(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
        }
    }

    #[tokio::test]
    async fn test_read_skips_write_and_stale_replies() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client = CacheClient::connect(local_config(port)).await.unwrap();
        let codec = ProtocolCodec::new(WireFormat::new(16, 64));

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = codec.decode(&buf[..len]).unwrap();
            assert_eq!(request.op, Op::Read);

            for (op, seq) in [
                (Op::RequestSuccess, request.seq.wrapping_add(9)),
                (Op::Write, request.seq),
                (Op::RequestSuccess, request.seq),
            ] {
                let reply = codec.encode_parts(op, seq, &request.key, b"value").unwrap();
                server.send_to(&reply, peer).await.unwrap();
            }
        });

        assert_eq!(client.read(b"k").await.unwrap(), &b"value"[..]);
        assert_eq!(client.latency_stats().count(), 1);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_not_found_and_timeout() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client = CacheClient::connect(local_config(port)).await.unwrap();
        let codec = ProtocolCodec::new(WireFormat::new(16, 64));

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = codec.decode(&buf[..len]).unwrap();
            let reply = codec
                .encode_parts(Op::KeyNotFound, request.seq, &request.key, &[])
                .unwrap();
            server.send_to(&reply, peer).await.unwrap();
            // Second request goes unanswered
            server.recv_from(&mut buf).await.unwrap();
        });

        assert_matches!(client.read(b"k").await, Err(Error::NotFound { .. }));
        assert_matches!(client.read(b"k").await, Err(Error::Timeout { .. }));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_init_is_format_error() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut client = CacheClient::connect(local_config(port)).await.unwrap();
        let codec = ProtocolCodec::new(WireFormat::new(16, 64));

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let request = codec.decode(&buf[..len]).unwrap();
            assert_eq!(request.op, Op::Init);
            let reply = codec
                .encode_parts(Op::KeyNotFound, request.seq, &request.key, &[])
                .unwrap();
            server.send_to(&reply, peer).await.unwrap();
        });

        assert_matches!(client.init(0).await, Err(Error::Format(_)));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_consistent_hash_is_rejected_before_sending() {
        let config = ClientConfig {
            scheme: PartitionScheme::ConsistentHash,
            ..local_config(1)
        };
        let mut client = CacheClient::connect(config).await.unwrap();
        assert_matches!(client.read(b"k").await, Err(Error::Unsupported(_)));
        assert_matches!(client.flush(b"k").await, Err(Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_oversized_key_is_format_error() {
        let mut client = CacheClient::connect(local_config(1)).await.unwrap();
        assert_matches!(client.read(&[b'k'; 17]).await, Err(Error::Format(_)));
    }
}
