//! Backend server tasks.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::oob::OobListener;
use crate::config::{WireFormat, NETCACHE_PORT};
use crate::domain::ports::InsertCompletion;
use crate::error::{Error, Result};
use crate::protocol::{display_key, Op, ProtocolCodec, ProtocolMessage};

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 65536;

/// Completion tokens buffered before the out-of-band task waits
const COMPLETION_QUEUE: usize = 64;

type Store = Arc<DashMap<Bytes, Bytes>>;

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address both transports bind to
    pub bind_ip: IpAddr,
    /// Port of both transports (`0` picks a free one)
    pub port: u16,
    /// Serve READ requests directly instead of leaving them to the cache
    pub nocache: bool,
    pub wire: WireFormat,
    /// Out-of-band socket; when set, cache-populating replies wait for the
    /// controller's completion token
    pub oob_path: Option<PathBuf>,
    /// Longest wait for a completion token
    pub completion_timeout: Duration,
    /// Longest wait for a stream request to arrive in full
    pub stream_read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: NETCACHE_PORT,
            nocache: false,
            wire: WireFormat::default(),
            oob_path: None,
            completion_timeout: Duration::from_secs(2),
            stream_read_timeout: Duration::from_secs(5),
        }
    }
}

/// Authoritative key-value store and its network front end.
#[derive(Debug)]
pub struct BackendServer {
    config: ServerConfig,
    codec: ProtocolCodec,
    store: Store,
}

impl BackendServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.wire.validate()?;
        Ok(Self {
            codec: ProtocolCodec::new(config.wire),
            config,
            store: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Add entries to the store.
    pub fn populate<K, V, I>(&self, entries: I)
    where
        K: Into<Bytes>,
        V: Into<Bytes>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in entries {
            self.store.insert(key.into(), value.into());
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.store.get(key).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Bind every transport and spawn the server tasks.
    pub async fn start(self) -> Result<ServerHandle> {
        let addr = SocketAddr::new(self.config.bind_ip, self.config.port);
        let udp = Arc::new(UdpSocket::bind(addr).await?);
        let udp_addr = udp.local_addr()?;
        // Streams share the datagram port, also when it was picked by the OS
        let tcp = TcpListener::bind(udp_addr).await?;
        let tcp_addr = tcp.local_addr()?;

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let completions = match &self.config.oob_path {
            Some(path) => {
                let oob = OobListener::bind(path.clone())?;
                let (tx, rx) = mpsc::channel(COMPLETION_QUEUE);
                tasks.spawn(oob.run(tx, cancel.clone()));
                Some(rx)
            }
            None => None,
        };

        let datagrams = DatagramTask {
            socket: udp,
            codec: self.codec,
            store: self.store.clone(),
            nocache: self.config.nocache,
            completions,
            completion_timeout: self.config.completion_timeout,
            pending: VecDeque::new(),
            cancel: cancel.clone(),
        };
        tasks.spawn(datagrams.run());

        let streams = StreamTask {
            listener: tcp,
            codec: self.codec,
            store: self.store.clone(),
            read_timeout: self.config.stream_read_timeout,
            cancel: cancel.clone(),
        };
        tasks.spawn(streams.run());

        info!(
            "Backend server up: datagrams on {}, streams on {} ({} mode, {} keys)",
            udp_addr,
            tcp_addr,
            if self.config.nocache { "no-cache" } else { "cached" },
            self.store.len()
        );

        Ok(ServerHandle {
            cancel,
            tasks,
            udp_addr,
            tcp_addr,
            oob_path: self.config.oob_path,
            store: self.store,
        })
    }
}

/// Running server.
#[derive(Debug)]
pub struct ServerHandle {
    cancel: CancellationToken,
    tasks: JoinSet<Result<()>>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    oob_path: Option<PathBuf>,
    store: Store,
}

impl ServerHandle {
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.store.get(key).map(|v| v.value().clone())
    }

    /// Token that stops every task when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until every task exits (after cancellation or a fatal error).
    pub async fn wait(&mut self) -> Result<()> {
        let mut result = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Server task failed: {}", e);
                    self.cancel.cancel();
                    result = Err(e);
                }
                Err(e) => {
                    self.cancel.cancel();
                    result = Err(Error::Internal(format!("server task panicked: {}", e)));
                }
            }
        }
        result
    }

    /// Stop every task and remove the out-of-band socket file.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        let result = self.wait().await;
        if let Some(path) = &self.oob_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
        info!("Backend server stopped");
        result
    }
}

// =============================================================================
// Datagram Task
// =============================================================================

struct DatagramTask {
    socket: Arc<UdpSocket>,
    codec: ProtocolCodec,
    store: Store,
    nocache: bool,
    completions: Option<mpsc::Receiver<InsertCompletion>>,
    completion_timeout: Duration,
    /// Datagrams received while waiting for a completion token
    pending: VecDeque<(Vec<u8>, SocketAddr)>,
    cancel: CancellationToken,
}

impl DatagramTask {
    async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (datagram, peer) = match self.pending.pop_front() {
                Some(queued) => queued,
                None => tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    received = self.socket.recv_from(&mut buf) => match received {
                        Ok((len, peer)) => (buf[..len].to_vec(), peer),
                        Err(e) => {
                            warn!("Datagram receive failed: {}", e);
                            continue;
                        }
                    },
                },
            };

            if let Err(e) = self.handle(&datagram, peer).await {
                warn!("Datagram from {} failed: {}", peer, e);
            }
        }
        Ok(())
    }

    async fn handle(&mut self, datagram: &[u8], peer: SocketAddr) -> Result<()> {
        let msg = self.codec.decode(datagram)?;
        let key = msg.key_str();

        match msg.op {
            Op::ReadFail => {
                info!("Received READ_FAIL({}) from {}", key, peer);
                match self.lookup(&msg.key) {
                    Some(value) => {
                        self.drain_completions();
                        self.send(Op::Write, msg.seq, &msg.key, &value, peer)
                            .await?;
                        self.await_completion().await;
                        self.send(Op::RequestSuccess, msg.seq, &msg.key, &value, peer)
                            .await
                    }
                    None => {
                        self.send(Op::KeyNotFound, msg.seq, &msg.key, &[], peer)
                            .await
                    }
                }
            }
            Op::Read if self.nocache => {
                debug!("Received READ({}) from {}", key, peer);
                match self.lookup(&msg.key) {
                    Some(value) => {
                        self.send(Op::RequestSuccess, msg.seq, &msg.key, &value, peer)
                            .await
                    }
                    None => {
                        self.send(Op::KeyNotFound, msg.seq, &msg.key, &[], peer)
                            .await
                    }
                }
            }
            Op::Read => {
                info!("Received READ({}) from {}, served by the cache", key, peer);
                Ok(())
            }
            Op::Write => {
                info!("Received WRITE({}) from {}", key, peer);
                self.store.insert(msg.key, msg.value);
                Ok(())
            }
            Op::Init => {
                info!("Received INIT from {}", peer);
                self.populate_cache(&msg, peer).await
            }
            other => {
                warn!("Unsupported op {} from {} (key {})", other, peer, key);
                Ok(())
            }
        }
    }

    /// Push every stored pair towards the cache, one value-width chunk per WRITE.
    ///
    /// Every chunk key is checked against the key width before anything is
    /// sent. If one does not fit, INIT is refused with `KEY_NOT_FOUND` and the
    /// cache is left untouched; `REQUEST_SUCCESS` follows only a complete push.
    async fn populate_cache(&mut self, request: &ProtocolMessage, peer: SocketAddr) -> Result<()> {
        let wire = *self.codec.wire();
        let chunks: Vec<(Bytes, Bytes)> = self
            .store
            .iter()
            .flat_map(|entry| chunk_entry(entry.key(), entry.value(), wire.value_width))
            .collect();

        let oversized: Vec<String> = chunks
            .iter()
            .filter(|(chunk_key, _)| chunk_key.len() > wire.key_width)
            .map(|(chunk_key, _)| display_key(chunk_key))
            .collect();
        if !oversized.is_empty() {
            warn!(
                "Refusing INIT from {}: {} chunk keys exceed the {}-byte key width ({})",
                peer,
                oversized.len(),
                wire.key_width,
                oversized.join(", ")
            );
            return self
                .send(Op::KeyNotFound, request.seq, &request.key, &[], peer)
                .await;
        }

        let mut refused = 0usize;
        for (chunk_key, chunk) in &chunks {
            self.drain_completions();
            self.send(Op::Write, request.seq, chunk_key, chunk, peer)
                .await?;
            if self.await_completion().await == Some(InsertCompletion::Failed) {
                refused += 1;
            }
        }

        if refused > 0 {
            warn!("INIT: cache refused {} of {} chunks", refused, chunks.len());
        }
        info!("INIT pushed {} chunks to {}", chunks.len(), peer);
        self.send(Op::RequestSuccess, request.seq, &request.key, &[], peer)
            .await
    }

    fn lookup(&self, key: &[u8]) -> Option<Bytes> {
        self.store.get(key).map(|v| v.value().clone())
    }

    async fn send(
        &self,
        op: Op,
        seq: u32,
        key: &[u8],
        value: &[u8],
        peer: SocketAddr,
    ) -> Result<()> {
        let packet = self.codec.encode_parts(op, seq, key, value)?;
        self.socket.send_to(&packet, peer).await?;
        debug!("Sent {}({}) to {}", op, display_key(key), peer);
        Ok(())
    }

    /// Discard tokens for inserts nobody is waiting on.
    fn drain_completions(&mut self) {
        if let Some(rx) = &mut self.completions {
            while rx.try_recv().is_ok() {
                debug!("Discarding unsolicited completion token");
            }
        }
    }

    /// Wait for one completion token, queueing datagrams that arrive meanwhile.
    ///
    /// Returns the outcome carried by the token, or `None` when no token came.
    async fn await_completion(&mut self) -> Option<InsertCompletion> {
        let Some(rx) = self.completions.as_mut() else {
            return None;
        };

        let deadline = tokio::time::sleep(self.completion_timeout);
        tokio::pin!(deadline);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        let completion = loop {
            tokio::select! {
                token = rx.recv() => break token.map(Some).ok_or(()),
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => self.pending.push_back((buf[..len].to_vec(), peer)),
                    Err(e) => warn!("Datagram receive failed: {}", e),
                },
                _ = &mut deadline => {
                    warn!(
                        "No insert completion within {}ms, replying anyway",
                        self.completion_timeout.as_millis()
                    );
                    break Ok(None);
                }
                _ = self.cancel.cancelled() => break Ok(None),
            }
        };

        match completion {
            Ok(Some(InsertCompletion::Failed)) => {
                debug!("Controller refused the insert, replying without a cached copy");
                Some(InsertCompletion::Failed)
            }
            Ok(completion) => completion,
            Err(()) => {
                warn!("Out-of-band channel closed, no longer waiting for completions");
                self.completions = None;
                None
            }
        }
    }
}

/// Split one pair into value-width chunks. Multi-chunk values get keys of the
/// form `key:index`.
fn chunk_entry(key: &[u8], value: &[u8], width: usize) -> Vec<(Bytes, Bytes)> {
    if value.len() <= width {
        return vec![(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value))];
    }
    value
        .chunks(width)
        .enumerate()
        .map(|(i, chunk)| {
            let mut chunk_key = key.to_vec();
            chunk_key.extend_from_slice(format!(":{}", i).as_bytes());
            (Bytes::from(chunk_key), Bytes::copy_from_slice(chunk))
        })
        .collect()
}

// =============================================================================
// Stream Task
// =============================================================================

struct StreamTask {
    listener: TcpListener,
    codec: ProtocolCodec,
    store: Store,
    read_timeout: Duration,
    cancel: CancellationToken,
}

impl StreamTask {
    async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Stream accept failed: {}", e);
                        continue;
                    }
                },
            };

            if let Err(e) = self.serve(stream, peer).await {
                warn!("Stream request from {} failed: {}", peer, e);
            }
        }
        Ok(())
    }

    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let request = tokio::time::timeout(self.read_timeout, read_message(&mut stream, &self.codec))
            .await
            .map_err(|_| Error::Timeout {
                what: format!("request from {}", peer),
                millis: self.read_timeout.as_millis() as u64,
            })??;

        let msg = self.codec.decode(&request)?;
        let reply_op = match msg.op {
            Op::Write => {
                info!("Received WRITE({}) from {}", msg.key_str(), peer);
                self.store.insert(msg.key.clone(), msg.value.clone());
                Op::RequestSuccess
            }
            Op::Flush => {
                info!("Received FLUSH({}) from {}", msg.key_str(), peer);
                if self.store.contains_key(&msg.key) {
                    Op::RequestSuccess
                } else {
                    Op::KeyNotFound
                }
            }
            other => {
                warn!("Unsupported stream op {} from {}", other, peer);
                return Ok(());
            }
        };

        let reply = self
            .codec
            .encode_parts(reply_op, msg.seq, &msg.key, &[])?;
        stream.write_all(&reply).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Read until a full message has arrived or the peer stops sending.
async fn read_message(stream: &mut TcpStream, codec: &ProtocolCodec) -> Result<Vec<u8>> {
    let full = codec.wire().message_len();
    let mut buf = vec![0u8; full];
    let mut filled = 0;
    while filled < full {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
