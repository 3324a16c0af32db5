//! NetCache End-to-End Tests
//!
//! A client, the backend server, the controller and a small dataplane
//! emulator talk to each other over loopback. The emulator stands in for the
//! switch program:
//!
//! ```text
//! client ──READ──▶ dataplane ──hit──▶ client
//!                      │ miss: READ_FAIL
//!                      ▼
//!                   server ──WRITE──▶ dataplane ──mirror──▶ ReportListener
//!                      ▲                                         │
//!                      └──────INSERT_OK / INSERT_FAIL─── CacheController
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use netcache::adapters::{InMemoryEventCollector, SimulatedSwitch, UnixNotifier};
use netcache::config::{CacheLayout, WireFormat};
use netcache::controller::{
    CacheController, ReportListener, ABSENT, LOOKUP_TABLE, PRESENT, VALIDITY_REGISTER,
};
use netcache::server::ServerHandle;
use netcache::{BackendServer, CacheClient, ClientConfig, Error, Op, ProtocolCodec, ServerConfig};

fn wire() -> WireFormat {
    WireFormat::new(16, 64)
}

fn oob_path() -> PathBuf {
    std::env::temp_dir().join(format!("netcache-e2e-{}.sock", uuid::Uuid::new_v4()))
}

struct Deployment {
    client: CacheClient,
    controller: Arc<CacheController>,
    switch: Arc<SimulatedSwitch>,
    events: Arc<InMemoryEventCollector>,
    server: ServerHandle,
    hits: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Deployment {
    async fn start(dataset: &[(&str, &str)]) -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let oob = oob_path();
        let cancel = CancellationToken::new();

        // Backend server
        let server = BackendServer::new(ServerConfig {
            bind_ip: localhost,
            port: 0,
            wire: wire(),
            oob_path: Some(oob.clone()),
            completion_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        server.populate(dataset.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let server = server.start().await.unwrap();

        // Controller
        let switch = Arc::new(SimulatedSwitch::new());
        let events = Arc::new(InMemoryEventCollector::new());
        let controller = Arc::new(
            CacheController::new(CacheLayout::new(8, 8, 16), wire().key_width, switch.clone())
                .unwrap()
                .with_notifier(Arc::new(UnixNotifier::new(&oob)))
                .with_event_publisher(events.clone()),
        );
        controller.setup().await.unwrap();

        let listener = ReportListener::bind(
            SocketAddr::new(localhost, 0),
            controller.clone(),
            ProtocolCodec::new(wire()),
        )
        .await
        .unwrap();
        let reports = listener.local_addr().unwrap();
        tokio::spawn(listener.run(cancel.clone()));

        // Dataplane, on one port for both transports like the server
        let datagrams = UdpSocket::bind(SocketAddr::new(localhost, 0)).await.unwrap();
        let dataplane_addr = datagrams.local_addr().unwrap();
        let streams = TcpListener::bind(dataplane_addr).await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        tokio::spawn(run_dataplane(
            datagrams,
            server.udp_addr(),
            reports,
            controller.clone(),
            switch.clone(),
            hits.clone(),
            cancel.clone(),
        ));
        tokio::spawn(run_stream_proxy(
            streams,
            server.tcp_addr(),
            reports,
            cancel.clone(),
        ));

        let client = CacheClient::connect(ClientConfig {
            port: dataplane_addr.port(),
            wire: wire(),
            timeout: Duration::from_secs(3),
            ..ClientConfig::for_servers(vec![localhost])
        })
        .await
        .unwrap();

        Self {
            client,
            controller,
            switch,
            events,
            server,
            hits,
            cancel,
        }
    }

    fn validity(&self, validity_id: u32) -> u64 {
        self.switch.register(VALIDITY_REGISTER, validity_id)
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.server.shutdown().await.unwrap();
    }
}

/// Value served by the switch for `key`, if the lookup hits a present entry.
async fn cached_value(
    controller: &CacheController,
    switch: &SimulatedSwitch,
    key: &[u8],
) -> Option<Bytes> {
    let entry = controller.entry(key).await?;
    if switch.register(VALIDITY_REGISTER, entry.validity_id) != PRESENT {
        return None;
    }
    controller.read_cached(key).await.ok()
}

async fn run_dataplane(
    socket: UdpSocket,
    server: SocketAddr,
    reports: SocketAddr,
    controller: Arc<CacheController>,
    switch: Arc<SimulatedSwitch>,
    hits: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let codec = ProtocolCodec::new(wire());
    let mut clients: HashMap<u32, SocketAddr> = HashMap::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(_) => return,
            },
        };
        let datagram = buf[..len].to_vec();
        let Ok(msg) = codec.decode(&datagram) else {
            continue;
        };

        if peer == server {
            if msg.op == Op::Write {
                socket.send_to(&datagram, reports).await.unwrap();
            }
            if let Some(client) = clients.get(&msg.seq) {
                socket.send_to(&datagram, *client).await.unwrap();
            }
            continue;
        }

        clients.insert(msg.seq, peer);
        match msg.op {
            Op::Read => match cached_value(&controller, &switch, &msg.key).await {
                Some(value) => {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let reply = codec.encode_parts(Op::Read, msg.seq, &msg.key, &value).unwrap();
                    socket.send_to(&reply, peer).await.unwrap();
                }
                None => {
                    let miss = codec
                        .encode_parts(Op::ReadFail, msg.seq, &msg.key, &[])
                        .unwrap();
                    socket.send_to(&miss, server).await.unwrap();
                }
            },
            _ => {
                socket.send_to(&datagram, server).await.unwrap();
            }
        }
    }
}

/// Forwards stream requests to the server, mirroring FLUSH to the controller.
async fn run_stream_proxy(
    listener: TcpListener,
    server: SocketAddr,
    reports: SocketAddr,
    cancel: CancellationToken,
) {
    let codec = ProtocolCodec::new(wire());
    let mirror = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    loop {
        let (mut inbound, _) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(_) => return,
            },
        };

        let mut request = vec![0u8; wire().message_len()];
        if inbound.read_exact(&mut request).await.is_err() {
            continue;
        }
        if matches!(codec.decode(&request), Ok(msg) if msg.op == Op::Flush) {
            mirror.send_to(&request, reports).await.unwrap();
        }

        let mut outbound = TcpStream::connect(server).await.unwrap();
        outbound.write_all(&request).await.unwrap();
        let mut reply = Vec::new();
        outbound.read_to_end(&mut reply).await.unwrap();
        inbound.write_all(&reply).await.unwrap();
        inbound.shutdown().await.ok();
    }
}

async fn wait_resident(controller: &CacheController, key: &[u8], resident: bool) {
    for _ in 0..200 {
        if controller.is_resident(key).await == resident {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "key {:?} never became {}",
        String::from_utf8_lossy(key),
        if resident { "resident" } else { "absent" }
    );
}

#[tokio::test]
async fn test_miss_populates_cache_then_hits() {
    let mut deployment = Deployment::start(&[("alpha", "first value")]).await;

    let value = deployment.client.read(b"alpha").await.unwrap();
    assert_eq!(value, &b"first value"[..]);
    assert_eq!(deployment.hits.load(Ordering::SeqCst), 0);

    // The server only replied once the insert completed
    let entry = deployment.controller.entry(b"alpha").await.unwrap();
    assert_eq!(deployment.validity(entry.validity_id), PRESENT);
    assert_eq!(deployment.switch.entries(LOOKUP_TABLE).len(), 1);
    assert_eq!(deployment.events.events_of_type("KeyInserted").len(), 1);

    let value = deployment.client.read(b"alpha").await.unwrap();
    assert_eq!(value, &b"first value"[..]);
    assert_eq!(deployment.hits.load(Ordering::SeqCst), 1);
    assert_eq!(deployment.client.latency_stats().count(), 2);

    deployment.stop().await;
}

#[tokio::test]
async fn test_unknown_key_is_not_found_and_not_cached() {
    let mut deployment = Deployment::start(&[("alpha", "first value")]).await;

    assert_matches!(
        deployment.client.read(b"ghost").await,
        Err(Error::NotFound { .. })
    );
    assert!(!deployment.controller.is_resident(b"ghost").await);
    assert!(deployment.switch.entries(LOOKUP_TABLE).is_empty());

    deployment.stop().await;
}

#[tokio::test]
async fn test_flush_invalidates_and_next_read_reaches_server() {
    let mut deployment = Deployment::start(&[("alpha", "first value")]).await;

    deployment.client.read(b"alpha").await.unwrap();
    let entry = deployment.controller.entry(b"alpha").await.unwrap();

    deployment.client.flush(b"alpha").await.unwrap();
    wait_resident(&deployment.controller, b"alpha", false).await;
    assert_eq!(deployment.validity(entry.validity_id), ABSENT);
    assert!(deployment.switch.entries(LOOKUP_TABLE).is_empty());
    assert_eq!(deployment.events.events_of_type("KeyFlushed").len(), 1);

    deployment
        .client
        .write(b"alpha", b"second value")
        .await
        .unwrap();
    assert_eq!(
        deployment.server.get(b"alpha").unwrap(),
        &b"second value"[..]
    );

    let value = deployment.client.read(b"alpha").await.unwrap();
    assert_eq!(value, &b"second value"[..]);
    assert_eq!(deployment.hits.load(Ordering::SeqCst), 0);
    assert_eq!(
        deployment.controller.read_cached(b"alpha").await.unwrap(),
        &b"second value"[..]
    );

    deployment.stop().await;
}

#[tokio::test]
async fn test_flush_of_unknown_key() {
    let mut deployment = Deployment::start(&[]).await;

    assert_matches!(
        deployment.client.flush(b"ghost").await,
        Err(Error::NotFound { .. })
    );

    deployment.stop().await;
}

#[tokio::test]
async fn test_init_pushes_whole_store_into_cache() {
    let mut deployment =
        Deployment::start(&[("alpha", "one"), ("beta", "two"), ("gamma", "three")]).await;

    let chunks = deployment.client.init(0).await.unwrap();
    assert_eq!(chunks, 3);

    for (key, value) in [("alpha", "one"), ("beta", "two"), ("gamma", "three")] {
        wait_resident(&deployment.controller, key.as_bytes(), true).await;
        assert_eq!(
            deployment.controller.read_cached(key.as_bytes()).await.unwrap(),
            value.as_bytes()
        );
    }
    assert_eq!(deployment.switch.entries(LOOKUP_TABLE).len(), 3);

    let value = deployment.client.read(b"beta").await.unwrap();
    assert_eq!(value, &b"two"[..]);
    assert_eq!(deployment.hits.load(Ordering::SeqCst), 1);

    deployment.stop().await;
}

#[tokio::test]
async fn test_miss_on_full_cache_is_answered_without_waiting() {
    let dataset: Vec<(String, String)> = (0..17)
        .map(|i| (format!("k{}", i), format!("v{}", i)))
        .collect();
    let pairs: Vec<(&str, &str)> = dataset
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let mut deployment = Deployment::start(&pairs).await;

    // One validity id per row, so 16 keys exhaust the cache
    for (key, value) in &pairs[..16] {
        let read = deployment.client.read(key.as_bytes()).await.unwrap();
        assert_eq!(read, value.as_bytes());
    }
    assert_eq!(deployment.switch.entries(LOOKUP_TABLE).len(), 16);

    let started = std::time::Instant::now();
    let value = deployment.client.read(b"k16").await.unwrap();
    assert_eq!(value, &b"v16"[..]);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "refused insert held the reply for {:?}",
        started.elapsed()
    );
    assert!(!deployment.controller.is_resident(b"k16").await);
    assert_eq!(deployment.events.events_of_type("OperationRejected").len(), 1);

    deployment.stop().await;
}
