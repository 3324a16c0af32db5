//! NetCache
//!
//! Command line entry point for the three NetCache roles.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            netcache                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  controller  │    │    server    │    │    client    │       │
//! │  │  (switch     │◀──▶│  (backend    │◀───│  (reads,     │       │
//! │  │   programs)  │OOB │   store)     │    │   flushes)   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netcache::adapters::{
    LoggingEventPublisher, RetryingSwitch, SimulatedSwitch, SwitchCli, UnixNotifier, DEFAULT_CLI,
};
use netcache::client::{default_server_ips, CacheClient, ClientConfig, PartitionScheme};
use netcache::controller::{CacheController, ReportFraming, ReportListener};
use netcache::domain::ports::SwitchControl;
use netcache::error::{Error, Result};
use netcache::metrics::CacheMetrics;
use netcache::server::{load_datasets, BackendServer, ServerConfig};
use netcache::{DeploymentConfig, ProtocolCodec};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NetCache - in-network key-value cache control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deployment configuration file (YAML)
    #[arg(long, global = true, env = "NETCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Program the switch and react to its reports
    Controller(ControllerArgs),
    /// Run the backend key-value server
    Server(ServerArgs),
    /// Issue requests against the deployment
    Client(ClientArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SwitchBackend {
    /// Runtime CLI of the software switch
    Cli,
    /// In-memory switch model
    Simulate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Framing {
    Payload,
    Frame,
}

#[derive(clap::Args, Debug)]
struct ControllerArgs {
    /// Switch control backend
    #[arg(long, env = "NETCACHE_SWITCH", value_enum, default_value = "cli")]
    switch: SwitchBackend,

    /// Thrift port of the switch runtime
    #[arg(long, env = "THRIFT_PORT")]
    thrift_port: Option<u16>,

    /// Runtime CLI binary
    #[arg(long, env = "SWITCH_CLI", default_value = DEFAULT_CLI)]
    cli_binary: String,

    /// Switch port connected to the controller
    #[arg(long, env = "CPU_PORT")]
    cpu_port: Option<u32>,

    /// Address receiving mirrored reports
    #[arg(long, env = "REPORT_ADDR")]
    report_addr: Option<SocketAddr>,

    /// How reports are framed
    #[arg(long, value_enum, default_value = "payload")]
    report_framing: Framing,

    /// Do not signal the backend server after inserts
    #[arg(long)]
    no_notify: bool,

    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,
}

#[derive(clap::Args, Debug)]
struct ServerArgs {
    /// Address to bind
    #[arg(long, env = "BIND_IP", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Serve reads directly instead of through the cache
    #[arg(long)]
    disable_cache: bool,

    /// Dataset files used to pre-populate the store
    #[arg(long, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Do not wait for the controller's completion signal
    #[arg(long)]
    no_oob: bool,

    /// Longest wait for a completion signal (milliseconds)
    #[arg(long, default_value = "2000")]
    completion_timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct ClientArgs {
    /// Number of servers in the reference topology
    #[arg(long, default_value = "1")]
    servers: usize,

    /// Explicit server addresses (overrides --servers)
    #[arg(long = "server", num_args = 1..)]
    server_ips: Vec<IpAddr>,

    /// Talk to servers on the no-cache port
    #[arg(long)]
    disable_cache: bool,

    /// Key partitioning scheme (range, hash, consistent-hash)
    #[arg(long, default_value = "range")]
    scheme: PartitionScheme,

    /// Reply timeout (milliseconds)
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    #[command(subcommand)]
    request: ClientRequest,
}

#[derive(Subcommand, Debug)]
enum ClientRequest {
    /// Read a key
    Read { key: String },
    /// Write a key
    Write { key: String, value: String },
    /// Evict a key from the cache
    Flush { key: String },
    /// Ask a server to push its store into the cache
    Init {
        #[arg(long, default_value = "0")]
        index: usize,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = match &args.config {
        Some(path) => DeploymentConfig::from_yaml_file(path)?,
        None => DeploymentConfig::default(),
    };

    match args.command {
        Command::Controller(cmd) => run_controller(config, cmd).await,
        Command::Server(cmd) => run_server(config, cmd).await,
        Command::Client(cmd) => run_client(config, cmd).await,
    }
}

// =============================================================================
// Controller
// =============================================================================

async fn run_controller(mut config: DeploymentConfig, args: ControllerArgs) -> Result<()> {
    if let Some(port) = args.thrift_port {
        config.thrift_port = port;
    }
    if args.cpu_port.is_some() {
        config.cpu_port = args.cpu_port;
    }
    config.validate()?;

    info!("Starting NetCache controller");
    info!("  Switch backend: {:?}", args.switch);
    info!(
        "  Layout: {} rows x {} lanes x {} bytes",
        config.layout.rows, config.layout.lanes, config.layout.slot_size
    );
    info!("  Thrift port: {}", config.thrift_port);
    info!("  CPU port: {:?}", config.cpu_port);

    let metrics = CacheMetrics::new()?;

    let backend: Arc<dyn SwitchControl> = match args.switch {
        SwitchBackend::Cli => Arc::new(SwitchCli::with_program(
            args.cli_binary.clone(),
            config.thrift_port,
        )),
        SwitchBackend::Simulate => Arc::new(SimulatedSwitch::new()),
    };
    let switch = Arc::new(
        RetryingSwitch::new(backend, config.retry).with_retry_counter(metrics.rpc_retries.clone()),
    );

    let mut controller = CacheController::new(config.layout, config.wire.key_width, switch)?
        .with_metrics(metrics.clone())
        .with_event_publisher(Arc::new(LoggingEventPublisher::info_level()))
        .with_cpu_port(config.cpu_port);
    if !args.no_notify {
        controller = controller.with_notifier(Arc::new(UnixNotifier::new(&config.oob_path)));
    }
    let controller = Arc::new(controller);

    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    // Start metrics and health server
    let http_state = Arc::new(HttpState {
        metrics,
        ready: ready.clone(),
    });
    let http_cancel = cancel.clone();
    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = run_http_server(metrics_addr, http_state, http_cancel).await {
            error!("Metrics server error: {}", e);
        }
    });

    if let Err(e) = controller.setup().await {
        error!("Switch setup failed: {}", e);
        cancel.cancel();
        return Err(e);
    }
    ready.store(true, Ordering::SeqCst);

    let report_addr = args.report_addr.unwrap_or_else(|| {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.report_port)
    });
    let framing = match args.report_framing {
        Framing::Payload => ReportFraming::Payload,
        Framing::Frame => ReportFraming::Frame,
    };
    let listener = ReportListener::bind(report_addr, controller, ProtocolCodec::new(config.wire))
        .await?
        .with_framing(framing);

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal_cancel.cancel();
    });

    listener.run(cancel).await?;
    info!("Controller shutdown complete");
    Ok(())
}

// =============================================================================
// Server
// =============================================================================

async fn run_server(config: DeploymentConfig, args: ServerArgs) -> Result<()> {
    let server_config = ServerConfig {
        bind_ip: args.bind,
        port: config.server_port(args.disable_cache),
        nocache: args.disable_cache,
        wire: config.wire,
        oob_path: (!args.no_oob).then(|| config.oob_path.clone()),
        completion_timeout: Duration::from_millis(args.completion_timeout_ms),
        ..Default::default()
    };

    info!("Starting NetCache server");
    info!("  Bind: {}:{}", server_config.bind_ip, server_config.port);
    info!("  No-cache mode: {}", server_config.nocache);
    info!("  Out-of-band channel: {:?}", server_config.oob_path);

    let server = BackendServer::new(server_config)?;
    if !args.input.is_empty() {
        server.populate(load_datasets(&args.input)?);
    }

    let mut handle = server.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        result = handle.wait() => return result,
    }

    handle.shutdown().await
}

// =============================================================================
// Client
// =============================================================================

async fn run_client(config: DeploymentConfig, args: ClientArgs) -> Result<()> {
    let servers = if args.server_ips.is_empty() {
        default_server_ips(args.servers)?
    } else {
        args.server_ips
    };
    let mut client = CacheClient::connect(ClientConfig {
        servers,
        port: config.server_port(args.disable_cache),
        wire: config.wire,
        scheme: args.scheme,
        timeout: Duration::from_millis(args.timeout_ms),
    })
    .await?;

    match args.request {
        ClientRequest::Read { key } => {
            let value = client.read(key.as_bytes()).await?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        ClientRequest::Write { key, value } => {
            client.write(key.as_bytes(), value.as_bytes()).await?;
            println!("OK");
        }
        ClientRequest::Flush { key } => {
            client.flush(key.as_bytes()).await?;
            println!("OK");
        }
        ClientRequest::Init { index } => {
            let chunks = client.init(index).await?;
            println!("{} chunks written", chunks);
        }
    }

    let summary = client.latency_stats().summary();
    info!(
        count = summary.count,
        mean_us = summary.mean_us,
        std_dev_us = summary.std_dev_us,
        "Request latency"
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics & Health Server
// =============================================================================

struct HttpState {
    metrics: CacheMetrics,
    ready: Arc<AtomicBool>,
}

async fn run_http_server(
    addr: SocketAddr,
    state: Arc<HttpState>,
    cancel: CancellationToken,
) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    fn route(req: &Request<hyper::body::Incoming>, state: &HttpState) -> Response<Full<Bytes>> {
        match req.uri().path() {
            "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
            "/readyz" => {
                if state.ready.load(Ordering::SeqCst) {
                    respond(StatusCode::OK, "ok")
                } else {
                    respond(StatusCode::SERVICE_UNAVAILABLE, "switch setup pending")
                }
            }
            "/metrics" => match state.metrics.gather_text() {
                Ok(text) => {
                    let mut response = respond(StatusCode::OK, text);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4"),
                    );
                    response
                }
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            _ => respond(StatusCode::NOT_FOUND, "not found"),
        }
    }

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?,
        };

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = route(&req, &state);
                async move { Ok::<_, std::convert::Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
