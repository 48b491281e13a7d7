//! Local Volume Manager
//!
//! Per-node daemon: discovers directories under the configured roots,
//! publishes them as node-pinned volumes, binds claims to them and recycles
//! them once their claim is deleted.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use local_volume_manager::{
    ApiServer, ApiServerConfig, ClusterApiRef, DiscoveryConfig, Error, KubeClusterApi,
    LifecycleManager, LocalHostFs, LocalShellExecutor, ManagerConfig, ManagerMetrics,
    MemoryCluster, NodeName, Result, DEFAULT_CONFIG_MAP_NAME, DEFAULT_NODE_LABEL_KEY,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Local Volume Manager - node-local persistent volume lifecycle
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the node this instance manages
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Namespace holding the discovery config map
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of the discovery config map
    #[arg(long, env = "VOLUME_CONFIG", default_value = DEFAULT_CONFIG_MAP_NAME)]
    volume_config: String,

    /// Read discovery roots from a YAML file instead of the config map
    #[arg(long, env = "VOLUME_CONFIG_FILE")]
    volume_config_file: Option<PathBuf>,

    /// Node label pinning published volumes to this node
    #[arg(long, env = "NODE_LABEL_KEY", default_value = DEFAULT_NODE_LABEL_KEY)]
    node_label_key: String,

    /// Directory scan interval in seconds
    #[arg(long, env = "SCAN_INTERVAL", default_value = "10")]
    scan_interval_secs: u64,

    /// Publish, bind and recreation interval in seconds
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "5")]
    reconcile_interval_secs: u64,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run against an in-memory cluster (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Local Volume Manager");
    info!("  Version: {}", local_volume_manager::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let node = NodeName::new(args.node_name.clone());
    let cluster = connect(&args).await?;
    let discovery = match &args.volume_config_file {
        Some(path) => DiscoveryConfig::from_file(path)?,
        None => {
            DiscoveryConfig::load(cluster.as_ref(), &args.namespace, &args.volume_config).await?
        }
    };

    let executor = Arc::new(LocalShellExecutor::new(node.clone()));
    let host_fs = Arc::new(LocalHostFs::new(node.clone(), executor));

    let config = ManagerConfig {
        node_name: node,
        node_label_key: args.node_label_key.clone(),
        discovery,
        scan_interval: Duration::from_secs(args.scan_interval_secs),
        reconcile_interval: Duration::from_secs(args.reconcile_interval_secs),
        ..Default::default()
    };
    let manager = LifecycleManager::initialize(config, cluster, host_fs).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!("Cannot listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_manager).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics = manager.metrics().clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
    };
    let api_server = ApiServer::new(api_config, manager.clone());
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move { api_server.run(api_shutdown).await });

    let outcome = manager.run(shutdown.clone()).await;
    shutdown.cancel();
    match api_handle.await {
        Ok(Err(e)) => error!("REST server error: {}", e),
        Err(e) => error!("REST server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Manager shutdown complete");
    outcome
}

/// Build the cluster adapter for the selected mode
async fn connect(args: &Args) -> Result<ClusterApiRef> {
    if !args.standalone {
        return Ok(Arc::new(KubeClusterApi::try_default().await?));
    }

    if args.volume_config_file.is_none() {
        return Err(Error::Configuration(
            "--volume-config-file is required in standalone mode".into(),
        ));
    }
    let cluster = MemoryCluster::new();
    cluster.add_node(
        &args.node_name,
        &[(args.node_label_key.as_str(), args.node_name.as_str())],
    );
    Ok(Arc::new(cluster))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info"] {
        filter = filter.add_directive(directive.parse().map_err(|e| {
            Error::Configuration(format!("Invalid log directive {}: {}", directive, e))
        })?);
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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn plain(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, manager: Arc<LifecycleManager>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = manager.is_ready();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => plain(StatusCode::OK, "ok"),
                        "/readyz" if ready => plain(StatusCode::OK, "ok"),
                        "/readyz" => plain(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => plain(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<ManagerMetrics>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(text) => {
                                let mut response = plain(StatusCode::OK, text);
                                response.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static(prometheus::TEXT_FORMAT),
                                );
                                response
                            }
                            Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => plain(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
