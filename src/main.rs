//! MinIO Operator
//!
//! Watches `Minio` resources and keeps their pods, services and buckets
//! converged.
//!
//! The process runs one watch per kind, a pool of reconcile workers fed
//! by the trigger queue, a health server and a metrics server.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use minio_operator::{
    crd::crd_yaml, install_crd, Controller, ControllerConfig, Error, Informers,
    KubeClusterClient, Metrics, MinioConnector, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// MinIO Operator - runs MinIO servers declared as Minio resources
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Number of parallel reconcile workers
    #[arg(long, env = "WORKERS", default_value = "1")]
    workers: usize,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

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

    /// How long a created pod may take to become ready
    #[arg(long, env = "POD_READY_TIMEOUT", default_value = "30")]
    pod_ready_timeout_secs: u64,

    /// Poll interval of the pod readiness wait
    #[arg(long, env = "POD_READY_INTERVAL", default_value = "1000")]
    pod_ready_interval_ms: u64,

    /// How long a MinIO server may take to come online
    #[arg(long, env = "BOOTSTRAP_TIMEOUT", default_value = "60")]
    bootstrap_timeout_secs: u64,

    /// Poll interval of the bootstrap loop
    #[arg(long, env = "BOOTSTRAP_INTERVAL", default_value = "10")]
    bootstrap_interval_secs: u64,

    /// Region buckets are created in
    #[arg(long, env = "BUCKET_REGION", default_value = "us-east-1")]
    bucket_region: String,

    /// Apply the Minio CRD on startup
    #[arg(long, env = "INSTALL_CRD")]
    install_crd: bool,

    /// How long to wait for the initial cache listing
    #[arg(long, env = "CACHE_SYNC_TIMEOUT", default_value = "120")]
    cache_sync_timeout_secs: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the Minio CRD as YAML and exit
    Crd,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            pod_ready_timeout: Duration::from_secs(self.pod_ready_timeout_secs),
            pod_ready_interval: Duration::from_millis(self.pod_ready_interval_ms),
            bootstrap_timeout: Duration::from_secs(self.bootstrap_timeout_secs),
            bootstrap_interval: Duration::from_secs(self.bootstrap_interval_secs),
            bucket_region: self.bucket_region.clone(),
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            ..Default::default()
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::Crd) = args.command {
        print!("{}", crd_yaml()?);
        return Ok(());
    }

    init_logging(&args);

    info!("Starting MinIO Operator");
    info!("  Version: {}", minio_operator::VERSION);
    info!("  Workers: {}", args.workers);
    info!("  Namespace: {}", args.namespace.as_deref().unwrap_or("<all>"));
    info!("  Bucket region: {}", args.bucket_region);

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    if args.install_crd {
        install_crd(client.clone(), Duration::from_secs(30))
            .await
            .context("Failed to install the Minio CRD")?;
    }

    let shutdown = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = Arc::clone(&ready);
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let registry = prometheus::Registry::new();
    let metrics = Metrics::new(&registry).context("Failed to register metrics")?;
    let metrics_addr = args.metrics_addr.clone();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, registry, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Wire the controller to the watches
    let informers = Informers::new();
    let connector = MinioConnector::new(args.bucket_region.clone(), Duration::from_secs(5))
        .context("Failed to build object store client")?;
    let controller = Controller::new(
        informers.caches(),
        Arc::new(KubeClusterClient::new(client.clone())),
        Arc::new(connector),
        args.controller_config(),
        metrics,
        shutdown.clone(),
    );
    informers.minios.add_event_handler(controller.minio_handler());
    informers.pods.add_event_handler(controller.pod_handler());
    informers.services.add_event_handler(controller.service_handler());

    let watches = informers.spawn(client, args.namespace.as_deref(), &shutdown);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_shutdown.cancel();
    });

    match controller.start(args.workers, shutdown.clone()).await {
        Ok(()) => {
            ready.store(true, Ordering::SeqCst);
            info!("Operator ready");
            shutdown.cancelled().await;
        }
        Err(Error::Cancelled { .. }) => info!("Shutdown before caches synced"),
        Err(e) => {
            shutdown.cancel();
            return Err(e).context("Controller failed to start");
        }
    }

    controller.stop().await;
    for watch in watches {
        if let Err(e) = watch.await {
            warn!("Watch task failed: {}", e);
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
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

    let filter = ["hyper=warn", "kube=info", "tower=warn", "rustls=warn"]
        .iter()
        .filter_map(|d| d.parse::<tracing_subscriber::filter::Directive>().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

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
// HTTP Servers
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: &str,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = Arc::clone(&ready);
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "caches not synced"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

async fn run_metrics_server(
    addr: &str,
    registry: prometheus::Registry,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    if let Ok(value) = encoder.format_type().parse::<header::HeaderValue>() {
                                        response.headers_mut().insert(header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
