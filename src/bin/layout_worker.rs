//! Layout Worker Binary
//!
//! One binary, four modes:
//!
//! - `standalone`: serve the layout API with embedded workers, no external queue
//! - `worker` (alias `celery`): join the distributed worker pool on the
//!   `graph_processing`, `optimization` and `persistence` queues
//! - `single`: run exactly one layout against the graph store and exit
//! - `health`: probe the graph store once; exit code 0 = healthy, 1 otherwise
//!
//! ## Configuration
//!
//! Flags override environment variables, which override defaults. A `.env`
//! file in the working directory is loaded first.
//!
//! - `DATABASE_URL`: PostgreSQL connection string
//! - `BATCH_SIZE`, `MAX_WORKERS`, `CONVERSION_TIMEOUT_SECONDS`: see `WorkerConfig`
//! - `PORT` (default: 8002), `HOST` (default: 0.0.0.0)
//! - `RUST_LOG`: Log level filter (default: info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//!
//! ## Usage
//!
//! ```bash
//! DATABASE_URL=postgresql://... cargo run --bin layout_worker --features service -- worker
//! cargo run --bin layout_worker --features service -- single --labels Article
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::middleware;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use knowledge_map_layering::coordinator::{QueueName, StageExecutor, WorkerPool};
use knowledge_map_layering::layering::ProgressRegistry;
use knowledge_map_layering::service::{
    create_router, metrics_middleware, request_logging_middleware, ServiceState,
};
use knowledge_map_layering::{
    DistributedLayoutCoordinator, LayoutOptions, NodeFilter, PostgresConfig, PostgresLayoutStore,
    PostgresTaskBroker, WorkerConfig,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long to wait for the first database connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "layout_worker", version, about = "Knowledge-map layout worker")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Args)]
struct Settings {
    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Nodes per sorter batch.
    #[arg(long, env = "BATCH_SIZE", global = true)]
    batch_size: Option<usize>,

    /// Concurrent workers in this process.
    #[arg(long, env = "MAX_WORKERS", global = true)]
    max_workers: Option<usize>,

    /// Per-run wall-clock cap in seconds.
    #[arg(long = "timeout", env = "CONVERSION_TIMEOUT_SECONDS", global = true)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Serve the layout API with embedded workers.
    Standalone {
        #[arg(long, env = "HOST")]
        host: Option<String>,
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },
    /// Consume stage tasks from the shared queue.
    #[command(alias = "celery")]
    Worker {
        /// Queues to consume; all of them by default.
        #[arg(long, value_delimiter = ',')]
        queues: Vec<String>,
    },
    /// Run one layout and exit.
    Single {
        /// Node labels to include; any match selects a node.
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
        /// JSON object of required property values.
        #[arg(long)]
        filters: Option<String>,
        /// JSON-encoded layout options.
        #[arg(long)]
        options: Option<String>,
        /// Submit stages to the shared queue instead of running them here.
        #[arg(long)]
        distributed: bool,
    },
    /// Probe the graph store once.
    Health,
}

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "layout_worker=info,knowledge_map_layering=info,layout=info,tower_http=info,sqlx=warn"
            .into()
    });

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .init();
    }
}

fn worker_config(settings: &Settings) -> Result<WorkerConfig, BoxError> {
    let mut config = WorkerConfig::from_env();
    if let Some(batch_size) = settings.batch_size {
        config = config.with_batch_size(batch_size);
    }
    if let Some(max_workers) = settings.max_workers {
        config = config.with_max_workers(max_workers);
    }
    if let Some(secs) = settings.timeout_secs {
        config = config.with_timeout(Duration::from_secs(secs));
    }
    config.validate()?;
    Ok(config)
}

async fn connect_store(settings: &Settings) -> Result<PostgresLayoutStore, BoxError> {
    let mut config = PostgresConfig::from_env();
    if let Some(url) = &settings.database_url {
        config = config.with_database_url(url.clone());
    }

    info!("Connecting to PostgreSQL...");
    let connect_start = Instant::now();
    let store = match tokio::time::timeout(CONNECT_TIMEOUT, PostgresLayoutStore::new(config)).await {
        Ok(Ok(store)) => store,
        Ok(Err(e)) => {
            error!(error = %e, "Failed to connect to PostgreSQL");
            return Err(e.into());
        }
        Err(_) => {
            error!("PostgreSQL connection timeout after 30s");
            return Err("Database connection timeout".into());
        }
    };
    info!(
        latency_ms = connect_start.elapsed().as_millis() as u64,
        "PostgreSQL connection established"
    );
    Ok(store)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

async fn run_standalone(
    settings: &Settings,
    config: WorkerConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), BoxError> {
    let host = host.unwrap_or_else(|| config.host.clone());
    let port = port.unwrap_or(config.port);

    let app = if settings.database_url.is_some() {
        let store = connect_store(settings).await?;
        create_router(ServiceState::new(store, config))
    } else {
        info!("No DATABASE_URL, serving without a graph store");
        create_router(ServiceState::<PostgresLayoutStore>::detached(config))
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = app
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Layout service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Layout service shutdown complete");
    Ok(())
}

async fn run_worker(
    settings: &Settings,
    config: WorkerConfig,
    queues: Vec<String>,
) -> Result<(), BoxError> {
    let queues = if queues.is_empty() {
        QueueName::ALL.to_vec()
    } else {
        queues
            .iter()
            .map(|q| QueueName::parse(q).ok_or_else(|| format!("unknown queue: {q}")))
            .collect::<Result<Vec<_>, _>>()?
    };

    let store = connect_store(settings).await?;
    store.migrate().await?;
    let broker = PostgresTaskBroker::new(store.pool().clone());
    broker.migrate().await?;

    let workers = config.max_workers;
    let executor = Arc::new(StageExecutor::new(
        Arc::new(store),
        config,
        Arc::new(ProgressRegistry::new()),
    ));
    let pool = WorkerPool::spawn(executor, Arc::new(broker), queues, workers);

    shutdown_signal().await;
    pool.shutdown().await;
    Ok(())
}

fn parse_filter(labels: Vec<String>, filters: Option<&str>) -> Result<NodeFilter, BoxError> {
    let mut filter = NodeFilter::with_labels(labels.into_iter().filter(|l| !l.is_empty()));
    if let Some(raw) = filters {
        let properties: BTreeMap<String, Value> = serde_json::from_str(raw)
            .map_err(|e| format!("--filters must be a JSON object: {e}"))?;
        filter.properties = properties;
    }
    Ok(filter)
}

async fn run_single(
    settings: &Settings,
    config: WorkerConfig,
    filter: NodeFilter,
    options: LayoutOptions,
    distributed: bool,
) -> Result<bool, BoxError> {
    let store = connect_store(settings).await?;
    store.migrate().await?;
    let store = Arc::new(store);

    let outcome = if distributed {
        let broker = PostgresTaskBroker::new(store.pool().clone());
        broker.migrate().await?;
        let coordinator =
            DistributedLayoutCoordinator::with_broker(store, Arc::new(broker), config);
        coordinator.calculate_layout(&filter, &options).await
    } else {
        let coordinator = DistributedLayoutCoordinator::in_process(store, config);
        let outcome = coordinator.calculate_layout(&filter, &options).await;
        coordinator.shutdown().await;
        outcome
    };

    let (ok, summary) = match outcome {
        Ok(result) => (
            true,
            json!({
                "success": true,
                "run_id": result.run_id,
                "layout_hash": result.layout_hash,
                "statistics": result.statistics,
            }),
        ),
        Err(failure) => (
            false,
            json!({
                "success": false,
                "run_id": failure.run_id,
                "error_code": failure.error.code(),
                "error_message": failure.error.to_string(),
                "statistics": failure.statistics,
            }),
        ),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ok)
}

async fn run_health(settings: &Settings) -> bool {
    let store = match connect_store(settings).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Health check failed: store unreachable");
            return false;
        }
    };
    let healthy = store.is_healthy().await;
    let stats = store.pool_stats();
    info!(
        healthy,
        pool_size = stats.size,
        pool_idle = stats.idle,
        pool_max = stats.max,
        "Health check finished"
    );
    healthy
}

async fn run(cli: Cli) -> Result<bool, BoxError> {
    let config = worker_config(&cli.settings)?;
    info!(
        batch_size = config.batch_size,
        max_workers = config.max_workers,
        timeout_secs = config.conversion_timeout.as_secs(),
        "Worker configuration loaded"
    );

    match cli.mode {
        Mode::Standalone { host, port } => {
            run_standalone(&cli.settings, config, host, port).await?;
            Ok(true)
        }
        Mode::Worker { queues } => {
            run_worker(&cli.settings, config, queues).await?;
            Ok(true)
        }
        Mode::Single {
            labels,
            filters,
            options,
            distributed,
        } => {
            let filter = parse_filter(labels, filters.as_deref())?;
            let options = match options {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| format!("--options must be JSON layout options: {e}"))?,
                None => LayoutOptions::default(),
            };
            run_single(&cli.settings, config, filter, options, distributed).await
        }
        Mode::Health => Ok(run_health(&cli.settings).await),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build_sha = option_env!("BUILD_SHA").unwrap_or("dev"),
        mode = ?cli.mode,
        "Starting layout worker"
    );

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Layout worker failed");
            ExitCode::FAILURE
        }
    }
}
