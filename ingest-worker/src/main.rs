//! Accept source files over HTTP, transform them into staging and merge them into production.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use health::HealthRegistry;
use ingest_common::{metrics::serve, metrics::setup_metrics_router};
use ingest_common::{PgControlStore, PgMergeEngine, PoolConfig};
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ingest_worker::config::Config;
use ingest_worker::handlers::{add_routes, AppState};
use ingest_worker::queue::job_queue;
use ingest_worker::source::SourceResolver;
use ingest_worker::submit::Submitter;
use ingest_worker::transform::ProcessTransform;
use ingest_worker::worker::{requeue_pending, IngestWorker};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()
        .map_err(|error| eyre::eyre!("invalid configuration: {:?}", error))?;

    let pool = PoolConfig::new(&config.database_url, config.max_pg_connections)
        .connect()
        .await?;
    if config.run_migrations {
        sqlx::migrate!("../migrations").run(&pool).await?;
    }

    let store = Arc::new(PgControlStore::from_pool(pool.clone()));
    let merge = Arc::new(PgMergeEngine::from_pool(pool));
    let transform = Arc::new(
        ProcessTransform::new(
            config.transform.program.as_str(),
            config.transform.args(),
        )
        .timeout(config.transform.timeout()),
    );
    let connection_string = config
        .transform
        .connection_string
        .as_ref()
        .map_or(config.database_url.as_str(), |s| s.as_str());

    let sources = SourceResolver::new(config.source_root.as_str());
    let (producer, consumer) = job_queue();
    requeue_pending(&*store, &producer, config.pending_recovery_limit).await?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register(
            "worker".to_string(),
            time::Duration::try_from(config.liveness_deadline.0)?,
        )
        .await;

    let shutdown = CancellationToken::new();
    let worker = IngestWorker::new(
        store.clone(),
        merge,
        transform,
        consumer,
        sources.clone(),
        worker_liveness,
    )
    .heartbeat_interval(config.heartbeat_interval.0)
    .chunk_size(config.chunk_size)
    .connection_string(connection_string);
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let state = AppState {
        submitter: Submitter::new(store, producer, sources),
        default_source_system: config.default_source_system.as_str().to_owned(),
    };
    let router = add_routes(setup_metrics_router()?, state, liveness);
    let bind = config.bind();
    let server_handle = tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!("failed to serve http on {}: {}", bind, error);
        }
    });
    info!(bind = %config.bind(), "listening");

    wait_for_shutdown_signal().await?;
    shutdown.cancel();
    worker_handle.await?;
    server_handle.abort();

    info!("shut down");
    Ok(())
}
