//! Mintstream Engine
//!
//! A resumable NFT collection indexer.
//!
//! # Architecture
//!
//! - **Collection Queue**: claims queued collections and feeds the worker pool
//! - **Collection Pipeline**: per-collection state machine driving mint
//!   discovery, token metadata/images, and trait aggregation
//! - **Monitor**: re-enqueues stuck or errored collections
//! - **Admin API**: enqueue trigger for operators
//!
//! # Graceful Shutdown
//!
//! On SIGTERM or SIGINT every service gets the broadcast shutdown signal and
//! a bounded grace period to stop at a persisted step; whatever is still
//! running after that is aborted. A worker killed mid-run loses nothing
//! durable: its claim goes stale and the monitor re-enqueues the collection.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mintstream::api::{self, ApiState};
use mintstream::config::Config;
use mintstream::error::Result;
use mintstream::fetch::{FsBlobStore, HttpStatsProvider, MetadataFetcher};
use mintstream::pipeline::{trait_frequency_scorer, CollectionRunner, PipelineContext};
use mintstream::provider::ProviderPool;
use mintstream::queue::CollectionQueue;
use mintstream::store::memory::MemoryDocStore;
use mintstream::store::postgres::PgDocStore;
use mintstream::store::DocStore;

/// Per-crate log directives used when RUST_LOG is not set. The noisy
/// dependencies stay at warn so pipeline progress is readable.
const DEFAULT_LOG_DIRECTIVES: &str = "mintstream=debug,tower_http=info,sqlx=warn,hyper=warn,info";

/// How long services get to wind down after the shutdown broadcast before
/// they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  🚀 Mintstream Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Components:");
    info!("    • Collection Queue + Worker Pool");
    info!("    • Collection Creation Pipeline");
    info!("    • Claim-Staleness Monitor");
    info!("    • Admin API Server");
    info!("═══════════════════════════════════════════════════════════════");

    // Load configuration
    let config = Config::from_env()?;
    let config = Arc::new(config);
    info!("✅ Configuration loaded and validated");

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize the document store
    let store: Arc<dyn DocStore> = match config.store.backend.as_str() {
        "memory" => {
            warn!("Using in-memory document store; documents do not survive restarts");
            Arc::new(MemoryDocStore::new())
        }
        _ => {
            let pg = PgDocStore::connect(&config.store.database, config.store.queue_poll_interval)
                .await?;
            pg.health_check().await?;
            Arc::new(pg)
        }
    };
    info!("✅ Document store ready ({})", config.store.backend);

    // Build the RPC provider pools
    let providers = Arc::new(ProviderPool::from_config(&config.chains)?);
    info!(
        "✅ Provider pools ready for chains: {:?}",
        config.chains.chain_ids()
    );

    // Shared pipeline context: explicit construction, no ambient registry
    let fetcher = Arc::new(MetadataFetcher::new(&config.fetch)?);
    let blob = Arc::new(FsBlobStore::new(
        config.fetch.blob_dir.clone(),
        config.fetch.blob_base_url.clone(),
    ));
    let stats = Arc::new(HttpStatsProvider::new(&config.fetch)?);
    let runner = Arc::new(CollectionRunner::new(Arc::new(PipelineContext {
        store: store.clone(),
        providers,
        fetcher,
        blob,
        stats,
        scorer: trait_frequency_scorer(),
        pipeline: config.pipeline.clone(),
    })));

    let queue = CollectionQueue::new(store.clone(), runner, config.queue.clone());

    // Every service runs as a named task in one supervision set; the first
    // one to exit on its own brings the whole engine down for a restart.
    let mut services: JoinSet<&'static str> = JoinSet::new();

    info!("🔍 Starting collection queue ({} workers)...", config.queue.workers);
    services.spawn({
        let queue = queue.clone();
        let shutdown = shutdown_tx.subscribe();
        async move {
            queue.run(shutdown).await;
            "collection queue"
        }
    });

    info!("🩺 Starting claim-staleness monitor...");
    services.spawn({
        let queue = queue.clone();
        let shutdown = shutdown_tx.subscribe();
        async move {
            queue.monitor(shutdown).await;
            "queue monitor"
        }
    });

    info!("🌐 Starting API server on port {}...", config.api.port);
    services.spawn(run_api(
        store.clone(),
        config.clone(),
        shutdown_tx.subscribe(),
    ));

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started successfully");
    info!("  📡 API: http://{}:{}", config.api.host, config.api.port);
    info!("═══════════════════════════════════════════════════════════════");

    // Run until a termination signal arrives or a service dies on its own.
    tokio::select! {
        signal = termination_signal() => {
            info!("📴 {} received", signal);
        }
        Some(exited) = services.join_next() => {
            match exited {
                Ok(name) => warn!("⚠️ {} exited unexpectedly", name),
                Err(e) => warn!("⚠️ a service panicked: {}", e),
            }
        }
    }

    // Graceful shutdown: broadcast, then give the remaining services a
    // bounded window to stop at a persisted step.
    info!("🛑 Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    let drain = async {
        while let Some(exited) = services.join_next().await {
            if let Ok(name) = exited {
                info!("  ✅ {} stopped", name);
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("⚠️ Shutdown grace period expired, aborting remaining services");
        services.shutdown().await;
    }

    info!("👋 Mintstream Engine stopped gracefully");
    Ok(())
}

/// Structured logging setup. Same builder shape as the enqueue CLI, with
/// the engine's default directives and color only when stdout is a tty.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal())
        .init();
}

/// The admin API as a supervised service: serve until failure or shutdown.
async fn run_api(
    store: Arc<dyn DocStore>,
    config: Arc<Config>,
    mut shutdown: broadcast::Receiver<()>,
) -> &'static str {
    let state = Arc::new(ApiState {
        store,
        chains: config.chains.chain_ids(),
        queue_cfg: config.queue.clone(),
    });

    tokio::select! {
        result = api::start_server(state, &config.api.host, config.api.port, config.api.cors_enabled) => {
            if let Err(e) = result {
                error!("API server error: {:?}", e);
            }
        }
        _ = shutdown.recv() => {
            info!("API server shutting down");
        }
    }
    "admin api"
}

/// Resolve once the process is asked to terminate, naming the signal for
/// the shutdown log.
#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    "ctrl-c"
}
