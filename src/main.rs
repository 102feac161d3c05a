//! Settlement Relayer - cross-chain intent settlement
//!
//! Runs the liquidity and intent-processor queues: CCTP transfers, batched
//! proves and withdrawals, and per-wallet balance checks.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use settlement_relayer::chain::{ChainClients, IndexerClient, IrisClient};
use settlement_relayer::config::{Settings, StoreBackend};
use settlement_relayer::jobs::balances::CheckBalancesManager;
use settlement_relayer::jobs::{self, JobName};
use settlement_relayer::metrics::MetricsServer;
use settlement_relayer::processor::grouped::WALLET_ADDRESS_FIELD;
use settlement_relayer::processor::{GroupedProcessor, JobProcessor, Processor, Worker};
use settlement_relayer::queue::postgres::{self, PgQueue};
use settlement_relayer::queue::{MemoryQueue, WorkQueue};
use settlement_relayer::scheduler::{CronJobManager, CronJobRegistry, RecurringTrigger};
use settlement_relayer::services::{IntentSettlementService, Services};

const LIQUIDITY_QUEUE: &str = "liquidity";
const INTENT_PROCESSOR_QUEUE: &str = "intent-processor";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting settlement relayer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.relayer.instance_id
    );

    let (liquidity_queue, intent_queue) = build_queues(&settings).await?;

    // Collaborators
    let chains = Arc::new(ChainClients::new(&settings)?);
    let iris = Arc::new(IrisClient::new(
        settings.cctp.attestation_api_url.clone(),
        Duration::from_secs(settings.cctp.request_timeout_secs),
    )?);
    let indexer = Arc::new(IndexerClient::new(
        settings.indexer.url.clone(),
        Duration::from_secs(settings.indexer.timeout_secs),
    )?);
    let settlement = Arc::new(IntentSettlementService::new(
        indexer,
        settings.intent_sources.clone(),
        settings.send_batch.chunk_size,
        settings.withdrawals.chunk_size,
    ));

    let services = Services::default()
        .with_attestations(iris)
        .with_mints(chains.clone())
        .with_destination_swaps(chains.clone())
        .with_batch_executor(chains.clone())
        .with_balances(chains.clone())
        .with_settlement(settlement);

    // Processors
    let liquidity = Processor::new(
        liquidity_queue.clone(),
        jobs::liquidity_managers(settings.cctp.repoll_delay()),
        services.clone(),
    )?;
    let liquidity: Arc<dyn JobProcessor> = Arc::new(GroupedProcessor::new(
        liquidity,
        WALLET_ADDRESS_FIELD,
        settings.queues.liquidity.group_requeue_delay(),
    ));

    let intent_processor: Arc<dyn JobProcessor> = Arc::new(
        Processor::new(intent_queue.clone(), jobs::intent_processor_managers(), services)?
            .avoid_concurrency([JobName::CheckSendBatch, JobName::CheckWithdraws]),
    );

    // Recurring triggers
    if settings.send_batch.enabled {
        RecurringTrigger::check_send_batch(settings.send_batch.interval())
            .install(intent_queue.as_ref())
            .await?;
    }
    if settings.withdrawals.enabled {
        RecurringTrigger::check_withdraws(settings.withdrawals.interval())
            .install(intent_queue.as_ref())
            .await?;
    }

    let cron = CronJobRegistry::new();
    if settings.balances.enabled {
        for wallet in &settings.balances.wallets {
            cron.register(CronJobManager::new(
                CheckBalancesManager::job_id(*wallet),
                liquidity_queue.clone(),
                CheckBalancesManager::job(*wallet)?,
                Duration::from_secs(settings.balances.interval_secs),
            ));
        }
        info!("Balance checks running for {} wallets", cron.len());
    }

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = vec![
        tokio::spawn(
            Worker::new(
                liquidity,
                (&settings.queues.liquidity).into(),
                shutdown_rx.clone(),
            )
            .run(),
        ),
        tokio::spawn(
            Worker::new(
                intent_processor,
                (&settings.queues.intent_processor).into(),
                shutdown_rx,
            )
            .run(),
        ),
    ];

    info!("Settlement relayer is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    cron.stop_all().await;
    shutdown_tx.send_replace(true);

    let drain = futures::future::join_all(workers);
    if tokio::time::timeout(
        Duration::from_secs(settings.relayer.shutdown_timeout_secs),
        drain,
    )
    .await
    .is_err()
    {
        warn!("Workers did not drain in time; in-flight jobs will be recovered on restart");
    }

    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Settlement relayer stopped");
    Ok(())
}

async fn build_queues(settings: &Settings) -> Result<(Arc<dyn WorkQueue>, Arc<dyn WorkQueue>)> {
    match settings.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store: jobs do not survive a restart");
            Ok((
                Arc::new(MemoryQueue::new(LIQUIDITY_QUEUE)),
                Arc::new(MemoryQueue::new(INTENT_PROCESSOR_QUEUE)),
            ))
        }
        StoreBackend::Postgres => {
            let pool = postgres::connect(&settings.store).await?;
            info!("Database connection established");

            postgres::run_migrations(&pool).await?;
            info!("Database migrations complete");

            Ok((
                Arc::new(PgQueue::new(pool.clone(), LIQUIDITY_QUEUE)),
                Arc::new(PgQueue::new(pool, INTENT_PROCESSOR_QUEUE)),
            ))
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,settlement_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
