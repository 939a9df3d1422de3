// Jobs scheduler daemon entry point
//
// Wires store, change feed, notifier, broker, worker pool and scheduler in
// one process and shuts them down in reverse order on Ctrl+C.

mod handlers;

use anyhow::{anyhow, Context};
use jobs_core::broker::Broker;
use jobs_core::config::Settings;
use jobs_core::db::DbPool;
use jobs_core::feed::{BroadcastChangeFeed, ChangeFeed, NatsChangeFeed};
use jobs_core::notifier::{BroadcastNotifier, JobNotifier, NatsNotifier};
use jobs_core::retry::ExponentialBackoff;
use jobs_core::schedule::parse_timezone;
use jobs_core::scheduler::Scheduler;
use jobs_core::store::{JobStore, MemoryStore, PgStore, TriggerStore};
use jobs_core::telemetry;
use jobs_core::trigger::TriggerContext;
use jobs_core::worker::WorkerPool;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Err(e) = telemetry::init_metrics(settings.observability.metrics_port) {
        warn!(error = %e, "Metrics exporter not started");
    }
    info!("Starting jobs scheduler");

    let (trigger_store, job_store) = open_stores(&settings).await?;
    let (feed, notifier) = connect_messaging(&settings).await?;

    let registry = handlers::registry(&settings);
    let broker = registry
        .register_queues(Broker::builder(job_store))
        .notifier(notifier)
        .retry_strategy(Arc::new(ExponentialBackoff::from_config(&settings.retry)))
        .max_backlog(settings.broker.max_backlog)
        .build();

    // Unfinished work from a previous run goes first, before triggers emit anything new
    let recovered = broker.recover().await.context("Job recovery failed")?;
    info!(recovered = recovered, "Recovered unfinished jobs");

    let pool = WorkerPool::new(broker.clone(), registry);
    pool.start().await;

    let context = TriggerContext::new(feed)
        .with_stale_window(settings.scheduler.stale_window())
        .with_timezone(parse_timezone(&settings.scheduler.timezone)?);
    let scheduler = Scheduler::new(trigger_store, broker.clone(), context);
    scheduler.start().await.context("Failed to start triggers")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    scheduler.shutdown().await;
    // Stops store retries first, so in-flight jobs cannot hold the pool open
    broker.shutdown();
    pool.shutdown().await;
    telemetry::shutdown_tracer();

    info!("Jobs scheduler stopped");
    Ok(())
}

async fn open_stores(
    settings: &Settings,
) -> anyhow::Result<(Arc<dyn TriggerStore>, Arc<dyn JobStore>)> {
    match &settings.database {
        Some(database) => {
            let pool = DbPool::new(database).await?;
            pool.migrate().await?;
            info!("Using PostgreSQL store");
            let store = Arc::new(PgStore::new(pool));
            Ok((store.clone(), store))
        }
        None => {
            warn!("No database configured; jobs and triggers are kept in memory only");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
    }
}

async fn connect_messaging(
    settings: &Settings,
) -> anyhow::Result<(Arc<dyn ChangeFeed>, Arc<dyn JobNotifier>)> {
    match &settings.nats {
        Some(nats) => {
            let client = async_nats::connect(nats.url.as_str())
                .await
                .with_context(|| format!("Failed to connect to NATS at {}", nats.url))?;
            let feed = NatsChangeFeed::connect(client.clone(), &nats.changes_subject).await?;
            let notifier = NatsNotifier::new(client, nats.events_subject_prefix.clone());
            info!(url = %nats.url, "Using NATS change feed and notifier");
            Ok((Arc::new(feed), Arc::new(notifier)))
        }
        None => Ok((
            Arc::new(BroadcastChangeFeed::default()),
            Arc::new(BroadcastNotifier::default()),
        )),
    }
}
