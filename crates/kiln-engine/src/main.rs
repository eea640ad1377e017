//! Kiln worker binary.
//!
//! Hosts the periodic background workers of the data core and owns the
//! lifecycle of the stateful services: the sync engine's quota is loaded
//! at start-up and persisted on shutdown, the classifier and mailer are
//! chosen from configuration.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `kiln-config.yaml` (or `KILN_CONFIG`)
//! 2. Initialize structured logging (tracing)
//! 3. Connect to the store
//! 4. Build the index managers, event log, sync engine and retry queue
//! 5. Spawn the workers
//! 6. Wait for Ctrl-C, cancel, join, persist quota state

mod config;
mod error;
mod workers;

use std::path::PathBuf;
use std::time::Duration;

use kiln_analytics::{Aggregator, EventLog, SentimentClassifier};
use kiln_index::IndexManager;
use kiln_notify::RetryQueue;
use kiln_store::Store;
use kiln_sync::SyncEngine;
use kiln_types::CancelToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{KilnConfig, LoggingConfig, StoreBackend};
use crate::error::EngineError;

const DEFAULT_CONFIG_PATH: &str = "kiln-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if any initialization step fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    init_logging(&config.logging)?;

    if let Err(e) = run(config).await {
        error!(error = %e, class = %e.class(), "kiln-engine failed");
        return Err(e.into());
    }
    Ok(())
}

/// Load configuration from `KILN_CONFIG` or the default path.
///
/// A missing file is not an error: every field has a default.
fn load_config() -> Result<KilnConfig, EngineError> {
    let path = std::env::var("KILN_CONFIG")
        .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    if path.exists() {
        Ok(KilnConfig::from_file(&path)?)
    } else {
        Ok(KilnConfig::parse("")?)
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) -> Result<(), EngineError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| EngineError::Logging {
            message: format!("invalid log filter {:?}: {e}", logging.level),
        })?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| EngineError::Logging {
        message: format!("failed to install subscriber: {e}"),
    })
}

async fn connect(config: &KilnConfig) -> Result<Store, EngineError> {
    match config.store.backend {
        StoreBackend::Dragonfly => {
            info!(url = %config.store.url, "Connecting to Dragonfly");
            Ok(Store::connect(&config.store.url).await?)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; state is lost on exit");
            Ok(Store::memory())
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run(config: KilnConfig) -> Result<(), EngineError> {
    info!("kiln-engine starting");
    let store = connect(&config).await?;
    info!(backend = store.backend(), "Store ready");

    let cancel = CancelToken::new();
    let mut handles = Vec::new();

    // Index reconciliation.
    let managers: Vec<IndexManager> = config
        .reconcile
        .collections
        .iter()
        .map(|spec| IndexManager::new(store.clone(), spec.clone()))
        .collect::<Result<_, _>>()?;
    info!(
        collections = ?managers.iter().map(|m| m.spec().namespace.as_str()).collect::<Vec<_>>(),
        "Index managers ready"
    );
    {
        let sweep = config.reconcile.sweep;
        let token = cancel.clone();
        handles.push(workers::spawn_periodic(
            "reconcile",
            Duration::from_secs(config.reconcile.interval_secs),
            cancel.clone(),
            move || {
                let managers = managers.clone();
                let token = token.clone();
                async move { workers::reconcile_all(&managers, sweep, &token).await }
            },
        ));
    }

    // Analytics.
    let aggregator = Aggregator::new(store.clone(), config.analytics.aggregator)?;
    let classifier = SentimentClassifier::from_config(&config.analytics.classifier);
    info!(
        classifier = classifier.name(),
        utc_offset_hours = aggregator.zone().hours(),
        "Analytics ready"
    );
    let event_log = EventLog::new(store.clone(), classifier);
    let retention_days = config.analytics.retention_days;
    if retention_days > 0 {
        let token = cancel.clone();
        handles.push(workers::spawn_periodic(
            "event-retention",
            Duration::from_secs(config.analytics.retention_interval_secs),
            cancel.clone(),
            move || {
                let log = event_log.clone();
                let token = token.clone();
                async move { workers::purge_events(&log, retention_days, &token).await }
            },
        ));
    } else {
        info!("Event retention disabled");
    }

    // Deferred sync.
    let sync_engine = SyncEngine::from_config(store.clone(), config.sync.engine.clone()).await?;
    match &sync_engine {
        Some(engine) => {
            let quota = engine.limiter().snapshot();
            info!(
                class = engine.limiter().class(),
                remaining = quota.remaining,
                reset_at = %quota.reset_at,
                "Sync engine ready"
            );
            let engine = engine.clone();
            let batch = config.sync.deferred_batch;
            let token = cancel.clone();
            handles.push(workers::spawn_periodic(
                "deferred-sync",
                Duration::from_secs(config.sync.deferred_interval_secs),
                cancel.clone(),
                move || {
                    let engine = engine.clone();
                    let token = token.clone();
                    async move { workers::drain_deferred(&engine, batch, &token).await }
                },
            ));
        }
        None => warn!("METRICS_BEARER_TOKEN not set, deferred sync disabled"),
    }

    // Notifications.
    let queue = RetryQueue::from_config(
        store.clone(),
        &config.notifications.mail,
        config.notifications.queue.clone(),
    )?;
    info!(transport = queue.transport().name(), "Notification queue ready");
    {
        let queue = queue.clone();
        let batch = config.notifications.queue.batch_size;
        let token = cancel.clone();
        handles.push(workers::spawn_periodic(
            "notification-sweep",
            Duration::from_secs(config.notifications.sweep_interval_secs),
            cancel.clone(),
            move || {
                let queue = queue.clone();
                let token = token.clone();
                async move { workers::sweep_notifications(&queue, batch, &token).await }
            },
        ));
    }
    handles.push(workers::spawn_periodic(
        "notification-cleanup",
        Duration::from_secs(config.notifications.cleanup_interval_secs),
        cancel.clone(),
        move || {
            let queue = queue.clone();
            async move { workers::clean_notifications(&queue).await }
        },
    ));

    info!(workers = handles.len(), "kiln-engine running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }

    info!("Shutdown requested");
    cancel.cancel();
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "Worker task panicked");
        }
    }

    if let Some(engine) = &sync_engine {
        engine.shutdown().await?;
    }
    info!("kiln-engine shutdown complete");
    Ok(())
}
