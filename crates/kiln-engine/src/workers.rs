//! Periodic background workers.
//!
//! Each worker is a `tokio` task driven by [`tokio::time::interval`]. The
//! first run happens immediately. All workers share one [`CancelToken`]:
//! cancelling it stops the interval loops and, because the batch
//! operations check the same token between chunks, cuts short any sweep in
//! flight at a chunk boundary.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use kiln_analytics::{Classifier, EventLog};
use kiln_index::{IndexManager, ReconcileConfig};
use kiln_notify::{RetryQueue, Transport};
use kiln_sync::{MetricsApi, SyncEngine};
use kiln_types::CancelToken;

/// Run `task` every `period` until `cancel` fires.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancelToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(worker = name, period_secs = period.as_secs(), "Worker started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => task().await,
            }
        }
        info!(worker = name, "Worker stopped");
    })
}

/// One reconciliation sweep over every collection.
pub async fn reconcile_all(
    managers: &[IndexManager],
    config: ReconcileConfig,
    cancel: &CancelToken,
) {
    for manager in managers {
        if cancel.is_cancelled() {
            return;
        }
        let namespace = &manager.spec().namespace;
        match manager.rebuild_indexes(config, cancel).await {
            Ok(report)
                if report.entries_added > 0
                    || report.entries_removed > 0
                    || report.all_set_repaired > 0 =>
            {
                warn!(
                    namespace = %namespace,
                    added = report.entries_added,
                    removed = report.entries_removed,
                    all_set_repaired = report.all_set_repaired,
                    "Reconciliation repaired index drift"
                );
            }
            Ok(_) => {}
            Err(e) => error!(
                namespace = %namespace,
                error = %e,
                class = %e.class(),
                "Reconciliation failed"
            ),
        }
    }
}

/// Retry deferred sync jobs.
pub async fn drain_deferred<A: MetricsApi>(
    engine: &SyncEngine<A>,
    batch: usize,
    cancel: &CancelToken,
) {
    if let Err(e) = engine.process_deferred(batch, cancel).await {
        error!(error = %e, class = %e.class(), "Deferred sync sweep failed");
    }
}

/// Deliver queued notifications.
pub async fn sweep_notifications<T: Transport>(
    queue: &RetryQueue<T>,
    batch: usize,
    cancel: &CancelToken,
) {
    if let Err(e) = queue.process_batch(batch, cancel).await {
        error!(error = %e, class = %e.class(), "Notification sweep failed");
    }
}

/// Drop old notification history.
pub async fn clean_notifications<T: Transport>(queue: &RetryQueue<T>) {
    if let Err(e) = queue.cleanup().await {
        error!(error = %e, class = %e.class(), "Notification cleanup failed");
    }
}

/// Purge events older than `retention_days` for every subject.
pub async fn purge_events<C: Classifier>(
    log: &EventLog<C>,
    retention_days: u32,
    cancel: &CancelToken,
) {
    let now = Utc::now();
    let Some(cutoff) = now.checked_sub_signed(chrono::Duration::days(i64::from(retention_days)))
    else {
        return;
    };
    let subjects = match log.subjects().await {
        Ok(subjects) => subjects,
        Err(e) => {
            error!(error = %e, class = %e.class(), "Event retention could not list subjects");
            return;
        }
    };
    for subject in subjects {
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = log.purge_before(&subject, cutoff).await {
            error!(subject = %subject, error = %e, class = %e.class(), "Event retention failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn periodic_worker_stops_on_cancel() {
        let cancel = CancelToken::new();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("test", Duration::from_millis(5), cancel.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
