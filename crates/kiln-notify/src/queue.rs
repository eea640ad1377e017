//! The notification retry queue.
//!
//! Three lists in the store hold serialized [`Notification`]s:
//!
//! | Key | Contents |
//! |-----|----------|
//! | `notifications:queue` | pending and retrying items, newest at the head |
//! | `notifications:sent` | delivered items, newest first, capped |
//! | `notifications:failed` | items that reached the attempt ceiling |
//!
//! ```text
//! pending -> sending -> sent
//!               |-----> failed_retry    (attempts < max, back in the queue)
//!               +-----> failed_terminal (attempts == max, moved to failed)
//! ```
//!
//! Every transition pushes the new serialized form first and only then
//! removes the old one. An interruption between the two leaves a duplicate,
//! never a loss: delivery is at-least-once.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kiln_store::{Store, codec, keys};
use kiln_types::{
    CancelToken, Notification, NotificationDraft, NotificationId, NotificationKind,
    NotificationStatus, Priority,
};

use crate::error::NotifyError;
use crate::template::EmailRenderer;
use crate::transport::{Mailer, OutgoingMail, Transport};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Retry queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryQueueConfig {
    /// Attempts before an item becomes `failed_terminal`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Items taken per sweep.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Length cap of the sent history.
    #[serde(default = "default_sent_history_cap")]
    pub sent_history_cap: u32,
    /// Age after which sent and failed entries are cleaned up, in days.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Directory holding a replacement `notification.html`.
    #[serde(default)]
    pub template_dir: Option<String>,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_batch_size() -> usize {
    10
}

const fn default_sent_history_cap() -> u32 {
    1000
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            batch_size: default_batch_size(),
            sent_history_cap: default_sent_history_cap(),
            retention_days: default_retention_days(),
            template_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What [`RetryQueue::enqueue`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueReceipt {
    /// Id of the new notification.
    pub id: NotificationId,
    /// State after enqueueing: `pending`, or the result of the immediate
    /// attempt for high-priority items.
    pub status: NotificationStatus,
}

/// Summary of one [`RetryQueue::process_batch`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items attempted.
    pub processed: usize,
    /// Delivered.
    pub sent: usize,
    /// Failed and re-queued.
    pub retried: usize,
    /// Failed for the last time.
    pub failed_terminal: usize,
    /// Entries that could not be decoded and were parked in the failed list.
    pub parked: usize,
}

/// List lengths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Items waiting for delivery.
    pub pending: u64,
    /// Delivered items kept in history.
    pub sent: u64,
    /// Terminal failures.
    pub failed: u64,
}

/// Entries removed by [`RetryQueue::cleanup`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Removed from the sent history.
    pub sent_removed: u64,
    /// Removed from the failed list.
    pub failed_removed: u64,
}

/// Filter for [`RetryQueue::history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFilter {
    /// Only this kind.
    pub kind: Option<NotificationKind>,
    /// Only this recipient address.
    pub recipient: Option<String>,
    /// Include terminal failures alongside delivered items.
    pub include_failed: bool,
    /// Maximum entries returned.
    pub limit: usize,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            kind: None,
            recipient: None,
            include_failed: false,
            limit: 100,
        }
    }
}

impl HistoryFilter {
    fn matches(&self, n: &Notification) -> bool {
        self.kind.is_none_or(|k| n.payload.kind == k)
            && self.recipient.as_deref().is_none_or(|r| n.payload.recipient == r)
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Durable notification queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RetryQueue<T = Mailer> {
    store: Store,
    transport: T,
    renderer: Arc<EmailRenderer>,
    config: RetryQueueConfig,
}

impl<T: Transport> RetryQueue<T> {
    /// Create a queue, loading the email template.
    pub fn new(store: Store, transport: T, config: RetryQueueConfig) -> Result<Self, NotifyError> {
        let renderer = EmailRenderer::load(config.template_dir.as_deref())?;
        Ok(Self {
            store,
            transport,
            renderer: Arc::new(renderer),
            config,
        })
    }

    /// The queue's transport.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Queue a notification.
    ///
    /// A `high` priority item is also attempted right away; its outcome is
    /// in the receipt and a failure leaves it queued for the next sweep.
    pub async fn enqueue(
        &self,
        draft: NotificationDraft,
        priority: Priority,
    ) -> Result<EnqueueReceipt, NotifyError> {
        let notification = Notification::pending(draft, priority, Utc::now());
        let raw = codec::encode(&notification)?;
        self.store.lpush(keys::NOTIFICATION_QUEUE, &raw).await?;
        debug!(
            id = %notification.id,
            kind = ?notification.payload.kind,
            ?priority,
            "Notification queued"
        );

        let status = if priority == Priority::High {
            self.deliver(&raw, notification.clone()).await?
        } else {
            NotificationStatus::Pending
        };
        Ok(EnqueueReceipt {
            id: notification.id,
            status,
        })
    }

    /// Deliver up to `limit` queued items, oldest first.
    pub async fn process_batch(
        &self,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<BatchReport, NotifyError> {
        let mut report = BatchReport::default();
        let Some(count) = i64::try_from(limit).ok().filter(|n| *n > 0) else {
            return Ok(report);
        };
        let raws = self
            .store
            .lrange(keys::NOTIFICATION_QUEUE, count.saturating_neg(), -1)
            .await?;

        for raw in raws.iter().rev() {
            if cancel.is_cancelled() {
                break;
            }
            let notification = match codec::decode::<Notification>(keys::NOTIFICATION_QUEUE, raw) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Undecodable queue entry, parking in failed list");
                    self.move_raw(raw, keys::NOTIFICATION_FAILED).await?;
                    report.parked = report.parked.saturating_add(1);
                    continue;
                }
            };
            if !notification.status.is_deliverable() {
                debug!(
                    id = %notification.id,
                    status = ?notification.status,
                    "Skipping non-deliverable entry"
                );
                continue;
            }

            report.processed = report.processed.saturating_add(1);
            match self.deliver(raw, notification).await? {
                NotificationStatus::Sent => report.sent = report.sent.saturating_add(1),
                NotificationStatus::FailedTerminal => {
                    report.failed_terminal = report.failed_terminal.saturating_add(1);
                }
                _ => report.retried = report.retried.saturating_add(1),
            }
        }

        if report.processed > 0 || report.parked > 0 {
            info!(
                processed = report.processed,
                sent = report.sent,
                retried = report.retried,
                failed_terminal = report.failed_terminal,
                parked = report.parked,
                "Notification sweep complete"
            );
        }
        Ok(report)
    }

    /// One delivery attempt for the queue entry `raw`.
    ///
    /// Returns the state the item ended in. Transport failures are recorded
    /// on the item; only store errors propagate.
    async fn deliver(
        &self,
        raw: &str,
        mut notification: Notification,
    ) -> Result<NotificationStatus, NotifyError> {
        if notification.attempts >= self.config.max_attempts {
            // Interrupted during its last attempt.
            notification.status = NotificationStatus::FailedTerminal;
            notification
                .last_error
                .get_or_insert_with(|| "interrupted during final attempt".to_owned());
            let terminal = codec::encode(&notification)?;
            self.replace(raw, keys::NOTIFICATION_FAILED, &terminal).await?;
            warn!(
                id = %notification.id,
                attempts = notification.attempts,
                "Notification failed terminally"
            );
            return Ok(NotificationStatus::FailedTerminal);
        }

        notification.status = NotificationStatus::Sending;
        notification.attempts = notification.attempts.saturating_add(1);
        let sending = codec::encode(&notification)?;
        self.replace(raw, keys::NOTIFICATION_QUEUE, &sending).await?;

        let result = match self.renderer.render(&notification.payload) {
            Ok(body) => {
                self.transport
                    .send(&OutgoingMail {
                        recipient: &notification.payload.recipient,
                        subject: &notification.payload.subject,
                        body: &body,
                        is_html: true,
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                notification.status = NotificationStatus::Sent;
                notification.sent_at = Some(Utc::now());
                let sent = codec::encode(&notification)?;
                self.replace(&sending, keys::NOTIFICATION_SENT, &sent).await?;
                let cap = i64::from(self.config.sent_history_cap.max(1));
                self.store
                    .ltrim(keys::NOTIFICATION_SENT, 0, cap.saturating_sub(1))
                    .await?;
                info!(
                    id = %notification.id,
                    recipient = %notification.payload.recipient,
                    attempts = notification.attempts,
                    "Notification sent"
                );
                Ok(NotificationStatus::Sent)
            }
            Err(e) => {
                notification.last_error = Some(e.to_string());
                let (status, list) = if notification.attempts >= self.config.max_attempts {
                    (NotificationStatus::FailedTerminal, keys::NOTIFICATION_FAILED)
                } else {
                    (NotificationStatus::FailedRetry, keys::NOTIFICATION_QUEUE)
                };
                notification.status = status;
                let next = codec::encode(&notification)?;
                self.replace(&sending, list, &next).await?;
                warn!(
                    id = %notification.id,
                    attempts = notification.attempts,
                    status = ?status,
                    error = %e,
                    class = %e.class(),
                    "Notification delivery failed"
                );
                Ok(status)
            }
        }
    }

    /// Push `new` onto `list`, then remove `old` from the queue.
    async fn replace(&self, old: &str, list: &str, new: &str) -> Result<(), NotifyError> {
        self.store.lpush(list, new).await?;
        self.store.lrem(keys::NOTIFICATION_QUEUE, 1, old).await?;
        Ok(())
    }

    async fn move_raw(&self, raw: &str, list: &str) -> Result<(), NotifyError> {
        self.replace(raw, list, raw).await
    }

    /// Delivered (and optionally failed) notifications, newest first.
    pub async fn history(&self, filter: &HistoryFilter) -> Result<Vec<Notification>, NotifyError> {
        let mut lists = vec![keys::NOTIFICATION_SENT];
        if filter.include_failed {
            lists.push(keys::NOTIFICATION_FAILED);
        }

        let mut found = Vec::new();
        for list in lists {
            for raw in self.store.lrange(list, 0, -1).await? {
                match codec::decode::<Notification>(list, &raw) {
                    Ok(n) if filter.matches(&n) => found.push(n),
                    Ok(_) => {}
                    Err(e) => debug!(list, error = %e, "Skipping undecodable history entry"),
                }
            }
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        found.truncate(filter.limit);
        Ok(found)
    }

    /// Lengths of the three lists.
    pub async fn queue_status(&self) -> Result<QueueStatus, NotifyError> {
        Ok(QueueStatus {
            pending: self.store.llen(keys::NOTIFICATION_QUEUE).await?,
            sent: self.store.llen(keys::NOTIFICATION_SENT).await?,
            failed: self.store.llen(keys::NOTIFICATION_FAILED).await?,
        })
    }

    /// Remove sent and failed entries created before `now - retention_days`.
    pub async fn cleanup(&self) -> Result<CleanupReport, NotifyError> {
        let now = Utc::now();
        let cutoff = now
            .checked_sub_signed(Duration::days(i64::from(self.config.retention_days)))
            .unwrap_or(now);
        self.cleanup_before(cutoff).await
    }

    /// Remove sent and failed entries created before `cutoff`.
    pub async fn cleanup_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<CleanupReport, NotifyError> {
        let report = CleanupReport {
            sent_removed: self.prune(keys::NOTIFICATION_SENT, cutoff).await?,
            failed_removed: self.prune(keys::NOTIFICATION_FAILED, cutoff).await?,
        };
        info!(
            cutoff = %cutoff,
            sent_removed = report.sent_removed,
            failed_removed = report.failed_removed,
            "Notification cleanup complete"
        );
        Ok(report)
    }

    async fn prune(&self, list: &str, cutoff: DateTime<Utc>) -> Result<u64, NotifyError> {
        let mut removed: u64 = 0;
        for raw in self.store.lrange(list, 0, -1).await? {
            let Ok(n) = codec::decode::<Notification>(list, &raw) else {
                continue;
            };
            if n.created_at < cutoff {
                let count = self.store.lrem(list, 1, &raw).await?;
                removed = removed.saturating_add(count);
            }
        }
        Ok(removed)
    }
}

impl RetryQueue<Mailer> {
    /// Queue with the transport chosen from mail settings.
    pub fn from_config(
        store: Store,
        mailer: &crate::transport::MailerConfig,
        config: RetryQueueConfig,
    ) -> Result<Self, NotifyError> {
        Self::new(store, Mailer::from_config(mailer), config)
    }
}
