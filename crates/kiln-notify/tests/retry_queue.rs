//! Retry queue scenarios against the in-memory store and a scripted
//! transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{Duration, Utc};
use kiln_notify::{
    HistoryFilter, NotifyError, OutgoingMail, PaymentDecision, Recipient, RetryQueue,
    RetryQueueConfig, Transport,
};
use kiln_store::{Store, codec, keys};
use kiln_types::{
    CancelToken, Notification, NotificationDraft, NotificationKind, NotificationStatus, Priority,
};
use rust_decimal::Decimal;

/// Fails the first `failures` sends, then succeeds.
#[derive(Debug, Clone, Default)]
struct FlakyTransport {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl FlakyTransport {
    fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::default(),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for FlakyTransport {
    async fn send(&self, _mail: &OutgoingMail<'_>) -> Result<(), NotifyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(NotifyError::Transport("connection reset".to_owned()))
        } else {
            Ok(())
        }
    }
}

fn draft(kind: NotificationKind, recipient: &str) -> NotificationDraft {
    NotificationDraft {
        kind,
        recipient: recipient.to_owned(),
        recipient_name: "Ada".to_owned(),
        subject: "Update".to_owned(),
        message: "Something happened.".to_owned(),
        metadata: BTreeMap::new(),
    }
}

fn queue(store: &Store, transport: FlakyTransport) -> RetryQueue<FlakyTransport> {
    RetryQueue::new(store.clone(), transport, RetryQueueConfig::default()).unwrap()
}

async fn list(store: &Store, key: &str) -> Vec<Notification> {
    store
        .lrange(key, 0, -1)
        .await
        .unwrap()
        .iter()
        .map(|raw| codec::decode(key, raw).unwrap())
        .collect()
}

#[tokio::test]
async fn fail_fail_succeed_ends_sent() {
    let store = Store::memory();
    let transport = FlakyTransport::failing(2);
    let q = queue(&store, transport.clone());
    let cancel = CancelToken::new();

    let receipt = q
        .enqueue(draft(NotificationKind::StageUpdated, "a@x.io"), Priority::Normal)
        .await
        .unwrap();
    assert_eq!(receipt.status, NotificationStatus::Pending);

    let first = q.process_batch(10, &cancel).await.unwrap();
    assert_eq!(first.retried, 1);
    let pending = list(&store, keys::NOTIFICATION_QUEUE).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, NotificationStatus::FailedRetry);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[0].last_error.as_deref(), Some("mail transport error: connection reset"));

    q.process_batch(10, &cancel).await.unwrap();
    let third = q.process_batch(10, &cancel).await.unwrap();
    assert_eq!(third.sent, 1);

    let status = q.queue_status().await.unwrap();
    assert_eq!((status.pending, status.sent, status.failed), (0, 1, 0));
    let sent = list(&store, keys::NOTIFICATION_SENT).await;
    assert_eq!(sent[0].id, receipt.id);
    assert_eq!(sent[0].attempts, 3);
    assert!(sent[0].sent_at.is_some());
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn attempts_stop_at_the_ceiling() {
    let store = Store::memory();
    let transport = FlakyTransport::failing(u32::MAX);
    let q = queue(&store, transport.clone());
    let cancel = CancelToken::new();

    q.enqueue(draft(NotificationKind::NoteAdded, "b@x.io"), Priority::Low).await.unwrap();
    for _ in 0..3 {
        q.process_batch(10, &cancel).await.unwrap();
    }
    let failed = list(&store, keys::NOTIFICATION_FAILED).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, NotificationStatus::FailedTerminal);
    assert_eq!(failed[0].attempts, 3);

    let idle = q.process_batch(10, &cancel).await.unwrap();
    assert_eq!(idle.processed, 0);
    assert_eq!(transport.calls(), 3);
    assert_eq!(q.queue_status().await.unwrap().pending, 0);
}

#[tokio::test]
async fn high_priority_is_delivered_at_enqueue() {
    let store = Store::memory();
    let q = queue(&store, FlakyTransport::default());
    let receipt = q
        .enqueue(draft(NotificationKind::CampaignAssigned, "c@x.io"), Priority::High)
        .await
        .unwrap();
    assert_eq!(receipt.status, NotificationStatus::Sent);
    let status = q.queue_status().await.unwrap();
    assert_eq!((status.pending, status.sent), (0, 1));
}

#[tokio::test]
async fn failed_high_priority_stays_queued() {
    let store = Store::memory();
    let q = queue(&store, FlakyTransport::failing(1));
    let receipt = q
        .enqueue(draft(NotificationKind::PaymentApproved, "d@x.io"), Priority::High)
        .await
        .unwrap();
    assert_eq!(receipt.status, NotificationStatus::FailedRetry);
    let report = q.process_batch(10, &CancelToken::new()).await.unwrap();
    assert_eq!(report.sent, 1);
}

#[tokio::test]
async fn oldest_items_go_first() {
    let store = Store::memory();
    let q = queue(&store, FlakyTransport::default());
    for recipient in ["1@x.io", "2@x.io", "3@x.io"] {
        q.enqueue(draft(NotificationKind::ProfileUpdated, recipient), Priority::Normal)
            .await
            .unwrap();
    }
    let report = q.process_batch(2, &CancelToken::new()).await.unwrap();
    assert_eq!(report.sent, 2);
    let pending = list(&store, keys::NOTIFICATION_QUEUE).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload.recipient, "3@x.io");
}

#[tokio::test]
async fn interrupted_send_is_redelivered() {
    let store = Store::memory();
    let mut stuck = Notification::pending(
        draft(NotificationKind::NoteAdded, "e@x.io"),
        Priority::Normal,
        Utc::now(),
    );
    stuck.status = NotificationStatus::Sending;
    stuck.attempts = 1;
    store.lpush(keys::NOTIFICATION_QUEUE, &codec::encode(&stuck).unwrap()).await.unwrap();

    let q = queue(&store, FlakyTransport::default());
    let report = q.process_batch(10, &CancelToken::new()).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(list(&store, keys::NOTIFICATION_SENT).await[0].attempts, 2);
}

#[tokio::test]
async fn interrupted_final_attempt_is_terminal() {
    let store = Store::memory();
    let mut stuck = Notification::pending(
        draft(NotificationKind::NoteAdded, "f@x.io"),
        Priority::Normal,
        Utc::now(),
    );
    stuck.status = NotificationStatus::Sending;
    stuck.attempts = 3;
    store.lpush(keys::NOTIFICATION_QUEUE, &codec::encode(&stuck).unwrap()).await.unwrap();

    let transport = FlakyTransport::default();
    let q = queue(&store, transport.clone());
    let report = q.process_batch(10, &CancelToken::new()).await.unwrap();
    assert_eq!(report.failed_terminal, 1);
    assert_eq!(transport.calls(), 0);
    assert_eq!(list(&store, keys::NOTIFICATION_FAILED).await[0].attempts, 3);
}

#[tokio::test]
async fn malformed_entries_are_parked() {
    let store = Store::memory();
    store.lpush(keys::NOTIFICATION_QUEUE, "{not json").await.unwrap();
    let q = queue(&store, FlakyTransport::default());
    let report = q.process_batch(10, &CancelToken::new()).await.unwrap();
    assert_eq!(report.parked, 1);
    assert_eq!(q.queue_status().await.unwrap().pending, 0);
    assert_eq!(store.lrange(keys::NOTIFICATION_FAILED, 0, -1).await.unwrap(), vec!["{not json"]);
}

#[tokio::test]
async fn history_filters_by_kind_and_recipient() {
    let store = Store::memory();
    let q = queue(&store, FlakyTransport::default());
    q.enqueue(draft(NotificationKind::StageUpdated, "a@x.io"), Priority::High).await.unwrap();
    q.enqueue(draft(NotificationKind::NoteAdded, "a@x.io"), Priority::High).await.unwrap();
    q.enqueue(draft(NotificationKind::StageUpdated, "b@x.io"), Priority::High).await.unwrap();

    let all = q.history(&HistoryFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let stage = q
        .history(&HistoryFilter {
            kind: Some(NotificationKind::StageUpdated),
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(stage.len(), 2);

    let for_a = q
        .history(&HistoryFilter {
            recipient: Some("a@x.io".to_owned()),
            limit: 1,
            ..HistoryFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(for_a.len(), 1);
    assert_eq!(for_a[0].payload.recipient, "a@x.io");
}

#[tokio::test]
async fn cleanup_removes_old_entries_only() {
    let store = Store::memory();
    let q = queue(&store, FlakyTransport::default());
    let old = Notification::pending(
        draft(NotificationKind::NoteAdded, "old@x.io"),
        Priority::Normal,
        Utc::now() - Duration::days(45),
    );
    store.lpush(keys::NOTIFICATION_SENT, &codec::encode(&old).unwrap()).await.unwrap();
    store.lpush(keys::NOTIFICATION_FAILED, &codec::encode(&old).unwrap()).await.unwrap();
    q.enqueue(draft(NotificationKind::NoteAdded, "new@x.io"), Priority::High).await.unwrap();

    let report = q.cleanup().await.unwrap();
    assert_eq!((report.sent_removed, report.failed_removed), (1, 1));
    let remaining = list(&store, keys::NOTIFICATION_SENT).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].payload.recipient, "new@x.io");
}

#[tokio::test]
async fn sent_history_is_capped() {
    let store = Store::memory();
    let config = RetryQueueConfig {
        sent_history_cap: 2,
        ..RetryQueueConfig::default()
    };
    let q = RetryQueue::new(store.clone(), FlakyTransport::default(), config).unwrap();
    for recipient in ["1@x.io", "2@x.io", "3@x.io"] {
        q.enqueue(draft(NotificationKind::NoteAdded, recipient), Priority::High).await.unwrap();
    }
    let sent = list(&store, keys::NOTIFICATION_SENT).await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].payload.recipient, "3@x.io");
}

#[tokio::test]
async fn producers_build_messages() {
    let store = Store::memory();
    let q = queue(&store, FlakyTransport::default());
    let kol = Recipient {
        handle: "@ada".to_owned(),
        name: None,
        email: Some("ada@x.io".to_owned()),
    };

    let receipt = q
        .notify_payment_status(
            &kol,
            "Launch",
            &PaymentDecision::Rejected {
                amount: Decimal::new(150_050, 2),
                reason: Some("missing proof".to_owned()),
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(receipt.status, NotificationStatus::Sent);

    q.notify_stage_update(&kol, "Launch", "contacted", "active").await.unwrap();
    let pending = list(&store, keys::NOTIFICATION_QUEUE).await;
    assert_eq!(pending[0].payload.kind, NotificationKind::StageUpdated);
    assert_eq!(pending[0].payload.recipient_name, "@ada");
    assert_eq!(pending[0].payload.metadata["new_stage"], "active");

    let sent = list(&store, keys::NOTIFICATION_SENT).await;
    assert_eq!(sent[0].payload.subject, "Payment Rejected - Launch");
    assert!(sent[0].payload.message.ends_with("Reason: missing proof"));
    assert_eq!(sent[0].payload.metadata["amount"], "$1500.50");

    let no_email = Recipient {
        email: None,
        ..kol
    };
    assert!(q.notify_note_added(&no_email, "admin", "hi").await.unwrap().is_none());
}
