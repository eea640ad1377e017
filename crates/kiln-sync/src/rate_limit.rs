//! Quota state for one external resource class.
//!
//! [`RateLimiter`] is the in-process authority for a class's quota. The
//! check and the decrement happen in one critical section with no I/O
//! under the lock, so concurrent jobs in this process can never reserve
//! more than `remaining`. The state is loaded from the store at start-up
//! and written back with [`RateLimiter::persist`].
//!
//! A reservation stays *outstanding* until its caller reports the units
//! as spent ([`RateLimiter::settle`]) or unused ([`RateLimiter::release`]).
//! The remote's quota headers count only calls it has already served, so
//! [`RateLimiter::observe`] subtracts the outstanding units from the
//! remote `remaining` before adopting it. Without that, a header arriving
//! mid-job would hand the job's unspent units to a second caller.
//!
//! Two processes sharing a class each hold their own copy and can
//! together over-commit until the remote's authoritative quota catches up.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kiln_store::{Store, keys};
use kiln_types::RateLimitState;

use crate::error::SyncError;

/// Quota defaults for a resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed per window.
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u32,
}

const fn default_limit() -> u32 {
    300
}

const fn default_window_secs() -> u32 {
    900
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
        }
    }
}

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// `needed` units were taken from the quota.
    Granted {
        /// Units left afterwards.
        remaining: u32,
    },
    /// Not enough quota; nothing was taken.
    Denied {
        /// Units currently available.
        remaining: u32,
        /// When the window resets.
        reset_at: DateTime<Utc>,
    },
}

/// Persisted state plus the units reserved in this process but not yet
/// accounted for by the remote.
#[derive(Debug, Clone, Copy)]
struct Quota {
    state: RateLimitState,
    outstanding: u32,
}

impl Quota {
    fn adopt(&mut self, remote: RateLimitState) {
        self.state.limit = remote.limit;
        self.state.remaining = remote
            .remaining
            .min(remote.limit)
            .saturating_sub(self.outstanding);
        self.state.reset_at = remote.reset_at;
    }

    fn take_outstanding(&mut self, units: u32) -> u32 {
        let taken = units.min(self.outstanding);
        self.outstanding = self.outstanding.saturating_sub(taken);
        taken
    }
}

/// Shared quota state of one resource class. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Store,
    class: String,
    window: Duration,
    quota: Arc<Mutex<Quota>>,
}

impl RateLimiter {
    /// Load the persisted state of `class`, or start a fresh window.
    pub async fn load(
        store: Store,
        class: &str,
        config: RateLimitConfig,
    ) -> Result<Self, SyncError> {
        let window = Duration::seconds(i64::from(config.window_secs));
        let state = match store.get_json::<RateLimitState>(&keys::rate_limit(class)).await? {
            Some(state) => {
                debug!(
                    class,
                    remaining = state.remaining,
                    reset_at = %state.reset_at,
                    "Loaded rate-limit state"
                );
                state
            }
            None => {
                let now = Utc::now();
                RateLimitState {
                    remaining: config.limit,
                    limit: config.limit,
                    reset_at: now.checked_add_signed(window).unwrap_or(now),
                }
            }
        };
        Ok(Self {
            store,
            class: class.to_owned(),
            window,
            quota: Arc::new(Mutex::new(Quota {
                state,
                outstanding: 0,
            })),
        })
    }

    /// Resource class name.
    pub fn class(&self) -> &str {
        &self.class
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Quota> {
        self.quota.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state as stored (not reset-adjusted).
    pub fn snapshot(&self) -> RateLimitState {
        self.lock().state
    }

    /// Units reserved but not yet settled or released.
    pub fn outstanding(&self) -> u32 {
        self.lock().outstanding
    }

    /// Whether `needed` units are available now. Read-only.
    pub fn can_proceed(&self, needed: u32) -> bool {
        self.snapshot().can_proceed(needed, Utc::now())
    }

    /// Check and take `needed` units in one step.
    ///
    /// Granted units stay outstanding until [`Self::settle`] or
    /// [`Self::release`] accounts for them.
    pub fn try_reserve(&self, needed: u32) -> Reservation {
        self.try_reserve_at(needed, Utc::now())
    }

    /// [`Self::try_reserve`] with an explicit clock.
    pub fn try_reserve_at(&self, needed: u32, now: DateTime<Utc>) -> Reservation {
        let mut quota = self.lock();
        if now >= quota.state.reset_at {
            quota.state.remaining = quota.state.limit.saturating_sub(quota.outstanding);
            quota.state.reset_at = now.checked_add_signed(self.window).unwrap_or(now);
        }
        match quota.state.remaining.checked_sub(needed) {
            Some(left) => {
                quota.state.remaining = left;
                quota.outstanding = quota.outstanding.saturating_add(needed);
                Reservation::Granted { remaining: left }
            }
            None => Reservation::Denied {
                remaining: quota.state.remaining,
                reset_at: quota.state.reset_at,
            },
        }
    }

    /// Record `spent` reserved units as consumed by a remote call, then
    /// adopt the quota the call reported, if any.
    pub fn settle(&self, spent: u32, remote: Option<RateLimitState>) {
        let mut quota = self.lock();
        quota.take_outstanding(spent);
        if let Some(remote) = remote {
            quota.adopt(remote);
        }
    }

    /// Return `unused` reserved units to the quota, then adopt the quota
    /// the remote reported, if any.
    pub fn release(&self, unused: u32, remote: Option<RateLimitState>) {
        let mut quota = self.lock();
        let returned = quota.take_outstanding(unused);
        quota.state.remaining = quota
            .state
            .remaining
            .saturating_add(returned)
            .min(quota.state.limit);
        if let Some(remote) = remote {
            quota.adopt(remote);
        }
    }

    /// Apply authoritative quota metadata from the remote. Units still
    /// outstanding in this process are deducted from its `remaining`.
    pub fn observe(&self, remote: RateLimitState) {
        self.lock().adopt(remote);
    }

    /// Write the current state to the store.
    pub async fn persist(&self) -> Result<(), SyncError> {
        let state = self.snapshot();
        self.store.set_json(&keys::rate_limit(&self.class), &state).await?;
        info!(
            class = %self.class,
            remaining = state.remaining,
            reset_at = %state.reset_at,
            "Rate-limit state persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn limiter(remaining: u32, reset_in: Duration) -> RateLimiter {
        let store = Store::memory();
        store
            .set_json(
                &keys::rate_limit("metrics"),
                &RateLimitState {
                    remaining,
                    limit: 300,
                    reset_at: Utc::now() + reset_in,
                },
            )
            .await
            .unwrap();
        RateLimiter::load(store, "metrics", RateLimitConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn fresh_class_gets_full_window() {
        let limiter = RateLimiter::load(Store::memory(), "new", RateLimitConfig::default())
            .await
            .unwrap();
        assert_eq!(limiter.snapshot().remaining, 300);
        assert!(limiter.can_proceed(300));
        assert!(!limiter.can_proceed(301));
    }

    #[tokio::test]
    async fn reservations_never_go_negative() {
        let limiter = limiter(5, Duration::minutes(10)).await;
        assert_eq!(limiter.try_reserve(3), Reservation::Granted { remaining: 2 });
        assert!(matches!(limiter.try_reserve(3), Reservation::Denied { remaining: 2, .. }));
        assert_eq!(limiter.try_reserve(2), Reservation::Granted { remaining: 0 });
        assert!(matches!(limiter.try_reserve(1), Reservation::Denied { remaining: 0, .. }));
    }

    #[tokio::test]
    async fn quota_resets_after_reset_at() {
        let limiter = limiter(0, Duration::minutes(1)).await;
        let later = Utc::now() + Duration::minutes(2);
        assert_eq!(limiter.try_reserve_at(100, later), Reservation::Granted { remaining: 200 });
        assert!(limiter.snapshot().reset_at > later);
    }

    #[tokio::test]
    async fn concurrent_reservations_respect_remaining() {
        let limiter = limiter(10, Duration::minutes(10)).await;
        let mut handles = Vec::new();
        for _ in 0..20 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.try_reserve(1) }));
        }
        let mut granted = 0;
        for h in handles {
            if matches!(h.await.unwrap(), Reservation::Granted { .. }) {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(limiter.snapshot().remaining, 0);
    }

    #[tokio::test]
    async fn remote_quota_cannot_hand_out_reserved_units() {
        let limiter = limiter(10, Duration::minutes(10)).await;
        let reset_at = limiter.snapshot().reset_at;
        let remote = |remaining| RateLimitState {
            remaining,
            limit: 10,
            reset_at,
        };

        // Job A reserves 6 and spends 3 of them; the remote reports 7 left.
        assert_eq!(limiter.try_reserve(6), Reservation::Granted { remaining: 4 });
        limiter.settle(3, Some(remote(7)));
        assert_eq!(limiter.outstanding(), 3);
        assert_eq!(limiter.snapshot().remaining, 4);

        // A header seen before the settle still leaves A's units reserved.
        limiter.observe(remote(8));
        assert_eq!(limiter.snapshot().remaining, 5);
        assert!(matches!(limiter.try_reserve(6), Reservation::Denied { remaining: 5, .. }));

        // A finishes; B can have what is really left.
        limiter.settle(3, Some(remote(4)));
        assert_eq!(limiter.outstanding(), 0);
        assert_eq!(limiter.try_reserve(4), Reservation::Granted { remaining: 0 });
    }

    #[tokio::test]
    async fn released_units_return_to_the_quota() {
        let limiter = limiter(10, Duration::minutes(10)).await;
        limiter.try_reserve(8);
        limiter.settle(2, None);
        limiter.release(6, None);
        assert_eq!(limiter.outstanding(), 0);
        assert_eq!(limiter.snapshot().remaining, 8);

        limiter.release(5, None);
        assert_eq!(limiter.snapshot().remaining, 8);
    }

    #[tokio::test]
    async fn persist_round_trips() {
        let limiter = limiter(50, Duration::minutes(10)).await;
        limiter.try_reserve(20);
        limiter.settle(20, None);
        limiter.persist().await.unwrap();
        let reloaded =
            RateLimiter::load(limiter.store.clone(), "metrics", RateLimitConfig::default())
                .await
                .unwrap();
        assert_eq!(reloaded.snapshot().remaining, 30);
    }
}
