//! Lease-based mutual exclusion and the fetch cooldown marker, both kept in the
//! shared key-value store so they hold across processes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use jfi_storage::{KvStore, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

pub const FETCH_LOCK_KEY: &str = "jobs:fetch:lock";
pub const LAST_RUN_MARKER_KEY: &str = "jobs:fetch:last_run_at";

/// Proof of a held lease. Hand it back to [`RunLock::release`]; the TTL
/// reclaims it if the holder dies first.
#[derive(Debug)]
#[must_use = "a lease that is never released blocks other holders until its TTL lapses"]
pub struct LeaseGuard {
    key: String,
    token: String,
    acquired_at: DateTime<Utc>,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }
}

#[derive(Clone)]
pub struct RunLock {
    kv: Arc<dyn KvStore>,
}

impl RunLock {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseGuard>, StoreError> {
        let token = Uuid::new_v4().to_string();
        if !self.kv.set_if_absent(key, &token, ttl).await? {
            return Ok(None);
        }
        debug!(key, ?ttl, "lease acquired");
        Ok(Some(LeaseGuard {
            key: key.to_string(),
            token,
            acquired_at: Utc::now(),
        }))
    }

    /// Deletes the key unconditionally.
    pub async fn release(&self, guard: LeaseGuard) -> Result<(), StoreError> {
        self.kv.delete(&guard.key).await?;
        debug!(key = %guard.key, "lease released");
        Ok(())
    }
}

/// Minimum spacing between successful fetch cycles.
#[derive(Clone)]
pub struct Cooldown {
    kv: Arc<dyn KvStore>,
    min_interval: Duration,
    marker_ttl: Duration,
}

impl Cooldown {
    pub fn new(kv: Arc<dyn KvStore>, min_interval: Duration, marker_ttl: Duration) -> Self {
        Self {
            kv,
            min_interval,
            marker_ttl,
        }
    }

    /// Time left before another cycle may run, or `None` when it may run now.
    pub async fn remaining(&self, now: DateTime<Utc>) -> Result<Option<Duration>, StoreError> {
        let Some(raw) = self.kv.get(LAST_RUN_MARKER_KEY).await? else {
            return Ok(None);
        };
        let last_run = match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(err) => {
                warn!(marker = %raw, error = %err, "ignoring unreadable cooldown marker");
                return Ok(None);
            }
        };
        let elapsed = (now - last_run).to_std().unwrap_or(Duration::ZERO);
        Ok((elapsed < self.min_interval).then(|| self.min_interval - elapsed))
    }

    pub async fn mark(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let value = at.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.kv.set(LAST_RUN_MARKER_KEY, &value, self.marker_ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jfi_storage::MemoryKv;

    #[tokio::test]
    async fn concurrent_acquire_has_exactly_one_winner() {
        let lock = RunLock::new(Arc::new(MemoryKv::new()));
        let ttl = Duration::from_secs(60);
        let (a, b) = tokio::join!(
            lock.try_acquire(FETCH_LOCK_KEY, ttl),
            lock.try_acquire(FETCH_LOCK_KEY, ttl)
        );
        let winners = [a.unwrap(), b.unwrap()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        assert_eq!(winners.len(), 1);

        for guard in winners {
            lock.release(guard).await.unwrap();
        }
        let again = lock.try_acquire(FETCH_LOCK_KEY, ttl).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_lease_expires_with_its_ttl() {
        let lock = RunLock::new(Arc::new(MemoryKv::new()));
        let held = lock
            .try_acquire(FETCH_LOCK_KEY, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(held.is_some());
        assert!(lock
            .try_acquire(FETCH_LOCK_KEY, Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(lock
            .try_acquire(FETCH_LOCK_KEY, Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn cooldown_reports_time_left_after_mark() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let cooldown = Cooldown::new(kv.clone(), Duration::from_secs(300), Duration::from_secs(3600));
        let now = Utc::now();
        assert_eq!(cooldown.remaining(now).await.unwrap(), None);

        cooldown.mark(now - chrono::Duration::seconds(120)).await.unwrap();
        let left = cooldown.remaining(now).await.unwrap().unwrap();
        assert!(left <= Duration::from_secs(180) && left > Duration::from_secs(179));

        cooldown.mark(now - chrono::Duration::seconds(301)).await.unwrap();
        assert_eq!(cooldown.remaining(now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_marker_does_not_block() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        kv.set(LAST_RUN_MARKER_KEY, "yesterday-ish", Duration::from_secs(60))
            .await
            .unwrap();
        let cooldown = Cooldown::new(kv, Duration::from_secs(300), Duration::from_secs(3600));
        assert_eq!(cooldown.remaining(Utc::now()).await.unwrap(), None);
    }
}
