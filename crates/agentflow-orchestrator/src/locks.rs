//! Resource Lock Manager (spec §4.3): named, TTL'd, owner-tagged advisory
//! locks with auto-expiry.
//!
//! Mutual exclusion per `resource_id`; no fairness guarantee beyond "older
//! waiters are likely to win", which is acceptable because workflows are
//! coarse-grained (spec's own framing). Deadlock avoidance is the caller's
//! responsibility: `acquire_ordered` takes a set of resource ids and sorts
//! them lexicographically before acquiring, per the Workflow Engine's
//! per-step `needs: [...]` contract in §4.10.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ResourceLock {
    pub resource_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    Conflict { held_by: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for lock on {0}")]
    WaitTimeout(String),
}

pub struct ResourceLockManager {
    locks: Mutex<HashMap<String, ResourceLock>>,
}

impl Default for ResourceLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a single lock. With `wait_timeout = None`, returns immediately
    /// with `Conflict` if held. With `Some(timeout)`, polls at exponentially
    /// increasing intervals (25ms -> 800ms cap) until the timeout elapses.
    pub async fn acquire(
        &self,
        resource_id: &str,
        owner: &str,
        ttl: Duration,
        wait_timeout: Option<Duration>,
    ) -> Result<AcquireOutcome, LockError> {
        let deadline = wait_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut backoff = Duration::from_millis(25);
        const BACKOFF_CAP: Duration = Duration::from_millis(800);

        loop {
            match self.try_acquire_once(resource_id, owner, ttl).await {
                AcquireOutcome::Acquired => return Ok(AcquireOutcome::Acquired),
                AcquireOutcome::Conflict { held_by } => {
                    let Some(deadline) = deadline else {
                        return Ok(AcquireOutcome::Conflict { held_by });
                    };
                    if tokio::time::Instant::now() >= deadline {
                        return Err(LockError::WaitTimeout(resource_id.to_string()));
                    }
                    tokio::time::sleep(backoff.min(BACKOFF_CAP)).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    /// Acquire multiple locks in lexicographic order of `resource_id`, as
    /// required by the Workflow Engine's deadlock-avoidance contract. On
    /// partial failure, releases whatever it already acquired.
    pub async fn acquire_ordered(
        &self,
        resource_ids: &[String],
        owner: &str,
        ttl: Duration,
        wait_timeout: Option<Duration>,
    ) -> Result<Vec<String>, LockError> {
        let mut ordered: Vec<String> = resource_ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut acquired = Vec::new();
        for resource_id in &ordered {
            match self.acquire(resource_id, owner, ttl, wait_timeout).await {
                Ok(AcquireOutcome::Acquired) => acquired.push(resource_id.clone()),
                Ok(AcquireOutcome::Conflict { .. }) | Err(_) => {
                    for held in &acquired {
                        self.release(held, owner).await;
                    }
                    return Err(LockError::WaitTimeout(resource_id.clone()));
                }
            }
        }
        Ok(acquired)
    }

    async fn try_acquire_once(&self, resource_id: &str, owner: &str, ttl: Duration) -> AcquireOutcome {
        let mut locks = self.locks.lock().await;
        let now = Utc::now();
        if let Some(existing) = locks.get(resource_id) {
            if existing.expires_at > now {
                return AcquireOutcome::Conflict {
                    held_by: existing.owner.clone(),
                };
            }
        }
        locks.insert(
            resource_id.to_string(),
            ResourceLock {
                resource_id: resource_id.to_string(),
                owner: owner.to_string(),
                acquired_at: now,
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
                reason: None,
            },
        );
        debug!(resource_id, owner, "lock acquired");
        AcquireOutcome::Acquired
    }

    /// No-op if not held by `owner`.
    pub async fn release(&self, resource_id: &str, owner: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(existing) = locks.get(resource_id) {
            if existing.owner == owner {
                locks.remove(resource_id);
                debug!(resource_id, owner, "lock released");
            }
        }
    }

    pub async fn release_all(&self, resource_ids: &[String], owner: &str) {
        for id in resource_ids {
            self.release(id, owner).await;
        }
    }

    /// Releases every lock currently held by `owner`, regardless of resource
    /// id. Used on workflow cancellation, where the caller does not know
    /// which step (if any) is mid-flight and holding locks at the moment the
    /// cancel signal lands. Returns the number of locks released.
    pub async fn release_owned(&self, owner: &str) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| lock.owner != owner);
        before - locks.len()
    }

    /// Admin override; records that the override happened via the returned
    /// reason so the caller can emit an audit event.
    pub async fn force_release(&self, resource_id: &str, reason: &str) -> bool {
        let mut locks = self.locks.lock().await;
        let removed = locks.remove(resource_id).is_some();
        if removed {
            warn!(resource_id, reason, "lock force-released");
        }
        removed
    }

    /// Delete rows whose TTL has elapsed. Intended to run on a timer.
    pub async fn sweep(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let now = Utc::now();
        let before = locks.len();
        locks.retain(|_, lock| lock.expires_at > now);
        before - locks.len()
    }

    pub async fn describe(&self, resource_id: &str) -> Option<ResourceLock> {
        self.locks.lock().await.get(resource_id).cloned()
    }
}

/// Spawns the 5-second sweep timer from spec §4.3.
pub fn spawn_sweeper(manager: Arc<ResourceLockManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let swept = manager.sweep().await;
            if swept > 0 {
                info!(swept, "resource lock sweep removed expired locks");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mutual_exclusion_per_resource() {
        let rlm = ResourceLockManager::new();
        let a = rlm
            .acquire("deploy:prod", "workflow-a", Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(a, AcquireOutcome::Acquired);

        let b = rlm
            .acquire("deploy:prod", "workflow-b", Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(
            b,
            AcquireOutcome::Conflict {
                held_by: "workflow-a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds() {
        let rlm = ResourceLockManager::new();
        rlm.acquire("r1", "a", Duration::from_secs(60), None)
            .await
            .unwrap();
        rlm.release("r1", "a").await;
        let outcome = rlm
            .acquire("r1", "b", Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired);
    }

    #[tokio::test]
    async fn release_noop_if_not_owner() {
        let rlm = ResourceLockManager::new();
        rlm.acquire("r1", "a", Duration::from_secs(60), None)
            .await
            .unwrap();
        rlm.release("r1", "someone-else").await;
        let outcome = rlm
            .acquire("r1", "b", Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Conflict {
                held_by: "a".to_string()
            }
        );
    }

    #[tokio::test]
    async fn expired_lock_does_not_block_new_acquire() {
        let rlm = ResourceLockManager::new();
        rlm.acquire("r1", "a", Duration::from_millis(10), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let outcome = rlm
            .acquire("r1", "b", Duration::from_secs(60), None)
            .await
            .unwrap();
        assert_eq!(outcome, AcquireOutcome::Acquired);
    }

    #[tokio::test]
    async fn sweep_removes_expired_rows() {
        let rlm = ResourceLockManager::new();
        rlm.acquire("r1", "a", Duration::from_millis(5), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let swept = rlm.sweep().await;
        assert_eq!(swept, 1);
        assert!(rlm.describe("r1").await.is_none());
    }

    #[tokio::test]
    async fn release_owned_drops_every_lock_for_that_owner_regardless_of_resource() {
        let rlm = ResourceLockManager::new();
        rlm.acquire("deploy:staging:a", "workflow-1", Duration::from_secs(60), None)
            .await
            .unwrap();
        rlm.acquire("deploy:prod:a", "workflow-1", Duration::from_secs(60), None)
            .await
            .unwrap();
        rlm.acquire("deploy:staging:b", "workflow-2", Duration::from_secs(60), None)
            .await
            .unwrap();

        let released = rlm.release_owned("workflow-1").await;
        assert_eq!(released, 2);
        assert!(rlm.describe("deploy:staging:a").await.is_none());
        assert!(rlm.describe("deploy:prod:a").await.is_none());
        assert!(rlm.describe("deploy:staging:b").await.is_some(), "other owners' locks must be untouched");
    }

    #[tokio::test]
    async fn ordered_acquisition_sorts_lexicographically() {
        let rlm = ResourceLockManager::new();
        let acquired = rlm
            .acquire_ordered(
                &["zeta".to_string(), "alpha".to_string()],
                "owner",
                Duration::from_secs(60),
                None,
            )
            .await
            .unwrap();
        assert_eq!(acquired, vec!["alpha".to_string(), "zeta".to_string()]);
    }
}
