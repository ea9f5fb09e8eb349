pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{AppResult, LockError};

pub use postgres::PgMutex;

const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A held lease. The owner token is what guards renew/release against a
/// competitor that stole the key after expiry.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

pub(crate) fn new_owner_token() -> String {
    let token: u128 = rand::rng().random();
    format!("{:032x}", token)
}

/// Cross-process mutex with lease TTLs. Required only for flows spanning
/// more than one atomic ledger mutation; single-record updates are already
/// linearized by the store.
///
/// A lease is never held indefinitely: expiry makes the key stealable, and a
/// holder whose critical section may outlive the TTL must renew.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// One attempt; None when someone else holds an unexpired lease.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<Lease>>;

    /// Extend a held lease. Fails with LeaseLost when the key expired and
    /// was taken over.
    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> AppResult<()>;

    async fn release(&self, lease: Lease) -> AppResult<()>;

    /// Bounded-wait acquire: retry until `max_wait` elapses, then give up
    /// with AcquireTimeout rather than queue forever.
    async fn acquire(&self, key: &str, ttl: Duration, max_wait: Duration) -> AppResult<Lease> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(max_wait)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        loop {
            if let Some(lease) = self.try_acquire(key, ttl).await? {
                return Ok(lease);
            }
            if Utc::now() >= deadline {
                return Err(LockError::AcquireTimeout(key.to_string()).into());
            }
            tokio::time::sleep(ACQUIRE_RETRY_DELAY).await;
        }
    }
}

struct Held {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// Single-process mutex with the same lease semantics as the Postgres one.
pub struct MemoryMutex {
    leases: RwLock<HashMap<String, Held>>,
}

impl MemoryMutex {
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedMutex for MemoryMutex {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<Lease>> {
        let mut leases = self.leases.write().await;
        let now = Utc::now();

        if let Some(held) = leases.get(key) {
            if held.expires_at > now {
                return Ok(None);
            }
            // Expired lease: stealable
        }

        let owner = new_owner_token();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| {
            chrono::Duration::seconds(10)
        });

        leases.insert(
            key.to_string(),
            Held {
                owner: owner.clone(),
                expires_at,
            },
        );

        Ok(Some(Lease {
            key: key.to_string(),
            owner,
            expires_at,
        }))
    }

    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> AppResult<()> {
        let mut leases = self.leases.write().await;

        match leases.get_mut(&lease.key) {
            Some(held) if held.owner == lease.owner => {
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(10));
                held.expires_at = expires_at;
                lease.expires_at = expires_at;
                Ok(())
            }
            _ => Err(LockError::LeaseLost(lease.key.clone()).into()),
        }
    }

    async fn release(&self, lease: Lease) -> AppResult<()> {
        let mut leases = self.leases.write().await;
        if leases
            .get(&lease.key)
            .map(|held| held.owner == lease.owner)
            .unwrap_or(false)
        {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_second_acquire_is_blocked() {
        let mutex = MemoryMutex::new();

        let lease = mutex.try_acquire("op:1", TTL).await.unwrap();
        assert!(lease.is_some());
        assert!(mutex.try_acquire("op:1", TTL).await.unwrap().is_none());
        // Different key is unrelated
        assert!(mutex.try_acquire("op:2", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_frees_the_key() {
        let mutex = MemoryMutex::new();

        let lease = mutex.try_acquire("op:1", TTL).await.unwrap().unwrap();
        mutex.release(lease).await.unwrap();
        assert!(mutex.try_acquire("op:1", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_stealable() {
        let mutex = MemoryMutex::new();

        let stale = mutex
            .try_acquire("op:1", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        let stolen = mutex.try_acquire("op:1", TTL).await.unwrap();
        assert!(stolen.is_some());

        // The original holder lost its renew and release rights
        let mut stale = stale;
        let err = mutex.renew(&mut stale, TTL).await.unwrap_err();
        assert!(matches!(err, AppError::Lock(LockError::LeaseLost(_))));
    }

    #[tokio::test]
    async fn test_renew_extends_the_lease() {
        let mutex = MemoryMutex::new();

        let mut lease = mutex
            .try_acquire("op:1", Duration::from_millis(80))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        mutex.renew(&mut lease, TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Past the original TTL but inside the renewed one
        assert!(mutex.try_acquire("op:1", TTL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_wait_is_bounded() {
        let mutex = Arc::new(MemoryMutex::new());
        let _held = mutex.try_acquire("op:1", Duration::from_secs(10)).await.unwrap();

        let err = mutex
            .acquire("op:1", TTL, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Lock(LockError::AcquireTimeout(_))));
    }

    #[tokio::test]
    async fn test_acquire_wins_after_release() {
        let mutex = Arc::new(MemoryMutex::new());
        let lease = mutex.try_acquire("op:1", Duration::from_secs(10)).await.unwrap().unwrap();

        let waiter = {
            let mutex = mutex.clone();
            tokio::spawn(async move {
                mutex
                    .acquire("op:1", TTL, Duration::from_secs(2))
                    .await
                    .is_ok()
            })
        };

        tokio::time::sleep(Duration::from_millis(80)).await;
        mutex.release(lease).await.unwrap();

        assert!(waiter.await.unwrap());
    }
}
