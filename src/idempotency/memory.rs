use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppResult;

use super::{BeginOutcome, IdempotencyStore, StoredResult};

struct Record {
    result: Option<StoredResult>,
    expires_at: DateTime<Utc>,
}

/// In-memory idempotency store with the same first-writer-wins semantics as
/// the Postgres one. Only safe with a single process; multi-instance
/// deployments must use the shared store.
pub struct MemoryIdempotencyStore {
    records: RwLock<HashMap<(Uuid, String), Record>>,
    ttl: Duration,
}

impl MemoryIdempotencyStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn begin(&self, key: &str, requester_id: Uuid) -> AppResult<BeginOutcome> {
        let mut records = self.records.write().await;
        let map_key = (requester_id, key.to_string());
        let now = Utc::now();

        if let Some(record) = records.get(&map_key) {
            if record.expires_at > now {
                return Ok(match &record.result {
                    Some(result) => BeginOutcome::Replay(result.clone()),
                    None => BeginOutcome::InProgress,
                });
            }
            // Expired: the claim is up for grabs again
        }

        records.insert(
            map_key,
            Record {
                result: None,
                expires_at: now + self.ttl,
            },
        );
        Ok(BeginOutcome::New)
    }

    async fn complete(
        &self,
        key: &str,
        requester_id: Uuid,
        result: StoredResult,
    ) -> AppResult<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&(requester_id, key.to_string())) {
            // Write-once: the first terminal result wins
            if record.result.is_none() {
                record.result = Some(result);
            }
        }
        Ok(())
    }

    async fn abandon(&self, key: &str, requester_id: Uuid) -> AppResult<()> {
        let mut records = self.records.write().await;
        let map_key = (requester_id, key.to_string());
        // Only a still-pending claim may be abandoned; a cached result stays
        if records
            .get(&map_key)
            .map(|r| r.result.is_none())
            .unwrap_or(false)
        {
            records.remove(&map_key);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> AppResult<u64> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;

    const KEY: &str = "key_0123456789abcdef";

    fn result(status: &str) -> StoredResult {
        StoredResult {
            payload: serde_json::json!({ "status": status }),
            status: status.to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_begin_is_new_then_in_progress() {
        let store = MemoryIdempotencyStore::new(60);
        let user = Uuid::new_v4();

        assert!(matches!(
            store.begin(KEY, user).await.unwrap(),
            BeginOutcome::New
        ));
        assert!(matches!(
            store.begin(KEY, user).await.unwrap(),
            BeginOutcome::InProgress
        ));
    }

    #[tokio::test]
    async fn test_completed_key_replays_stored_result() {
        let store = MemoryIdempotencyStore::new(60);
        let user = Uuid::new_v4();

        store.begin(KEY, user).await.unwrap();
        store.complete(KEY, user, result("SETTLED")).await.unwrap();

        match store.begin(KEY, user).await.unwrap() {
            BeginOutcome::Replay(stored) => assert_eq!(stored.status, "SETTLED"),
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_requester() {
        let store = MemoryIdempotencyStore::new(60);

        assert!(matches!(
            store.begin(KEY, Uuid::new_v4()).await.unwrap(),
            BeginOutcome::New
        ));
        // Same token, different requester: a fresh claim
        assert!(matches!(
            store.begin(KEY, Uuid::new_v4()).await.unwrap(),
            BeginOutcome::New
        ));
    }

    #[tokio::test]
    async fn test_abandon_frees_the_key_for_retry() {
        let store = MemoryIdempotencyStore::new(60);
        let user = Uuid::new_v4();

        store.begin(KEY, user).await.unwrap();
        store.abandon(KEY, user).await.unwrap();

        // A rejected request is not cached; the retry re-executes
        assert!(matches!(
            store.begin(KEY, user).await.unwrap(),
            BeginOutcome::New
        ));
    }

    #[tokio::test]
    async fn test_abandon_never_drops_a_cached_result() {
        let store = MemoryIdempotencyStore::new(60);
        let user = Uuid::new_v4();

        store.begin(KEY, user).await.unwrap();
        store.complete(KEY, user, result("SETTLED")).await.unwrap();
        store.abandon(KEY, user).await.unwrap();

        assert!(matches!(
            store.begin(KEY, user).await.unwrap(),
            BeginOutcome::Replay(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_begins_elect_one_executor() {
        let store = Arc::new(MemoryIdempotencyStore::new(60));
        let user = Uuid::new_v4();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    matches!(store.begin(KEY, user).await.unwrap(), BeginOutcome::New)
                })
            })
            .collect();

        let winners = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_records_are_purged_and_reclaimable() {
        let store = MemoryIdempotencyStore::new(0);
        let user = Uuid::new_v4();

        store.begin(KEY, user).await.unwrap();
        store.complete(KEY, user, result("SETTLED")).await.unwrap();

        // TTL of zero: the record is immediately stale
        assert!(matches!(
            store.begin(KEY, user).await.unwrap(),
            BeginOutcome::New
        ));

        assert!(store.purge_expired().await.unwrap() >= 1);
    }
}
