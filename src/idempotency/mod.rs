pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppResult, IdempotencyError};

pub use memory::MemoryIdempotencyStore;
pub use postgres::PgIdempotencyStore;

/// Result payload cached for replays, exactly as the first execution
/// returned it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub payload: serde_json::Value,
    pub status: String,
}

/// Outcome of claiming an idempotency key.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// First observation of this key; the caller is the one executor.
    New,
    /// A previous execution already finished; replay its result verbatim.
    Replay(StoredResult),
    /// Another request holds the key and has not completed yet.
    InProgress,
}

/// Idempotency store - dedups repeated client requests sharing a key.
///
/// Two requests racing on a new key resolve to exactly one executor: the
/// claim is an insert that fails on duplicate. Results are persisted only for
/// definitively terminal outcomes; a rejected or internally-failed request
/// abandons its claim so a legitimate retry can execute.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claim `key` for `requester_id`. Keys are scoped per requester; the
    /// same token from two users is two keys.
    async fn begin(&self, key: &str, requester_id: Uuid) -> AppResult<BeginOutcome>;

    /// Persist the terminal result for a claimed key. No-op on a key that
    /// was never claimed (the record may have been purged meanwhile).
    async fn complete(
        &self,
        key: &str,
        requester_id: Uuid,
        result: StoredResult,
    ) -> AppResult<()>;

    /// Drop a pending claim without caching anything. Used for rejected
    /// requests and internal errors, where a retry must re-execute.
    async fn abandon(&self, key: &str, requester_id: Uuid) -> AppResult<()>;

    /// TTL sweep; returns the number of purged records.
    async fn purge_expired(&self) -> AppResult<u64>;
}

/// Opaque-token format gate: 16-128 chars of `[A-Za-z0-9_-]`. Checked before
/// any side effect, so a malformed key never reaches a store.
pub fn validate_key(key: &str) -> AppResult<()> {
    let well_formed = (16..=128).contains(&key.len())
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if !well_formed {
        return Err(IdempotencyError::MalformedKey.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format_gate() {
        assert!(validate_key("key_0123456789abcdef").is_ok());
        assert!(validate_key(&"x".repeat(128)).is_ok());
        assert!(validate_key(&"x".repeat(16)).is_ok());

        assert!(validate_key("short").is_err());
        assert!(validate_key(&"x".repeat(129)).is_err());
        assert!(validate_key("has spaces in it!").is_err());
        assert!(validate_key("").is_err());
        assert!(validate_key("key_with_ünicode_").is_err());
    }
}
