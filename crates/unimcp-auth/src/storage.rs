//! TTL'd key-value repositories backing the auth state.
//!
//! The core depends only on this interface; the in-memory implementation
//! is the per-process default. Keys are namespaced by logical area.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::AuthError;

/// Key prefixes for the persisted areas.
pub mod keys {
    /// Client registrations, TTL 30 days.
    pub const CLIENTS: &str = "auth/clients/";
    /// Authorization codes, TTL ≤ 60 s.
    pub const CODES: &str = "auth/codes/";
    /// Token sessions, TTL = access-token TTL.
    pub const SESSIONS: &str = "auth/sessions/";
    /// Streamable-HTTP session metadata for restoration.
    pub const TRANSPORT: &str = "transport/streamable/";
}

/// The storage interface the core depends on.
#[async_trait]
pub trait KeyValueRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, AuthError>;
    async fn save(&self, key: &str, value: Value, ttl: Duration) -> Result<(), AuthError>;
    async fn delete(&self, key: &str) -> Result<(), AuthError>;
    /// Drop expired entries; returns how many were removed.
    async fn sweep(&self) -> Result<u64, AuthError>;
}

/// In-memory repository with per-entry expiry.
#[derive(Default)]
pub struct MemoryRepository {
    entries: DashMap<String, (Value, Instant)>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueRepository for MemoryRepository {
    async fn get(&self, key: &str) -> Result<Option<Value>, AuthError> {
        // The read guard must drop before the expired-entry removal, or
        // the shard write below would deadlock against it.
        let expired = match self.entries.get(key) {
            Some(entry) if entry.value().1 > Instant::now() => {
                return Ok(Some(entry.value().0.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn save(&self, key: &str, value: Value, ttl: Duration) -> Result<(), AuthError> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AuthError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn sweep(&self) -> Result<u64, AuthError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expiry)| *expiry > now);
        Ok((before - self.entries.len()) as u64)
    }
}

/// The three repositories the OAuth provider uses.
#[derive(Clone)]
pub struct OAuthStorage {
    pub clients: Arc<dyn KeyValueRepository>,
    pub codes: Arc<dyn KeyValueRepository>,
    pub sessions: Arc<dyn KeyValueRepository>,
}

impl OAuthStorage {
    /// All three areas over one in-memory store.
    pub fn in_memory() -> Self {
        let repo: Arc<dyn KeyValueRepository> = Arc::new(MemoryRepository::new());
        Self {
            clients: Arc::clone(&repo),
            codes: Arc::clone(&repo),
            sessions: repo,
        }
    }

    /// Sweep every area.
    pub async fn sweep(&self) -> u64 {
        let mut removed = 0;
        for repo in [&self.clients, &self.codes, &self.sessions] {
            if let Ok(n) = repo.sweep().await {
                removed += n;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_get_delete() {
        let repo = MemoryRepository::new();
        repo.save("k", serde_json::json!({"a": 1}), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(repo.get("k").await.unwrap().unwrap()["a"], 1);
        repo.delete("k").await.unwrap();
        assert!(repo.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let repo = MemoryRepository::new();
        repo.save("k", serde_json::json!(true), Duration::from_millis(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(repo.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_counts_removed() {
        let repo = MemoryRepository::new();
        repo.save("a", serde_json::json!(1), Duration::from_millis(0))
            .await
            .unwrap();
        repo.save("b", serde_json::json!(2), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(repo.sweep().await.unwrap(), 1);
        assert!(repo.get("b").await.unwrap().is_some());
    }
}
