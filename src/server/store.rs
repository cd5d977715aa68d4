//! Versioned record store underlying the lease manager.
//!
//! The store is a flat key -> bytes map where every live entry carries a
//! monotonically bumped version number and an optional expiration deadline.
//! Expiration is lazy: an entry past its deadline stays in the map, readable
//! with its `expired` flag raised, until some caller explicitly overwrites
//! or deletes it. All mutations are conditional (compare-and-swap on the
//! version, or must-not-exist), which is what makes lease handoffs safe.

use std::collections::HashMap;

use crate::utils::PalisadeError;

use async_trait::async_trait;

use bytes::Bytes;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Precondition attached to a `put_if` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The key must have no entry at all (an expired entry still counts as
    /// present).
    MustNotExist,

    /// The key must have an entry at exactly this version.
    Version(u64),
}

/// Result of a conditional put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// Entry written; reports the version it was stored at.
    Stored { version: u64 },

    /// `MustNotExist` failed because an entry is present.
    Exists { version: u64, expired: bool },

    /// `Version` precondition failed against a live entry.
    VersionMismatch { current: u64 },

    /// `Version` precondition failed because the key has no entry.
    Missing,
}

/// Result of a conditional delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Entry removed.
    Deleted,

    /// Version precondition failed against the current entry.
    VersionMismatch { current: u64 },

    /// The key has no entry.
    Missing,
}

/// Snapshot of one stored entry as returned by `get`.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// Opaque value bytes.
    pub value: Bytes,

    /// Version the entry is currently at.
    pub version: u64,

    /// Expiration deadline if the entry was stored with a TTL.
    pub expires_at: Option<Instant>,
}

impl StoredEntry {
    /// True if the entry carries a deadline that has already passed.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| at <= Instant::now())
            .unwrap_or(false)
    }

    /// Remaining time until expiration, zero if already expired. `None` if
    /// the entry has no deadline.
    #[inline]
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Interface of the record store a lease manager runs against. The provided
/// implementation is in-memory; something durable can be swapped in behind
/// this trait without touching lease logic.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Writes `value` under `key` if `expect` holds. A successful write over
    /// an existing entry bumps its version by one; a write to a vacant key
    /// starts at version 1. `ttl` of `None` stores the entry without a
    /// deadline.
    async fn put_if(
        &self,
        key: &str,
        value: Bytes,
        expect: Expect,
        ttl: Option<Duration>,
    ) -> Result<PutOutcome, PalisadeError>;

    /// Reads the entry under `key`, expired or not.
    async fn get(&self, key: &str)
        -> Result<Option<StoredEntry>, PalisadeError>;

    /// Deletes the entry under `key` if its version matches. With
    /// `expect_version` of `None` the delete is unconditional.
    async fn delete_if(
        &self,
        key: &str,
        expect_version: Option<u64>,
    ) -> Result<DeleteOutcome, PalisadeError>;
}

/// One live entry in the in-memory store.
#[derive(Debug, Clone)]
struct MemEntry {
    value: Bytes,
    version: u64,
    expires_at: Option<Instant>,
}

impl MemEntry {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-memory `LockStore` implementation holding everything in a mutexed
/// hash map. Expired entries are never purged in the background.
#[derive(Debug, Default)]
pub struct MemStore {
    /// Map from key to current entry.
    entries: Mutex<HashMap<String, MemEntry>>,
}

impl MemStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        MemStore {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LockStore for MemStore {
    async fn put_if(
        &self,
        key: &str,
        value: Bytes,
        expect: Expect,
        ttl: Option<Duration>,
    ) -> Result<PutOutcome, PalisadeError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);

        match entries.get_mut(key) {
            Some(entry) => match expect {
                Expect::MustNotExist => Ok(PutOutcome::Exists {
                    version: entry.version,
                    expired: entry.is_expired(now),
                }),
                Expect::Version(v) if entry.version == v => {
                    entry.value = value;
                    entry.version += 1;
                    entry.expires_at = expires_at;
                    Ok(PutOutcome::Stored {
                        version: entry.version,
                    })
                }
                Expect::Version(_) => Ok(PutOutcome::VersionMismatch {
                    current: entry.version,
                }),
            },

            None => match expect {
                Expect::MustNotExist => {
                    entries.insert(
                        key.into(),
                        MemEntry {
                            value,
                            version: 1,
                            expires_at,
                        },
                    );
                    Ok(PutOutcome::Stored { version: 1 })
                }
                Expect::Version(_) => Ok(PutOutcome::Missing),
            },
        }
    }

    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<StoredEntry>, PalisadeError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).map(|entry| StoredEntry {
            value: entry.value.clone(),
            version: entry.version,
            expires_at: entry.expires_at,
        }))
    }

    async fn delete_if(
        &self,
        key: &str,
        expect_version: Option<u64>,
    ) -> Result<DeleteOutcome, PalisadeError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) => match expect_version {
                Some(v) if entry.version != v => {
                    Ok(DeleteOutcome::VersionMismatch {
                        current: entry.version,
                    })
                }
                _ => {
                    entries.remove(key);
                    Ok(DeleteOutcome::Deleted)
                }
            },
            None => Ok(DeleteOutcome::Missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_create_get() -> Result<(), PalisadeError> {
        let store = MemStore::new();
        assert_eq!(
            store
                .put_if("k1", Bytes::from("v1"), Expect::MustNotExist, None)
                .await?,
            PutOutcome::Stored { version: 1 }
        );
        let entry = store.get("k1").await?.unwrap();
        assert_eq!(entry.value, Bytes::from("v1"));
        assert_eq!(entry.version, 1);
        assert!(!entry.is_expired());
        assert!(store.get("k2").await?.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_version_cas() -> Result<(), PalisadeError> {
        let store = MemStore::new();
        store
            .put_if("k1", Bytes::from("v1"), Expect::MustNotExist, None)
            .await?;
        assert_eq!(
            store
                .put_if("k1", Bytes::from("v2"), Expect::Version(1), None)
                .await?,
            PutOutcome::Stored { version: 2 }
        );
        assert_eq!(
            store
                .put_if("k1", Bytes::from("v3"), Expect::Version(1), None)
                .await?,
            PutOutcome::VersionMismatch { current: 2 }
        );
        assert_eq!(
            store
                .put_if("k1", Bytes::from("v3"), Expect::MustNotExist, None)
                .await?,
            PutOutcome::Exists {
                version: 2,
                expired: false
            }
        );
        assert_eq!(
            store
                .put_if("nope", Bytes::from("v1"), Expect::Version(7), None)
                .await?,
            PutOutcome::Missing
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_lazy_expiry() -> Result<(), PalisadeError> {
        let store = MemStore::new();
        store
            .put_if(
                "k1",
                Bytes::from("v1"),
                Expect::MustNotExist,
                Some(Duration::from_millis(50)),
            )
            .await?;
        assert!(!store.get("k1").await?.unwrap().is_expired());

        time::sleep(Duration::from_millis(80)).await;
        // still present, but flagged expired and blocking fresh creates
        let entry = store.get("k1").await?.unwrap();
        assert!(entry.is_expired());
        assert_eq!(entry.remaining(), Some(Duration::ZERO));
        assert_eq!(
            store
                .put_if("k1", Bytes::from("v2"), Expect::MustNotExist, None)
                .await?,
            PutOutcome::Exists {
                version: 1,
                expired: true
            }
        );

        // version replace over the expired entry still goes through
        assert_eq!(
            store
                .put_if("k1", Bytes::from("v2"), Expect::Version(1), None)
                .await?,
            PutOutcome::Stored { version: 2 }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn store_conditional_delete() -> Result<(), PalisadeError> {
        let store = MemStore::new();
        store
            .put_if("k1", Bytes::from("v1"), Expect::MustNotExist, None)
            .await?;
        assert_eq!(
            store.delete_if("k1", Some(9)).await?,
            DeleteOutcome::VersionMismatch { current: 1 }
        );
        assert_eq!(
            store.delete_if("k1", Some(1)).await?,
            DeleteOutcome::Deleted
        );
        assert_eq!(store.delete_if("k1", Some(1)).await?, DeleteOutcome::Missing);
        assert!(store.get("k1").await?.is_none());
        Ok(())
    }
}
