//! Per-replica lease table management.
//!
//! Each replica keeps its lock leases as versioned records in a `LockStore`
//! and decides every operation purely from its local table. Mutual exclusion
//! across the cluster comes from clients requiring a majority of replicas to
//! agree, not from any replica-to-replica coordination.
//!
//! Fencing token counters are persisted under a separate key per lock name
//! so that releasing a lock (which deletes its record) never resets the
//! counter. Token issuance folds in a client-provided hint, which lets
//! replicas that missed grants catch their counter up lazily.

use std::sync::Arc;

use crate::server::{FencingToken, Version};
use crate::server::store::{
    DeleteOutcome, Expect, LockStore, PutOutcome, StoredEntry,
};
use crate::utils::PalisadeError;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use tokio::time::Duration;

/// Maximum TTL a single grant or renewal may ask for.
const MAX_LEASE_TTL: Duration = Duration::from_secs(3600);

/// Attempts to take a token counter CAS slot before giving up.
const TOKEN_CAS_RETRIES: usize = 100;

/// A lock lease record as stored under its `rec/` key. Version numbers and
/// expiration deadlines are kept by the store itself, not in the record.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Lock name.
    pub name: String,

    /// Opaque identity of the current holder.
    pub owner_id: String,

    /// Fencing token issued with this grant.
    pub fencing_token: FencingToken,
}

/// Read-only view of one replica's record for a lock name, as reported to
/// inspection queries.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RecordView {
    /// Opaque identity of the current holder.
    pub holder: String,

    /// Fencing token issued with the grant.
    pub fencing_token: FencingToken,

    /// Record version on this replica.
    pub version: Version,

    /// Milliseconds until this replica considers the lease expired; zero if
    /// already past the deadline.
    pub remaining_ms: u64,

    /// True if the lease is past its deadline but not yet taken over.
    pub expired: bool,
}

/// Result of a grant attempt on a vacant name.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CreateOutcome {
    /// Lease created (or re-reported to the same owner).
    Created {
        token: FencingToken,
        version: Version,
    },

    /// Some other owner's record is in the way. `expired` tells whether a
    /// takeover attempt would be admissible.
    Occupied {
        holder: String,
        version: Version,
        expired: bool,
    },
}

/// Result of a takeover attempt on an expired record.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TakeoverOutcome {
    /// Expired record replaced by a fresh grant.
    Taken {
        token: FencingToken,
        version: Version,
    },

    /// Record is still within its lease window.
    NotExpired { holder: String },

    /// Record changed or vanished between inspection and replacement.
    Raced,
}

/// Result of a renewal attempt.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RenewOutcome {
    /// Deadline pushed out; record now at this version.
    Renewed { version: Version },

    /// Record is held by someone else.
    NotOwner { holder: String },

    /// Owner matches but the record moved past the presented version.
    VersionConflict { current: Version },

    /// No record under this name.
    Gone,
}

/// Result of a release attempt.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ReleaseOutcome {
    /// Record deleted.
    Released,

    /// No record under this name; releasing is idempotent.
    AlreadyGone,

    /// Record is held by someone else.
    NotOwner { holder: String },

    /// Record version moved between inspection and deletion.
    Raced { current: Version },
}

/// The lease table manager of one lock server replica. All operations are
/// conditional writes against the underlying store, so concurrent servant
/// tasks can drive a shared manager safely.
pub struct LeaseManager<S: LockStore> {
    /// Record store holding lease records and token counters.
    store: Arc<S>,
}

impl<S: LockStore> LeaseManager<S> {
    /// Creates a new lease manager over the given store.
    pub fn new(store: Arc<S>) -> Self {
        LeaseManager { store }
    }

    /// Key of the lease record for a lock name.
    #[inline]
    fn rec_key(name: &str) -> String {
        format!("rec/{}", name)
    }

    /// Key of the persisted fencing token counter for a lock name.
    #[inline]
    fn tok_key(name: &str) -> String {
        format!("tok/{}", name)
    }

    fn check_ttl(ttl: Duration) -> Result<(), PalisadeError> {
        if ttl.is_zero() || ttl > MAX_LEASE_TTL {
            logged_err!("invalid lease ttl {:?}", ttl)
        } else {
            Ok(())
        }
    }

    fn decode_record(entry: &StoredEntry) -> Result<LockRecord, PalisadeError> {
        Ok(rmp_serde::from_slice(&entry.value)?)
    }

    fn encode_record(record: &LockRecord) -> Result<Bytes, PalisadeError> {
        Ok(Bytes::from(rmp_serde::to_vec(record)?))
    }

    /// Bumps and persists the fencing token counter for a name, folding in
    /// the client-provided hint. Returns the freshly issued token, which is
    /// strictly greater than both the stored counter and the hint.
    async fn issue_token(
        &self,
        name: &str,
        hint: FencingToken,
    ) -> Result<FencingToken, PalisadeError> {
        let key = Self::tok_key(name);
        for _ in 0..TOKEN_CAS_RETRIES {
            match self.store.get(&key).await? {
                Some(entry) => {
                    let current: FencingToken =
                        rmp_serde::from_slice(&entry.value)?;
                    let token = current.max(hint) + 1;
                    let value = Bytes::from(rmp_serde::to_vec(&token)?);
                    if let PutOutcome::Stored { .. } = self
                        .store
                        .put_if(
                            &key,
                            value,
                            Expect::Version(entry.version),
                            None,
                        )
                        .await?
                    {
                        return Ok(token);
                    }
                }
                None => {
                    let token = hint + 1;
                    let value = Bytes::from(rmp_serde::to_vec(&token)?);
                    if let PutOutcome::Stored { .. } = self
                        .store
                        .put_if(&key, value, Expect::MustNotExist, None)
                        .await?
                    {
                        return Ok(token);
                    }
                }
            }
            // lost the CAS slot to a concurrent issuer; go around
        }
        logged_err!("token counter for '{}' too contended", name)
    }

    /// Attempts to grant a lease on `name` to `owner` for `ttl`. Succeeds
    /// only if no record exists under the name; an expired record still
    /// blocks creation and must go through `force_takeover` instead. A
    /// repeated attempt by the current holder reports the existing grant.
    pub async fn try_create(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        token_hint: FencingToken,
    ) -> Result<CreateOutcome, PalisadeError> {
        Self::check_ttl(ttl)?;
        let key = Self::rec_key(name);

        loop {
            if let Some(entry) = self.store.get(&key).await? {
                let record = Self::decode_record(&entry)?;
                if record.owner_id == owner && !entry.is_expired() {
                    pf_trace!(
                        "repeated grant of '{}' to {} @ token {}",
                        name,
                        owner,
                        record.fencing_token
                    );
                    return Ok(CreateOutcome::Created {
                        token: record.fencing_token,
                        version: entry.version,
                    });
                }
                return Ok(CreateOutcome::Occupied {
                    holder: record.owner_id,
                    version: entry.version,
                    expired: entry.is_expired(),
                });
            }

            let token = self.issue_token(name, token_hint).await?;
            let record = LockRecord {
                name: name.into(),
                owner_id: owner.into(),
                fencing_token: token,
            };
            let value = Self::encode_record(&record)?;

            match self
                .store
                .put_if(&key, value, Expect::MustNotExist, Some(ttl))
                .await?
            {
                PutOutcome::Stored { version } => {
                    pf_debug!(
                        "granted '{}' to {} @ token {} v{}",
                        name,
                        owner,
                        token,
                        version
                    );
                    return Ok(CreateOutcome::Created { token, version });
                }
                PutOutcome::Exists { .. } => {
                    // raced with a concurrent creator; go around to report
                    // theirs (or retry if it vanished again)
                    continue;
                }
                outcome => {
                    return logged_err!(
                        "unexpected create outcome {:?}",
                        outcome
                    );
                }
            }
        }
    }

    /// Replaces an expired record on `name` with a fresh grant to `owner`.
    /// Refuses if the record is still within its lease window; reports a
    /// race if the record changed or vanished underneath.
    pub async fn force_takeover(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        token_hint: FencingToken,
    ) -> Result<TakeoverOutcome, PalisadeError> {
        Self::check_ttl(ttl)?;
        let key = Self::rec_key(name);

        let entry = match self.store.get(&key).await? {
            Some(entry) => entry,
            None => return Ok(TakeoverOutcome::Raced),
        };
        let old = Self::decode_record(&entry)?;
        if !entry.is_expired() {
            return Ok(TakeoverOutcome::NotExpired {
                holder: old.owner_id,
            });
        }

        let token = self.issue_token(name, token_hint).await?;
        let record = LockRecord {
            name: name.into(),
            owner_id: owner.into(),
            fencing_token: token,
        };
        let value = Self::encode_record(&record)?;

        match self
            .store
            .put_if(&key, value, Expect::Version(entry.version), Some(ttl))
            .await?
        {
            PutOutcome::Stored { version } => {
                pf_debug!(
                    "took over expired '{}' from {} for {} @ token {} v{}",
                    name,
                    old.owner_id,
                    owner,
                    token,
                    version
                );
                Ok(TakeoverOutcome::Taken { token, version })
            }
            PutOutcome::VersionMismatch { .. } | PutOutcome::Missing => {
                Ok(TakeoverOutcome::Raced)
            }
            outcome => {
                logged_err!("unexpected takeover outcome {:?}", outcome)
            }
        }
    }

    /// Pushes the lease deadline on `name` out to `ttl` from now, if the
    /// record still belongs to `owner` at exactly `version`. A record past
    /// its deadline that nobody has taken over yet is still renewable.
    pub async fn renew(
        &self,
        name: &str,
        owner: &str,
        version: Version,
        ttl: Duration,
    ) -> Result<RenewOutcome, PalisadeError> {
        Self::check_ttl(ttl)?;
        let key = Self::rec_key(name);

        let entry = match self.store.get(&key).await? {
            Some(entry) => entry,
            None => return Ok(RenewOutcome::Gone),
        };
        let record = Self::decode_record(&entry)?;
        if record.owner_id != owner {
            return Ok(RenewOutcome::NotOwner {
                holder: record.owner_id,
            });
        }
        if entry.version != version {
            return Ok(RenewOutcome::VersionConflict {
                current: entry.version,
            });
        }

        let value = Self::encode_record(&record)?;
        match self
            .store
            .put_if(&key, value, Expect::Version(version), Some(ttl))
            .await?
        {
            PutOutcome::Stored { version } => {
                pf_trace!("renewed '{}' for {} v{}", name, owner, version);
                Ok(RenewOutcome::Renewed { version })
            }
            PutOutcome::VersionMismatch { current } => {
                Ok(RenewOutcome::VersionConflict { current })
            }
            PutOutcome::Missing => Ok(RenewOutcome::Gone),
            outcome => {
                logged_err!("unexpected renew outcome {:?}", outcome)
            }
        }
    }

    /// Deletes the record on `name` if it still belongs to `owner` at
    /// exactly `version`. The fencing token counter is left in place.
    pub async fn release(
        &self,
        name: &str,
        owner: &str,
        version: Version,
    ) -> Result<ReleaseOutcome, PalisadeError> {
        let key = Self::rec_key(name);

        let entry = match self.store.get(&key).await? {
            Some(entry) => entry,
            None => return Ok(ReleaseOutcome::AlreadyGone),
        };
        let record = Self::decode_record(&entry)?;
        if record.owner_id != owner {
            return Ok(ReleaseOutcome::NotOwner {
                holder: record.owner_id,
            });
        }

        match self.store.delete_if(&key, Some(version)).await? {
            DeleteOutcome::Deleted => {
                pf_debug!("released '{}' held by {}", name, owner);
                Ok(ReleaseOutcome::Released)
            }
            DeleteOutcome::VersionMismatch { current } => {
                Ok(ReleaseOutcome::Raced { current })
            }
            DeleteOutcome::Missing => Ok(ReleaseOutcome::AlreadyGone),
        }
    }

    /// Reports this replica's record for `name`, expired or not.
    pub async fn inspect(
        &self,
        name: &str,
    ) -> Result<Option<RecordView>, PalisadeError> {
        let key = Self::rec_key(name);
        match self.store.get(&key).await? {
            Some(entry) => {
                let record = Self::decode_record(&entry)?;
                Ok(Some(RecordView {
                    holder: record.owner_id,
                    fencing_token: record.fencing_token,
                    version: entry.version,
                    remaining_ms: entry
                        .remaining()
                        .unwrap_or(Duration::ZERO)
                        .as_millis() as u64,
                    expired: entry.is_expired(),
                }))
            }
            None => Ok(None),
        }
    }
}
