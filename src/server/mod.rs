//! Palisade's lock server functionality modules.

mod leaseman;
mod node;
mod service;
mod store;

/// Replica ID type, used cluster-wide as the position of a replica in the
/// configured endpoints list.
pub type ReplicaId = u8;

/// Fencing token type. Tokens are issued per lock name, start at 1, and
/// strictly increase across grants of that name.
pub type FencingToken = u64;

/// Record version type, bumped by every successful write to a record.
pub type Version = u64;

pub use leaseman::{
    CreateOutcome, LeaseManager, LockRecord, RecordView, ReleaseOutcome,
    RenewOutcome, TakeoverOutcome,
};
pub use node::{LockNode, NodeConfig};
pub use service::{
    LockOp, LockOutcome, LockReply, LockRequest, LockService, RequestId,
};
pub use store::{
    DeleteOutcome, Expect, LockStore, MemStore, PutOutcome, StoredEntry,
};
