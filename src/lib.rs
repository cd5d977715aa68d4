//! Palisade is a quorum-based distributed lock service. A lock is held by
//! acquiring leases on a quorum of independent replicas; leases expire on
//! their own, so crashed holders never wedge a lock, and every grant hands
//! out a monotonically increasing fencing token that protected resources
//! check to shut out stalled ex-holders.

#[macro_use]
mod utils;

mod client;
mod fence;
mod server;

pub use crate::utils::{
    logger_init, set_identity, Bitmap, PalisadeError, Timer, ME,
};

pub use crate::server::{
    CreateOutcome, DeleteOutcome, Expect, FencingToken, LeaseManager,
    LockNode, LockOp, LockOutcome, LockRecord, LockReply, LockRequest,
    LockService, LockStore, MemStore, NodeConfig, PutOutcome, RecordView,
    ReleaseOutcome, RenewOutcome, ReplicaId, RequestId, StoredEntry,
    TakeoverOutcome, Version,
};

pub use crate::client::{
    AcquireError, ClientConfig, ClientId, HandleStatus, LockClient,
    LockHandle, RenewError, ReplicaApiStub, ReplicaRecvStub, ReplicaSendStub,
};

pub use crate::fence::{FenceGate, StaleFencingToken};
