//! Palisade client lock handle implementation.
//!
//! A `LockHandle` is the capability a successful acquisition hands back.
//! It carries the fencing token of the grant and watches the lease state
//! its renewal keeper publishes. Releasing consumes the handle: the keeper
//! is stopped and joined first, so no renewal can be in flight while the
//! release requests go out.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::sync::Arc;

use crate::client::coord::{Coordinator, RoundPlan};
use crate::client::keeper::KeeperCmd;
use crate::server::{FencingToken, LockOp, LockOutcome, ReplicaId, Version};
use crate::utils::{Bitmap, PalisadeError};

use futures::future::join_all;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Externally visible status of a lock handle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HandleStatus {
    /// The lock is held and the keeper is renewing its lease.
    Held,

    /// The lock was released cleanly.
    Released,

    /// The validity window passed without a successful renewal.
    Expired,

    /// Ownership was definitively lost, or renewal retries exhausted.
    Invalidated,
}

/// Grant bookkeeping of one held lock, published by the renewal keeper on
/// every change.
#[derive(Debug, Clone)]
pub(crate) struct GrantState {
    /// Current handle status.
    pub(crate) status: HandleStatus,

    /// Conservative client-side validity deadline.
    pub(crate) valid_until: Instant,

    /// Last known record version per replica still granting the lease.
    pub(crate) versions: HashMap<ReplicaId, Version>,
}

/// Error type of manual lease renewals.
#[derive(Debug, PartialEq, Eq)]
pub enum RenewError {
    /// Ownership of the lock was lost to another holder.
    Lost,

    /// Renewal could not confirm enough replicas within its retries.
    Timeout,

    /// The handle no longer holds the lock.
    Invalid,

    /// Infrastructure failure underneath the renewal.
    Internal(PalisadeError),
}

impl fmt::Display for RenewError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RenewError::Lost => write!(f, "lock ownership lost"),
            RenewError::Timeout => write!(f, "renewal timed out"),
            RenewError::Invalid => write!(f, "handle no longer holds lock"),
            RenewError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl error::Error for RenewError {}

impl From<PalisadeError> for RenewError {
    fn from(e: PalisadeError) -> Self {
        RenewError::Internal(e)
    }
}

impl From<RenewError> for PalisadeError {
    fn from(e: RenewError) -> Self {
        PalisadeError::msg(e)
    }
}

/// The lock capability handed back by a successful acquisition.
pub struct LockHandle {
    /// Name of the held lock.
    name: String,

    /// Owner identity string this acquisition used.
    owner: String,

    /// Fencing token of the grant (highest across the granting quorum).
    fencing_token: FencingToken,

    /// Coordinator shared with the client, for the final release round.
    coord: Arc<Coordinator>,

    /// Timeout applied to each release request.
    reply_timeout: Duration,

    /// Receiver side of the keeper's state channel.
    rx_state: watch::Receiver<GrantState>,

    /// Sender side of the keeper's command channel. Dropping it (without a
    /// `Stop`) tells the keeper to exit without releasing.
    tx_cmd: mpsc::UnboundedSender<KeeperCmd>,

    /// Join handle of the keeper task; hands the state channel back.
    keeper_handle: Option<JoinHandle<watch::Sender<GrantState>>>,
}

impl LockHandle {
    /// Creates a new lock handle wrapping a freshly spawned keeper.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        owner: String,
        fencing_token: FencingToken,
        coord: Arc<Coordinator>,
        reply_timeout: Duration,
        rx_state: watch::Receiver<GrantState>,
        tx_cmd: mpsc::UnboundedSender<KeeperCmd>,
        keeper_handle: JoinHandle<watch::Sender<GrantState>>,
    ) -> Self {
        LockHandle {
            name,
            owner,
            fencing_token,
            coord,
            reply_timeout,
            rx_state,
            tx_cmd,
            keeper_handle: Some(keeper_handle),
        }
    }

    /// Returns the name of the held lock.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the owner identity string of this acquisition.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the fencing token of the grant. Writes guarded by this lock
    /// should carry this token to the protected resource.
    pub fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    /// Returns the current status of the handle.
    pub fn status(&self) -> HandleStatus {
        self.rx_state.borrow().status
    }

    /// Returns the current conservative validity deadline.
    pub fn valid_until(&self) -> Instant {
        self.rx_state.borrow().valid_until
    }

    /// Checks whether the lock is currently held with valid lease time
    /// remaining.
    pub fn is_valid(&self) -> bool {
        let state = self.rx_state.borrow();
        state.status == HandleStatus::Held
            && Instant::now() < state.valid_until
    }

    /// Waits until the keeper publishes a state change, then returns the
    /// new status.
    pub async fn status_changed(
        &mut self,
    ) -> Result<HandleStatus, PalisadeError> {
        self.rx_state.changed().await?;
        Ok(self.rx_state.borrow_and_update().status)
    }

    /// Runs a renewal sweep right now, ahead of the keeper's own cadence.
    pub async fn renew(&self) -> Result<(), RenewError> {
        if self.status() != HandleStatus::Held {
            return Err(self.not_held_error());
        }

        let (tx_done, rx_done) = oneshot::channel();
        if self.tx_cmd.send(KeeperCmd::Renew { tx_done }).is_err() {
            return Err(self.not_held_error());
        }
        match rx_done.await {
            Ok(verdict) => verdict,
            // keeper exited between accepting and answering the command
            Err(_) => Err(self.not_held_error()),
        }
    }

    /// Releases the lock: stops and joins the keeper, then asks every
    /// replica still granting the lease to delete its record. Lapsed or
    /// lost grants make this a no-op server-side, so the call reports `Ok`
    /// whatever the per-replica outcomes were.
    pub async fn release(mut self) -> Result<(), PalisadeError> {
        let _ = self.tx_cmd.send(KeeperCmd::Stop);
        let tx_state = match self.keeper_handle.take() {
            Some(handle) => handle.await?,
            None => return Ok(()),
        };

        let versions: Vec<(ReplicaId, Version)> = {
            let state = tx_state.borrow();
            if state.status != HandleStatus::Held {
                // already expired or invalidated; records lapse on their own
                return Ok(());
            }
            state.versions.iter().map(|(&r, &v)| (r, v)).collect()
        };

        let mut rounds = vec![];
        for &(replica, version) in versions.iter() {
            let mut target = Bitmap::new(self.coord.population(), false);
            target.set(replica, true)?;
            rounds.push(self.coord.round(RoundPlan {
                op: LockOp::Release {
                    name: self.name.clone(),
                    owner: self.owner.clone(),
                    version,
                },
                targets: target,
                early_quorum: None,
                timeout: self.reply_timeout,
            }));
        }

        for (&(replica, _), result) in
            versions.iter().zip(join_all(rounds).await)
        {
            match result {
                Ok(result) => match result.replies.get(&replica) {
                    Some(LockOutcome::Released) => {}
                    Some(outcome) => pf_warn!(
                        "replica {} replied {:?} to release of '{}'",
                        replica,
                        outcome,
                        self.name
                    ),
                    None => pf_warn!(
                        "replica {} silent on release of '{}'",
                        replica,
                        self.name
                    ),
                },
                Err(e) => pf_error!(
                    "error releasing '{}' on replica {}: {}",
                    self.name,
                    replica,
                    e
                ),
            }
        }

        tx_state.send_modify(|state| {
            state.status = HandleStatus::Released;
            state.versions.clear();
        });
        pf_debug!("released lock '{}'", self.name);
        Ok(())
    }

    /// Picks the renewal error that describes a handle whose keeper is no
    /// longer answering.
    fn not_held_error(&self) -> RenewError {
        match self.status() {
            HandleStatus::Invalidated => RenewError::Lost,
            HandleStatus::Held => {
                RenewError::Internal(PalisadeError::msg("keeper has exited"))
            }
            _ => RenewError::Invalid,
        }
    }
}
