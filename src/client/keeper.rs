//! Palisade client lease renewal keeper implementation.
//!
//! Every held lock is kept alive by one keeper task. It ticks at the
//! renewal interval and runs a renewal sweep per tick: one single-target
//! renew round per replica still granting the lease (their record versions
//! diverge, so a broadcast round cannot carry the right CAS version for
//! everyone), with jittered retries for replicas that stayed silent.
//!
//! A sweep extends the client-side validity deadline only when at least a
//! quorum of replicas confirmed the renewal. The grant set matches the
//! acquisition quorum exactly, so a replica that denies ownership makes a
//! quorum unreachable: that is a definitive loss. Retry exhaustion or a
//! loss concludes the handle as invalidated; the validity timer firing
//! first concludes it as expired. Both are terminal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::client::coord::{Coordinator, RoundPlan, RoundResult};
use crate::client::detector::jittered_delay;
use crate::client::handle::{GrantState, HandleStatus, RenewError};
use crate::server::{LockOp, LockOutcome, ReplicaId, Version};
use crate::utils::{Bitmap, PalisadeError, Timer};

use futures::future::join_all;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Commands from the lock handle to its keeper.
pub(crate) enum KeeperCmd {
    /// Run a renewal sweep now and report the verdict.
    Renew {
        tx_done: oneshot::Sender<Result<(), RenewError>>,
    },

    /// Exit without touching the lease records; the handle issues the
    /// release requests itself after joining.
    Stop,
}

/// How one renewal sweep concluded.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum SweepVerdict {
    /// Enough replicas renewed; the validity deadline advanced.
    Extended,

    /// Could not confirm enough replicas within the retry budget.
    Exhausted,

    /// Enough replicas definitively denied ownership.
    Lost,
}

/// The lease renewal keeper, owned 1:1 by a lock handle.
pub(crate) struct LeaseKeeper {
    /// Coordinator shared with the owning client.
    pub(crate) coord: Arc<Coordinator>,

    /// Name of the held lock.
    pub(crate) name: String,

    /// Owner identity string of this acquisition.
    pub(crate) owner: String,

    /// Lease TTL re-requested on every renewal.
    pub(crate) ttl: Duration,

    /// Client-side validity of the initial grant.
    pub(crate) initial_validity: Duration,

    /// Cadence of automatic renewal sweeps.
    pub(crate) renew_interval: Duration,

    /// Safety margin subtracted from every validity computation.
    pub(crate) clock_drift_margin: Duration,

    /// Jittered retries allowed per sweep for silent replicas.
    pub(crate) max_renewal_retries: u8,

    /// Upper bound of the uniform retry jitter.
    pub(crate) retry_jitter: Duration,

    /// Timeout applied to each renew request.
    pub(crate) reply_timeout: Duration,

    /// Replicas that must confirm a sweep for the lease to stay valid.
    pub(crate) quorum: u8,

    /// Last known record version per replica still granting the lease.
    pub(crate) versions: HashMap<ReplicaId, Version>,

    /// Validity countdown; firing means the lease must be treated as lost.
    pub(crate) validity: Timer,

    /// Sender side of the grant state channel; handed back at exit.
    pub(crate) tx_state: watch::Sender<GrantState>,

    /// Receiver side of the handle's command channel.
    pub(crate) rx_cmd: mpsc::UnboundedReceiver<KeeperCmd>,
}

impl LeaseKeeper {
    /// Keeper task function. Runs until stopped, dropped, or the lease is
    /// concluded lost; returns the state channel sender so the handle can
    /// publish the released status after its release requests.
    pub(crate) async fn run(mut self) -> watch::Sender<GrantState> {
        if let Err(e) = self.validity.kickoff(self.initial_validity) {
            pf_error!("error starting validity timer: {}", e);
        }

        let mut ticker = time::interval_at(
            Instant::now() + self.renew_interval,
            self.renew_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        pf_debug!(
            "keeper of '{}' started (interval {} ms)",
            self.name,
            self.renew_interval.as_millis()
        );

        loop {
            tokio::select! {
                biased;

                cmd = self.rx_cmd.recv() => match cmd {
                    Some(KeeperCmd::Stop) => break,

                    Some(KeeperCmd::Renew { tx_done }) => {
                        let verdict = self.renew_sweep().await;
                        let _ = tx_done.send(match verdict {
                            SweepVerdict::Extended => Ok(()),
                            SweepVerdict::Exhausted => {
                                Err(RenewError::Timeout)
                            }
                            SweepVerdict::Lost => Err(RenewError::Lost),
                        });
                        if verdict != SweepVerdict::Extended {
                            self.conclude_lost(verdict);
                            break;
                        }
                    }

                    None => {
                        pf_warn!(
                            "handle of '{}' dropped without release; lease \
                             will lapse",
                            self.name
                        );
                        break;
                    }
                },

                _ = self.validity.timeout() => {
                    if !self.validity.exploded() {
                        // stale wakeup from a fire a later kickoff superseded
                        continue;
                    }
                    pf_warn!(
                        "lease of '{}' expired without renewal",
                        self.name
                    );
                    self.tx_state.send_modify(|state| {
                        state.status = HandleStatus::Expired;
                    });
                    break;
                }

                _ = ticker.tick() => {
                    let verdict = self.renew_sweep().await;
                    if verdict != SweepVerdict::Extended {
                        self.conclude_lost(verdict);
                        break;
                    }
                }
            }
        }

        pf_debug!("keeper of '{}' exited", self.name);
        self.tx_state
    }

    /// Runs one renewal sweep: a single-target renew round per replica
    /// still granting the lease, retrying silent ones with jittered delays
    /// up to the retry budget.
    async fn renew_sweep(&mut self) -> SweepVerdict {
        let sweep_start = Instant::now();
        let mut unconfirmed: Vec<ReplicaId> =
            self.versions.keys().copied().collect();
        unconfirmed.sort_unstable();
        let mut confirmed: u8 = 0;

        for attempt in 0..=self.max_renewal_retries {
            if attempt > 0 {
                time::sleep(jittered_delay(
                    Duration::ZERO,
                    self.retry_jitter,
                ))
                .await;
            }
            if self.validity.exploded() {
                return SweepVerdict::Exhausted;
            }

            let mut rounds = vec![];
            for &replica in unconfirmed.iter() {
                rounds.push(self.renew_round(replica));
            }
            let results = join_all(rounds).await;

            let mut still_silent = vec![];
            for (&replica, result) in unconfirmed.iter().zip(results) {
                match result {
                    Ok(result) => match result.replies.get(&replica) {
                        Some(LockOutcome::Renewed { version }) => {
                            self.versions.insert(replica, *version);
                            confirmed += 1;
                        }
                        Some(LockOutcome::NotOwner { holder }) => {
                            pf_warn!(
                                "replica {} denies ownership of '{}', \
                                 holder '{}'",
                                replica,
                                self.name,
                                holder
                            );
                            self.versions.remove(&replica);
                        }
                        Some(LockOutcome::VersionConflict { current }) => {
                            pf_warn!(
                                "replica {} renew conflict on '{}' at \
                                 version {}",
                                replica,
                                self.name,
                                current
                            );
                            self.versions.remove(&replica);
                        }
                        Some(LockOutcome::Gone) => {
                            pf_warn!(
                                "record of '{}' gone on replica {}",
                                self.name,
                                replica
                            );
                            self.versions.remove(&replica);
                        }
                        Some(outcome) => {
                            pf_error!(
                                "unexpected renew outcome {:?} from \
                                 replica {}",
                                outcome,
                                replica
                            );
                            still_silent.push(replica);
                        }
                        None => still_silent.push(replica),
                    },
                    Err(e) => {
                        pf_error!(
                            "error renewing on replica {}: {}",
                            replica,
                            e
                        );
                        still_silent.push(replica);
                    }
                }
            }
            unconfirmed = still_silent;

            // versions only shrinks on denials, so dipping below quorum
            // means ownership is gone somewhere it must not be
            if (self.versions.len() as u8) < self.quorum {
                return SweepVerdict::Lost;
            }
            if confirmed >= self.quorum {
                // validity measured from the sweep's start, not its end
                let valid_until =
                    sweep_start + self.ttl - self.clock_drift_margin;
                let remaining =
                    valid_until.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return SweepVerdict::Exhausted;
                }
                if let Err(e) = self.validity.kickoff(remaining) {
                    pf_error!("error restarting validity timer: {}", e);
                }
                self.tx_state.send_modify(|state| {
                    state.valid_until = valid_until;
                    state.versions = self.versions.clone();
                });
                pf_trace!(
                    "renewed '{}' on {} replicas, valid for {} ms",
                    self.name,
                    confirmed,
                    remaining.as_millis()
                );
                return SweepVerdict::Extended;
            }
        }
        SweepVerdict::Exhausted
    }

    /// Runs one single-target renew round against `replica` with its last
    /// known record version.
    async fn renew_round(
        &self,
        replica: ReplicaId,
    ) -> Result<RoundResult, PalisadeError> {
        let version = match self.versions.get(&replica) {
            Some(&version) => version,
            None => {
                return logged_err!(
                    "replica {} not found among lease grants",
                    replica
                );
            }
        };
        let mut target = Bitmap::new(self.coord.population(), false);
        target.set(replica, true)?;
        self.coord
            .round(RoundPlan {
                op: LockOp::Renew {
                    name: self.name.clone(),
                    owner: self.owner.clone(),
                    version,
                    ttl_ms: self.ttl.as_millis() as u64,
                },
                targets: target,
                early_quorum: None,
                timeout: self.reply_timeout,
            })
            .await
    }

    /// Publishes the terminal status of a failed sweep. If the validity
    /// timer fired while the sweep was retrying, expiry is the truth.
    fn conclude_lost(&self, verdict: SweepVerdict) {
        let status = if self.validity.exploded() {
            HandleStatus::Expired
        } else {
            HandleStatus::Invalidated
        };
        pf_warn!(
            "giving up on lease of '{}': {:?} => {:?}",
            self.name,
            verdict,
            status
        );
        self.tx_state.send_modify(|state| state.status = status);
    }
}
