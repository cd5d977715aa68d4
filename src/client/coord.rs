//! Palisade client quorum coordination module implementation.
//!
//! One coordinator task owns the replica hub and drives all request rounds
//! for a client: it fans a request out to its target replicas, collects
//! tagged replies into per-round state, and resolves each round when every
//! target replied, when the round's grant quorum is reached or provably out
//! of reach, or when the round's deadline passes.
//!
//! Rounds resolved before every reply arrived leave a straggler entry
//! behind. A grant that trickles in for such a round is released right
//! away, so replicas never sit on grants their client does not know it
//! owns. A round whose caller has gone away by resolution time gets the
//! same treatment for the grants it did collect. The reply traffic also
//! feeds the failure detector, whose liveness speculation is published on
//! a watch channel.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::client::detector::FailureDetector;
use crate::client::hub::ReplicaHub;
use crate::client::ClientId;
use crate::server::{
    LockOp, LockOutcome, LockReply, LockRequest, ReplicaId, RequestId,
    Version,
};
use crate::utils::{Bitmap, PalisadeError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Granularity of round deadline checks.
const DEADLINE_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Consecutive barren detector sweeps before a replica is speculated dead.
const SUSPECT_AFTER: u8 = 3;

/// How long a resolved round keeps its straggler entry around.
const STRAGGLER_LINGER: Duration = Duration::from_secs(5);

/// What one request round asks for.
#[derive(Debug, Clone)]
pub struct RoundPlan {
    /// Operation to fan out; the request ID is assigned by the coordinator.
    pub op: LockOp,

    /// Replicas to send to.
    pub targets: Bitmap,

    /// If set, resolve the round as soon as this many replicas granted, or
    /// as soon as that count is provably out of reach.
    pub early_quorum: Option<u8>,

    /// Deadline for the round measured from its first send.
    pub timeout: Duration,
}

/// Per-replica outcomes a round resolved with. Replicas that stayed silent
/// until resolution are simply absent from the map.
#[derive(Debug)]
pub struct RoundResult {
    /// Outcome per replica that replied in time.
    pub replies: HashMap<ReplicaId, LockOutcome>,

    /// Time from the round's send until its resolution.
    pub elapsed: Duration,
}

impl RoundResult {
    /// Number of replicas that granted in this round.
    pub fn granted_cnt(&self) -> u8 {
        self.replies
            .values()
            .filter(|o| matches!(o, LockOutcome::Granted { .. }))
            .count() as u8
    }
}

/// Commands from round callers to the coordinator task.
enum CoordCmd {
    Round {
        plan: RoundPlan,
        tx_done: oneshot::Sender<RoundResult>,
    },
}

/// Bookkeeping of one inflight round.
struct RoundState {
    /// Original operation, kept for straggler reconciliation.
    op: LockOp,

    /// Replicas this round was sent to.
    targets: Bitmap,

    /// Early resolution quorum, if any.
    early_quorum: Option<u8>,

    /// When the round was sent out.
    started: Instant,

    /// When the round times out.
    deadline: Instant,

    /// Replies collected so far.
    replies: HashMap<ReplicaId, LockOutcome>,

    /// Oneshot for handing the result back to the caller.
    tx_done: oneshot::Sender<RoundResult>,
}

impl RoundState {
    /// Checks whether the round can resolve with the replies collected so
    /// far.
    fn resolvable(&self) -> bool {
        let total = self.targets.count();
        let replied = self.replies.len() as u8;
        if replied >= total {
            return true;
        }
        if let Some(quorum) = self.early_quorum {
            let granted = self
                .replies
                .values()
                .filter(|o| matches!(o, LockOutcome::Granted { .. }))
                .count() as u8;
            if granted >= quorum {
                return true;
            }
            // pending replicas could all grant and still not make quorum
            if granted + (total - replied) < quorum {
                return true;
            }
        }
        false
    }
}

/// The client quorum coordination module.
pub struct Coordinator {
    /// Cluster size (total number of replicas).
    population: u8,

    /// Sender side of the command channel.
    tx_cmd: mpsc::UnboundedSender<CoordCmd>,

    /// Receiver side of the liveness speculation channel.
    rx_alive: watch::Receiver<Bitmap>,

    /// Join handle of the coordinator task.
    _coordinator_handle: JoinHandle<()>,
}

// Coordinator public API implementation
impl Coordinator {
    /// Creates a new coordinator: connects the replica hub and spawns the
    /// coordinator task around it.
    pub async fn new_and_setup(
        id: ClientId,
        replica_addrs: &[SocketAddr],
        chan_send_cap: usize,
        chan_recv_cap: usize,
        connect_retries: usize,
        fd_sweep_interval: Duration,
    ) -> Result<Self, PalisadeError> {
        if fd_sweep_interval < Duration::from_millis(1) {
            return logged_err!(
                "invalid fd_sweep_interval {:?}",
                fd_sweep_interval
            );
        }

        let hub = ReplicaHub::new_and_setup(
            id,
            replica_addrs,
            chan_send_cap,
            chan_recv_cap,
            connect_retries,
        )
        .await?;
        let population = hub.population();

        let detector = FailureDetector::new(population, SUSPECT_AFTER)?;
        let (tx_alive, rx_alive) =
            watch::channel(Bitmap::new(population, true));
        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();

        let coordinator_handle = tokio::spawn(Self::coordinator_task(
            hub,
            detector,
            tx_alive,
            rx_cmd,
            fd_sweep_interval,
        ));

        Ok(Coordinator {
            population,
            tx_cmd,
            rx_alive,
            _coordinator_handle: coordinator_handle,
        })
    }

    /// Returns the cluster size.
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Returns the current liveness speculation of replicas.
    pub fn peer_alive(&self) -> Bitmap {
        self.rx_alive.borrow().clone()
    }

    /// Runs one request round to resolution.
    pub async fn round(
        &self,
        plan: RoundPlan,
    ) -> Result<RoundResult, PalisadeError> {
        if plan.targets.count() == 0 {
            return logged_err!("round plan with empty targets");
        }
        if let Some(quorum) = plan.early_quorum {
            if quorum == 0 || quorum > plan.targets.count() {
                return logged_err!(
                    "invalid early_quorum {} of {} targets",
                    quorum,
                    plan.targets.count()
                );
            }
        }
        if plan.timeout.is_zero() {
            return logged_err!("round plan with zero timeout");
        }

        let (tx_done, rx_done) = oneshot::channel();
        self.tx_cmd.send(CoordCmd::Round { plan, tx_done })?;
        Ok(rx_done.await?)
    }
}

// Coordinator coordinator task implementation
impl Coordinator {
    /// Coordinator task function.
    async fn coordinator_task(
        mut hub: ReplicaHub,
        mut detector: FailureDetector,
        tx_alive: watch::Sender<Bitmap>,
        mut rx_cmd: mpsc::UnboundedReceiver<CoordCmd>,
        fd_sweep_interval: Duration,
    ) {
        pf_debug!("coordinator task spawned");

        let mut next_req_id: RequestId = 0;
        let mut inflight: HashMap<RequestId, RoundState> = HashMap::new();
        let mut stragglers: HashMap<RequestId, (LockOp, Instant)> =
            HashMap::new();

        let mut deadline_check = time::interval(DEADLINE_CHECK_INTERVAL);
        deadline_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fd_sweep = time::interval(fd_sweep_interval);
        fd_sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                // a caller wants a new round sent out
                cmd = rx_cmd.recv() => match cmd {
                    Some(CoordCmd::Round { plan, tx_done }) => {
                        let id = next_req_id;
                        next_req_id += 1;

                        // timestamp taken before sending, so validity
                        // computed from elapsed never overshoots
                        let now = Instant::now();

                        let req = LockRequest {
                            id,
                            op: plan.op.clone(),
                        };
                        for peer in plan.targets.ones() {
                            detector.record_sent(peer);
                        }
                        if let Err(e) =
                            hub.send_req(&req, &plan.targets).await
                        {
                            pf_error!("error sending round {}: {}", id, e);
                        }

                        inflight.insert(id, RoundState {
                            op: plan.op,
                            targets: plan.targets,
                            early_quorum: plan.early_quorum,
                            started: now,
                            deadline: now + plan.timeout,
                            replies: HashMap::new(),
                            tx_done,
                        });
                    }
                    None => break, // client dropped
                },

                // a reply came back from some replica
                reply = hub.recv_reply() => match reply {
                    Ok((peer, reply)) => {
                        if let Ok(true) = detector.record_reply(peer) {
                            tx_alive.send_replace(
                                detector.peer_alive().clone());
                        }
                        Self::handle_reply(
                            peer,
                            reply,
                            &mut next_req_id,
                            &mut inflight,
                            &mut stragglers,
                            &hub,
                        )
                        .await;
                    }
                    Err(e) => {
                        pf_error!("error receiving reply: {}", e);
                        break;
                    }
                },

                // resolve rounds whose deadline has passed
                _ = deadline_check.tick() => {
                    let now = Instant::now();
                    let timed_out: Vec<RequestId> = inflight
                        .iter()
                        .filter(|(_, state)| state.deadline <= now)
                        .map(|(&id, _)| id)
                        .collect();
                    for id in timed_out {
                        pf_debug!("round {} timed out", id);
                        if let Some((op, grants)) = Self::resolve_round(
                            id,
                            &mut inflight,
                            &mut stragglers,
                        ) {
                            Self::release_abandoned(
                                op,
                                grants,
                                &mut next_req_id,
                                &hub,
                            )
                            .await;
                        }
                    }
                    stragglers.retain(|_, (_, linger_until)| {
                        *linger_until > now
                    });
                },

                // periodic failure speculation sweep
                _ = fd_sweep.tick() => {
                    if let Ok(true) = detector.sweep() {
                        tx_alive.send_replace(detector.peer_alive().clone());
                    }
                },
            }
        }

        pf_debug!("coordinator task exited");
    }

    /// Records one tagged reply, resolving its round if possible. A grant
    /// that arrives for an already resolved round gets released on the
    /// replica that reported it.
    async fn handle_reply(
        peer: ReplicaId,
        reply: LockReply,
        next_req_id: &mut RequestId,
        inflight: &mut HashMap<RequestId, RoundState>,
        stragglers: &mut HashMap<RequestId, (LockOp, Instant)>,
        hub: &ReplicaHub,
    ) {
        match inflight.get_mut(&reply.id) {
            Some(state) => {
                if !state.targets.get(peer).unwrap_or(false)
                    || state.replies.contains_key(&peer)
                {
                    pf_warn!(
                        "unexpected reply for round {} from {}",
                        reply.id,
                        peer
                    );
                    return;
                }
                state.replies.insert(peer, reply.outcome);
                if state.resolvable() {
                    if let Some((op, grants)) =
                        Self::resolve_round(reply.id, inflight, stragglers)
                    {
                        Self::release_abandoned(
                            op,
                            grants,
                            next_req_id,
                            hub,
                        )
                        .await;
                    }
                }
            }

            None => {
                // round already resolved; release a straggling grant so
                // the replica does not sit on it until lease expiry
                if let (
                    Some((LockOp::Acquire { name, owner, .. }, _)),
                    LockOutcome::Granted { version, .. },
                ) = (stragglers.get(&reply.id), &reply.outcome)
                {
                    pf_debug!(
                        "releasing straggler grant of '{}' on {}",
                        name,
                        peer
                    );
                    Self::send_release(
                        name,
                        owner,
                        *version,
                        peer,
                        next_req_id,
                        hub,
                    )
                    .await;
                }
            }
        }
    }

    /// Takes a round out of the inflight table and hands its result to the
    /// caller, leaving a straggler entry behind if some acquire targets
    /// never replied. Returns the grants of an acquire round whose caller
    /// stopped listening, for release by the caller of this function.
    fn resolve_round(
        id: RequestId,
        inflight: &mut HashMap<RequestId, RoundState>,
        stragglers: &mut HashMap<RequestId, (LockOp, Instant)>,
    ) -> Option<(LockOp, Vec<(ReplicaId, Version)>)> {
        let state = inflight.remove(&id)?;
        let is_acquire = matches!(state.op, LockOp::Acquire { .. });
        if is_acquire && (state.replies.len() as u8) < state.targets.count()
        {
            stragglers.insert(
                id,
                (state.op.clone(), Instant::now() + STRAGGLER_LINGER),
            );
        }
        let result = RoundResult {
            replies: state.replies,
            elapsed: state.started.elapsed(),
        };
        if let Err(result) = state.tx_done.send(result) {
            // caller gave up on the round; its grants must not sit on
            // replicas nobody is renewing until lease expiry
            if is_acquire {
                let grants: Vec<(ReplicaId, Version)> = result
                    .replies
                    .iter()
                    .filter_map(|(&peer, outcome)| match outcome {
                        LockOutcome::Granted { version, .. } => {
                            Some((peer, *version))
                        }
                        _ => None,
                    })
                    .collect();
                if !grants.is_empty() {
                    return Some((state.op, grants));
                }
            }
        }
        None
    }

    /// Releases the grants collected by an acquire round whose caller has
    /// gone away.
    async fn release_abandoned(
        op: LockOp,
        grants: Vec<(ReplicaId, Version)>,
        next_req_id: &mut RequestId,
        hub: &ReplicaHub,
    ) {
        if let LockOp::Acquire { name, owner, .. } = op {
            for (peer, version) in grants {
                pf_debug!(
                    "releasing abandoned grant of '{}' on {}",
                    name,
                    peer
                );
                Self::send_release(
                    &name,
                    &owner,
                    version,
                    peer,
                    next_req_id,
                    hub,
                )
                .await;
            }
        }
    }

    /// Sends one fire-and-forget release of a grant to the replica holding
    /// it, under a fresh untracked request ID.
    async fn send_release(
        name: &str,
        owner: &str,
        version: Version,
        peer: ReplicaId,
        next_req_id: &mut RequestId,
        hub: &ReplicaHub,
    ) {
        let id = *next_req_id;
        *next_req_id += 1;
        let release = LockRequest {
            id,
            op: LockOp::Release {
                name: name.into(),
                owner: owner.into(),
                version,
            },
        };
        let mut target = Bitmap::new(hub.population(), false);
        let _ = target.set(peer, true);
        if let Err(e) = hub.send_req(&release, &target).await {
            pf_warn!(
                "error releasing grant of '{}' on {}: {}",
                name,
                peer,
                e
            );
        }
    }
}
