//! Palisade client library implementation.
//!
//! `LockClient` is the entry point of the client side. It connects to the
//! configured replicas through a quorum coordinator and exposes the lock
//! operations: acquire (retried against an overall deadline), try-acquire
//! (one round), and per-replica inspection. A successful acquisition hands
//! back a `LockHandle` whose background keeper renews the lease until the
//! handle is released, expires, or is invalidated.

use std::collections::HashMap;
use std::error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::coord::{Coordinator, RoundPlan};
use crate::client::detector::jittered_delay;
use crate::client::handle::GrantState;
use crate::client::keeper::LeaseKeeper;
use crate::server::{
    FencingToken, LockOp, LockOutcome, RecordView, ReplicaId, Version,
};
use crate::utils::{set_identity, Bitmap, PalisadeError, Timer};

use futures::future::join_all;

use rand::Rng;

use serde::Deserialize;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Duration, Instant};

mod coord;
mod detector;
mod handle;
mod hub;
mod keeper;
mod stub;

pub use handle::{HandleStatus, LockHandle, RenewError};
pub use stub::{ReplicaApiStub, ReplicaRecvStub, ReplicaSendStub};

/// Client ID type.
pub type ClientId = u64;

/// Capacity of each per-replica send channel.
const CHAN_SEND_CAP: usize = 64;

/// Capacity of the shared reply recv channel.
const CHAN_RECV_CAP: usize = 512;

/// Configuration parameters of a lock client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Addresses of all lock service replicas, in replica-ID order.
    pub replica_endpoints: Vec<SocketAddr>,

    /// Number of grants required for a successful acquisition; 0 means a
    /// majority of the replicas. May be raised above majority, never
    /// lowered below it.
    pub quorum_size: u8,

    /// Lease TTL in millisecs applied when an acquisition names none.
    pub default_ttl_ms: u64,

    /// Safety margin in millisecs subtracted from every client-side lease
    /// validity computation.
    pub clock_drift_margin_ms: u64,

    /// Jittered retries allowed per renewal sweep for silent replicas.
    pub max_renewal_retries: u8,

    /// Upper bound in millisecs of the uniform jitter applied between
    /// acquisition rounds and renewal retries.
    pub retry_jitter_ms: u64,

    /// Timeout in millisecs for collecting replies of one request round.
    pub reply_timeout_ms: u64,

    /// Cadence in millisecs of automatic lease renewals; 0 means one
    /// third of the lease TTL.
    pub renew_interval_ms: u64,

    /// Connection attempts allowed per replica at setup.
    pub connect_retries: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            replica_endpoints: vec![],
            quorum_size: 0,
            default_ttl_ms: 10_000,
            clock_drift_margin_ms: 100,
            max_renewal_retries: 3,
            retry_jitter_ms: 50,
            reply_timeout_ms: 500,
            renew_interval_ms: 0,
            connect_retries: 10,
        }
    }
}

/// Error type of lock acquisitions.
#[derive(Debug, PartialEq, Eq)]
pub enum AcquireError {
    /// The lock is currently held by another owner.
    Conflict,

    /// No quorum decision could be reached before the deadline.
    Timeout,

    /// Infrastructure failure underneath the acquisition.
    Internal(PalisadeError),
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AcquireError::Conflict => write!(f, "lock held by another owner"),
            AcquireError::Timeout => write!(f, "acquisition timed out"),
            AcquireError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl error::Error for AcquireError {}

impl From<PalisadeError> for AcquireError {
    fn from(e: PalisadeError) -> Self {
        AcquireError::Internal(e)
    }
}

impl From<AcquireError> for PalisadeError {
    fn from(e: AcquireError) -> Self {
        PalisadeError::msg(e)
    }
}

/// How one acquisition round concluded.
enum AttemptOutcome {
    /// Reached quorum with validity to spare; the lock is held.
    Granted(LockHandle),

    /// No quorum. `holder` carries an observed live holder, if any.
    Contended { holder: Option<String> },
}

/// The lock service client.
pub struct LockClient {
    /// My client ID (randomly generated at setup).
    id: ClientId,

    /// Validated configuration parameters.
    config: ClientConfig,

    /// Resolved grant quorum size.
    quorum: u8,

    /// Quorum coordinator, shared with the keepers of held locks.
    coord: Arc<Coordinator>,

    /// Highest fencing token observed per lock name, passed as the token
    /// hint of later acquisitions so lagging replicas catch up.
    token_hints: Mutex<HashMap<String, FencingToken>>,
}

// LockClient public API implementation
impl LockClient {
    /// Creates a new lock client and connects it to all configured
    /// replicas.
    pub async fn new_and_setup(
        config_str: Option<&str>,
    ) -> Result<Self, PalisadeError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    replica_endpoints, quorum_size,
                                    default_ttl_ms, clock_drift_margin_ms,
                                    max_renewal_retries, retry_jitter_ms,
                                    reply_timeout_ms, renew_interval_ms,
                                    connect_retries)?;
        let population = config.replica_endpoints.len();
        if population == 0 || population > u8::MAX as usize {
            return logged_err!(
                "invalid number of replica endpoints {}",
                population
            );
        }
        let population = population as u8;

        let majority = population / 2 + 1;
        let quorum = if config.quorum_size == 0 {
            majority
        } else {
            config.quorum_size
        };
        if quorum < majority || quorum > population {
            return logged_err!(
                "invalid quorum size {} for {} replicas",
                quorum,
                population
            );
        }
        if config.default_ttl_ms == 0
            || config.default_ttl_ms <= config.clock_drift_margin_ms
        {
            return logged_err!(
                "invalid default_ttl_ms {} within margin {} ms",
                config.default_ttl_ms,
                config.clock_drift_margin_ms
            );
        }
        if config.reply_timeout_ms == 0 {
            return logged_err!("invalid reply_timeout_ms 0");
        }

        let id: ClientId = rand::thread_rng().gen();
        set_identity(format!("c{}", id % 100000));

        let coord = Arc::new(
            Coordinator::new_and_setup(
                id,
                &config.replica_endpoints,
                CHAN_SEND_CAP,
                CHAN_RECV_CAP,
                config.connect_retries,
                Duration::from_millis(config.reply_timeout_ms),
            )
            .await?,
        );
        pf_info!(
            "lock client {} connected to {} replicas (quorum {})",
            id % 100000,
            population,
            quorum
        );

        Ok(LockClient {
            id,
            config,
            quorum,
            coord,
            token_hints: Mutex::new(HashMap::new()),
        })
    }

    /// Returns my client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Returns the cluster size.
    pub fn population(&self) -> u8 {
        self.coord.population()
    }

    /// Returns the resolved grant quorum size.
    pub fn quorum(&self) -> u8 {
        self.quorum
    }

    /// Returns the current liveness speculation of replicas. Purely
    /// advisory; lease decisions never depend on it.
    pub fn peer_alive(&self) -> Bitmap {
        self.coord.peer_alive()
    }

    /// Acquires the named lock, running acquisition rounds until one
    /// reaches quorum or the overall timeout passes. A round that observes
    /// a live holder fails immediately with `Conflict`; back-off against a
    /// held lock belongs to the caller. `ttl` of `None` applies the
    /// configured default.
    pub async fn acquire(
        &self,
        name: &str,
        ttl: Option<Duration>,
        timeout: Duration,
    ) -> Result<LockHandle, AcquireError> {
        let ttl = self.effective_ttl(ttl)?;
        let renew_interval = self.renew_interval_for(ttl)?;
        if timeout.is_zero() {
            return Err(AcquireError::Internal(PalisadeError::msg(
                "invalid acquisition timeout 0",
            )));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                pf_debug!("acquisition of '{}' timed out", name);
                return Err(AcquireError::Timeout);
            }
            let round_timeout =
                Duration::from_millis(self.config.reply_timeout_ms)
                    .min(remaining);

            match self
                .acquire_attempt(name, ttl, renew_interval, round_timeout)
                .await?
            {
                AttemptOutcome::Granted(handle) => return Ok(handle),
                AttemptOutcome::Contended {
                    holder: Some(holder),
                } => {
                    pf_debug!("lock '{}' held by '{}'", name, holder);
                    return Err(AcquireError::Conflict);
                }
                AttemptOutcome::Contended { holder: None } => {
                    let delay = jittered_delay(
                        Duration::ZERO,
                        Duration::from_millis(self.config.retry_jitter_ms),
                    );
                    time::sleep(delay.min(
                        deadline.saturating_duration_since(Instant::now()),
                    ))
                    .await;
                }
            }
        }
    }

    /// Runs a single acquisition round for the named lock.
    pub async fn try_acquire(
        &self,
        name: &str,
        ttl: Option<Duration>,
    ) -> Result<LockHandle, AcquireError> {
        let ttl = self.effective_ttl(ttl)?;
        let renew_interval = self.renew_interval_for(ttl)?;
        let round_timeout = Duration::from_millis(self.config.reply_timeout_ms);

        match self
            .acquire_attempt(name, ttl, renew_interval, round_timeout)
            .await?
        {
            AttemptOutcome::Granted(handle) => Ok(handle),
            AttemptOutcome::Contended { holder: Some(_) } => {
                Err(AcquireError::Conflict)
            }
            AttemptOutcome::Contended { holder: None } => {
                Err(AcquireError::Timeout)
            }
        }
    }

    /// Fetches one replica's view of the named lock's record. Intended for
    /// tests and operators; views from a single replica are never
    /// authoritative.
    pub async fn inspect(
        &self,
        replica: ReplicaId,
        name: &str,
    ) -> Result<Option<RecordView>, PalisadeError> {
        let mut target = Bitmap::new(self.coord.population(), false);
        target.set(replica, true)?;
        let result = self
            .coord
            .round(RoundPlan {
                op: LockOp::Inspect { name: name.into() },
                targets: target,
                early_quorum: None,
                timeout: Duration::from_millis(self.config.reply_timeout_ms),
            })
            .await?;

        match result.replies.get(&replica) {
            Some(LockOutcome::Record(view)) => {
                if let Some(view) = view {
                    self.remember_token(name, view.fencing_token).await;
                }
                Ok(view.clone())
            }
            Some(outcome) => logged_err!(
                "unexpected inspect outcome {:?} from replica {}",
                outcome,
                replica
            ),
            None => logged_err!(
                "no reply from replica {} inspecting '{}'",
                replica,
                name
            ),
        }
    }
}

// LockClient acquire_attempt implementation
impl LockClient {
    /// Runs one acquisition round: a fresh owner identity, parallel
    /// `Acquire` to all replicas resolving early at quorum, then either a
    /// keeper spawn for the grant or best-effort cleanup of the partial
    /// grants collected.
    async fn acquire_attempt(
        &self,
        name: &str,
        ttl: Duration,
        renew_interval: Duration,
        round_timeout: Duration,
    ) -> Result<AttemptOutcome, PalisadeError> {
        let owner =
            format!("{:x}-{:x}", self.id, rand::thread_rng().gen::<u64>());
        let token_hint = {
            let hints = self.token_hints.lock().await;
            hints.get(name).copied().unwrap_or(0)
        };

        let result = self
            .coord
            .round(RoundPlan {
                op: LockOp::Acquire {
                    name: name.into(),
                    owner: owner.clone(),
                    ttl_ms: ttl.as_millis() as u64,
                    token_hint,
                },
                targets: Bitmap::new(self.coord.population(), true),
                early_quorum: Some(self.quorum),
                timeout: round_timeout,
            })
            .await?;

        let mut grants: Vec<(ReplicaId, FencingToken, Version)> = vec![];
        let mut holder: Option<String> = None;
        let mut faults = 0;
        let mut fault_msg = String::new();
        for (&replica, outcome) in result.replies.iter() {
            match outcome {
                LockOutcome::Granted { token, version } => {
                    grants.push((replica, *token, *version));
                }
                LockOutcome::Held { holder: h } => holder = Some(h.clone()),
                LockOutcome::Fault(msg) => {
                    faults += 1;
                    fault_msg.clone_from(msg);
                }
                outcome => pf_error!(
                    "unexpected acquire outcome {:?} from replica {}",
                    outcome,
                    replica
                ),
            }
        }

        if let Some(max_token) = grants.iter().map(|&(_, t, _)| t).max() {
            self.remember_token(name, max_token).await;
            if grants.iter().any(|&(_, t, _)| t != max_token) {
                // lagging minority; the next write's hint reconciles it
                pf_debug!(
                    "granted tokens for '{}' disagree, {} is authoritative",
                    name,
                    max_token
                );
            }
        }

        if (grants.len() as u8) >= self.quorum {
            let margin =
                Duration::from_millis(self.config.clock_drift_margin_ms);
            let validity = ttl
                .checked_sub(result.elapsed)
                .and_then(|d| d.checked_sub(margin))
                .unwrap_or(Duration::ZERO);
            if validity.is_zero() {
                pf_warn!(
                    "grants of '{}' took {} ms against ttl {} ms, discarding",
                    name,
                    result.elapsed.as_millis(),
                    ttl.as_millis()
                );
                self.cleanup_grants(name, &owner, &grants).await;
                return Ok(AttemptOutcome::Contended { holder: None });
            }
            return Ok(AttemptOutcome::Granted(self.spawn_keeper(
                name,
                owner,
                ttl,
                validity,
                renew_interval,
                &grants,
            )));
        }

        if !result.replies.is_empty() && faults == result.replies.len() {
            return logged_err!(
                "all replicas faulted acquiring '{}': {}",
                name,
                fault_msg
            );
        }
        self.cleanup_grants(name, &owner, &grants).await;
        Ok(AttemptOutcome::Contended { holder })
    }

    /// Spawns the renewal keeper of a fresh grant and wraps it in a lock
    /// handle.
    fn spawn_keeper(
        &self,
        name: &str,
        owner: String,
        ttl: Duration,
        validity: Duration,
        renew_interval: Duration,
        grants: &[(ReplicaId, FencingToken, Version)],
    ) -> LockHandle {
        let versions: HashMap<ReplicaId, Version> =
            grants.iter().map(|&(r, _, v)| (r, v)).collect();
        let token = grants.iter().map(|&(_, t, _)| t).max().unwrap_or(0);
        let reply_timeout = Duration::from_millis(self.config.reply_timeout_ms);

        let (tx_state, rx_state) = watch::channel(GrantState {
            status: HandleStatus::Held,
            valid_until: Instant::now() + validity,
            versions: versions.clone(),
        });
        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();

        let keeper = LeaseKeeper {
            coord: self.coord.clone(),
            name: name.to_string(),
            owner: owner.clone(),
            ttl,
            initial_validity: validity,
            renew_interval,
            clock_drift_margin: Duration::from_millis(
                self.config.clock_drift_margin_ms,
            ),
            max_renewal_retries: self.config.max_renewal_retries,
            retry_jitter: Duration::from_millis(self.config.retry_jitter_ms),
            reply_timeout,
            quorum: self.quorum,
            versions,
            validity: Timer::new(),
            tx_state,
            rx_cmd,
        };
        let keeper_handle = tokio::spawn(keeper.run());

        pf_debug!("acquired lock '{}' with fencing token {}", name, token);
        LockHandle::new(
            name.to_string(),
            owner,
            token,
            self.coord.clone(),
            reply_timeout,
            rx_state,
            tx_cmd,
            keeper_handle,
        )
    }

    /// Best-effort release of the grants of a round that did not make
    /// quorum or arrived without validity to spare.
    async fn cleanup_grants(
        &self,
        name: &str,
        owner: &str,
        grants: &[(ReplicaId, FencingToken, Version)],
    ) {
        let mut rounds = vec![];
        for &(replica, _, version) in grants.iter() {
            let mut target = Bitmap::new(self.coord.population(), false);
            if let Err(e) = target.set(replica, true) {
                pf_error!("error targeting replica {}: {}", replica, e);
                continue;
            }
            rounds.push(self.coord.round(RoundPlan {
                op: LockOp::Release {
                    name: name.into(),
                    owner: owner.into(),
                    version,
                },
                targets: target,
                early_quorum: None,
                timeout: Duration::from_millis(self.config.reply_timeout_ms),
            }));
        }
        for result in join_all(rounds).await {
            if let Err(e) = result {
                pf_warn!("error cleaning up grant of '{}': {}", name, e);
            }
        }
    }

    /// Resolves the effective lease TTL of an acquisition and checks it
    /// leaves room for the clock drift margin.
    fn effective_ttl(
        &self,
        ttl: Option<Duration>,
    ) -> Result<Duration, PalisadeError> {
        let ttl =
            ttl.unwrap_or(Duration::from_millis(self.config.default_ttl_ms));
        let margin = Duration::from_millis(self.config.clock_drift_margin_ms);
        if ttl.is_zero() || ttl <= margin {
            return logged_err!(
                "invalid ttl {} ms within margin {} ms",
                ttl.as_millis(),
                margin.as_millis()
            );
        }
        Ok(ttl)
    }

    /// Resolves the renewal cadence for the given TTL.
    fn renew_interval_for(
        &self,
        ttl: Duration,
    ) -> Result<Duration, PalisadeError> {
        let interval = if self.config.renew_interval_ms > 0 {
            Duration::from_millis(self.config.renew_interval_ms)
        } else {
            ttl / 3
        };
        if interval.is_zero() || interval >= ttl {
            return logged_err!(
                "invalid renew interval {} ms against ttl {} ms",
                interval.as_millis(),
                ttl.as_millis()
            );
        }
        Ok(interval)
    }

    /// Records a token observation if it is the highest seen for the name.
    async fn remember_token(&self, name: &str, token: FencingToken) {
        let mut hints = self.token_hints.lock().await;
        let entry = hints.entry(name.to_string()).or_insert(0);
        if token > *entry {
            *entry = token;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::{FenceGate, StaleFencingToken};
    use crate::server::{LockNode, LockReply, LockRequest};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config_for(nodes: &[LockNode], extra: &str) -> String {
        let endpoints: Vec<String> = nodes
            .iter()
            .map(|node| format!("'{}'", node.local_addr()))
            .collect();
        format!(
            "replica_endpoints = [{}]\n{}",
            endpoints.join(", "),
            extra
        )
    }

    async fn spin_up(
        population: u8,
        extra: &str,
    ) -> Result<(Vec<LockNode>, LockClient), PalisadeError> {
        let mut nodes = vec![];
        for _ in 0..population {
            nodes.push(
                LockNode::new_and_setup("127.0.0.1:0".parse()?, None).await?,
            );
        }
        let client =
            LockClient::new_and_setup(Some(&config_for(&nodes, extra)))
                .await?;
        Ok((nodes, client))
    }

    async fn second_client(
        nodes: &[LockNode],
        extra: &str,
    ) -> Result<LockClient, PalisadeError> {
        LockClient::new_and_setup(Some(&config_for(nodes, extra))).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_basic_lifecycle() -> Result<(), PalisadeError> {
        let (nodes, client_a) = spin_up(3, "").await?;
        let client_b = second_client(&nodes, "").await?;

        let handle = client_a
            .acquire("db", None, Duration::from_millis(500))
            .await?;
        let token_a = handle.fencing_token();
        assert_eq!(handle.name(), "db");
        assert_eq!(token_a, 1);
        assert_eq!(handle.status(), HandleStatus::Held);
        assert!(handle.is_valid());

        // competing client bounces off while the lock is held
        assert!(matches!(
            client_b.try_acquire("db", None).await,
            Err(AcquireError::Conflict)
        ));
        assert!(matches!(
            client_b
                .acquire("db", None, Duration::from_millis(300))
                .await,
            Err(AcquireError::Conflict)
        ));

        handle.release().await?;
        let handle = client_b.try_acquire("db", None).await?;
        assert!(handle.fencing_token() > token_a);
        handle.release().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_crash_takeover_fencing() -> Result<(), PalisadeError> {
        let cfg = "default_ttl_ms = 300\nclock_drift_margin_ms = 20\n\
                   reply_timeout_ms = 100";
        let (nodes, client_a) = spin_up(3, cfg).await?;
        let client_b = second_client(&nodes, cfg).await?;
        let gate = FenceGate::new();

        let handle_a = client_a
            .acquire("db", None, Duration::from_millis(500))
            .await?;
        let token_a = handle_a.fencing_token();
        assert_eq!(token_a, 1);
        gate.admit("db", token_a)?;

        // holder crashes: dropping the handle stops renewal silently
        drop(handle_a);
        time::sleep(Duration::from_millis(400)).await;

        let handle_b = client_b
            .acquire("db", None, Duration::from_millis(500))
            .await?;
        let token_b = handle_b.fencing_token();
        assert!(token_b > token_a);
        gate.admit("db", token_b)?;

        // a deferred write of the dead holder bounces off the fence
        assert_eq!(
            gate.admit("db", token_a),
            Err(StaleFencingToken {
                seen: token_a,
                highest: token_b,
            })
        );
        handle_b.release().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_quorum_tolerance() -> Result<(), PalisadeError> {
        let cfg = "reply_timeout_ms = 100\nretry_jitter_ms = 20";
        let (nodes, client) = spin_up(5, cfg).await?;

        // two silent replicas leave a quorum of three reachable
        nodes[3].pause();
        nodes[4].pause();
        let handle = client
            .acquire("db", None, Duration::from_millis(800))
            .await?;
        assert!(handle.is_valid());
        handle.renew().await?;
        handle.release().await?;

        // three silent replicas make a quorum impossible
        nodes[2].pause();
        assert!(matches!(
            client
                .acquire("db", None, Duration::from_millis(400))
                .await,
            Err(AcquireError::Timeout)
        ));
        Ok(())
    }

    /// Binds a listener that completes the connection handshake but never
    /// reads a request frame, so frames sent its way back up indefinitely.
    async fn sink_replica() -> Result<SocketAddr, PalisadeError> {
        let listener =
            TcpListener::bind("127.0.0.1:0".parse::<SocketAddr>()?).await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let mut conns = vec![];
            loop {
                if let Ok((mut conn, _)) = listener.accept().await {
                    let _ = conn.read_u64().await;
                    conns.push(conn); // keep open, never read again
                }
            }
        });
        Ok(addr)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_sink_replica_tolerated() -> Result<(), PalisadeError> {
        // two healthy replicas plus one that stops draining its socket;
        // a quorum stays reachable, so no operation may hang on the sink
        let mut nodes = vec![];
        for _ in 0..2 {
            nodes.push(
                LockNode::new_and_setup("127.0.0.1:0".parse()?, None).await?,
            );
        }
        let mut endpoints: Vec<String> = nodes
            .iter()
            .map(|node| format!("'{}'", node.local_addr()))
            .collect();
        endpoints.push(format!("'{}'", sink_replica().await?));
        let cfg = format!(
            "replica_endpoints = [{}]\nreply_timeout_ms = 300",
            endpoints.join(", ")
        );
        let client_a = LockClient::new_and_setup(Some(&cfg)).await?;
        let client_b = LockClient::new_and_setup(Some(&cfg)).await?;

        // wide names exhaust the sink's socket buffering within a few
        // rounds, after which its send path stays saturated
        let wide_name = "x".repeat(64 * 1024);
        let handle = time::timeout(
            Duration::from_secs(2),
            client_a.acquire(&wide_name, None, Duration::from_millis(800)),
        )
        .await??;

        // every attempt resolves through the healthy quorum on time, far
        // past the point where frames to the sink started getting dropped
        for _ in 0..300 {
            let attempt = time::timeout(
                Duration::from_secs(2),
                client_b.try_acquire(&wide_name, None),
            )
            .await?;
            assert!(matches!(attempt, Err(AcquireError::Conflict)));
        }

        // an unrelated lock stays acquirable as well
        let other = time::timeout(
            Duration::from_secs(2),
            client_b.acquire("db", None, Duration::from_millis(800)),
        )
        .await??;
        other.release().await?;
        handle.release().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_stale_pair_reconciled() -> Result<(), PalisadeError> {
        let cfg = "reply_timeout_ms = 100";
        let (nodes, client) = spin_up(5, cfg).await?;

        // a stale pair misses two full acquire/release cycles
        nodes[3].pause();
        nodes[4].pause();
        for _ in 0..2 {
            let handle = client
                .acquire("db", None, Duration::from_millis(800))
                .await?;
            handle.release().await?;
        }
        nodes[3].resume();
        nodes[4].resume();

        // the healed pair's next grant carries a hinted, caught-up token
        let handle = client
            .acquire("db", None, Duration::from_millis(800))
            .await?;
        assert_eq!(handle.fencing_token(), 3);
        for replica in 0..5 {
            if let Some(view) = client.inspect(replica, "db").await? {
                assert_eq!(view.fencing_token, 3);
                assert_eq!(view.holder, handle.owner());
            }
        }
        handle.release().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_renewal_invalidated() -> Result<(), PalisadeError> {
        let cfg = "default_ttl_ms = 1000\nclock_drift_margin_ms = 100\n\
                   reply_timeout_ms = 60\nrenew_interval_ms = 250\n\
                   max_renewal_retries = 2\nretry_jitter_ms = 30";
        let (nodes, client) = spin_up(3, cfg).await?;

        let mut handle = client
            .acquire("db", None, Duration::from_millis(500))
            .await?;
        let valid_until = handle.valid_until();
        for node in nodes.iter() {
            node.pause();
        }

        // silence across every renewal retry invalidates before expiry
        let status = handle.status_changed().await?;
        assert_eq!(status, HandleStatus::Invalidated);
        assert!(Instant::now() < valid_until);
        assert!(!handle.is_valid());

        // renewing a concluded handle reports the loss
        assert_eq!(handle.renew().await.unwrap_err(), RenewError::Lost);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_release_idempotent() -> Result<(), PalisadeError> {
        let (nodes, client_a) = spin_up(3, "").await?;
        let client_b = second_client(&nodes, "").await?;

        let handle = client_a
            .acquire("db", None, Duration::from_millis(500))
            .await?;

        // vacate the records out from under the holder, as the holder
        let stub = ReplicaApiStub::new(rand::thread_rng().gen());
        for (replica, node) in nodes.iter().enumerate() {
            let replica = replica as ReplicaId;
            if let Some(view) = client_b.inspect(replica, "db").await? {
                let (mut send_stub, mut recv_stub) =
                    stub.connect(replica, node.local_addr()).await?;
                send_stub
                    .send_req(LockRequest {
                        id: 7,
                        op: LockOp::Release {
                            name: "db".into(),
                            owner: view.holder.clone(),
                            version: view.version,
                        },
                    })
                    .await?;
                let LockReply { outcome, .. } = recv_stub.recv_reply().await?;
                assert_eq!(outcome, LockOutcome::Released);
            }
        }

        // the handle's own release then hits fully vacated records
        handle.release().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_manual_renew_extends() -> Result<(), PalisadeError> {
        let cfg = "default_ttl_ms = 400\nclock_drift_margin_ms = 40\n\
                   reply_timeout_ms = 100";
        let (_nodes, client) = spin_up(3, cfg).await?;

        let handle = client
            .acquire("db", None, Duration::from_millis(500))
            .await?;
        let first_deadline = handle.valid_until();

        time::sleep(Duration::from_millis(60)).await;
        handle.renew().await?;
        assert!(handle.valid_until() > first_deadline);
        assert!(handle.is_valid());
        handle.release().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_keeper_outlives_ttl() -> Result<(), PalisadeError> {
        let cfg = "default_ttl_ms = 300\nclock_drift_margin_ms = 30\n\
                   reply_timeout_ms = 60";
        let (_nodes, client) = spin_up(3, cfg).await?;

        let handle = client
            .acquire("db", None, Duration::from_millis(500))
            .await?;
        time::sleep(Duration::from_millis(900)).await;

        // three TTLs later the background keeper still holds the lease
        assert!(handle.is_valid());
        assert_eq!(handle.status(), HandleStatus::Held);
        handle.release().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_mutual_exclusion_fenced() -> Result<(), PalisadeError> {
        let cfg = "default_ttl_ms = 2000\nreply_timeout_ms = 100\n\
                   retry_jitter_ms = 30";
        let (nodes, client_a) = spin_up(3, cfg).await?;
        let client_b = second_client(&nodes, cfg).await?;

        let gate = Arc::new(FenceGate::new());
        let in_section = Arc::new(AtomicBool::new(false));
        let admissions = Arc::new(AtomicU64::new(0));

        let mut drivers = vec![];
        for client in [client_a, client_b] {
            let gate = gate.clone();
            let in_section = in_section.clone();
            let admissions = admissions.clone();
            drivers.push(tokio::spawn(async move {
                let mut admitted = 0u64;
                let mut attempts = 0;
                while admissions.load(Ordering::SeqCst) < 6 {
                    attempts += 1;
                    if attempts > 300 {
                        return logged_err!("driver starved out");
                    }
                    match client.try_acquire("db", None).await {
                        Ok(handle) => {
                            gate.admit("db", handle.fencing_token())?;
                            assert!(!in_section.swap(true, Ordering::SeqCst));
                            time::sleep(Duration::from_millis(30)).await;
                            assert!(in_section.swap(false, Ordering::SeqCst));
                            admissions.fetch_add(1, Ordering::SeqCst);
                            admitted += 1;
                            handle.release().await?;
                        }
                        Err(AcquireError::Conflict)
                        | Err(AcquireError::Timeout) => {
                            time::sleep(Duration::from_millis(20)).await;
                        }
                        Err(AcquireError::Internal(e)) => return Err(e),
                    }
                }
                Ok(admitted)
            }));
        }

        let mut total = 0;
        for driver in drivers {
            total += driver.await??;
        }
        assert!(total >= 6);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_config_rejected() -> Result<(), PalisadeError> {
        // no replica endpoints
        assert!(LockClient::new_and_setup(None).await.is_err());

        // quorum below majority
        assert!(LockClient::new_and_setup(Some(
            "replica_endpoints = ['127.0.0.1:40011', '127.0.0.1:40012', \
             '127.0.0.1:40013']\nquorum_size = 1"
        ))
        .await
        .is_err());

        // unknown field name
        assert!(LockClient::new_and_setup(Some("tt1_ms = 10"))
            .await
            .is_err());

        // ttl not above the drift margin
        assert!(LockClient::new_and_setup(Some(
            "replica_endpoints = ['127.0.0.1:40014']\ndefault_ttl_ms = 50\n\
             clock_drift_margin_ms = 50"
        ))
        .await
        .is_err());
        Ok(())
    }
}
