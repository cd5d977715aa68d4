//! Palisade lock server node implementation.
//!
//! A node owns one lease table and serves lock operations over its external
//! API, one request at a time. Expired-lease takeovers are sequenced here:
//! an acquire that finds an expired record falls through to a takeover
//! attempt, so clients never issue takeovers themselves.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::server::leaseman::{
    CreateOutcome, LeaseManager, ReleaseOutcome, RenewOutcome,
    TakeoverOutcome,
};
use crate::server::service::{LockOp, LockOutcome, LockReply, LockService};
use crate::server::store::MemStore;
use crate::utils::{set_identity, PalisadeError};

use serde::Deserialize;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Attempts at the create/takeover sequence before giving up on a raced
/// acquire.
const ACQUIRE_RETRIES: usize = 4;

/// Configuration parameters of a lock server node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Lease TTL in millisecs granted when a request does not name one.
    pub default_ttl_ms: u64,

    /// Capacity of the incoming request channel.
    pub chan_req_cap: usize,

    /// Capacity of each client's reply channel.
    pub chan_reply_cap: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            default_ttl_ms: 10_000,
            chan_req_cap: 512,
            chan_reply_cap: 64,
        }
    }
}

/// One lock server replica node.
pub struct LockNode {
    /// Address my client listener bound to.
    local_addr: SocketAddr,

    /// Pause flag shared with the dispatcher task. While raised, incoming
    /// requests are swallowed without replies, which looks exactly like a
    /// network partition to clients.
    tx_pause: watch::Sender<bool>,

    /// Join handle of the dispatcher task.
    _dispatcher_handle: JoinHandle<()>,
}

impl LockNode {
    /// Creates a new lock server node: parses the config string, binds the
    /// external API listener, and spawns the dispatcher task over a fresh
    /// in-memory lease table.
    pub async fn new_and_setup(
        api_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, PalisadeError> {
        let config = parsed_config!(config_str => NodeConfig;
                                    default_ttl_ms, chan_req_cap,
                                    chan_reply_cap)?;
        if config.default_ttl_ms == 0 {
            return logged_err!(
                "invalid config.default_ttl_ms {}",
                config.default_ttl_ms
            );
        }

        let service = LockService::new_and_setup(
            api_addr,
            config.chan_req_cap,
            config.chan_reply_cap,
        )
        .await?;
        let local_addr = service.local_addr();
        set_identity(format!("n{}", local_addr.port()));

        let leaseman = LeaseManager::new(Arc::new(MemStore::new()));
        let (tx_pause, rx_pause) = watch::channel(false);

        let dispatcher_handle = tokio::spawn(Self::dispatcher_task(
            service,
            leaseman,
            Duration::from_millis(config.default_ttl_ms),
            rx_pause,
        ));

        pf_info!("lock node serving clients at '{}'", local_addr);
        Ok(LockNode {
            local_addr,
            tx_pause,
            _dispatcher_handle: dispatcher_handle,
        })
    }

    /// Returns the address the client listener bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts swallowing incoming requests without replying, as if this
    /// node got partitioned away from all clients.
    pub fn pause(&self) {
        self.tx_pause.send_replace(true);
        pf_warn!("node at '{}' paused", self.local_addr);
    }

    /// Resumes serving requests.
    pub fn resume(&self) {
        self.tx_pause.send_replace(false);
        pf_warn!("node at '{}' resumed", self.local_addr);
    }
}

// LockNode dispatcher task implementation
impl LockNode {
    /// Applies one lock operation to the lease table.
    async fn apply_op(
        leaseman: &LeaseManager<MemStore>,
        default_ttl: Duration,
        op: LockOp,
    ) -> Result<LockOutcome, PalisadeError> {
        let op_ttl = |ttl_ms: u64| {
            if ttl_ms == 0 {
                default_ttl
            } else {
                Duration::from_millis(ttl_ms)
            }
        };

        match op {
            LockOp::Acquire {
                name,
                owner,
                ttl_ms,
                token_hint,
            } => {
                let ttl = op_ttl(ttl_ms);
                for _ in 0..ACQUIRE_RETRIES {
                    match leaseman
                        .try_create(&name, &owner, ttl, token_hint)
                        .await?
                    {
                        CreateOutcome::Created { token, version } => {
                            return Ok(LockOutcome::Granted {
                                token,
                                version,
                            });
                        }
                        CreateOutcome::Occupied {
                            holder,
                            expired: false,
                            ..
                        } => {
                            return Ok(LockOutcome::Held { holder });
                        }
                        CreateOutcome::Occupied { expired: true, .. } => {
                            // expired record in the way; try to take over,
                            // going around once more if the takeover raced
                            match leaseman
                                .force_takeover(
                                    &name,
                                    &owner,
                                    ttl,
                                    token_hint,
                                )
                                .await?
                            {
                                TakeoverOutcome::Taken { token, version } => {
                                    return Ok(LockOutcome::Granted {
                                        token,
                                        version,
                                    });
                                }
                                TakeoverOutcome::NotExpired { holder } => {
                                    return Ok(LockOutcome::Held { holder });
                                }
                                TakeoverOutcome::Raced => continue,
                            }
                        }
                    }
                }
                logged_err!("acquire of '{}' raced out of retries", name)
            }

            LockOp::Renew {
                name,
                owner,
                version,
                ttl_ms,
            } => Ok(
                match leaseman
                    .renew(&name, &owner, version, op_ttl(ttl_ms))
                    .await?
                {
                    RenewOutcome::Renewed { version } => {
                        LockOutcome::Renewed { version }
                    }
                    RenewOutcome::NotOwner { holder } => {
                        LockOutcome::NotOwner { holder }
                    }
                    RenewOutcome::VersionConflict { current } => {
                        LockOutcome::VersionConflict { current }
                    }
                    RenewOutcome::Gone => LockOutcome::Gone,
                },
            ),

            LockOp::Release {
                name,
                owner,
                version,
            } => Ok(
                match leaseman.release(&name, &owner, version).await? {
                    ReleaseOutcome::Released
                    | ReleaseOutcome::AlreadyGone => LockOutcome::Released,
                    ReleaseOutcome::NotOwner { holder } => {
                        LockOutcome::NotOwner { holder }
                    }
                    ReleaseOutcome::Raced { current } => {
                        LockOutcome::VersionConflict { current }
                    }
                },
            ),

            LockOp::Inspect { name } => {
                Ok(LockOutcome::Record(leaseman.inspect(&name).await?))
            }
        }
    }

    /// Dispatcher task function: pulls requests off the external API and
    /// applies them to the lease table one at a time.
    async fn dispatcher_task(
        mut service: LockService,
        leaseman: LeaseManager<MemStore>,
        default_ttl: Duration,
        rx_pause: watch::Receiver<bool>,
    ) {
        pf_debug!("dispatcher task spawned");

        loop {
            let (client, req) = match service.get_req().await {
                Ok(req) => req,
                Err(e) => {
                    pf_error!("error getting request: {}", e);
                    break;
                }
            };

            if *rx_pause.borrow() {
                pf_trace!(
                    "swallowing request {} from {} while paused",
                    req.id,
                    client
                );
                continue;
            }

            let outcome =
                match Self::apply_op(&leaseman, default_ttl, req.op).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        pf_error!("error applying op {}: {}", req.id, e);
                        LockOutcome::Fault(e.to_string())
                    }
                };

            if let Err(e) = service
                .send_reply(
                    LockReply {
                        id: req.id,
                        outcome,
                    },
                    client,
                )
                .await
            {
                pf_warn!("error replying to {}: {}", client, e);
            }
        }

        pf_debug!("dispatcher task exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ReplicaApiStub, ReplicaRecvStub, ReplicaSendStub};
    use crate::server::service::LockRequest;
    use crate::server::RecordView;
    use rand::Rng;
    use tokio::time::{self, Instant};

    async fn one_node_and_stub(
        config_str: Option<&str>,
    ) -> Result<(LockNode, ReplicaSendStub, ReplicaRecvStub), PalisadeError>
    {
        let node =
            LockNode::new_and_setup("127.0.0.1:0".parse()?, config_str)
                .await?;
        let stub = ReplicaApiStub::new(rand::thread_rng().gen());
        let (send_stub, recv_stub) =
            stub.connect(0, node.local_addr()).await?;
        Ok((node, send_stub, recv_stub))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn node_lock_lifecycle() -> Result<(), PalisadeError> {
        let (_node, mut send_stub, mut recv_stub) =
            one_node_and_stub(None).await?;

        send_stub
            .send_req(LockRequest {
                id: 0,
                op: LockOp::Acquire {
                    name: "db".into(),
                    owner: "owner-a".into(),
                    ttl_ms: 5000,
                    token_hint: 0,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?,
            LockReply {
                id: 0,
                outcome: LockOutcome::Granted {
                    token: 1,
                    version: 1
                },
            }
        );

        send_stub
            .send_req(LockRequest {
                id: 1,
                op: LockOp::Acquire {
                    name: "db".into(),
                    owner: "owner-b".into(),
                    ttl_ms: 5000,
                    token_hint: 0,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?,
            LockReply {
                id: 1,
                outcome: LockOutcome::Held {
                    holder: "owner-a".into()
                },
            }
        );

        send_stub
            .send_req(LockRequest {
                id: 2,
                op: LockOp::Renew {
                    name: "db".into(),
                    owner: "owner-a".into(),
                    version: 1,
                    ttl_ms: 5000,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?,
            LockReply {
                id: 2,
                outcome: LockOutcome::Renewed { version: 2 },
            }
        );

        send_stub
            .send_req(LockRequest {
                id: 3,
                op: LockOp::Release {
                    name: "db".into(),
                    owner: "owner-a".into(),
                    version: 2,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?,
            LockReply {
                id: 3,
                outcome: LockOutcome::Released,
            }
        );

        send_stub
            .send_req(LockRequest {
                id: 4,
                op: LockOp::Inspect { name: "db".into() },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?,
            LockReply {
                id: 4,
                outcome: LockOutcome::Record(None),
            }
        );

        // token counter survives the release
        send_stub
            .send_req(LockRequest {
                id: 5,
                op: LockOp::Acquire {
                    name: "db".into(),
                    owner: "owner-b".into(),
                    ttl_ms: 5000,
                    token_hint: 0,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?,
            LockReply {
                id: 5,
                outcome: LockOutcome::Granted {
                    token: 2,
                    version: 1
                },
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn node_takeover_sequencing() -> Result<(), PalisadeError> {
        let (_node, mut send_stub, mut recv_stub) =
            one_node_and_stub(None).await?;

        send_stub
            .send_req(LockRequest {
                id: 0,
                op: LockOp::Acquire {
                    name: "db".into(),
                    owner: "owner-a".into(),
                    ttl_ms: 60,
                    token_hint: 0,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?.outcome,
            LockOutcome::Granted {
                token: 1,
                version: 1
            }
        );

        time::sleep(Duration::from_millis(100)).await;

        // acquire over the expired record goes through a takeover
        send_stub
            .send_req(LockRequest {
                id: 1,
                op: LockOp::Acquire {
                    name: "db".into(),
                    owner: "owner-b".into(),
                    ttl_ms: 5000,
                    token_hint: 0,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?.outcome,
            LockOutcome::Granted {
                token: 2,
                version: 2
            }
        );

        // previous holder is fenced out
        send_stub
            .send_req(LockRequest {
                id: 2,
                op: LockOp::Renew {
                    name: "db".into(),
                    owner: "owner-a".into(),
                    version: 1,
                    ttl_ms: 5000,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?.outcome,
            LockOutcome::NotOwner {
                holder: "owner-b".into()
            }
        );

        send_stub
            .send_req(LockRequest {
                id: 3,
                op: LockOp::Inspect { name: "db".into() },
            })
            .await?;
        let reply = recv_stub.recv_reply().await?;
        match reply.outcome {
            LockOutcome::Record(Some(RecordView {
                holder,
                fencing_token,
                version,
                expired,
                ..
            })) => {
                assert_eq!(holder, "owner-b");
                assert_eq!(fencing_token, 2);
                assert_eq!(version, 2);
                assert!(!expired);
            }
            outcome => panic!("unexpected inspect outcome {:?}", outcome),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn node_default_ttl_applies() -> Result<(), PalisadeError> {
        let (_node, mut send_stub, mut recv_stub) =
            one_node_and_stub(Some("default_ttl_ms = 80")).await?;

        send_stub
            .send_req(LockRequest {
                id: 0,
                op: LockOp::Acquire {
                    name: "db".into(),
                    owner: "owner-a".into(),
                    ttl_ms: 0, // ask for the configured default
                    token_hint: 0,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?.outcome,
            LockOutcome::Granted {
                token: 1,
                version: 1
            }
        );

        time::sleep(Duration::from_millis(130)).await;
        send_stub
            .send_req(LockRequest {
                id: 1,
                op: LockOp::Acquire {
                    name: "db".into(),
                    owner: "owner-b".into(),
                    ttl_ms: 0,
                    token_hint: 0,
                },
            })
            .await?;
        assert_eq!(
            recv_stub.recv_reply().await?.outcome,
            LockOutcome::Granted {
                token: 2,
                version: 2
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn node_pause_resume() -> Result<(), PalisadeError> {
        let (node, mut send_stub, mut recv_stub) =
            one_node_and_stub(None).await?;

        send_stub
            .send_req(LockRequest {
                id: 0,
                op: LockOp::Inspect { name: "db".into() },
            })
            .await?;
        assert_eq!(recv_stub.recv_reply().await?.id, 0);

        // a paused node swallows requests without replying
        node.pause();
        send_stub
            .send_req(LockRequest {
                id: 1,
                op: LockOp::Inspect { name: "db".into() },
            })
            .await?;
        assert!(time::timeout(
            Duration::from_millis(150),
            recv_stub.recv_reply()
        )
        .await
        .is_err());

        node.resume();
        let start = Instant::now();
        send_stub
            .send_req(LockRequest {
                id: 2,
                op: LockOp::Inspect { name: "db".into() },
            })
            .await?;
        let reply = recv_stub.recv_reply().await?;
        assert_eq!(reply.id, 2);
        assert!(start.elapsed() < Duration::from_millis(150));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn node_config_rejected() -> Result<(), PalisadeError> {
        assert!(LockNode::new_and_setup(
            "127.0.0.1:0".parse()?,
            Some("default_ttl_ms = 0")
        )
        .await
        .is_err());
        assert!(LockNode::new_and_setup(
            "127.0.0.1:0".parse()?,
            Some("no_such_field = 7")
        )
        .await
        .is_err());
        Ok(())
    }
}
