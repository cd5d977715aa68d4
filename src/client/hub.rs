//! Palisade client replica-connections hub implementation.
//!
//! Maintains one TCP connection per configured replica, each driven by a
//! messenger task. Requests fan out through per-replica send channels;
//! replies from all replicas funnel into one shared recv channel tagged
//! with the replica ID they came from. A broken connection turns that
//! replica silent; the next outgoing request lazily attempts one
//! reconnection. Sends never wait on a backed-up replica: a request that
//! cannot be queued right away is dropped and that replica counts as
//! silent for its round.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::client::stub::{ReplicaApiStub, ReplicaRecvStub, ReplicaSendStub};
use crate::client::ClientId;
use crate::server::{LockReply, LockRequest, ReplicaId};
use crate::utils::{Bitmap, PalisadeError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Delay between repeated connection attempts to one replica.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Cap on how long one connection attempt to a replica may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Client replica-connections hub.
pub struct ReplicaHub {
    /// Cluster size (total number of replicas).
    population: u8,

    /// Map from replica ID -> sender side of its send channel.
    tx_sends: HashMap<ReplicaId, mpsc::Sender<LockRequest>>,

    /// Receiver side of the shared recv channel.
    rx_recv: mpsc::Receiver<(ReplicaId, LockReply)>,

    /// Map from replica ID -> messenger task join handles.
    _messenger_handles: HashMap<ReplicaId, JoinHandle<()>>,
}

// ReplicaHub public API implementation
impl ReplicaHub {
    /// Creates a new replica-connections hub: connects to every replica in
    /// the list (retrying each until `connect_retries` runs out) and spawns
    /// one messenger task per connection. Replica IDs are the positions in
    /// the given list.
    pub async fn new_and_setup(
        id: ClientId,
        replica_addrs: &[SocketAddr],
        chan_send_cap: usize,
        chan_recv_cap: usize,
        connect_retries: usize,
    ) -> Result<Self, PalisadeError> {
        if replica_addrs.is_empty() || replica_addrs.len() > u8::MAX as usize
        {
            return logged_err!(
                "invalid number of replicas {}",
                replica_addrs.len()
            );
        }
        if chan_send_cap == 0 {
            return logged_err!("invalid chan_send_cap {}", chan_send_cap);
        }
        if chan_recv_cap == 0 {
            return logged_err!("invalid chan_recv_cap {}", chan_recv_cap);
        }

        let population = replica_addrs.len() as u8;
        let api_stub = ReplicaApiStub::new(id);
        let (tx_recv, rx_recv) = mpsc::channel(chan_recv_cap);

        let mut tx_sends = HashMap::new();
        let mut messenger_handles = HashMap::new();
        for (peer, &addr) in replica_addrs.iter().enumerate() {
            let peer = peer as ReplicaId;
            let (send_stub, recv_stub) =
                Self::connect_with_retries(&api_stub, peer, addr, connect_retries)
                    .await?;

            let (tx_send, rx_send) = mpsc::channel(chan_send_cap);
            tx_sends.insert(peer, tx_send);

            messenger_handles.insert(
                peer,
                tokio::spawn(Self::replica_messenger_task(
                    api_stub.clone(),
                    peer,
                    addr,
                    send_stub,
                    recv_stub,
                    rx_send,
                    tx_recv.clone(),
                )),
            );
        }

        pf_info!("connected to {} replicas", population);
        Ok(ReplicaHub {
            population,
            tx_sends,
            rx_recv,
            _messenger_handles: messenger_handles,
        })
    }

    /// Returns the cluster size.
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Sends a request to the replicas marked in `target`. A replica whose
    /// messenger has gone away, or whose send channel is full because its
    /// connection stopped draining, is skipped with a warning; the caller's
    /// reply-counting machinery treats it like any other silent replica.
    pub async fn send_req(
        &self,
        req: &LockRequest,
        target: &Bitmap,
    ) -> Result<(), PalisadeError> {
        for peer in target.ones() {
            match self.tx_sends.get(&peer) {
                // never `.send().await` here: a replica that accepts the
                // connection but stops reading would wedge the caller
                Some(tx_send) => match tx_send.try_send(req.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        pf_warn!(
                            "send channel of replica {} is full; request {} \
                             not sent",
                            peer,
                            req.id
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        pf_warn!(
                            "messenger for replica {} has exited; request {} \
                             not sent",
                            peer,
                            req.id
                        );
                    }
                },
                None => {
                    return logged_err!(
                        "replica ID {} not found among connected ones",
                        peer
                    );
                }
            }
        }
        Ok(())
    }

    /// Receives a reply from some replica by receiving from the shared
    /// recv channel. Returns a pair of `(replica_id, reply)` on success.
    pub async fn recv_reply(
        &mut self,
    ) -> Result<(ReplicaId, LockReply), PalisadeError> {
        match self.rx_recv.recv().await {
            Some((peer, reply)) => Ok((peer, reply)),
            None => logged_err!("recv channel has been closed"),
        }
    }

    /// Makes one connection attempt, bounded in time so that a replica
    /// that swallows the TCP handshake cannot pin its caller.
    async fn connect_once(
        api_stub: &ReplicaApiStub,
        peer: ReplicaId,
        addr: SocketAddr,
    ) -> Result<(ReplicaSendStub, ReplicaRecvStub), PalisadeError> {
        time::timeout(CONNECT_TIMEOUT, api_stub.connect(peer, addr)).await?
    }

    async fn connect_with_retries(
        api_stub: &ReplicaApiStub,
        peer: ReplicaId,
        addr: SocketAddr,
        retries: usize,
    ) -> Result<(ReplicaSendStub, ReplicaRecvStub), PalisadeError> {
        let mut attempt = 0;
        loop {
            match Self::connect_once(api_stub, peer, addr).await {
                Ok(stubs) => return Ok(stubs),
                Err(e) if attempt < retries => {
                    pf_warn!(
                        "retrying connection to replica {} at '{}': {}",
                        peer,
                        addr,
                        e
                    );
                    attempt += 1;
                    time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ReplicaHub replica_messenger task implementation
impl ReplicaHub {
    /// Replica messenger task function. Exits when the hub drops its send
    /// channel. While the replica connection is broken the replica looks
    /// silent; the next request to send triggers one reconnection attempt.
    #[allow(clippy::too_many_arguments)]
    async fn replica_messenger_task(
        api_stub: ReplicaApiStub,
        peer: ReplicaId,
        addr: SocketAddr,
        send_stub: ReplicaSendStub,
        recv_stub: ReplicaRecvStub,
        mut rx_send: mpsc::Receiver<LockRequest>,
        tx_recv: mpsc::Sender<(ReplicaId, LockReply)>,
    ) {
        pf_debug!("messenger task for replica {} spawned", peer);
        let mut conn = Some((send_stub, recv_stub));

        'task: loop {
            match conn.take() {
                // connected; pump requests out and replies in
                Some((mut send_stub, mut recv_stub)) => loop {
                    tokio::select! {
                        // gets a request to send out
                        req = rx_send.recv() => match req {
                            Some(req) => {
                                if let Err(e) =
                                    send_stub.send_req(req).await
                                {
                                    pf_warn!(
                                        "error sending to replica {}: {}",
                                        peer,
                                        e
                                    );
                                    continue 'task;
                                }
                            },
                            None => break 'task, // hub dropped
                        },

                        // receives new reply from the replica
                        reply = recv_stub.recv_reply() => match reply {
                            Ok(reply) => {
                                if tx_recv
                                    .send((peer, reply))
                                    .await
                                    .is_err()
                                {
                                    break 'task; // hub dropped
                                }
                            },
                            Err(_) => {
                                pf_warn!(
                                    "connection to replica {} lost", peer
                                );
                                continue 'task;
                            }
                        },
                    }
                },

                // disconnected; wait for the next request to send, then
                // try once to re-establish the connection for it
                None => match rx_send.recv().await {
                    Some(req) => match Self::connect_once(&api_stub, peer, addr)
                        .await
                    {
                        Ok((mut send_stub, recv_stub)) => {
                            pf_info!("reconnected to replica {}", peer);
                            if let Err(e) = send_stub.send_req(req).await {
                                pf_warn!(
                                    "error sending to replica {}: {}",
                                    peer,
                                    e
                                );
                            } else {
                                conn = Some((send_stub, recv_stub));
                            }
                        }
                        Err(e) => {
                            pf_warn!(
                                "replica {} unreachable, request dropped: {}",
                                peer,
                                e
                            );
                        }
                    },
                    None => break 'task, // hub dropped
                },
            }
        }

        pf_debug!("messenger task for replica {} exited", peer);
    }
}
