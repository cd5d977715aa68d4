//! Palisade server external API module implementation.
//!
//! Listens for client connections, runs one servant task per connected
//! client, and bridges the TCP streams to the node's dispatch loop through
//! bounded channels.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::{FencingToken, Version};
use crate::server::leaseman::RecordView;
use crate::utils::PalisadeError;

use bytes::{Bytes, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// External API request ID type.
pub type RequestId = u64;

/// Lock operation carried by a client request. `ttl_ms` of 0 asks for the
/// server's configured default TTL.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum LockOp {
    /// Acquire the named lock. `token_hint` is the highest fencing token
    /// the client has seen issued for this name.
    Acquire {
        name: String,
        owner: String,
        ttl_ms: u64,
        token_hint: FencingToken,
    },

    /// Push out the lease deadline of a held lock.
    Renew {
        name: String,
        owner: String,
        version: Version,
        ttl_ms: u64,
    },

    /// Release a held lock.
    Release {
        name: String,
        owner: String,
        version: Version,
    },

    /// Report this replica's view of the named lock.
    Inspect { name: String },
}

/// Request received from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    /// Client request ID.
    pub id: RequestId,

    /// Operation to apply to the local lease table.
    pub op: LockOp,
}

/// Per-replica outcome of a lock operation.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum LockOutcome {
    /// Acquire succeeded on this replica.
    Granted {
        token: FencingToken,
        version: Version,
    },

    /// Acquire refused; the named lock is held by `holder`.
    Held { holder: String },

    /// Renew succeeded; record now at this version.
    Renewed { version: Version },

    /// Renew or release refused; the record belongs to `holder`.
    NotOwner { holder: String },

    /// Record exists but moved past the presented version.
    VersionConflict { current: Version },

    /// Renew refused; no record under this name.
    Gone,

    /// Release succeeded or the record was already gone.
    Released,

    /// Inspection result.
    Record(Option<RecordView>),

    /// Server-side error string.
    Fault(String),
}

/// Reply back to client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LockReply {
    /// ID of the corresponding client request.
    pub id: RequestId,

    /// Outcome of the operation on this replica.
    pub outcome: LockOutcome,
}

/// The external client-facing API module.
pub struct LockService {
    /// Address the listener actually bound to.
    local_addr: SocketAddr,

    /// Receiver side of the req channel.
    rx_req: mpsc::Receiver<(ClientId, LockRequest)>,

    /// Map from client ID -> sender side of its reply channel, shared with
    /// the client acceptor task.
    tx_replies: flashmap::ReadHandle<ClientId, mpsc::Sender<LockReply>>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,

    /// Map from client ID -> client servant task join handles, shared with
    /// the client acceptor task.
    _client_servant_handles: flashmap::ReadHandle<ClientId, JoinHandle<()>>,
}

// LockService public API implementation
impl LockService {
    /// Creates a new external API module, binds the listener, and spawns
    /// the client acceptor task. Returns the module on success; the address
    /// may name port 0 to bind an ephemeral port.
    pub async fn new_and_setup(
        api_addr: SocketAddr,
        chan_req_cap: usize,
        chan_reply_cap: usize,
    ) -> Result<Self, PalisadeError> {
        if chan_req_cap == 0 {
            return logged_err!("invalid chan_req_cap {}", chan_req_cap);
        }
        if chan_reply_cap == 0 {
            return logged_err!("invalid chan_reply_cap {}", chan_reply_cap);
        }

        let (tx_req, rx_req) = mpsc::channel(chan_req_cap);

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::Sender<LockReply>>();

        let client_listener = TcpListener::bind(api_addr).await?;
        let local_addr = client_listener.local_addr()?;

        let (client_servant_handles_write, client_servant_handles_read) =
            flashmap::new::<ClientId, JoinHandle<()>>();

        let client_acceptor_handle = tokio::spawn(Self::client_acceptor_task(
            tx_req,
            chan_reply_cap,
            client_listener,
            tx_replies_write,
            client_servant_handles_write,
        ));

        Ok(LockService {
            local_addr,
            rx_req,
            tx_replies: tx_replies_read,
            _client_acceptor_handle: client_acceptor_handle,
            _client_servant_handles: client_servant_handles_read,
        })
    }

    /// Returns the address the client listener bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns whether a client ID is connected to me.
    #[allow(dead_code)]
    pub fn has_client(&self, client: ClientId) -> bool {
        self.tx_replies.guard().contains_key(&client)
    }

    /// Waits for the next client request.
    pub async fn get_req(
        &mut self,
    ) -> Result<(ClientId, LockRequest), PalisadeError> {
        match self.rx_req.recv().await {
            Some((client, req)) => Ok((client, req)),
            None => logged_err!("req channel has been closed"),
        }
    }

    /// Sends a reply back to client by sending to the reply channel.
    pub async fn send_reply(
        &mut self,
        reply: LockReply,
        client: ClientId,
    ) -> Result<(), PalisadeError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&client) {
            Some(tx_reply) => {
                tx_reply
                    .send(reply)
                    .await
                    .map_err(|e| PalisadeError(e.to_string()))?;
                Ok(())
            }
            None => {
                logged_err!(
                    "client ID {} not found among active clients",
                    client
                )
            }
        }
    }
}

// LockService client_acceptor task implementation
impl LockService {
    /// Client acceptor task function.
    async fn client_acceptor_task(
        tx_req: mpsc::Sender<(ClientId, LockRequest)>,
        chan_reply_cap: usize,
        client_listener: TcpListener,
        mut tx_replies: flashmap::WriteHandle<ClientId, mpsc::Sender<LockReply>>,
        mut client_servant_handles: flashmap::WriteHandle<
            ClientId,
            JoinHandle<()>,
        >,
    ) {
        pf_debug!("client_acceptor task spawned");

        loop {
            let accepted = client_listener.accept().await;
            if let Err(e) = accepted {
                pf_warn!("error accepting client connection: {}", e);
                continue;
            }
            let (mut stream, addr) = accepted.unwrap();

            // connection starts with the client sending its ID
            let id = match stream.read_u64().await {
                Ok(id) => id,
                Err(e) => {
                    pf_warn!("error receiving new client ID: {}", e);
                    continue;
                }
            };

            let mut tx_replies_guard = tx_replies.guard();
            if let Some(sender) = tx_replies_guard.get(&id) {
                if sender.is_closed() {
                    // this client ID has left before; garbage collect it now
                    let mut client_servant_handles_guard =
                        client_servant_handles.guard();
                    client_servant_handles_guard.remove(id);
                    tx_replies_guard.remove(id);
                } else {
                    pf_error!("duplicate client ID listened: {}", id);
                    continue;
                }
            }
            pf_info!("accepted new client {}", id);

            let (tx_reply, rx_reply) = mpsc::channel(chan_reply_cap);
            tx_replies_guard.insert(id, tx_reply);

            let client_servant_handle = tokio::spawn(
                Self::client_servant_task(
                    id,
                    addr,
                    stream,
                    tx_req.clone(),
                    rx_reply,
                ),
            );
            let mut client_servant_handles_guard =
                client_servant_handles.guard();
            client_servant_handles_guard.insert(id, client_servant_handle);

            client_servant_handles_guard.publish();
            tx_replies_guard.publish();
        }
    }
}

// LockService client_servant task implementation
impl LockService {
    /// Reads a client request from given TcpStream.
    async fn read_req(
        // first 8 bytes being the request length, and the rest bytes being
        // the request itself
        req_buf: &mut BytesMut,
        conn_read: &mut ReadHalf<'_>,
    ) -> Result<LockRequest, PalisadeError> {
        // CANCELLATION SAFETY: cannot use `read_u64()` and `read_exact()`
        // here because this function serves as a `tokio::select!` branch and
        // those two methods are not cancellation-safe

        // read length of request first
        while req_buf.len() < 8 {
            // req_len not wholesomely read from socket before last
            // cancellation
            if conn_read.read_buf(req_buf).await? == 0 {
                return Err(PalisadeError::msg("connection closed"));
            }
        }
        let req_len = u64::from_be_bytes(req_buf[..8].try_into().unwrap());

        // then read the request itself
        let req_end = 8 + req_len as usize;
        if req_buf.capacity() < req_end {
            req_buf.reserve(req_end - req_buf.capacity());
        }
        while req_buf.len() < req_end {
            if conn_read.read_buf(req_buf).await? == 0 {
                return Err(PalisadeError::msg("connection closed"));
            }
        }
        let req = decode_from_slice(&req_buf[8..req_end])?;

        // no more awaits ahead, so no further cancellation possible; discard
        // the bytes consumed by this call
        if req_buf.len() > req_end {
            let buf_tail = Bytes::copy_from_slice(&req_buf[req_end..]);
            req_buf.clear();
            req_buf.extend_from_slice(&buf_tail);
        } else {
            req_buf.clear();
        }

        Ok(req)
    }

    /// Writes a reply through given TcpStream.
    async fn write_reply(
        reply: &LockReply,
        conn_write: &mut WriteHalf<'_>,
    ) -> Result<(), PalisadeError> {
        let reply_bytes = encode_to_vec(reply)?;
        conn_write.write_u64(reply_bytes.len() as u64).await?; // length first
        conn_write.write_all(&reply_bytes[..]).await?;
        Ok(())
    }

    /// Client request listener and reply sender task function. Exits when
    /// the client closes its connection.
    async fn client_servant_task(
        id: ClientId,
        addr: SocketAddr,
        mut conn: TcpStream,
        tx_req: mpsc::Sender<(ClientId, LockRequest)>,
        mut rx_reply: mpsc::Receiver<LockReply>,
    ) {
        pf_debug!("client_servant task for {} ({}) spawned", id, addr);

        let (mut conn_read, mut conn_write) = conn.split();
        let mut req_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            tokio::select! {
                // select between getting a new reply to send back and
                // receiving new client request, prioritizing the former
                biased;

                // gets a reply to send back
                reply = rx_reply.recv() => {
                    match reply {
                        Some(reply) => {
                            if let Err(e) = Self::write_reply(&reply, &mut conn_write).await {
                                pf_error!("error replying to {}: {}", id, e);
                            }
                        },
                        None => break, // channel closed and no messages remain
                    }
                },

                // receives client request
                req = Self::read_req(&mut req_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            if let Err(e) = tx_req.send((id, req)).await {
                                pf_error!(
                                    "error sending to tx_req for {}: {}", id, e
                                );
                            }
                        },

                        Err(_) => {
                            // EOF or broken connection counts as departure
                            pf_info!("client {} has disconnected", id);
                            break;
                        }
                    }
                },
            }
        }

        pf_debug!("client_servant task for {} ({}) exited", id, addr);
    }
}
