//! Palisade client replica-connection stub implementation.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::server::{LockReply, LockRequest, ReplicaId};
use crate::utils::PalisadeError;

use bytes::{Bytes, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Client replica-connection stub.
#[derive(Clone)]
pub struct ReplicaApiStub {
    /// My client ID.
    id: ClientId,
}

impl ReplicaApiStub {
    /// Creates a new replica-connection stub.
    pub fn new(id: ClientId) -> Self {
        ReplicaApiStub { id }
    }

    /// Connects to the given replica address, returning a split pair of
    /// owned read/write halves on success.
    pub async fn connect(
        &self,
        peer: ReplicaId,
        addr: SocketAddr,
    ) -> Result<(ReplicaSendStub, ReplicaRecvStub), PalisadeError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u64(self.id).await?; // send my client ID

        pf_debug!("connected to replica {} at '{}'", peer, addr);
        let (read_half, write_half) = stream.into_split();
        let send_stub = ReplicaSendStub::new(peer, write_half);
        let recv_stub = ReplicaRecvStub::new(peer, read_half);

        Ok((send_stub, recv_stub))
    }
}

/// Client write stub that owns a TCP write half.
pub struct ReplicaSendStub {
    /// Which replica this stub writes to.
    peer: ReplicaId,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,
}

impl ReplicaSendStub {
    /// Creates a new write stub.
    fn new(peer: ReplicaId, conn_write: OwnedWriteHalf) -> Self {
        ReplicaSendStub { peer, conn_write }
    }

    /// Sends a request to established replica connection.
    pub async fn send_req(
        &mut self,
        req: LockRequest,
    ) -> Result<(), PalisadeError> {
        pf_trace!("sending -> {} req {:?}", self.peer, req);
        let req_bytes = encode_to_vec(&req)?;
        self.conn_write.write_u64(req_bytes.len() as u64).await?; // length first
        self.conn_write.write_all(&req_bytes[..]).await?;
        Ok(())
    }
}

/// Client read stub that owns a TCP read half. Carries a persistent read
/// buffer so that `recv_reply()` can safely serve as a `tokio::select!`
/// branch.
pub struct ReplicaRecvStub {
    /// Which replica this stub reads from.
    peer: ReplicaId,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Bytes read off the socket but not yet consumed by a full reply.
    reply_buf: BytesMut,
}

impl ReplicaRecvStub {
    /// Creates a new read stub.
    fn new(peer: ReplicaId, conn_read: OwnedReadHalf) -> Self {
        ReplicaRecvStub {
            peer,
            conn_read,
            reply_buf: BytesMut::with_capacity(8 + 1024),
        }
    }

    /// Receives a reply from established replica connection.
    pub async fn recv_reply(&mut self) -> Result<LockReply, PalisadeError> {
        // CANCELLATION SAFETY: cannot use `read_u64()` and `read_exact()`
        // here because this method serves as a `tokio::select!` branch and
        // those two methods are not cancellation-safe; partially read frames
        // survive in `reply_buf` across cancellations instead

        // read length of reply first
        while self.reply_buf.len() < 8 {
            if self.conn_read.read_buf(&mut self.reply_buf).await? == 0 {
                return Err(PalisadeError::msg("connection closed"));
            }
        }
        let reply_len =
            u64::from_be_bytes(self.reply_buf[..8].try_into().unwrap());

        // then read the reply itself
        let reply_end = 8 + reply_len as usize;
        if self.reply_buf.capacity() < reply_end {
            self.reply_buf.reserve(reply_end - self.reply_buf.capacity());
        }
        while self.reply_buf.len() < reply_end {
            if self.conn_read.read_buf(&mut self.reply_buf).await? == 0 {
                return Err(PalisadeError::msg("connection closed"));
            }
        }
        let reply = decode_from_slice(&self.reply_buf[8..reply_end])?;

        // no more awaits ahead; discard the bytes consumed by this call
        if self.reply_buf.len() > reply_end {
            let buf_tail = Bytes::copy_from_slice(&self.reply_buf[reply_end..]);
            self.reply_buf.clear();
            self.reply_buf.extend_from_slice(&buf_tail);
        } else {
            self.reply_buf.clear();
        }

        pf_trace!("received <- {} reply {:?}", self.peer, reply);
        Ok(reply)
    }
}
