// RPC TCP Server with Record Marking
//
// Implements Sun RPC over TCP with record marking (RFC 5531). Each
// connection is served in order: the next record is read only after the
// previous reply has been written.

use anyhow::{Context, Result, bail};
use bytes::{BufMut, Bytes, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::WorkerPool;
use super::worker::{Job, system_error};
use crate::mount::MOUNT_PROGRAM;
use crate::portmap::{self, PORTMAP_PROGRAM, Registry};
use crate::protocol::rpc::{AcceptStat, CallHeader, RPC_VERSION, RpcMessage};
use crate::protocol::v2::nfs::NFS_PROGRAM;

/// Last-fragment flag of a record mark
const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Largest call record accepted; a full WRITE is well below this
const MAX_RECORD: usize = 64 * 1024;

/// RPC server handling TCP connections with record marking
pub struct RpcServer {
    listener: TcpListener,
    registry: Registry,
    pool: Arc<WorkerPool>,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr, registry: Registry, pool: Arc<WorkerPool>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        Ok(Self {
            listener,
            registry,
            pool,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` completes
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("RPC server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (socket, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        // Out of descriptors and the like; keep listening
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => break,
            };
            debug!("New connection from {}", peer);

            let registry = self.registry.clone();
            let pool = self.pool.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, peer, registry, pool).await {
                    warn!("Connection error from {}: {:#}", peer, e);
                }
            });
        }

        info!("RPC server stopped accepting connections");
        Ok(())
    }
}

/// Handle a single TCP connection
async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    registry: Registry,
    pool: Arc<WorkerPool>,
) -> Result<()> {
    let _ = socket.set_nodelay(true);
    while let Some(record) = read_record(&mut socket).await? {
        if let Some(reply) = handle_record(record, peer, &registry, &pool).await {
            write_record(&mut socket, &reply).await?;
        }
    }
    debug!("Connection closed by {}", peer);
    Ok(())
}

/// Read one complete record, joining its fragments
///
/// Returns `None` on a clean end of stream between records.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
    let mut record = BytesMut::new();
    loop {
        let mut mark = [0u8; 4];
        match reader.read_exact(&mut mark).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && record.is_empty() => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let mark = u32::from_be_bytes(mark);
        let len = (mark & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD {
            bail!("record exceeds {} bytes", MAX_RECORD);
        }

        let start = record.len();
        record.resize(start + len, 0);
        reader.read_exact(&mut record[start..]).await?;

        if mark & LAST_FRAGMENT != 0 {
            return Ok(Some(record.freeze()));
        }
    }
}

/// Write a reply as a single-fragment record
///
/// Mark and payload go out in one write.
pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, reply: &[u8]) -> Result<()> {
    let mut out = BytesMut::with_capacity(4 + reply.len());
    out.put_u32(reply.len() as u32 | LAST_FRAGMENT);
    out.put_slice(reply);
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Route one call record; `None` means no reply is sent
async fn handle_record(
    record: Bytes,
    peer: SocketAddr,
    registry: &Registry,
    pool: &WorkerPool,
) -> Option<BytesMut> {
    let (call, args_offset) = match RpcMessage::deserialize_call(&record) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Dropping undecodable record from {}: {}", peer, e);
            return None;
        }
    };
    let xid = call.xid;
    debug!(
        "RPC call: xid={}, prog={}, vers={}, proc={}",
        xid, call.prog, call.vers, call.proc_
    );

    let reply = if call.rpcvers != RPC_VERSION {
        warn!("RPC version {} from {}", call.rpcvers, peer);
        RpcMessage::create_rpc_mismatch_reply(xid)
    } else {
        match call.prog {
            PORTMAP_PROGRAM => {
                let args = record.get(args_offset..).unwrap_or(&[]);
                portmap::handle_portmap_call(&call, args, registry)
            }
            MOUNT_PROGRAM | NFS_PROGRAM => {
                return Some(submit(pool, peer, call, record, args_offset).await);
            }
            prog => {
                debug!("Unknown program number: {}", prog);
                RpcMessage::create_error_reply(xid, AcceptStat::ProgUnavail)
            }
        }
    };

    match reply {
        Ok(reply) => Some(reply),
        Err(e) => {
            error!("Failed to build reply (xid={}): {}", xid, e);
            Some(system_error(xid))
        }
    }
}

/// Hand a call to its worker and wait for the reply
async fn submit(
    pool: &WorkerPool,
    peer: SocketAddr,
    call: CallHeader,
    record: Bytes,
    args_offset: usize,
) -> BytesMut {
    let xid = call.xid;
    let (tx, rx) = oneshot::channel();
    let job = Job {
        peer,
        call,
        record,
        args_offset,
        reply: tx,
    };
    if pool.submit(job).is_err() {
        error!("No worker accepts calls (xid={})", xid);
        return system_error(xid);
    }
    rx.await.unwrap_or_else(|_| {
        warn!("Worker dropped call without reply (xid={})", xid);
        system_error(xid)
    })
}
