// Worker
//
// A worker owns everything a call may touch: export table, handle cache,
// uid/gid caches and the activity log copy. It serves calls strictly one
// after another. Reloads and cache flushes requested while a call is
// running take effect once the call's reply has been handed back.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, debug_span, error, info, warn};

use super::Control;
use crate::auth::creds::{CredentialGuard, Identity};
use crate::auth::gate::Gate;
use crate::auth::{CallContext, ExportTable, UgidTranslator};
use crate::config::ServerConfig;
use crate::mount::{self, MOUNT_PROGRAM, MountRequest, Rmtab};
use crate::nfs::{self, NfsRequest};
use crate::protocol::ProtocolError;
use crate::protocol::rpc::{AcceptStat, CallHeader, RpcMessage};

/// Builds a fresh export table, at startup and on every reload
pub type TableLoader = Arc<dyn Fn() -> Result<ExportTable> + Send + Sync>;

/// One decoded call waiting for a worker
#[derive(Debug)]
pub struct Job {
    pub peer: SocketAddr,
    pub call: CallHeader,
    /// Complete call record; arguments start at `args_offset`
    pub record: Bytes,
    pub args_offset: usize,
    pub reply: oneshot::Sender<BytesMut>,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Call(Job),
    /// Look at the control flags without serving a call
    Wake,
    Shutdown,
}

/// What ended a worker's run
#[derive(Debug, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    /// Every sender is gone
    Disconnected,
}

pub struct Worker {
    id: usize,
    config: Arc<ServerConfig>,
    control: Arc<Control>,
    loader: TableLoader,
    gate: Gate,
    rmtab: Rmtab,
    reload_seen: u64,
    flush_seen: u64,
}

impl Worker {
    /// Set up a worker with its own copy of the export table
    pub fn new(id: usize, config: Arc<ServerConfig>, control: Arc<Control>, loader: TableLoader) -> Result<Self> {
        let table = loader()?;
        let gate = Gate::new(
            table,
            UgidTranslator::system(config.directory_service.as_deref()),
            config.read_only,
        );
        let rmtab = Rmtab::new(&config.rmtab);
        debug!("Worker {} records mounts in {}", id, rmtab.path().display());
        Ok(Worker {
            id,
            rmtab,
            reload_seen: control.reload_epoch(),
            flush_seen: control.flush_epoch(),
            config,
            control,
            loader,
            gate,
        })
    }

    /// Serve messages until told to stop
    pub fn run(&mut self, rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Exit {
        // Filesystem calls outside a client's scope run as the configured
        // server identity
        let _base = (self.config.root_uid != 0)
            .then(|| CredentialGuard::assume(Identity::new(self.config.root_uid, unsafe { libc::getegid() })));

        debug!("Worker {} ready", self.id);
        loop {
            match rx.blocking_recv() {
                Some(WorkerMessage::Call(job)) => {
                    let reply = self.serve(&job);
                    if job.reply.send(reply).is_err() {
                        debug!("Connection went away before reply (xid={})", job.call.xid);
                    }
                }
                Some(WorkerMessage::Wake) => {}
                Some(WorkerMessage::Shutdown) => return Exit::Shutdown,
                None => return Exit::Disconnected,
            }
            self.housekeeping();
        }
    }

    /// Run one call and build its reply
    pub fn serve(&mut self, job: &Job) -> BytesMut {
        let call = &job.call;
        let procedure = match call.prog {
            MOUNT_PROGRAM => mount::procedure_name(call.proc_),
            _ => nfs::procedure_name(call.proc_),
        };
        let span = debug_span!(
            "call",
            worker = self.id,
            xid = call.xid,
            peer = %job.peer,
            prog = call.prog,
            procedure
        );
        let _enter = span.enter();

        let ctx = CallContext::new(job.peer, call.auth_unix());
        let args = job.record.get(job.args_offset..).unwrap_or(&[]);
        debug!(
            "{} from uid {:?}, {} argument bytes",
            procedure,
            ctx.cred.as_ref().map(|c| c.uid),
            args.len()
        );

        match self.dispatch(&ctx, call, args) {
            Ok(reply) => {
                debug!("{} done, {} reply bytes", procedure, reply.len());
                reply
            }
            Err(e) => {
                error!("Failed to encode reply: {}", e);
                system_error(call.xid)
            }
        }
    }

    fn dispatch(&mut self, ctx: &CallContext, call: &CallHeader, args: &[u8]) -> Result<BytesMut, ProtocolError> {
        match call.prog {
            MOUNT_PROGRAM => {
                let mut req = MountRequest {
                    gate: &mut self.gate,
                    ctx,
                    config: &self.config,
                    rmtab: &mut self.rmtab,
                };
                mount::handle_mount_call(&mut req, call, args)
            }
            _ => {
                let mut req = NfsRequest {
                    gate: &mut self.gate,
                    ctx,
                    config: &self.config,
                };
                nfs::dispatch(&mut req, call, args)
            }
        }
    }

    /// Apply reload and flush requests raised since the last look
    fn housekeeping(&mut self) {
        let reload = self.control.reload_epoch();
        if reload != self.reload_seen {
            self.reload_seen = reload;
            match (self.loader)() {
                Ok(table) => {
                    info!("Worker {} reloaded exports", self.id);
                    self.gate.replace_table(table);
                }
                Err(e) => warn!("Worker {} keeps its old exports: {:#}", self.id, e),
            }
        }

        let flush = self.control.flush_epoch();
        if flush != self.flush_seen {
            self.flush_seen = flush;
            self.gate.handles().flush(false);
        }
    }
}

/// Reply used when no other reply can be built
pub fn system_error(xid: u32) -> BytesMut {
    RpcMessage::create_error_reply(xid, AcceptStat::SystemErr).unwrap_or_else(|_| BytesMut::new())
}
