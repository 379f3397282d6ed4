// MOUNT Protocol Handlers
//
// Program: 100005 (MOUNT)
// Version: 1
//
// Clients mount an exported path to obtain the first file handle before
// they can perform NFS operations. Successful mounts are recorded in the
// activity log (rmtab) so DUMP can list them.

pub mod dump;
pub mod export;
pub mod mnt;
pub mod null;
pub mod rmtab;
pub mod umnt;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::auth::CallContext;
use crate::auth::gate::Gate;
use crate::config::ServerConfig;
use crate::protocol::ProtocolError;
use crate::protocol::rpc::{AcceptStat, CallHeader, RpcMessage};
use crate::protocol::v2::mount::{DirPath, MountMessage};

pub use rmtab::Rmtab;

/// MOUNT program number (RFC 1094, appendix A)
pub const MOUNT_PROGRAM: u32 = 100005;

/// MOUNT version 1
pub const MOUNT_V1: u32 = 1;

/// MOUNT procedure numbers
pub mod procedures {
    pub const NULL: u32 = 0;
    pub const MNT: u32 = 1;
    pub const DUMP: u32 = 2;
    pub const UMNT: u32 = 3;
    pub const UMNTALL: u32 = 4;
    pub const EXPORT: u32 = 5;
    pub const EXPORTALL: u32 = 6;
}

/// Everything a MOUNT handler works with during one call
pub struct MountRequest<'a> {
    pub gate: &'a mut Gate,
    pub ctx: &'a CallContext,
    pub config: &'a ServerConfig,
    pub rmtab: &'a mut Rmtab,
}

impl MountRequest<'_> {
    /// Name under which the caller appears in the activity log
    fn host(&self) -> String {
        self.ctx.peer_ip().to_string()
    }
}

/// Name of a MOUNT procedure for logging
pub fn procedure_name(procedure: u32) -> &'static str {
    match procedure {
        procedures::NULL => "NULL",
        procedures::MNT => "MNT",
        procedures::DUMP => "DUMP",
        procedures::UMNT => "UMNT",
        procedures::UMNTALL => "UMNTALL",
        procedures::EXPORT => "EXPORT",
        procedures::EXPORTALL => "EXPORTALL",
        _ => "UNKNOWN",
    }
}

/// Dispatch MOUNT procedure call to appropriate handler
pub fn handle_mount_call(
    req: &mut MountRequest<'_>,
    call: &CallHeader,
    args_data: &[u8],
) -> Result<BytesMut, ProtocolError> {
    let xid = call.xid;

    if call.vers != MOUNT_V1 {
        warn!("Expected MOUNT version {}, got {}", MOUNT_V1, call.vers);
        return RpcMessage::create_prog_mismatch_reply(xid, MOUNT_V1, MOUNT_V1);
    }

    let body = match call.proc_ {
        procedures::NULL => return null::handle(xid),
        procedures::MNT => {
            let Some(dirpath) = dirpath(xid, args_data) else {
                return RpcMessage::create_error_reply(xid, AcceptStat::GarbageArgs);
            };
            MountMessage::serialize_fhstatus(&mnt::handle(req, dirpath))?
        }
        procedures::DUMP => MountMessage::serialize_mountlist(&dump::handle(req))?,
        procedures::UMNT => {
            let Some(dirpath) = dirpath(xid, args_data) else {
                return RpcMessage::create_error_reply(xid, AcceptStat::GarbageArgs);
            };
            umnt::handle(req, dirpath);
            BytesMut::new()
        }
        procedures::UMNTALL => {
            umnt::handle_all(req);
            BytesMut::new()
        }
        procedures::EXPORT | procedures::EXPORTALL => MountMessage::serialize_exports(&export::handle(req))?,
        procedure => {
            warn!("Unknown MOUNT procedure: {}", procedure);
            return RpcMessage::create_error_reply(xid, AcceptStat::ProcUnavail);
        }
    };

    RpcMessage::create_success_reply_with_data(xid, &body)
}

fn dirpath(xid: u32, args_data: &[u8]) -> Option<DirPath> {
    match MountMessage::deserialize_dirpath(args_data) {
        Ok(path) => Some(path),
        Err(e) => {
            debug!("Failed to decode MOUNT dirpath (xid={}): {}", xid, e);
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::nfs::testkit::Fixture;

    /// NFS fixture plus an activity log in its own scratch directory
    pub struct MountFixture {
        pub fx: Fixture,
        _rmtab_dir: tempfile::TempDir,
        pub rmtab: Rmtab,
    }

    impl MountFixture {
        pub fn new() -> Self {
            let rmtab_dir = tempfile::TempDir::new().unwrap();
            let rmtab = Rmtab::new(rmtab_dir.path().join("rmtab"));
            MountFixture {
                fx: Fixture::new(),
                _rmtab_dir: rmtab_dir,
                rmtab,
            }
        }

        pub fn request(&mut self) -> MountRequest<'_> {
            MountRequest {
                gate: &mut self.fx.gate,
                ctx: &self.fx.ctx,
                config: &self.fx.config,
                rmtab: &mut self.rmtab,
            }
        }
    }
}
