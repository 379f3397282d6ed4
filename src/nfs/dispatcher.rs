// NFS Procedure Dispatcher
//
// Routes incoming NFS RPC calls to the appropriate procedure handler

use bytes::BytesMut;
use std::io::Cursor;
use tracing::{debug, warn};
use xdr_codec::{Pack, Unpack};

use super::{
    NfsRequest, create, getattr, link, lookup, mkdir, null, read, readdir, readlink, remove, rename, rmdir,
    setattr, statfs, symlink, write,
};
use crate::error::NfsResult;
use crate::protocol::ProtocolError;
use crate::protocol::rpc::{AcceptStat, CallHeader, RpcMessage};
use crate::protocol::v2::nfs::{NFS_V2, NfsMessage, Void};

/// Procedure names of NFS version 2, indexed by procedure number
const PROCEDURES: [&str; 18] = [
    "NULL",
    "GETATTR",
    "SETATTR",
    "ROOT",
    "LOOKUP",
    "READLINK",
    "READ",
    "WRITECACHE",
    "WRITE",
    "CREATE",
    "REMOVE",
    "RENAME",
    "LINK",
    "SYMLINK",
    "MKDIR",
    "RMDIR",
    "READDIR",
    "STATFS",
];

/// Name of an NFS procedure for logging
pub fn procedure_name(procedure: u32) -> &'static str {
    PROCEDURES.get(procedure as usize).copied().unwrap_or("UNKNOWN")
}

/// Dispatch NFS procedure call to appropriate handler
///
/// # Arguments
/// * `req` - Worker state for this call
/// * `call` - Parsed RPC call header
/// * `args` - Encoded procedure arguments
///
/// # Returns
/// Serialized RPC reply message
pub fn dispatch(req: &mut NfsRequest<'_>, call: &CallHeader, args: &[u8]) -> Result<BytesMut, ProtocolError> {
    let xid = call.xid;

    if call.vers != NFS_V2 {
        warn!("Unsupported NFS version: {}", call.vers);
        return RpcMessage::create_prog_mismatch_reply(xid, NFS_V2, NFS_V2);
    }

    match call.proc_ {
        0 | 3 | 7 => null::handle_void(xid),
        1 => reply(req, xid, args, getattr::handle_getattr),
        2 => reply(req, xid, args, setattr::handle_setattr),
        4 => reply(req, xid, args, lookup::handle_lookup),
        5 => reply(req, xid, args, readlink::handle_readlink),
        6 => reply(req, xid, args, read::handle_read),
        8 => reply(req, xid, args, write::handle_write),
        9 => reply(req, xid, args, create::handle_create),
        10 => reply(req, xid, args, |req, a| status_only(remove::handle_remove(req, a))),
        11 => reply(req, xid, args, |req, a| status_only(rename::handle_rename(req, a))),
        12 => reply(req, xid, args, |req, a| status_only(link::handle_link(req, a))),
        13 => reply(req, xid, args, |req, a| status_only(symlink::handle_symlink(req, a))),
        14 => reply(req, xid, args, mkdir::handle_mkdir),
        15 => reply(req, xid, args, |req, a| status_only(rmdir::handle_rmdir(req, a))),
        16 => reply(req, xid, args, readdir::handle_readdir),
        17 => reply(req, xid, args, statfs::handle_statfs),
        procedure => {
            warn!("Unknown NFS procedure: {}", procedure);
            RpcMessage::create_error_reply(xid, AcceptStat::ProcUnavail)
        }
    }
}

fn status_only(res: NfsResult<()>) -> NfsResult<Void> {
    res.map(|()| Void)
}

/// Decode the arguments, run `handler` and encode its outcome
///
/// Undecodable arguments are answered with GARBAGE_ARGS; a failing handler
/// still produces a successful RPC reply carrying the error status.
fn reply<'a, 'r, A, R>(
    req: &mut NfsRequest<'r>,
    xid: u32,
    args: &'a [u8],
    handler: impl FnOnce(&mut NfsRequest<'r>, A) -> NfsResult<R>,
) -> Result<BytesMut, ProtocolError>
where
    A: Unpack<Cursor<&'a [u8]>>,
    R: Pack<Vec<u8>>,
{
    let args = match NfsMessage::deserialize::<A>(args) {
        Ok(args) => args,
        Err(e) => {
            debug!("Failed to decode NFS arguments (xid={}): {}", xid, e);
            return RpcMessage::create_error_reply(xid, AcceptStat::GarbageArgs);
        }
    };

    let res = handler(req, args).map_err(|e| {
        debug!("NFS call failed (xid={}): {}", xid, e);
        e.status()
    });
    let body = NfsMessage::serialize_result(&res)?;
    RpcMessage::create_success_reply_with_data(xid, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfs::testkit::Fixture;
    use crate::protocol::{decode_prefix, encode};
    use crate::protocol::rpc::{MSG_CALL, OpaqueAuth, RPC_VERSION};
    use crate::protocol::v2::nfs::{DirOpArgs, FType, Filename, NFS_PROGRAM, NfsStat};

    fn header(vers: u32, proc_: u32) -> CallHeader {
        CallHeader {
            xid: 42,
            mtype: MSG_CALL,
            rpcvers: RPC_VERSION,
            prog: NFS_PROGRAM,
            vers,
            proc_,
            cred: OpaqueAuth::default(),
            verf: OpaqueAuth::default(),
        }
    }

    /// Accept status of a reply, and the offset of its body
    fn accept_stat(reply: &[u8]) -> (u32, usize) {
        // xid, REPLY, MSG_ACCEPTED, verifier (flavor + empty body)
        let offset = 5 * 4;
        let (stat, n) = decode_prefix::<u32>(&reply[offset..]).unwrap();
        (stat, offset + n)
    }

    #[test]
    fn test_procedure_name() {
        assert_eq!(procedure_name(0), "NULL");
        assert_eq!(procedure_name(16), "READDIR");
        assert_eq!(procedure_name(18), "UNKNOWN");
    }

    #[test]
    fn test_unknown_procedure() {
        let mut fx = Fixture::new();
        let reply = dispatch(&mut fx.request(), &header(NFS_V2, 18), &[]).unwrap();
        assert_eq!(accept_stat(&reply).0, AcceptStat::ProcUnavail as u32);
    }

    #[test]
    fn test_garbage_args() {
        let mut fx = Fixture::new();
        let reply = dispatch(&mut fx.request(), &header(NFS_V2, 1), &[0, 1, 2]).unwrap();
        assert_eq!(accept_stat(&reply).0, AcceptStat::GarbageArgs as u32);
    }

    #[test]
    fn test_wrong_version() {
        let mut fx = Fixture::new();
        let reply = dispatch(&mut fx.request(), &header(3, 0), &[]).unwrap();
        let (stat, offset) = accept_stat(&reply);
        assert_eq!(stat, AcceptStat::ProgMismatch as u32);
        assert_eq!(&reply[offset..], &[0u8, 0, 0, 2, 0, 0, 0, 2]);
    }

    #[test]
    fn test_obsolete_procedures_are_void() {
        let mut fx = Fixture::new();
        for proc_ in [0, 3, 7] {
            let reply = dispatch(&mut fx.request(), &header(NFS_V2, proc_), &[]).unwrap();
            let (stat, offset) = accept_stat(&reply);
            assert_eq!(stat, AcceptStat::Success as u32);
            assert_eq!(offset, reply.len());
        }
    }

    #[test]
    fn test_getattr_round_trip() {
        let mut fx = Fixture::new();
        let fh = fx.handle("");
        let args = encode(&fh).unwrap();
        let reply = dispatch(&mut fx.request(), &header(NFS_V2, 1), &args).unwrap();

        let (stat, offset) = accept_stat(&reply);
        assert_eq!(stat, AcceptStat::Success as u32);
        let (status, n) = decode_prefix::<u32>(&reply[offset..]).unwrap();
        assert_eq!(status, NfsStat::Ok as u32);
        // ftype is the first word of the attributes
        let (ftype, _) = decode_prefix::<u32>(&reply[offset + n..]).unwrap();
        assert_eq!(ftype, FType::Dir as u32);
        // 11 plain words and three timevals
        assert_eq!(reply.len() - offset - n, 17 * 4);
    }

    #[test]
    fn test_error_status_reply() {
        let mut fx = Fixture::new();
        let dir = fx.handle("");
        let args = encode(&DirOpArgs {
            dir,
            name: Filename::new("missing"),
        })
        .unwrap();
        let reply = dispatch(&mut fx.request(), &header(NFS_V2, 10), &args).unwrap();

        let (stat, offset) = accept_stat(&reply);
        assert_eq!(stat, AcceptStat::Success as u32);
        assert_eq!(&reply[offset..], &(NfsStat::NoEnt as u32).to_be_bytes());
    }
}
