// NFS Protocol Implementation (NFSv2)
//
// One module per procedure of RFC 1094. Handlers receive decoded arguments
// and return a typed result or an `NfsError`; the dispatcher encodes
// either one into the reply, so every call gets a status.

pub mod dispatcher;

mod create;
mod getattr;
mod link;
mod lookup;
mod mkdir;
mod null;
mod read;
mod readdir;
mod readlink;
mod remove;
mod rename;
mod rmdir;
mod setattr;
mod statfs;
mod symlink;
mod write;

pub use dispatcher::{dispatch, procedure_name};

use std::fs::{self, File, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::info;

use crate::auth::creds::with_identity;
use crate::auth::gate::Gate;
use crate::auth::ugid::{ID_NOBODY, ID_NONE};
use crate::auth::{CallContext, Decision};
use crate::config::ServerConfig;
use crate::error::NfsResult;
use crate::fsal::local::NewAttrs;
use crate::fsal::{self, Owner, pseudo_inode};
use crate::protocol::v2::nfs::{DirOpOk, FAttr, SAttr, SATTR_IGNORE};

/// Everything a procedure handler works with during one call
pub struct NfsRequest<'a> {
    pub gate: &'a mut Gate,
    pub ctx: &'a CallContext,
    pub config: &'a ServerConfig,
}

impl NfsRequest<'_> {
    /// Wire attributes for `meta`, owners translated for the client
    fn attributes(&mut self, decision: &Decision, meta: &Metadata) -> FAttr {
        let owner = Owner {
            uid: self.gate.remote_uid(self.ctx, decision, meta.uid()),
            gid: self.gate.remote_gid(self.ctx, decision, meta.gid()),
        };
        fsal::attributes(meta, pseudo_inode(meta.ino(), meta.dev()), owner)
    }

    /// Handle and attributes for the object at `decision.path`
    fn dir_op_result(&mut self, decision: &Decision, open: Option<File>) -> NfsResult<DirOpOk> {
        let meta = with_identity(decision.identity, || fs::symlink_metadata(&decision.path))?;
        let open = open.map(|file| (file, decision.identity));
        let file = self.gate.handles().compose(&decision.path, &meta, open);
        Ok(DirOpOk {
            file,
            attributes: self.attributes(decision, &meta),
        })
    }

    /// Convert client-supplied attributes, translating owners to local ids
    fn new_attrs(&mut self, decision: &Decision, sattr: &SAttr) -> NewAttrs {
        let uid = given(sattr.uid)
            .map(|uid| self.gate.local_uid(self.ctx, decision, uid))
            .and_then(given);
        let gid = given(sattr.gid)
            .map(|gid| self.gate.local_gid(self.ctx, decision, gid))
            .and_then(given);
        NewAttrs {
            mode: NewAttrs::mode_from_wire(sattr.mode),
            uid,
            gid,
            size: Some(sattr.size).filter(|size| *size != SATTR_IGNORE),
            atime: Some(sattr.atime).filter(|t| t.is_set()),
            mtime: Some(sattr.mtime).filter(|t| t.is_set()),
        }
    }

    fn log_transfer(&self, path: &Path, direction: &str) {
        if self.config.log_transfers {
            info!("{} {} {}", self.ctx.peer_ip(), direction, path.display());
        }
    }
}

/// `None` for the reserved ids, the ignore marker among them
fn given(id: u32) -> Option<u32> {
    match id {
        ID_NONE | ID_NOBODY => None,
        id => Some(id),
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::auth::identity::IdentityService;
    use crate::auth::{ClientKind, ExportTable, MountOptions, NoNetgroups, Squash, UgidTranslator};
    use crate::protocol::rpc::AuthUnix;
    use crate::protocol::v2::nfs::FHandle;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct NoAccounts;

    impl IdentityService for NoAccounts {
        fn name_for_uid(&self, _uid: u32) -> Option<String> {
            None
        }
        fn uid_for_name(&self, _name: &str) -> Option<u32> {
            None
        }
        fn name_for_gid(&self, _gid: u32) -> Option<String> {
            None
        }
        fn gid_for_name(&self, _name: &str) -> Option<u32> {
            None
        }
    }

    pub const CLIENT: [u8; 4] = [10, 0, 0, 5];

    /// Scratch export tree: `root` and `root/second` exported read-write,
    /// `root/ro` read-only, all to one client
    pub struct Fixture {
        _dir: TempDir,
        pub root: PathBuf,
        pub gate: Gate,
        pub ctx: CallContext,
        pub config: ServerConfig,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path().canonicalize().unwrap();
            fs::create_dir(root.join("second")).unwrap();
            fs::create_dir(root.join("ro")).unwrap();

            let mut table = ExportTable::new(Arc::new(NoNetgroups));
            let client = table.get_or_add_client("client", ClientKind::Exact, vec![Ipv4Addr::from(CLIENT)]);
            let mut rw = MountOptions::new(true);
            rw.squash = Squash::None;
            table.add_mount(client, &root, rw.clone());
            table.add_mount(client, &root.join("second"), rw.clone());
            let mut ro = rw;
            ro.read_only = true;
            table.add_mount(client, &root.join("ro"), ro);
            table.link_parents();

            let ugid = UgidTranslator::new(
                Box::new(NoAccounts),
                None,
                Box::new(|_peer: IpAddr| Box::new(NoAccounts) as Box<dyn IdentityService + Send>),
            );

            // Run as ourselves so the tests hold with and without root
            let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
            let ctx = CallContext::new(
                SocketAddr::from((CLIENT, 700)),
                Some(AuthUnix {
                    stamp: 0,
                    machine: "client".to_string(),
                    uid,
                    gid,
                    gids: Vec::new(),
                }),
            );

            Fixture {
                _dir: dir,
                root,
                gate: Gate::new(table, ugid, false),
                ctx,
                config: ServerConfig::default(),
            }
        }

        pub fn request(&mut self) -> NfsRequest<'_> {
            NfsRequest {
                gate: &mut self.gate,
                ctx: &self.ctx,
                config: &self.config,
            }
        }

        /// Handle for a path relative to the export root
        pub fn handle(&mut self, rel: &str) -> FHandle {
            let path = if rel.is_empty() { self.root.clone() } else { self.root.join(rel) };
            let meta = fs::symlink_metadata(&path).unwrap();
            self.gate.handles().compose(&path, &meta, None)
        }
    }
}
