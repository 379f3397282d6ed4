// Authorization Gate
//
// Every procedure runs its handle or (directory, name) pair through the
// gate before touching the filesystem. The gate owns one worker's export
// table, handle cache and uid/gid translator; the per-call state (peer
// address and credentials) travels in an explicit `CallContext`.

use std::ffi::OsStr;
use std::fs::{self, Metadata};
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use super::creds::Identity;
use super::mount::{DeviceProbe, FsProbe};
use super::ugid::{ID_NOBODY, ID_NONE};
use super::{ClientId, ExportTable, Mount, MountId, UgidTranslator};
use crate::error::{NfsError, NfsResult};
use crate::fsal::handle::{AuthHint, HandleCache};
use crate::protocol::rpc::AuthUnix;
use crate::protocol::v2::nfs::{FHandle, MAXPATHLEN};

/// Source ports below this are privileged
const SECURE_PORT_LIMIT: u16 = 1024;

/// Per-call request context
#[derive(Debug, Clone)]
pub struct CallContext {
    pub peer: SocketAddr,
    /// AUTH_UNIX credentials, `None` for any other flavor
    pub cred: Option<AuthUnix>,
}

impl CallContext {
    pub fn new(peer: SocketAddr, cred: Option<AuthUnix>) -> Self {
        CallContext { peer, cred }
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn from_secure_port(&self) -> bool {
        self.peer.port() < SECURE_PORT_LIMIT
    }

    /// Name of the calling machine as claimed in its credentials
    pub fn machine(&self) -> Option<&str> {
        self.cred.as_ref().map(|c| c.machine.as_str())
    }
}

/// What a request intends to do with the object it names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Metadata only; allowed at the root of a no-access export
    Read,
    /// File contents
    ReadData,
    /// Modification, refused on no-access exports
    Write,
    /// Modification that is not subject to the no-access restriction
    WriteBypassNoaccess,
}

impl AccessMode {
    fn is_write(&self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::WriteBypassNoaccess)
    }

    fn checks_noaccess(&self) -> bool {
        matches!(self, AccessMode::ReadData | AccessMode::Write)
    }
}

/// Outcome of a successful authorization
#[derive(Debug)]
pub struct Decision {
    pub client: ClientId,
    pub mount: MountId,
    pub path: PathBuf,
    /// Attributes observed while resolving a handle
    pub meta: Option<Metadata>,
    /// Local identity the filesystem call runs as
    pub identity: Identity,
}

/// One worker's authorization state
pub struct Gate {
    table: ExportTable,
    handles: HandleCache,
    ugid: UgidTranslator,
    read_only: bool,
    probe: Box<dyn DeviceProbe + Send>,
}

impl Gate {
    /// Create a gate over `table`; `read_only` forces every export read-only
    pub fn new(table: ExportTable, ugid: UgidTranslator, read_only: bool) -> Self {
        Gate {
            table,
            handles: HandleCache::new(),
            ugid,
            read_only,
            probe: Box::new(FsProbe),
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn DeviceProbe + Send>) -> Self {
        self.probe = probe;
        self
    }

    pub fn table(&self) -> &ExportTable {
        &self.table
    }

    pub fn handles(&mut self) -> &mut HandleCache {
        &mut self.handles
    }

    pub fn mount(&self, decision: &Decision) -> &Mount {
        self.table.mount(decision.mount)
    }

    /// Install a freshly loaded export table
    pub fn replace_table(&mut self, table: ExportTable) {
        debug!(
            "Replacing export table generation {} with {}",
            self.table.generation(),
            table.generation()
        );
        self.table = table;
        self.ugid.clear_cache();
        self.handles.flush(true);
    }

    /// Authorize a request on an existing file handle
    pub fn authorize(&mut self, ctx: &CallContext, fh: &FHandle, mode: AccessMode) -> NfsResult<Decision> {
        let resolved = self.handles.resolve(fh)?;
        let peer = ctx.peer_ip();

        let client = self.table.match_client(peer).ok_or_else(|| {
            debug!("No export entry for client {}", peer);
            NfsError::Access
        })?;

        let generation = self.table.generation();
        let mount = match self.handles.hint(fh) {
            Some(hint) if hint.generation == generation && hint.client == client => hint.mount,
            _ => {
                let mount = self
                    .table
                    .match_mount(client, &resolved.path, self.probe.as_ref())
                    .ok_or(NfsError::Access)?;
                self.handles.set_hint(
                    fh,
                    AuthHint {
                        generation,
                        client,
                        mount,
                    },
                );
                mount
            }
        };

        let identity = self.check(ctx, mount, &resolved.path, mode)?;
        Ok(Decision {
            client,
            mount,
            path: resolved.path,
            meta: Some(resolved.meta),
            identity,
        })
    }

    /// Authorize a request on a path that may not exist yet
    pub fn authorize_path(&mut self, ctx: &CallContext, path: &Path, mode: AccessMode) -> NfsResult<Decision> {
        let peer = ctx.peer_ip();
        let client = self.table.match_client(peer).ok_or_else(|| {
            debug!("No export entry for client {}", peer);
            NfsError::Access
        })?;
        let mount = self
            .table
            .match_mount(client, path, self.probe.as_ref())
            .ok_or(NfsError::Access)?;
        let identity = self.check(ctx, mount, path, mode)?;
        Ok(Decision {
            client,
            mount,
            path: path.to_path_buf(),
            meta: None,
            identity,
        })
    }

    /// Authorize `name` inside the directory `dir`
    ///
    /// The combined path is matched against the client's exports again, so
    /// a name can lead into another export or out of every export.
    pub fn build_path(
        &mut self,
        ctx: &CallContext,
        dir: &FHandle,
        name: &OsStr,
        mode: AccessMode,
    ) -> NfsResult<Decision> {
        let parent = self.authorize(ctx, dir, mode)?;
        if !parent.meta.as_ref().is_some_and(Metadata::is_dir) {
            return Err(NfsError::NotDir);
        }
        let path = join_name(&parent.path, name)?;
        self.authorize_path(ctx, &path, mode)
    }

    fn check(&mut self, ctx: &CallContext, mount: MountId, path: &Path, mode: AccessMode) -> NfsResult<Identity> {
        let mount = self.table.mount(mount);
        let options = &mount.options;

        if options.secure_port && !ctx.from_secure_port() {
            warn!(
                "Request from {} on insecure port for {}",
                ctx.peer,
                path.display()
            );
            return Err(NfsError::Access);
        }

        if options.no_access && (mode.checks_noaccess() || path != mount.path) {
            warn!(
                "Client {} tried to access {} (noaccess)",
                ctx.peer_ip(),
                path.display()
            );
            return Err(NfsError::Access);
        }

        if mode.is_write() && (options.read_only || self.read_only) {
            return Err(NfsError::ReadOnly);
        }

        if let Some(link) = symlink_ancestor(&mount.path, path) {
            warn!(
                "Refusing {}: {} is a symbolic link",
                path.display(),
                link.display()
            );
            return Err(NfsError::NotDir);
        }

        let peer = ctx.peer_ip();
        let (uid, gid) = match &ctx.cred {
            Some(cred) => (
                self.ugid.remote_to_local_uid(cred.uid, options, peer),
                self.ugid.remote_to_local_gid(cred.gid, options, peer),
            ),
            None => (options.nobody_uid, options.nobody_gid),
        };
        let uid = if is_sentinel(uid) { options.nobody_uid } else { uid };
        let gid = if is_sentinel(gid) { options.nobody_gid } else { gid };
        Ok(Identity::new(uid, gid))
    }

    /// Translate a client-supplied uid for the export of `decision`
    pub fn local_uid(&mut self, ctx: &CallContext, decision: &Decision, uid: u32) -> u32 {
        let options = &self.table.mount(decision.mount).options;
        self.ugid.remote_to_local_uid(uid, options, ctx.peer_ip())
    }

    /// Translate a client-supplied gid for the export of `decision`
    pub fn local_gid(&mut self, ctx: &CallContext, decision: &Decision, gid: u32) -> u32 {
        let options = &self.table.mount(decision.mount).options;
        self.ugid.remote_to_local_gid(gid, options, ctx.peer_ip())
    }

    /// Owner uid as reported to the client
    pub fn remote_uid(&mut self, ctx: &CallContext, decision: &Decision, uid: u32) -> u32 {
        let options = &self.table.mount(decision.mount).options;
        self.ugid.local_to_remote_uid(uid, options, ctx.peer_ip())
    }

    /// Owner gid as reported to the client
    pub fn remote_gid(&mut self, ctx: &CallContext, decision: &Decision, gid: u32) -> u32 {
        let options = &self.table.mount(decision.mount).options;
        self.ugid.local_to_remote_gid(gid, options, ctx.peer_ip())
    }
}

fn is_sentinel(id: u32) -> bool {
    id == ID_NONE || id == ID_NOBODY
}

/// First directory strictly between `root` and `path` that is a symlink
fn symlink_ancestor<'a>(root: &Path, path: &'a Path) -> Option<&'a Path> {
    path.ancestors()
        .skip(1)
        .take_while(|dir| dir.starts_with(root) && *dir != root)
        .find(|dir| fs::symlink_metadata(dir).is_ok_and(|meta| meta.file_type().is_symlink()))
}

/// Append a single name to a directory path
///
/// `.` and `..` are resolved lexically.
pub fn join_name(dir: &Path, name: &OsStr) -> NfsResult<PathBuf> {
    let bytes = name.as_encoded_bytes();
    if bytes.contains(&b'/') {
        return Err(NfsError::Invalid);
    }
    if dir.as_os_str().len() + bytes.len() + 1 >= MAXPATHLEN {
        return Err(NfsError::NameTooLong);
    }

    let mut path = dir.to_path_buf();
    match Path::new(name).components().next() {
        None | Some(Component::CurDir) => {}
        Some(Component::ParentDir) => {
            path.pop();
        }
        Some(_) => path.push(name),
    }
    Ok(path)
}
