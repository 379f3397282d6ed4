// Export Table and Request Authorization
//
// The export table is an arena of clients and mounts addressed by index.
// Parent and origin back-references are stored as indices, so the table can
// be rebuilt and swapped wholesale on reload without any shared ownership.
//
// Submodules:
// - exports: exports file parser
// - netgroup: netgroup membership lookups
// - client: peer address -> client matching
// - mount: client + path -> export matching
// - ugid: uid/gid translation
// - identity: local and remote name services
// - gate: per-request authorization
// - creds: scoped filesystem credentials

pub mod client;
pub mod creds;
pub mod exports;
pub mod gate;
pub mod identity;
pub mod mount;
pub mod netgroup;
pub mod ugid;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use gate::{AccessMode, CallContext, Decision};
pub use netgroup::{NetgroupResolver, NoNetgroups};
pub use ugid::{StaticMap, UgidTranslator};

/// Unique across every table built by this process
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Index of a client in its export table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(usize);

/// Index of a mount in its export table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(usize);

#[cfg(test)]
impl ClientId {
    pub(crate) fn for_test(index: usize) -> Self {
        ClientId(index)
    }
}

#[cfg(test)]
impl MountId {
    pub(crate) fn for_test(index: usize) -> Self {
        MountId(index)
    }
}

/// How a client record is matched against peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKind {
    /// One or more literal addresses
    Exact,
    /// `addr/mask`
    Subnet { mask: Ipv4Addr },
    /// `@group`
    Netgroup { group: String },
    /// World export (`*`)
    Anonymous,
    /// Catch-all for otherwise unknown peers, only when promiscuous
    Default,
    /// Cached winner of a non-exact match for one peer address
    Automatic,
}

/// How remote ids are translated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UidMapMode {
    Identity,
    Static,
    /// Ask the identity service running on the peer
    Remote,
    /// Ask the configured directory service for the given domain
    Directory { domain: String },
}

/// Which remote ids are forced to the nobody identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Squash {
    None,
    Root,
    All,
}

/// Per-export policy
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub secure_port: bool,
    pub link_relative: bool,
    pub cross_mounts: bool,
    pub no_access: bool,
    pub uid_map: UidMapMode,
    pub squash: Squash,
    pub nobody_uid: u32,
    pub nobody_gid: u32,
    pub static_map: Option<Arc<StaticMap>>,
}

impl MountOptions {
    pub const NOBODY_ID: u32 = 65534;

    /// Defaults for an export line with no options
    pub fn new(cross_mounts: bool) -> Self {
        MountOptions {
            read_only: false,
            secure_port: true,
            link_relative: false,
            cross_mounts,
            no_access: false,
            uid_map: UidMapMode::Identity,
            squash: Squash::Root,
            nobody_uid: Self::NOBODY_ID,
            nobody_gid: Self::NOBODY_ID,
            static_map: None,
        }
    }
}

/// One exported subtree under one client
#[derive(Debug, Clone)]
pub struct Mount {
    pub path: PathBuf,
    pub options: MountOptions,
    pub client: ClientId,
    pub parent: Option<MountId>,
    pub origin: Option<ClientId>,
}

/// A peer, or class of peers, the exports file grants access to
#[derive(Debug, Clone)]
pub struct Client {
    pub name: String,
    pub kind: ClientKind,
    pub addrs: Vec<Ipv4Addr>,
    /// Sorted by path length, longest first
    pub mounts: Vec<MountId>,
}

impl Client {
    fn new(name: impl Into<String>, kind: ClientKind, addrs: Vec<Ipv4Addr>) -> Self {
        Client {
            name: name.into(),
            kind,
            addrs,
            mounts: Vec::new(),
        }
    }
}

/// An exported directory as advertised by the MOUNT EXPORT procedure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub path: PathBuf,
    /// Host specifications as written; empty when exported to the world
    pub groups: Vec<String>,
    pub world: bool,
}

/// In-memory export table
pub struct ExportTable {
    clients: Vec<Client>,
    mounts: Vec<Mount>,
    generation: u64,
    netgroups: Arc<dyn NetgroupResolver>,
    automatic: HashMap<IpAddr, ClientId>,
    listing: Vec<ExportEntry>,
}

impl std::fmt::Debug for ExportTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportTable")
            .field("generation", &self.generation)
            .field("clients", &self.clients)
            .field("mounts", &self.mounts)
            .finish()
    }
}

impl ExportTable {
    /// Create an empty table
    pub fn new(netgroups: Arc<dyn NetgroupResolver>) -> Self {
        ExportTable {
            clients: Vec::new(),
            mounts: Vec::new(),
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            netgroups,
            automatic: HashMap::new(),
            listing: Vec::new(),
        }
    }

    /// Build number of this table; hints cached against an older table are void
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn client(&self, id: ClientId) -> &Client {
        &self.clients[id.0]
    }

    pub fn mount(&self, id: MountId) -> &Mount {
        &self.mounts[id.0]
    }

    /// Iterate over clients in configuration order
    pub fn clients(&self) -> impl Iterator<Item = (ClientId, &Client)> {
        self.clients.iter().enumerate().map(|(i, c)| (ClientId(i), c))
    }

    /// Mounts of a client, longest path first
    pub fn mounts_of(&self, client: ClientId) -> impl Iterator<Item = (MountId, &Mount)> {
        self.clients[client.0]
            .mounts
            .iter()
            .map(move |id| (*id, &self.mounts[id.0]))
    }

    /// Look up the client configured under this name and kind, or create it
    pub fn get_or_add_client(&mut self, name: &str, kind: ClientKind, addrs: Vec<Ipv4Addr>) -> ClientId {
        if let Some((id, _)) = self
            .clients()
            .find(|(_, c)| c.name == name && c.kind == kind && c.kind != ClientKind::Automatic)
        {
            return id;
        }
        self.clients.push(Client::new(name, kind, addrs));
        ClientId(self.clients.len() - 1)
    }

    /// Configured exports in file order
    pub fn exports(&self) -> &[ExportEntry] {
        &self.listing
    }

    /// Note that `path` is exported to `group` (`None` for the world)
    pub fn record_export(&mut self, path: &Path, group: Option<&str>) {
        let idx = match self.listing.iter().position(|e| e.path == path) {
            Some(idx) => idx,
            None => {
                self.listing.push(ExportEntry {
                    path: path.to_path_buf(),
                    groups: Vec::new(),
                    world: false,
                });
                self.listing.len() - 1
            }
        };
        let entry = &mut self.listing[idx];
        match group {
            None => {
                entry.world = true;
                entry.groups.clear();
            }
            Some(_) if entry.world => {}
            Some(group) => {
                if !entry.groups.iter().any(|g| g == group) {
                    entry.groups.push(group.to_string());
                }
            }
        }
    }

    /// Find the single catch-all client, if any
    pub fn default_client(&self) -> Option<ClientId> {
        self.clients()
            .find(|(_, c)| c.kind == ClientKind::Default)
            .map(|(id, _)| id)
    }

    /// Attach a mount to a client, keeping the client's mount list sorted
    ///
    /// Re-exporting the same path for the same client replaces its options.
    pub fn add_mount(&mut self, client: ClientId, path: &Path, options: MountOptions) -> MountId {
        let existing = self.clients[client.0]
            .mounts
            .iter()
            .copied()
            .find(|id| self.mounts[id.0].path == path);
        if let Some(id) = existing {
            self.mounts[id.0].options = options;
            return id;
        }

        self.mounts.push(Mount {
            path: path.to_path_buf(),
            options,
            client,
            parent: None,
            origin: None,
        });
        let id = MountId(self.mounts.len() - 1);
        self.clients[client.0].mounts.push(id);
        self.sort_mounts(client);
        id
    }

    /// Restore the longest-path-first order of a client's mounts
    ///
    /// The sort is stable, so equally long paths keep insertion order.
    pub fn sort_mounts(&mut self, client: ClientId) {
        let mounts = &self.mounts;
        self.clients[client.0]
            .mounts
            .sort_by(|a, b| path_len(&mounts[b.0].path).cmp(&path_len(&mounts[a.0].path)));
    }

    /// Point every nested export at the closest enclosing export of the same client
    pub fn link_parents(&mut self) {
        for client in 0..self.clients.len() {
            let ids = self.clients[client].mounts.clone();
            for (i, id) in ids.iter().enumerate() {
                // Later entries are shorter, so the first enclosing one is the closest
                let parent = ids[i + 1..].iter().copied().find(|other| {
                    let outer = &self.mounts[other.0].path;
                    let inner = &self.mounts[id.0].path;
                    inner != outer && inner.starts_with(outer)
                });
                self.mounts[id.0].parent = parent;
            }
        }
    }

    fn push_client(&mut self, client: Client) -> ClientId {
        self.clients.push(client);
        ClientId(self.clients.len() - 1)
    }

    fn push_mount(&mut self, mount: Mount) -> MountId {
        let client = mount.client;
        self.mounts.push(mount);
        let id = MountId(self.mounts.len() - 1);
        self.clients[client.0].mounts.push(id);
        id
    }
}

pub(crate) fn path_len(path: &Path) -> usize {
    path.as_os_str().len()
}
