// UID/GID Translation
//
// Remote ids arriving in credentials and SETATTR are translated to local
// ids before any filesystem call; local ids in returned attributes are
// translated back. Translation never fails: anything without a mapping
// ends up as the export's nobody id.
//
// The sentinels -1 ("not specified") and -2 ("nobody") are never produced
// by a lookup and are passed through untouched unless squashing applies.

use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use tracing::debug;

use super::identity::{IdentityService, RemoteIdentityClient, SystemAccounts};
use super::{MountOptions, Squash, UidMapMode};

/// "Not specified" marker (-1)
pub const ID_NONE: u32 = u32::MAX;

/// Wire representation of nobody (-2)
pub const ID_NOBODY: u32 = u32::MAX - 1;

/// User or group id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    User,
    Group,
}

impl IdKind {
    fn nobody(&self, options: &MountOptions) -> u32 {
        match self {
            IdKind::User => options.nobody_uid,
            IdKind::Group => options.nobody_gid,
        }
    }
}

/// Outcome of a static table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapped {
    To(u32),
    Squash,
}

/// `lo..=hi` mapped onto `to..` or squashed when `to` is `None`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub lo: u32,
    pub hi: u32,
    pub to: Option<u32>,
}

impl IdRange {
    fn forward(&self, id: u32) -> Option<Mapped> {
        if id < self.lo || id > self.hi {
            return None;
        }
        Some(match self.to {
            Some(base) => Mapped::To(base.saturating_add(id - self.lo)),
            None => Mapped::Squash,
        })
    }

    fn reverse(&self, id: u32) -> Option<u32> {
        let base = self.to?;
        let span = self.hi - self.lo;
        if id >= base && id - base <= span {
            Some(self.lo + (id - base))
        } else {
            None
        }
    }
}

/// Static uid/gid map of one export
///
/// File format, one rule per line:
///
///     # remote        local
///     uid 0-99        -
///     uid 1000-1999   5000
///     gid 100         100
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticMap {
    uids: Vec<IdRange>,
    gids: Vec<IdRange>,
}

impl StaticMap {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read uid map {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid uid map {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut map = StaticMap::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [kind, range, to] = fields[..] else {
                bail!("line {}: expected '<uid|gid> <range> <id|->'", lineno + 1);
            };
            let (lo, hi) = parse_range(range).with_context(|| format!("line {}", lineno + 1))?;
            let to = match to {
                "-" => None,
                id => Some(
                    id.parse::<u32>()
                        .with_context(|| format!("line {}: bad id {}", lineno + 1, id))?,
                ),
            };
            let rule = IdRange { lo, hi, to };
            match kind {
                "uid" => map.uids.push(rule),
                "gid" => map.gids.push(rule),
                other => bail!("line {}: unknown map kind {}", lineno + 1, other),
            }
        }
        Ok(map)
    }

    /// Force remote uids `lo..=hi` to nobody
    pub fn squash_uids(&mut self, lo: u32, hi: u32) {
        self.uids.push(IdRange { lo, hi, to: None });
    }

    /// Force remote gids `lo..=hi` to nobody
    pub fn squash_gids(&mut self, lo: u32, hi: u32) {
        self.gids.push(IdRange { lo, hi, to: None });
    }

    fn ranges(&self, kind: IdKind) -> &[IdRange] {
        match kind {
            IdKind::User => &self.uids,
            IdKind::Group => &self.gids,
        }
    }

    /// Map a remote id; `None` means no rule covers it
    pub fn forward(&self, kind: IdKind, id: u32) -> Option<Mapped> {
        self.ranges(kind).iter().find_map(|r| r.forward(id))
    }

    /// Map a local id back to the remote id that produces it
    pub fn reverse(&self, kind: IdKind, id: u32) -> Option<Mapped> {
        let ranges = self.ranges(kind);
        if let Some(remote) = ranges.iter().find_map(|r| r.reverse(id)) {
            return Some(Mapped::To(remote));
        }
        // The same remote id means something else, so this local id has
        // no remote representation
        if ranges.iter().any(|r| r.forward(id).is_some()) {
            return Some(Mapped::Squash);
        }
        None
    }
}

/// Parse `n` or `lo-hi`
pub fn parse_range(text: &str) -> Result<(u32, u32)> {
    let (lo, hi) = match text.split_once('-') {
        Some((lo, hi)) => (lo, hi),
        None => (text, text),
    };
    let lo: u32 = lo.trim().parse().map_err(|_| anyhow!("bad id range {}", text))?;
    let hi: u32 = hi.trim().parse().map_err(|_| anyhow!("bad id range {}", text))?;
    if hi < lo {
        bail!("empty id range {}", text);
    }
    Ok((lo, hi))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Source {
    Peer(IpAddr),
    Directory(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    ToLocal,
    ToRemote,
}

type Connector = Box<dyn Fn(IpAddr) -> Box<dyn IdentityService + Send> + Send>;

/// Per-worker uid/gid translator with a lookup cache
pub struct UgidTranslator {
    local: Box<dyn IdentityService + Send>,
    directory: Option<Box<dyn IdentityService + Send>>,
    connect: Connector,
    peers: HashMap<IpAddr, Box<dyn IdentityService + Send>>,
    cache: HashMap<(Source, Direction, IdKind, u32), Option<u32>>,
}

impl UgidTranslator {
    pub fn new(
        local: Box<dyn IdentityService + Send>,
        directory: Option<Box<dyn IdentityService + Send>>,
        connect: Connector,
    ) -> Self {
        UgidTranslator {
            local,
            directory,
            connect,
            peers: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    /// Translator backed by the local account database and ugidd peers
    pub fn system(directory_service: Option<&str>) -> Self {
        let directory = directory_service
            .and_then(RemoteIdentityClient::from_endpoint)
            .map(|c| Box::new(c) as Box<dyn IdentityService + Send>);
        Self::new(
            Box::new(SystemAccounts),
            directory,
            Box::new(|peer: IpAddr| Box::new(RemoteIdentityClient::new(peer)) as Box<dyn IdentityService + Send>),
        )
    }

    /// Forget cached lookups and peer connections
    pub fn clear_cache(&mut self) {
        self.peers.clear();
        self.cache.clear();
    }

    pub fn remote_to_local_uid(&mut self, uid: u32, options: &MountOptions, peer: IpAddr) -> u32 {
        self.to_local(IdKind::User, uid, options, peer)
    }

    pub fn remote_to_local_gid(&mut self, gid: u32, options: &MountOptions, peer: IpAddr) -> u32 {
        self.to_local(IdKind::Group, gid, options, peer)
    }

    pub fn local_to_remote_uid(&mut self, uid: u32, options: &MountOptions, peer: IpAddr) -> u32 {
        self.to_remote(IdKind::User, uid, options, peer)
    }

    pub fn local_to_remote_gid(&mut self, gid: u32, options: &MountOptions, peer: IpAddr) -> u32 {
        self.to_remote(IdKind::Group, gid, options, peer)
    }

    fn to_local(&mut self, kind: IdKind, id: u32, options: &MountOptions, peer: IpAddr) -> u32 {
        let nobody = kind.nobody(options);
        match options.squash {
            Squash::All => return nobody,
            Squash::Root if id == 0 => return nobody,
            _ => {}
        }
        if id == ID_NONE || id == ID_NOBODY {
            return id;
        }

        match &options.uid_map {
            UidMapMode::Identity => id,
            UidMapMode::Static => match options.static_map.as_ref().and_then(|m| m.forward(kind, id)) {
                Some(Mapped::To(local)) => local,
                Some(Mapped::Squash) => nobody,
                None => id,
            },
            UidMapMode::Remote => self
                .lookup(Source::Peer(peer), Direction::ToLocal, kind, id)
                .unwrap_or(nobody),
            UidMapMode::Directory { domain } => self
                .lookup(Source::Directory(domain.clone()), Direction::ToLocal, kind, id)
                .unwrap_or(nobody),
        }
    }

    fn to_remote(&mut self, kind: IdKind, id: u32, options: &MountOptions, peer: IpAddr) -> u32 {
        if id == ID_NONE || id == ID_NOBODY {
            return id;
        }
        let nobody = kind.nobody(options);

        match &options.uid_map {
            UidMapMode::Identity => id,
            UidMapMode::Static => match options.static_map.as_ref().and_then(|m| m.reverse(kind, id)) {
                Some(Mapped::To(remote)) => remote,
                Some(Mapped::Squash) => nobody,
                None => id,
            },
            UidMapMode::Remote => self
                .lookup(Source::Peer(peer), Direction::ToRemote, kind, id)
                .unwrap_or(nobody),
            UidMapMode::Directory { domain } => self
                .lookup(Source::Directory(domain.clone()), Direction::ToRemote, kind, id)
                .unwrap_or(nobody),
        }
    }

    fn lookup(&mut self, source: Source, direction: Direction, kind: IdKind, id: u32) -> Option<u32> {
        let key = (source, direction, kind, id);
        if let Some(cached) = self.cache.get(&key) {
            return *cached;
        }

        let result = self.resolve(&key.0, direction, kind, id);
        debug!(
            "ugid {:?} {:?} {:?} {} -> {:?}",
            key.0, direction, kind, id, result
        );
        self.cache.insert(key, result);
        result
    }

    fn resolve(&mut self, source: &Source, direction: Direction, kind: IdKind, id: u32) -> Option<u32> {
        let connect = &self.connect;
        let remote: &dyn IdentityService = match source {
            Source::Peer(peer) => &**self.peers.entry(*peer).or_insert_with(|| connect(*peer)),
            Source::Directory(_) => self.directory.as_deref()?,
        };
        let local: &dyn IdentityService = self.local.as_ref();

        let (from, to) = match direction {
            Direction::ToLocal => (remote, local),
            Direction::ToRemote => (local, remote),
        };
        let found = match kind {
            IdKind::User => from.name_for_uid(id).and_then(|name| to.uid_for_name(&name)),
            IdKind::Group => from.name_for_gid(id).and_then(|name| to.gid_for_name(&name)),
        };
        found.filter(|id| *id != ID_NONE && *id != ID_NOBODY)
    }
}
