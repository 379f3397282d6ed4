// File Handle Cache
//
// File handles are opaque identifiers used by NFS to reference files and
// directories. Each worker keeps its own cache mapping handles to paths.
//
// Handle layout (32 bytes):
//   0..8    entry id
//   8..16   hash of the path at compose time
//   16..20  pseudo inode
//   20..24  cache epoch (handles from an earlier cache are stale)
//   24..32  zero
//
// An entry remembers the (dev, ino) it was composed for. Resolving lstats
// the path again; if the object vanished or was replaced the handle is
// stale. Entries may also hold one open descriptor and the last
// client/mount pair that was authorized through them.
//
// The cache is bounded. Past its capacity the least recently used entries
// without an open descriptor are dropped, and their handles turn stale.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs::{File, Metadata, OpenOptions};
use std::hash::{Hash, Hasher};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::auth::creds::Identity;
use crate::auth::{ClientId, MountId};
use crate::error::{NfsError, NfsResult};
use crate::fsal::local::DirCookies;
use crate::protocol::v2::nfs::{FHSIZE, FHandle};

/// Descriptors unused for this long are closed by a non-forced flush
pub const FD_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of handles a worker keeps
pub const MAX_HANDLES: usize = 8192;

/// Client and mount that last authorized a request through a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthHint {
    pub generation: u64,
    pub client: ClientId,
    pub mount: MountId,
}

/// Access needed from a cached descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Descriptor opened for one identity and access mode
#[derive(Debug)]
struct CachedFd {
    file: File,
    mode: OpenMode,
    identity: Identity,
    last_used: Instant,
}

impl CachedFd {
    fn new(file: File, mode: OpenMode, identity: Identity) -> Self {
        CachedFd {
            file,
            mode,
            identity,
            last_used: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    path_hash: u64,
    dev: u64,
    ino: u64,
    fd: Option<CachedFd>,
    hint: Option<AuthHint>,
    /// Value of the cache clock when the entry was last used
    used: u64,
}

/// A handle resolved back to a live path
#[derive(Debug)]
pub struct Resolved {
    pub path: PathBuf,
    pub meta: Metadata,
}

/// Per-worker handle <-> path cache
#[derive(Debug)]
pub struct HandleCache {
    entries: HashMap<u64, Entry>,
    by_path: HashMap<PathBuf, u64>,
    next_id: u64,
    epoch: u32,
    capacity: usize,
    clock: u64,
    cookies: DirCookies,
}

/// Stable small integer identity for a (inode, device) pair
pub fn pseudo_inode(ino: u64, dev: u64) -> u32 {
    let mixed = ino ^ dev.rotate_left(40);
    let folded = (mixed ^ (mixed >> 32)) as u32;
    // 0 and all-ones confuse some clients
    match folded {
        0 => 1,
        u32::MAX => u32::MAX - 1,
        other => other,
    }
}

fn hash_path(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

impl HandleCache {
    /// Create an empty cache holding up to `MAX_HANDLES` handles
    pub fn new() -> Self {
        Self::with_capacity(MAX_HANDLES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(0)
            | 1;
        Self {
            entries: HashMap::new(),
            by_path: HashMap::new(),
            next_id: 1,
            epoch,
            capacity: capacity.max(1),
            clock: 0,
            cookies: DirCookies::default(),
        }
    }

    /// Number of cached handles
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Produce the handle for `path`, whose current attributes are `meta`
    ///
    /// A descriptor already opened for writing may be handed over to the
    /// cache together with the identity that opened it.
    pub fn compose(&mut self, path: &Path, meta: &Metadata, open: Option<(File, Identity)>) -> FHandle {
        let used = self.tick();
        let existing = self.by_path.get(path).copied();
        if let Some(id) = existing {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.dev == meta.dev() && entry.ino == meta.ino() {
                    if let Some((file, identity)) = open {
                        entry.fd = Some(CachedFd::new(file, OpenMode::Write, identity));
                    }
                    entry.used = used;
                    return self.encode(id);
                }
            }
            self.remove(id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                path: path.to_path_buf(),
                path_hash: hash_path(path),
                dev: meta.dev(),
                ino: meta.ino(),
                fd: open.map(|(file, identity)| CachedFd::new(file, OpenMode::Write, identity)),
                hint: None,
                used,
            },
        );
        self.by_path.insert(path.to_path_buf(), id);
        debug!("Created file handle {} for path: {:?}", id, path);
        if self.entries.len() > self.capacity {
            self.evict(id);
        }
        self.encode(id)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop least recently used entries until the cache is back in bounds
    ///
    /// Entries holding a descriptor stay, as does `keep`. A bit more than
    /// the excess goes so that the next inserts do not evict again.
    fn evict(&mut self, keep: u64) {
        let target = self.capacity - self.capacity / 8;
        let excess = self.entries.len().saturating_sub(target);
        let mut idle: Vec<(u64, u64)> = self
            .entries
            .iter()
            .filter(|(id, e)| **id != keep && e.fd.is_none())
            .map(|(id, e)| (e.used, *id))
            .collect();
        idle.sort_unstable();
        let evicted = excess.min(idle.len());
        for (_, id) in idle.into_iter().take(evicted) {
            self.remove(id);
        }
        debug!("Evicted {} file handles, {} remain", evicted, self.entries.len());
    }

    fn encode(&self, id: u64) -> FHandle {
        let mut raw = [0u8; FHSIZE];
        if let Some(entry) = self.entries.get(&id) {
            raw[0..8].copy_from_slice(&id.to_be_bytes());
            raw[8..16].copy_from_slice(&entry.path_hash.to_be_bytes());
            raw[16..20].copy_from_slice(&pseudo_inode(entry.ino, entry.dev).to_be_bytes());
            raw[20..24].copy_from_slice(&self.epoch.to_be_bytes());
        }
        FHandle(raw)
    }

    fn decode(&self, fh: &FHandle) -> Option<u64> {
        let id = u64::from_be_bytes(fh.0[0..8].try_into().ok()?);
        let hash = u64::from_be_bytes(fh.0[8..16].try_into().ok()?);
        let epoch = u32::from_be_bytes(fh.0[20..24].try_into().ok()?);
        if epoch != self.epoch {
            return None;
        }
        let entry = self.entries.get(&id)?;
        (entry.path_hash == hash).then_some(id)
    }

    /// Map a handle back to its path, checking the object is still there
    pub fn resolve(&mut self, fh: &FHandle) -> NfsResult<Resolved> {
        let id = self.decode(fh).ok_or(NfsError::Stale)?;
        let used = self.tick();
        let (path, dev, ino) = match self.entries.get_mut(&id) {
            Some(e) => {
                e.used = used;
                (e.path.clone(), e.dev, e.ino)
            }
            None => return Err(NfsError::Stale),
        };

        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.dev() == dev && meta.ino() == ino => Ok(Resolved { path, meta }),
            _ => {
                debug!("Stale file handle {} for {:?}", id, path);
                self.remove(id);
                Err(NfsError::Stale)
            }
        }
    }

    /// Path of a handle without touching the filesystem
    pub fn path_of(&self, fh: &FHandle) -> Option<&Path> {
        let id = self.decode(fh)?;
        self.entries.get(&id).map(|e| e.path.as_path())
    }

    /// Open descriptor for a handle, reusing the cached one when possible
    ///
    /// A cached descriptor is only reused for the identity and access mode
    /// it was opened with; otherwise the file is opened again, under
    /// whatever credentials the caller has assumed for `identity`. The
    /// final path component is never followed if it is a symlink.
    pub fn open_fd(&mut self, fh: &FHandle, mode: OpenMode, identity: Identity) -> NfsResult<&File> {
        let id = self.decode(fh).ok_or(NfsError::Stale)?;
        let entry = self.entries.get_mut(&id).ok_or(NfsError::Stale)?;

        let reusable = entry
            .fd
            .as_ref()
            .is_some_and(|fd| fd.mode == mode && fd.identity == identity);
        if !reusable {
            let file = open_nofollow(&entry.path, mode)?;
            let meta = file.metadata()?;
            if meta.dev() != entry.dev || meta.ino() != entry.ino {
                return Err(NfsError::Stale);
            }
            entry.fd = Some(CachedFd::new(file, mode, identity));
        }

        let fd = entry.fd.as_mut().ok_or(NfsError::Stale)?;
        fd.last_used = Instant::now();
        Ok(&fd.file)
    }

    /// Last authorization hint stored for a handle
    pub fn hint(&self, fh: &FHandle) -> Option<AuthHint> {
        let id = self.decode(fh)?;
        self.entries.get(&id).and_then(|e| e.hint)
    }

    pub fn set_hint(&mut self, fh: &FHandle, hint: AuthHint) {
        if let Some(id) = self.decode(fh) {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.hint = Some(hint);
            }
        }
    }

    /// READDIR cookie translations of this worker
    pub fn dir_cookies(&mut self) -> &mut DirCookies {
        &mut self.cookies
    }

    /// Pseudo inode encoded in a handle
    pub fn pseudo_inode(&self, fh: &FHandle) -> Option<u32> {
        let id = self.decode(fh)?;
        self.entries.get(&id).map(|e| pseudo_inode(e.ino, e.dev))
    }

    /// Drop `path` and everything below it
    pub fn invalidate(&mut self, path: &Path) {
        let doomed: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.path.starts_with(path))
            .map(|(id, _)| *id)
            .collect();
        if !doomed.is_empty() {
            debug!("Invalidating {} handles under {:?}", doomed.len(), path);
        }
        for id in doomed {
            self.remove(id);
        }
    }

    /// Close descriptors
    ///
    /// A forced flush closes every descriptor and forgets every
    /// authorization hint; handles themselves stay valid. Otherwise only
    /// descriptors idle for longer than `FD_IDLE_TIMEOUT` are closed.
    pub fn flush(&mut self, force: bool) {
        let now = Instant::now();
        let mut closed = 0;
        for entry in self.entries.values_mut() {
            if force {
                entry.hint = None;
            }
            let idle = entry
                .fd
                .as_ref()
                .is_some_and(|fd| force || now.duration_since(fd.last_used) >= FD_IDLE_TIMEOUT);
            if idle {
                entry.fd = None;
                closed += 1;
            }
        }
        debug!("Handle cache flush (force={}): closed {} descriptors", force, closed);
    }

    fn remove(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            if self.by_path.get(&entry.path) == Some(&id) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    #[cfg(test)]
    fn open_fds(&self) -> usize {
        self.entries.values().filter(|e| e.fd.is_some()).count()
    }
}

impl Default for HandleCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a path without following a final symlink
pub fn open_nofollow(path: &Path, mode: OpenMode) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    match mode {
        OpenMode::Read => options.read(true),
        OpenMode::Write => options.write(true),
    };
    options.custom_flags(libc::O_NOFOLLOW).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::fd::AsRawFd;
    use tempfile::TempDir;

    fn compose(cache: &mut HandleCache, path: &Path) -> FHandle {
        let meta = fs::symlink_metadata(path).unwrap();
        cache.compose(path, &meta, None)
    }

    fn me() -> Identity {
        unsafe { Identity::new(libc::geteuid(), libc::getegid()) }
    }

    #[test]
    fn test_compose_and_resolve() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"data").unwrap();

        let mut cache = HandleCache::new();
        let fh = compose(&mut cache, &path);
        assert_eq!(cache.resolve(&fh).unwrap().path, path);
        assert_eq!(cache.path_of(&fh), Some(path.as_path()));
    }

    #[test]
    fn test_idempotent_compose() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"data").unwrap();

        let mut cache = HandleCache::new();
        let first = compose(&mut cache, &path);
        let second = compose(&mut cache, &path);
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_replaced_file_is_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"one").unwrap();

        let mut cache = HandleCache::new();
        let fh = compose(&mut cache, &path);

        // Keep the old inode alive so the new file cannot reuse its number
        let _old = dir.path().join("old");
        fs::rename(&path, &_old).unwrap();
        fs::write(&path, b"two").unwrap();

        assert!(matches!(cache.resolve(&fh), Err(NfsError::Stale)));
        assert!(cache.is_empty());

        let fresh = compose(&mut cache, &path);
        assert_ne!(fresh, fh);
    }

    #[test]
    fn test_foreign_handle_is_stale() {
        let dir = TempDir::new().unwrap();
        let mut cache = HandleCache::new();
        let fh = compose(&mut cache, dir.path());

        let mut forged = fh;
        forged.0[8] ^= 0xFF;
        assert!(matches!(cache.resolve(&forged), Err(NfsError::Stale)));

        let mut other = HandleCache::new();
        other.epoch ^= 2;
        assert!(matches!(other.resolve(&fh), Err(NfsError::Stale)));
    }

    #[test]
    fn test_invalidate_descendants() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("a"), b"a").unwrap();
        let sibling = dir.path().join("subx");
        fs::write(&sibling, b"x").unwrap();

        let mut cache = HandleCache::new();
        let fh_sub = compose(&mut cache, &sub);
        let fh_a = compose(&mut cache, &sub.join("a"));
        let fh_sibling = compose(&mut cache, &sibling);

        cache.invalidate(&sub);
        assert!(cache.resolve(&fh_sub).is_err());
        assert!(cache.resolve(&fh_a).is_err());
        assert!(cache.resolve(&fh_sibling).is_ok());
    }

    #[test]
    fn test_open_fd_and_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"data").unwrap();

        let mut cache = HandleCache::new();
        let fh = compose(&mut cache, &path);
        cache.open_fd(&fh, OpenMode::Read, me()).unwrap();
        assert_eq!(cache.open_fds(), 1);

        // Fresh descriptors survive a regular flush
        cache.flush(false);
        assert_eq!(cache.open_fds(), 1);

        let hint = AuthHint {
            generation: 1,
            client: crate::auth::ClientId::for_test(0),
            mount: crate::auth::MountId::for_test(0),
        };
        cache.set_hint(&fh, hint);
        assert_eq!(cache.hint(&fh), Some(hint));

        cache.flush(true);
        assert_eq!(cache.open_fds(), 0);
        assert_eq!(cache.hint(&fh), None);
        assert!(cache.resolve(&fh).is_ok());
    }

    #[test]
    fn test_open_fd_refuses_symlink() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"data").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut cache = HandleCache::new();
        let fh = compose(&mut cache, &link);
        assert!(cache.open_fd(&fh, OpenMode::Read, me()).is_err());
    }

    #[test]
    fn test_pseudo_inode_stable() {
        assert_eq!(pseudo_inode(42, 7), pseudo_inode(42, 7));
        assert_ne!(pseudo_inode(42, 7), pseudo_inode(43, 7));
        assert_ne!(pseudo_inode(0, 0), 0);
    }

    #[test]
    fn test_fd_is_not_shared_between_identities() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        fs::write(&path, b"data").unwrap();

        let mut cache = HandleCache::new();
        let fh = compose(&mut cache, &path);
        let other = Identity::new(me().uid.wrapping_add(1), me().gid);

        let first = cache.open_fd(&fh, OpenMode::Read, me()).unwrap().as_raw_fd();
        let again = cache.open_fd(&fh, OpenMode::Read, me()).unwrap().as_raw_fd();
        assert_eq!(first, again);

        // Another identity gets its own descriptor, opened while the old
        // one was still open
        let theirs = cache.open_fd(&fh, OpenMode::Read, other).unwrap().as_raw_fd();
        assert_ne!(theirs, first);
        assert_eq!(cache.open_fds(), 1);
    }

    #[test]
    fn test_handed_over_fd_keeps_its_identity_and_mode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.txt");
        let file = fs::File::create(&path).unwrap();
        let handed = file.as_raw_fd();

        let mut cache = HandleCache::new();
        let meta = fs::symlink_metadata(&path).unwrap();
        let fh = cache.compose(&path, &meta, Some((file, me())));

        assert_eq!(cache.open_fd(&fh, OpenMode::Write, me()).unwrap().as_raw_fd(), handed);
        // Write-only, so reading needs a descriptor of its own
        let read = cache.open_fd(&fh, OpenMode::Read, me()).unwrap();
        assert_eq!(read.metadata().unwrap().len(), 0);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let dir = TempDir::new().unwrap();
        let mut cache = HandleCache::with_capacity(8);

        let busy_path = dir.path().join("busy");
        fs::write(&busy_path, b"b").unwrap();
        let busy = compose(&mut cache, &busy_path);
        cache.open_fd(&busy, OpenMode::Read, me()).unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let path = dir.path().join(format!("f{}", i));
            fs::write(&path, b"x").unwrap();
            handles.push(compose(&mut cache, &path));
            // Keep the first one in use
            cache.resolve(&handles[0]).unwrap();
        }

        assert!(cache.len() <= 8);
        assert!(cache.resolve(&busy).is_ok());
        assert!(cache.resolve(&handles[0]).is_ok());
        assert!(cache.resolve(&handles[19]).is_ok());
        assert!(matches!(cache.resolve(&handles[1]), Err(NfsError::Stale)));
    }
}
