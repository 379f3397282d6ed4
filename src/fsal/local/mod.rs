// Local Filesystem Operations
//
// Path based building blocks used by the procedure handlers. Callers are
// responsible for authorization and for running these under the client's
// filesystem identity.

use std::collections::{HashMap, VecDeque};
use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::{self, File, Metadata, OpenOptions};
use std::io;
use std::ops::BitOr;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::ptr::NonNull;
use tracing::debug;

use super::handle::pseudo_inode;
use crate::error::{NfsError, NfsResult};
use crate::protocol::v2::nfs::{MAXDATA, MAXPATHLEN, TimeVal};

/// Fixed cost of one READDIR entry in the reply size estimate
pub const ENTRY_OVERHEAD: usize = 16;

/// Extra allowance per entry
const ENTRY_SLOP: usize = 16;

/// Mode values some clients send to mean "unchanged"
const MODE_IGNORE_LEGACY: u32 = 0xFFFF;

/// Read up to `count` bytes (capped at MAXDATA) at `offset`
pub fn read(file: &File, offset: u32, count: u32) -> io::Result<Vec<u8>> {
    let count = count.min(MAXDATA) as usize;
    let mut buf = vec![0u8; count];
    let mut filled = 0;
    while filled < count {
        let n = file.read_at(&mut buf[filled..], offset as u64 + filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Write all of `data` at `offset`
pub fn write(file: &File, offset: u32, data: &[u8]) -> io::Result<()> {
    file.write_all_at(data, offset as u64)
}

/// Open or create a regular file for writing without following symlinks
pub fn open_for_create(path: &Path, create: bool, truncate: bool, mode: u32) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(create)
        .truncate(truncate)
        .mode(mode & 0o7777)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

/// One READDIR entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub fileid: u32,
    pub name: OsString,
    /// Cursor that resumes right after this entry
    pub cursor: u32,
}

/// Result of one READDIR call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    pub eof: bool,
}

/// What a client may see of a directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirView {
    /// Only `.` and `..` are listed
    pub dots_only: bool,
    /// The directory is a top-level export root; `..` reports its own inode
    pub export_root: bool,
}

/// Reply bytes an entry named `name` is assumed to take
pub fn entry_size(name: &OsStr) -> usize {
    ENTRY_OVERHEAD + name.len() + ENTRY_SLOP
}

/// Cookies with this bit set stand for a remembered stream offset
const COOKIE_TOKEN: u32 = 0x8000_0000;

/// Remembered offsets that do not fit a cookie
const COOKIE_TOKENS: usize = 1 << 16;

/// Translation between directory stream offsets and 4-byte READDIR cookies
///
/// Offsets below 2^31 are their own cookie. Filesystems handing out
/// larger offsets (hashed directories) get a token with the high bit set
/// instead; the most recent `COOKIE_TOKENS` of them are remembered.
#[derive(Debug, Default)]
pub struct DirCookies {
    offsets: HashMap<u32, i64>,
    tokens: HashMap<i64, u32>,
    issued: VecDeque<u32>,
    next: u32,
}

impl DirCookies {
    /// Cookie resuming at stream position `offset`
    pub fn cookie(&mut self, offset: i64) -> u32 {
        if offset > 0 && offset < i64::from(COOKIE_TOKEN) {
            return offset as u32;
        }
        if let Some(token) = self.tokens.get(&offset) {
            return *token;
        }

        if self.issued.len() >= COOKIE_TOKENS {
            if let Some(old) = self.issued.pop_front() {
                if let Some(stale) = self.offsets.remove(&old) {
                    self.tokens.remove(&stale);
                }
            }
        }
        let token = COOKIE_TOKEN | (self.next & !COOKIE_TOKEN);
        self.next = self.next.wrapping_add(1);
        self.offsets.insert(token, offset);
        self.tokens.insert(offset, token);
        self.issued.push_back(token);
        token
    }

    /// Stream position for `cookie`, `None` for a forgotten token
    pub fn offset(&self, cookie: u32) -> Option<i64> {
        if cookie & COOKIE_TOKEN == 0 {
            return Some(i64::from(cookie));
        }
        self.offsets.get(&cookie).copied()
    }
}

/// Directory stream opened without following a final symlink
struct DirStream(NonNull<libc::DIR>);

impl DirStream {
    fn open(path: &Path) -> io::Result<Self> {
        let c_path = cpath(path)?;
        let flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_NOFOLLOW | libc::O_CLOEXEC;
        let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        match NonNull::new(unsafe { libc::fdopendir(fd) }) {
            Some(dir) => Ok(DirStream(dir)),
            None => {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                Err(err)
            }
        }
    }

    fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.0.as_ptr(), offset as libc::c_long) }
    }

    fn tell(&mut self) -> i64 {
        unsafe { libc::telldir(self.0.as_ptr()) as i64 }
    }

    /// Next name and inode number, `None` at the end of the stream
    fn next_entry(&mut self) -> io::Result<Option<(OsString, u64)>> {
        unsafe {
            *libc::__errno_location() = 0;
            let ent = libc::readdir(self.0.as_ptr());
            if ent.is_null() {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(0) => Ok(None),
                    _ => Err(err),
                };
            }
            let name = CStr::from_ptr((*ent).d_name.as_ptr());
            Ok(Some((OsStr::from_bytes(name.to_bytes()).to_os_string(), (*ent).d_ino as u64)))
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.0.as_ptr()) };
    }
}

/// Enumerate a directory starting at `cursor`
///
/// The cursor is a cookie from `cookies` for a position in the directory
/// stream, 0 being the start. Positions stay valid while other entries
/// are added or removed. Entries are added until the size estimate
/// reaches `max_bytes`; the first entry is always returned.
pub fn read_dir_page(
    path: &Path,
    cursor: u32,
    max_bytes: u32,
    view: DirView,
    cookies: &mut DirCookies,
) -> io::Result<DirPage> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Err(io::Error::from_raw_os_error(libc::ENOTDIR));
    }
    let dev = meta.dev();
    let dot = meta.ino();
    let dotdot = if view.export_root {
        dot
    } else {
        fs::symlink_metadata(path.join("..")).map(|m| m.ino()).unwrap_or(dot)
    };

    let mut stream = DirStream::open(path)?;
    if cursor != 0 {
        let offset = cookies.offset(cursor).ok_or_else(|| {
            debug!("readdir {:?}: unknown cookie {:#x}", path, cursor);
            io::Error::from_raw_os_error(libc::EINVAL)
        })?;
        stream.seek(offset);
    }

    let mut entries: Vec<DirEntry> = Vec::new();
    let mut used = 0usize;
    let eof = loop {
        let Some((name, ino)) = stream.next_entry()? else {
            break true;
        };

        used += entry_size(&name);
        if used >= max_bytes as usize && !entries.is_empty() {
            break false;
        }

        let ino = match name.as_bytes() {
            b"." => dot,
            b".." => dotdot,
            _ if view.dots_only => break true,
            _ => ino,
        };
        entries.push(DirEntry {
            fileid: pseudo_inode(ino, dev),
            name,
            cursor: cookies.cookie(stream.tell()),
        });
    };

    debug!(
        "readdir {:?} from {}: {} entries, eof={}",
        path,
        cursor,
        entries.len(),
        eof
    );
    Ok(DirPage { entries, eof })
}

/// Which attribute groups a SETATTR-like call may change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrMask(u8);

impl AttrMask {
    pub const SIZE: AttrMask = AttrMask(1);
    pub const UTIMES: AttrMask = AttrMask(2);
    pub const CHMOD: AttrMask = AttrMask(4);
    pub const CHOWN: AttrMask = AttrMask(8);
    pub const ALL: AttrMask = AttrMask(15);

    pub fn contains(&self, other: AttrMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: AttrMask) -> AttrMask {
        AttrMask(self.0 & !other.0)
    }
}

impl BitOr for AttrMask {
    type Output = AttrMask;

    fn bitor(self, rhs: AttrMask) -> AttrMask {
        AttrMask(self.0 | rhs.0)
    }
}

/// Requested attribute values; `None` leaves the attribute alone
///
/// Owner ids must already be translated to local ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NewAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u32>,
    pub atime: Option<TimeVal>,
    pub mtime: Option<TimeVal>,
}

impl NewAttrs {
    /// Mode bits from a client, honoring both ignore markers
    pub fn mode_from_wire(mode: u32) -> Option<u32> {
        match mode {
            u32::MAX | MODE_IGNORE_LEGACY => None,
            mode => Some(mode),
        }
    }
}

/// Apply the attribute groups in `mask` to `path`
///
/// Order: size, times, mode, owner. Each step runs only when its value is
/// given and differs from the current one. The first failing system call
/// aborts the operation; steps already applied stay applied.
pub fn set_attributes(path: &Path, current: Option<&Metadata>, attrs: &NewAttrs, mask: AttrMask) -> io::Result<()> {
    let meta = match current {
        Some(meta) => meta.clone(),
        None => fs::symlink_metadata(path)?,
    };
    let is_symlink = meta.file_type().is_symlink();

    if mask.contains(AttrMask::SIZE) {
        if let Some(size) = attrs.size {
            if meta.is_file() && u64::from(size) != meta.size() {
                debug!("setattr {:?}: size {}", path, size);
                OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_NOFOLLOW)
                    .open(path)?
                    .set_len(u64::from(size))?;
            }
        }
    }

    if mask.contains(AttrMask::UTIMES) {
        let atime = attrs.atime.filter(|t| t.is_set());
        let mtime = attrs.mtime.filter(|t| t.is_set());
        let atime_changed = atime.is_some_and(|t| i64::from(t.seconds) != meta.atime());
        let mtime_changed = mtime.is_some_and(|t| i64::from(t.seconds) != meta.mtime());
        if atime_changed || mtime_changed {
            debug!("setattr {:?}: atime {:?} mtime {:?}", path, atime, mtime);
            set_times(path, atime, mtime)?;
        }
    }

    if mask.contains(AttrMask::CHMOD) && !is_symlink {
        if let Some(mode) = attrs.mode {
            if mode & 0o7777 != meta.mode() & 0o7777 {
                debug!("setattr {:?}: mode {:o}", path, mode & 0o7777);
                fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
            }
        }
    }

    if mask.contains(AttrMask::CHOWN) {
        let uid = attrs.uid.filter(|uid| *uid != meta.uid());
        let gid = attrs.gid.filter(|gid| *gid != meta.gid());
        if uid.is_some() || gid.is_some() {
            debug!("setattr {:?}: owner {:?}:{:?}", path, uid, gid);
            std::os::unix::fs::lchown(path, attrs.uid, attrs.gid)?;
        }
    }

    Ok(())
}

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn timespec(time: Option<TimeVal>) -> libc::timespec {
    match time {
        Some(t) => libc::timespec {
            tv_sec: t.seconds as libc::time_t,
            tv_nsec: (t.useconds.min(999_999) as libc::c_long) * 1000,
        },
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
    }
}

/// Set access and modification times without following a final symlink
fn set_times(path: &Path, atime: Option<TimeVal>, mtime: Option<TimeVal>) -> io::Result<()> {
    let c = cpath(path)?;
    let times = [timespec(atime), timespec(mtime)];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Kinds of non-regular files CREATE can make
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    Fifo,
    Char(u64),
    Block(u64),
    Socket,
}

impl SpecialKind {
    fn format_bits(&self) -> u32 {
        match self {
            SpecialKind::Fifo => libc::S_IFIFO as u32,
            SpecialKind::Char(_) => libc::S_IFCHR as u32,
            SpecialKind::Block(_) => libc::S_IFBLK as u32,
            SpecialKind::Socket => libc::S_IFSOCK as u32,
        }
    }

    /// Whether an existing node is this very kind of special file
    pub fn matches(&self, meta: &Metadata) -> bool {
        if meta.mode() & libc::S_IFMT as u32 != self.format_bits() {
            return false;
        }
        match self {
            SpecialKind::Char(dev) | SpecialKind::Block(dev) => meta.rdev() == *dev,
            _ => true,
        }
    }
}

/// Create a FIFO, device node or UNIX-domain socket
pub fn make_special(path: &Path, kind: SpecialKind, mode: u32) -> io::Result<()> {
    if kind == SpecialKind::Socket {
        // mknod cannot create sockets; bind leaves the node behind
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        drop(listener);
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
            debug!("chmod on new socket {:?} failed: {}", path, e);
        }
        return Ok(());
    }

    let dev = match kind {
        SpecialKind::Char(dev) | SpecialKind::Block(dev) => dev,
        _ => 0,
    };
    let c = cpath(path)?;
    let full_mode = kind.format_bits() | (mode & 0o7777);
    let rc = unsafe { libc::mknod(c.as_ptr(), full_mode as libc::mode_t, dev as libc::dev_t) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Space usage of the filesystem holding `path`, in 512-byte units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
}

pub const USAGE_BLOCK_SIZE: u64 = 512;

pub fn fs_usage(path: &Path) -> io::Result<FsUsage> {
    let c = cpath(path)?;
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c.as_ptr(), &mut buf) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let frsize = if buf.f_frsize > 0 {
        buf.f_frsize as u64
    } else {
        buf.f_bsize as u64
    };
    let scale = |n: u64| n.saturating_mul(frsize) / USAGE_BLOCK_SIZE;
    Ok(FsUsage {
        blocks: scale(buf.f_blocks as u64),
        bfree: scale(buf.f_bfree as u64),
        bavail: scale(buf.f_bavail as u64),
    })
}

/// Rewrite an absolute symlink target relative to the link's location
///
/// A link at depth `n` gets `n` leading `../` in place of the leading `/`;
/// at depth 0 the target is prefixed with `.`.
pub fn relative_link(link_path: &Path, target: &OsStr) -> NfsResult<OsString> {
    let bytes = target.as_bytes();
    if bytes.first() != Some(&b'/') {
        return Ok(target.to_os_string());
    }

    let link = link_path.as_os_str().as_bytes();
    let depth = link.iter().skip(1).filter(|b| **b == b'/').count();

    let mut out = Vec::with_capacity(bytes.len() + 3 * depth);
    if depth == 0 {
        out.push(b'.');
        out.extend_from_slice(bytes);
    } else {
        for _ in 0..depth {
            out.extend_from_slice(b"../");
        }
        out.extend_from_slice(&bytes[1..]);
    }

    if out.len() >= MAXPATHLEN {
        return Err(NfsError::NameTooLong);
    }
    Ok(OsString::from_vec(out))
}
