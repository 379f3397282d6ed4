// Filesystem Abstraction Layer (FSAL)
//
// Local filesystem access on behalf of authorized requests: the per-worker
// handle cache, attribute conversion to the wire format, and the procedure
// building blocks in `local` (directory enumeration, attribute
// application, special files).

pub mod handle;
pub mod local;

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use crate::protocol::v2::nfs::{FAttr, FType, MAXPATHLEN, TimeVal};

pub use handle::{AuthHint, HandleCache, OpenMode, Resolved, pseudo_inode};

/// Every export is reported as one filesystem
pub const FSID: u32 = 1;

/// Linux NFS superblock magic
const NFS_SUPER_MAGIC: i64 = 0x6969;

/// Map a local file type to the wire type
pub fn file_type(meta: &Metadata) -> FType {
    let ft = meta.file_type();
    if ft.is_file() {
        FType::Reg
    } else if ft.is_dir() {
        FType::Dir
    } else if ft.is_symlink() {
        FType::Lnk
    } else if ft.is_block_device() {
        FType::Blk
    } else if ft.is_char_device() {
        FType::Chr
    } else if ft.is_fifo() {
        FType::Fifo
    } else if ft.is_socket() {
        FType::Sock
    } else {
        FType::Non
    }
}

/// Owner ids as they should appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Build wire attributes from local metadata
///
/// # Arguments
/// * `meta` - lstat result for the object
/// * `fileid` - pseudo inode of the object's handle
/// * `owner` - owner ids already translated for the client
pub fn attributes(meta: &Metadata, fileid: u32, owner: Owner) -> FAttr {
    let ftype = file_type(meta);
    let size = if ftype == FType::Lnk {
        meta.size().min(MAXPATHLEN as u64)
    } else {
        meta.size()
    };

    FAttr {
        ftype,
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        uid: owner.uid,
        gid: owner.gid,
        size: size as u32,
        blocksize: meta.blksize() as u32,
        rdev: meta.rdev() as u32,
        blocks: meta.blocks() as u32,
        fsid: FSID,
        fileid,
        atime: time_val(meta.atime(), meta.atime_nsec()),
        mtime: time_val(meta.mtime(), meta.mtime_nsec()),
        ctime: time_val(meta.ctime(), meta.ctime_nsec()),
    }
}

fn time_val(seconds: i64, nanos: i64) -> TimeVal {
    TimeVal {
        seconds: seconds as u32,
        useconds: (nanos / 1000) as u32,
    }
}

/// Whether `path` lives on an NFS mount of this host
#[cfg(target_os = "linux")]
pub fn is_nfs_mounted(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(cpath.as_ptr(), &mut buf) } != 0 {
        return false;
    }
    buf.f_type as i64 == NFS_SUPER_MAGIC
}

#[cfg(not(target_os = "linux"))]
pub fn is_nfs_mounted(_path: &Path) -> bool {
    false
}
