// Error Types
//
// Failures inside the procedure engine never reach the transport as faults.
// Every handler turns them into an NFS status via `NfsError::status`.

use std::io;

use thiserror::Error;

use crate::protocol::v2::nfs::NfsStat;

/// Errors raised by the authorization gate and the procedure handlers
#[derive(Debug, Error)]
pub enum NfsError {
    #[error("stale file handle")]
    Stale,

    #[error("access denied")]
    Access,

    #[error("write to read-only export")]
    ReadOnly,

    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("name too long")]
    NameTooLong,

    #[error("invalid argument")]
    Invalid,

    #[error("file exists")]
    Exists,

    #[error("no such file or directory")]
    NoEnt,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type NfsResult<T> = Result<T, NfsError>;

impl NfsError {
    /// Map this error to the status code reported to the client
    pub fn status(&self) -> NfsStat {
        match self {
            NfsError::Stale => NfsStat::Stale,
            NfsError::Access => NfsStat::Acces,
            NfsError::ReadOnly => NfsStat::RoFs,
            NfsError::NotDir => NfsStat::NotDir,
            NfsError::IsDir => NfsStat::IsDir,
            NfsError::NameTooLong => NfsStat::NameTooLong,
            NfsError::Invalid => NfsStat::Inval,
            NfsError::Exists => NfsStat::Exist,
            NfsError::NoEnt => NfsStat::NoEnt,
            NfsError::Io(e) => match e.raw_os_error() {
                Some(errno) => errno_to_status(errno),
                None => kind_to_status(e.kind()),
            },
        }
    }

    /// Build an error from a raw errno value
    pub fn from_errno(errno: i32) -> Self {
        NfsError::Io(io::Error::from_raw_os_error(errno))
    }
}

/// Translate a local errno into the closest protocol status.
///
/// Anything without a protocol equivalent is reported as a generic I/O error.
pub fn errno_to_status(errno: i32) -> NfsStat {
    match errno {
        0 => NfsStat::Ok,
        libc::EPERM => NfsStat::Perm,
        libc::ENOENT => NfsStat::NoEnt,
        libc::EIO => NfsStat::Io,
        libc::ENXIO => NfsStat::NxIo,
        libc::EACCES => NfsStat::Acces,
        libc::EEXIST => NfsStat::Exist,
        libc::ENODEV => NfsStat::NoDev,
        libc::ENOTDIR => NfsStat::NotDir,
        libc::EISDIR => NfsStat::IsDir,
        libc::EINVAL => NfsStat::Inval,
        libc::EFBIG => NfsStat::FBig,
        libc::ENOSPC => NfsStat::NoSpc,
        libc::EROFS => NfsStat::RoFs,
        libc::ENAMETOOLONG => NfsStat::NameTooLong,
        libc::ENOTEMPTY => NfsStat::NotEmpty,
        libc::EDQUOT => NfsStat::DQuot,
        libc::ESTALE => NfsStat::Stale,
        _ => NfsStat::Io,
    }
}

fn kind_to_status(kind: io::ErrorKind) -> NfsStat {
    match kind {
        io::ErrorKind::NotFound => NfsStat::NoEnt,
        io::ErrorKind::PermissionDenied => NfsStat::Acces,
        io::ErrorKind::AlreadyExists => NfsStat::Exist,
        io::ErrorKind::InvalidInput => NfsStat::Inval,
        _ => NfsStat::Io,
    }
}
