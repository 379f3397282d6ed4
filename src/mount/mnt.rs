// MOUNT MNT Procedure Handler
//
// Procedure: 1 (MNT)
// Purpose: Mount a directory and return a file handle

use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::MountRequest;
use crate::auth::AccessMode;
use crate::error::{NfsError, NfsResult};
use crate::fsal::is_nfs_mounted;
use crate::protocol::v2::mount::{DirPath, FhStatus};
use crate::protocol::v2::nfs::FHandle;

/// Handle MOUNT MNT procedure
///
/// The path is canonicalized before it is matched, so a symlink cannot
/// lead a client into an export it was not given. Directories and regular
/// files can be mounted.
pub fn handle(req: &mut MountRequest<'_>, dirpath: DirPath) -> FhStatus {
    match mount(req, dirpath) {
        Ok(fh) => FhStatus::Ok(fh),
        Err(e) => {
            debug!("MOUNT MNT refused: {}", e);
            FhStatus::Err(e.status())
        }
    }
}

fn mount(req: &mut MountRequest<'_>, dirpath: DirPath) -> NfsResult<FHandle> {
    let requested = if dirpath.0.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(dirpath.0)
    };
    info!("MOUNT MNT request from {} for {}", req.ctx.peer_ip(), requested.display());

    let path = fs::canonicalize(&requested)?;
    let decision = req.gate.authorize_path(req.ctx, &path, AccessMode::Read)?;
    if req.gate.mount(&decision).options.no_access {
        warn!(
            "Client {} tried to mount {} (noaccess)",
            req.ctx.peer_ip(),
            path.display()
        );
        return Err(NfsError::Access);
    }

    let meta = fs::symlink_metadata(&path)?;
    if !meta.is_dir() && !meta.is_file() {
        return Err(NfsError::NotDir);
    }
    if !req.config.re_export && is_nfs_mounted(&path) {
        warn!("Refusing to re-export NFS mounted {}", path.display());
        return Err(NfsError::Access);
    }

    let fh = req.gate.handles().compose(&path, &meta, None);

    let host = req.host();
    if let Err(e) = req.rmtab.record_mount(&host, &path.to_string_lossy()) {
        warn!("Failed to record mount of {} by {}: {:#}", path.display(), host, e);
    }
    info!("{} mounted {}", host, path.display());
    Ok(fh)
}
