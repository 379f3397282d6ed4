// NFS RENAME Procedure (Procedure 11)
//
// Renames a directory entry, possibly into another directory

use std::fs;
use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::protocol::v2::nfs::RenameArgs;

/// Handle NFS RENAME
///
/// Handles for both names are dropped before the rename.
pub fn handle_rename(req: &mut NfsRequest<'_>, args: RenameArgs) -> NfsResult<()> {
    let from = req
        .gate
        .build_path(req.ctx, &args.from.dir, args.from.name.as_os_str(), AccessMode::Write)?;
    let to = req
        .gate
        .build_path(req.ctx, &args.to.dir, args.to.name.as_os_str(), AccessMode::Write)?;
    debug!("RENAME {:?} -> {:?}", from.path, to.path);

    let handles = req.gate.handles();
    handles.invalidate(&from.path);
    handles.invalidate(&to.path);
    with_identity(from.identity, || fs::rename(&from.path, &to.path))?;
    Ok(())
}
