// NFS REMOVE Procedure (Procedure 10)
//
// Removes a non-directory entry from a directory

use std::fs;
use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::protocol::v2::nfs::DirOpArgs;

/// Handle NFS REMOVE
pub fn handle_remove(req: &mut NfsRequest<'_>, args: DirOpArgs) -> NfsResult<()> {
    let decision = req
        .gate
        .build_path(req.ctx, &args.dir, args.name.as_os_str(), AccessMode::Write)?;
    debug!("REMOVE {:?}", decision.path);

    req.gate.handles().invalidate(&decision.path);
    with_identity(decision.identity, || fs::remove_file(&decision.path))?;
    Ok(())
}
