// NFS READLINK Procedure (Procedure 5)
//
// Reads the target of a symbolic link

use std::fs;
use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::fsal::local;
use crate::protocol::v2::nfs::{FHandle, NfsPath};

/// Handle NFS READLINK
///
/// On `link_relative` exports absolute targets are rewritten relative to
/// the link's own directory.
pub fn handle_readlink(req: &mut NfsRequest<'_>, fh: FHandle) -> NfsResult<NfsPath> {
    let decision = req.gate.authorize(req.ctx, &fh, AccessMode::ReadData)?;
    let target = with_identity(decision.identity, || fs::read_link(&decision.path))?;
    let target = target.into_os_string();

    let target = if req.gate.mount(&decision).options.link_relative {
        local::relative_link(&decision.path, &target)?
    } else {
        target
    };
    debug!("READLINK {:?} -> {:?}", decision.path, target);
    Ok(NfsPath(target))
}
