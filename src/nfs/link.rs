// NFS LINK Procedure (Procedure 12)
//
// Creates a hard link

use std::fs;
use tracing::{debug, warn};

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::{NfsError, NfsResult};
use crate::protocol::v2::nfs::LinkArgs;

/// Handle NFS LINK
///
/// Source and new name must resolve to the same export; links between two
/// exports are refused even when both are writable by the client.
pub fn handle_link(req: &mut NfsRequest<'_>, args: LinkArgs) -> NfsResult<()> {
    let from = req.gate.authorize(req.ctx, &args.from, AccessMode::Write)?;
    let to = req
        .gate
        .build_path(req.ctx, &args.to.dir, args.to.name.as_os_str(), AccessMode::Write)?;
    debug!("LINK {:?} -> {:?}", from.path, to.path);

    if from.mount != to.mount {
        warn!(
            "Client {} tried to link across exports: {} -> {}",
            req.ctx.peer_ip(),
            from.path.display(),
            to.path.display()
        );
        return Err(NfsError::Access);
    }

    with_identity(to.identity, || fs::hard_link(&from.path, &to.path))?;
    Ok(())
}
