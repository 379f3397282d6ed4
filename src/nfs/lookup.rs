// NFS LOOKUP Procedure (Procedure 4)
//
// Looks up a name in a directory and returns a handle for it

use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::error::NfsResult;
use crate::protocol::v2::nfs::{DirOpArgs, DirOpOk};

/// Handle NFS LOOKUP
///
/// `.` and `..` are resolved lexically, and the resulting path is matched
/// against the client's exports again, so `..` at an export root leaves
/// the export.
pub fn handle_lookup(req: &mut NfsRequest<'_>, args: DirOpArgs) -> NfsResult<DirOpOk> {
    let decision = req
        .gate
        .build_path(req.ctx, &args.dir, args.name.as_os_str(), AccessMode::Read)?;
    debug!("LOOKUP {:?}", decision.path);
    req.dir_op_result(&decision, None)
}
