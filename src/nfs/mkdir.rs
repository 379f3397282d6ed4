// NFS MKDIR Procedure (Procedure 14)
//
// Creates a directory

use std::fs::{self, DirBuilder};
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::auth::creds::with_identity;
use crate::error::NfsResult;
use crate::fsal::local::{self, AttrMask, NewAttrs};
use crate::protocol::v2::nfs::{CreateArgs, DirOpOk};

const DEFAULT_DIR_MODE: u32 = 0o777;

/// Handle NFS MKDIR
///
/// A setgid bit the new directory inherited from its parent survives the
/// requested mode. The requested group is ignored.
pub fn handle_mkdir(req: &mut NfsRequest<'_>, args: CreateArgs) -> NfsResult<DirOpOk> {
    let decision = req
        .gate
        .build_path(req.ctx, &args.where_.dir, args.where_.name.as_os_str(), AccessMode::Write)?;
    debug!("MKDIR {:?}", decision.path);

    let requested = req.new_attrs(&decision, &args.attributes);
    with_identity(decision.identity, || {
        DirBuilder::new()
            .mode(requested.mode.unwrap_or(DEFAULT_DIR_MODE) & 0o7777)
            .create(&decision.path)?;
        let meta = fs::symlink_metadata(&decision.path)?;
        let inherited = meta.mode() & libc::S_ISGID as u32;
        let attrs = NewAttrs {
            gid: None,
            mode: requested.mode.map(|mode| mode | inherited),
            ..requested
        };
        local::set_attributes(
            &decision.path,
            Some(&meta),
            &attrs,
            AttrMask::CHOWN | AttrMask::CHMOD | AttrMask::UTIMES,
        )
    })?;

    req.dir_op_result(&decision, None)
}
