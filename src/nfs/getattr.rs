// NFS GETATTR Procedure (Procedure 1)
//
// Returns file attributes for a given file handle

use tracing::debug;

use super::NfsRequest;
use crate::auth::AccessMode;
use crate::error::{NfsError, NfsResult};
use crate::protocol::v2::nfs::{FAttr, FHandle};

/// Handle NFS GETATTR
///
/// The attributes come from the lstat done while validating the handle.
pub fn handle_getattr(req: &mut NfsRequest<'_>, fh: FHandle) -> NfsResult<FAttr> {
    let decision = req.gate.authorize(req.ctx, &fh, AccessMode::Read)?;
    let meta = decision.meta.clone().ok_or(NfsError::Stale)?;
    let attrs = req.attributes(&decision, &meta);
    debug!(
        "GETATTR {:?}: type={:?}, size={}, mode={:o}",
        decision.path, attrs.ftype, attrs.size, attrs.mode
    );
    Ok(attrs)
}
