// MOUNT DUMP Procedure Handler
//
// Procedure: 2 (DUMP)
// Purpose: List the activity log

use tracing::{debug, warn};

use super::MountRequest;
use crate::protocol::v2::mount::MountBody;

/// Handle MOUNT DUMP procedure
///
/// An unreadable activity log is reported as an empty list.
pub fn handle(req: &mut MountRequest<'_>) -> Vec<MountBody> {
    match req.rmtab.list_mounts() {
        Ok(mounts) => {
            debug!("MOUNT DUMP: {} entries", mounts.len());
            mounts
        }
        Err(e) => {
            warn!("Failed to read mount list: {:#}", e);
            Vec::new()
        }
    }
}
