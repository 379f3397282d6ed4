// MOUNT EXPORT and EXPORTALL Procedure Handlers
//
// Procedures: 5 (EXPORT), 6 (EXPORTALL)
// Purpose: List the configured exports with the hosts they go to

use tracing::debug;

use super::MountRequest;
use crate::protocol::v2::mount::ExportNode;

/// Handle MOUNT EXPORT procedure
///
/// Every caller sees the whole list, as with other servers. World exports
/// carry no groups.
pub fn handle(req: &mut MountRequest<'_>) -> Vec<ExportNode> {
    let exports: Vec<_> = req
        .gate
        .table()
        .exports()
        .iter()
        .map(|e| ExportNode {
            directory: e.path.to_string_lossy().into_owned(),
            groups: e.groups.clone(),
        })
        .collect();
    debug!("MOUNT EXPORT: {} exports", exports.len());
    exports
}
